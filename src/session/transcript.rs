//! Aggregates streaming transcript segments into one utterance.

use crate::stt::SttEvent;

/// Final text plus the current interim hypothesis.
///
/// Interim segments only change what is displayed. Final segments are
/// appended with single-space joining, unless the buffer already ends with
/// exactly that segment on a word boundary (providers re-send finals after
/// reconnects).
#[derive(Debug, Default, Clone)]
pub struct TranscriptAggregator {
    finals: String,
    interim: String,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a segment. Returns `true` when the live text changed.
    pub fn apply(&mut self, event: &SttEvent) -> bool {
        let text = event.transcript.trim();
        if text.is_empty() {
            return false;
        }

        if !event.is_final {
            if self.interim == text {
                return false;
            }
            self.interim = text.to_owned();
            return true;
        }

        let had_interim = !self.interim.is_empty();
        self.interim.clear();
        if self.ends_with_segment(text) {
            return had_interim;
        }
        if !self.finals.is_empty() {
            self.finals.push(' ');
        }
        self.finals.push_str(text);
        true
    }

    fn ends_with_segment(&self, text: &str) -> bool {
        self.finals
            .strip_suffix(text)
            .is_some_and(|head| head.is_empty() || head.ends_with(' '))
    }

    /// Finalized text followed by the current interim, for display.
    pub fn live_text(&self) -> String {
        match (self.finals.is_empty(), self.interim.is_empty()) {
            (_, true) => self.finals.clone(),
            (true, false) => self.interim.clone(),
            (false, false) => format!("{} {}", self.finals, self.interim),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finals.is_empty() && self.interim.is_empty()
    }

    /// Close the buffer into one utterance.
    ///
    /// A trailing interim the provider never finalized is included.
    /// Returns `None` for an empty buffer.
    pub fn take(&mut self) -> Option<String> {
        let text = self.live_text();
        self.clear();
        (!text.is_empty()).then_some(text)
    }

    pub fn clear(&mut self) {
        self.finals.clear();
        self.interim.clear();
    }
}
