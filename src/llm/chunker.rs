//! Sentence chunking of streamed reply text for synthesis.
//!
//! Chunks normally end at sentence boundaries. The first chunk of a reply
//! may end earlier, at the first clause break or once it grows past a
//! length limit, so audio can start before the first sentence is complete.

use crate::config::ChunkingConfig;

/// Accumulates reply deltas and yields speakable chunks.
#[derive(Debug)]
pub struct SentenceChunker {
    first_chunk_on_clause: bool,
    first_chunk_max_chars: usize,
    buffer: String,
    emitted: usize,
}

impl SentenceChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            first_chunk_on_clause: config.first_chunk_on_clause,
            first_chunk_max_chars: config.first_chunk_max_chars,
            buffer: String::new(),
            emitted: 0,
        }
    }

    /// Add a delta and return every chunk it completes, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut chunks = Vec::new();
        while let Some(end) = self.next_boundary() {
            let chunk = self.buffer[..end].trim().to_owned();
            self.buffer.drain(..end);
            if !chunk.is_empty() {
                self.emitted += 1;
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Flush whatever remains once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        self.emitted += 1;
        Some(rest.to_owned())
    }

    /// Number of chunks produced so far.
    pub fn chunks_emitted(&self) -> usize {
        self.emitted
    }

    fn next_boundary(&self) -> Option<usize> {
        if let Some(end) = find_sentence_boundary(&self.buffer) {
            return Some(end);
        }
        if self.emitted > 0 {
            return None;
        }
        if self.first_chunk_on_clause
            && let Some(end) = find_first_clause_boundary(&self.buffer)
        {
            return Some(end);
        }
        if self.first_chunk_max_chars > 0 && self.buffer.len() >= self.first_chunk_max_chars {
            return find_word_break(&self.buffer, self.first_chunk_max_chars);
        }
        None
    }
}

/// Byte offset just past the first sentence end (`.`, `!`, `?` followed by
/// whitespace, or a newline).
///
/// A terminator at the very end of the buffer does not count yet: the next
/// delta may turn `3.` into `3.5`.
pub(crate) fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        let end = i + c.len_utf8();
        if c == '\n' {
            return Some(end);
        }
        if matches!(c, '.' | '!' | '?')
            && text[end..].starts_with(|n: char| n.is_whitespace())
        {
            return Some(end);
        }
    }
    None
}

/// Byte offset just past the first clause mark (`, ; :` or a dash) that is
/// followed by whitespace and has text before it.
pub(crate) fn find_first_clause_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':' | '\u{2014}' | '\u{2013}') {
            let end = i + c.len_utf8();
            if text[end..].starts_with(|n: char| n.is_whitespace()) && !text[..i].trim().is_empty()
            {
                return Some(end);
            }
        }
    }
    None
}

/// Last whitespace offset at or before `limit`, if any past the start.
fn find_word_break(text: &str, limit: usize) -> Option<usize> {
    text.char_indices()
        .take_while(|(i, _)| *i <= limit)
        .filter(|(i, c)| *i > 0 && c.is_whitespace())
        .map(|(i, _)| i)
        .last()
}
