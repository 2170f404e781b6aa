//! Ordered playback of out-of-order synthesis results.
//!
//! Each reply chunk reserves the next slot index before synthesis starts.
//! Synthesis tasks fill slots in whatever order they finish; the player
//! always takes slot `i` before slot `i + 1`. Waiting is driven by a
//! `watch` version counter bumped on every change.

use crate::error::Result;
use crate::tts::SynthesizedAudio;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Device side of playback.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play one chunk, returning when playback has finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the device rejects the audio.
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()>;

    /// Stop whatever is playing. Must not block.
    fn stop(&self);
}

/// Content of a filled slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    Ready(SynthesizedAudio),
    Failed(String),
}

/// What the player gets next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextChunk {
    Ready(SynthesizedAudio),
    Failed(String),
    /// The queue was closed and every reserved slot has been played.
    Exhausted,
    /// The turn was cleared or superseded.
    Cancelled,
}

#[derive(Debug, Default)]
struct QueueState {
    turn: u64,
    slots: Vec<Option<SlotState>>,
    played: usize,
    closed: bool,
    cancelled: bool,
}

/// Per-session playback queue, tagged with the owning turn id.
#[derive(Debug)]
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    version: watch::Sender<u64>,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState {
                cancelled: true,
                ..QueueState::default()
            }),
            version,
        }
    }

    /// Reset the queue for a new turn.
    pub fn begin_turn(&self, turn: u64) {
        {
            let mut state = self.lock();
            *state = QueueState {
                turn,
                ..QueueState::default()
            };
        }
        self.bump();
    }

    /// Reserve the next slot. `None` if `turn` is not current or the queue
    /// is closed.
    pub fn reserve(&self, turn: u64) -> Option<usize> {
        let mut state = self.lock();
        if state.turn != turn || state.closed || state.cancelled {
            return None;
        }
        state.slots.push(None);
        Some(state.slots.len() - 1)
    }

    /// Fill a reserved slot. Results for stale turns are discarded.
    pub fn fill(&self, turn: u64, index: usize, slot: SlotState) -> bool {
        let filled = {
            let mut state = self.lock();
            if state.turn != turn || state.cancelled || index < state.played {
                false
            } else {
                match state.slots.get_mut(index) {
                    Some(entry) if entry.is_none() => {
                        *entry = Some(slot);
                        true
                    }
                    _ => false,
                }
            }
        };
        if filled {
            self.bump();
        }
        filled
    }

    /// No more slots will be reserved for `turn`.
    pub fn close(&self, turn: u64) {
        {
            let mut state = self.lock();
            if state.turn != turn {
                return;
            }
            state.closed = true;
        }
        self.bump();
    }

    /// Drop every slot, including pending synthesis results, and wake the
    /// player with [`NextChunk::Cancelled`].
    pub fn clear(&self) {
        {
            let mut state = self.lock();
            state.slots.clear();
            state.played = 0;
            state.cancelled = true;
        }
        self.bump();
    }

    /// Slots reserved but not yet played.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.slots.len() - state.played
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next slot of `turn` in order.
    pub async fn next(&self, turn: u64) -> NextChunk {
        let mut changes = self.version.subscribe();
        loop {
            {
                let mut state = self.lock();
                if state.turn != turn || state.cancelled {
                    return NextChunk::Cancelled;
                }
                let index = state.played;
                if let Some(entry) = state.slots.get_mut(index) {
                    if let Some(slot) = entry.take() {
                        state.played += 1;
                        return match slot {
                            SlotState::Ready(audio) => NextChunk::Ready(audio),
                            SlotState::Failed(reason) => NextChunk::Failed(reason),
                        };
                    }
                } else if state.closed {
                    return NextChunk::Exhausted;
                }
            }
            if changes.changed().await.is_err() {
                return NextChunk::Cancelled;
            }
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn audio(index: usize) -> SynthesizedAudio {
        SynthesizedAudio {
            turn: 1,
            index,
            text: format!("chunk {index}"),
            data: Bytes::from(vec![index as u8]),
        }
    }

    #[tokio::test]
    async fn plays_in_order_despite_out_of_order_fill() {
        let queue = PlaybackQueue::new();
        queue.begin_turn(1);
        let a = queue.reserve(1).unwrap();
        let b = queue.reserve(1).unwrap();
        let c = queue.reserve(1).unwrap();
        queue.close(1);

        assert!(queue.fill(1, c, SlotState::Ready(audio(c))));
        assert!(queue.fill(1, b, SlotState::Ready(audio(b))));
        assert!(queue.fill(1, a, SlotState::Ready(audio(a))));

        for expected in 0..3 {
            assert_eq!(queue.next(1).await, NextChunk::Ready(audio(expected)));
        }
        assert_eq!(queue.next(1).await, NextChunk::Exhausted);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn player_waits_for_earlier_slot() {
        let queue = Arc::new(PlaybackQueue::new());
        queue.begin_turn(7);
        let first = queue.reserve(7).unwrap();
        let second = queue.reserve(7).unwrap();
        queue.fill(7, second, SlotState::Ready(audio(second)));

        let player = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next(7).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!player.is_finished());

        queue.fill(7, first, SlotState::Ready(audio(first)));
        assert_eq!(player.await.unwrap(), NextChunk::Ready(audio(0)));
    }

    #[tokio::test]
    async fn closing_empty_queue_exhausts_immediately() {
        let queue = PlaybackQueue::new();
        queue.begin_turn(2);
        queue.close(2);
        assert_eq!(queue.next(2).await, NextChunk::Exhausted);
    }

    #[tokio::test]
    async fn clear_cancels_waiting_player_and_drops_results() {
        let queue = Arc::new(PlaybackQueue::new());
        queue.begin_turn(3);
        let slot = queue.reserve(3).unwrap();
        queue.reserve(3).unwrap();
        assert_eq!(queue.len(), 2);

        let player = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next(3).await })
        };
        tokio::task::yield_now().await;
        queue.clear();

        assert_eq!(player.await.unwrap(), NextChunk::Cancelled);
        assert_eq!(queue.len(), 0);
        assert!(!queue.fill(3, slot, SlotState::Ready(audio(0))));
        assert!(queue.reserve(3).is_none());
    }

    #[tokio::test]
    async fn stale_turn_is_rejected() {
        let queue = PlaybackQueue::new();
        queue.begin_turn(4);
        let slot = queue.reserve(4).unwrap();
        queue.begin_turn(5);
        assert!(!queue.fill(4, slot, SlotState::Ready(audio(0))));
        assert!(queue.reserve(4).is_none());
        assert_eq!(queue.next(4).await, NextChunk::Cancelled);
    }

    #[tokio::test]
    async fn failed_slot_is_reported_in_order() {
        let queue = PlaybackQueue::new();
        queue.begin_turn(1);
        let a = queue.reserve(1).unwrap();
        queue.fill(1, a, SlotState::Failed("voice unavailable".to_owned()));
        assert_eq!(
            queue.next(1).await,
            NextChunk::Failed("voice unavailable".to_owned())
        );
    }
}
