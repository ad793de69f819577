//! Next-available-slot cursor on the output clock.

/// Advances only when a buffer is reserved; rewinds only on [`reset`].
///
/// [`reset`]: PlaybackTimeline::reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackTimeline {
    next_slot: u64,
}

impl PlaybackTimeline {
    pub fn new(now: u64) -> Self {
        Self { next_slot: now }
    }

    /// Claim `frames` starting at `max(now, next_slot)`. Returns the start.
    pub fn reserve(&mut self, now: u64, frames: u64) -> u64 {
        let start = now.max(self.next_slot);
        self.next_slot = start + frames;
        start
    }

    pub fn reset(&mut self, now: u64) {
        self.next_slot = now;
    }

    /// Frame at which everything reserved so far has finished.
    pub fn end(&self) -> u64 {
        self.next_slot
    }
}
