//! Fixed-capacity sliding window over the most recent samples.

use std::collections::VecDeque;

/// A FIFO holding at most `capacity` samples; appending past capacity
/// discards the oldest samples first.
#[derive(Debug)]
pub struct SlidingSampleBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SlidingSampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a frame, evicting the oldest samples beyond capacity.
    pub fn push_frame(&mut self, frame: &[f32]) {
        // Only the tail of an oversized frame can survive.
        let frame = &frame[frame.len().saturating_sub(self.capacity)..];
        let overflow = (self.samples.len() + frame.len()).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(frame);
    }

    /// True once at least `min_len` samples are held.
    pub fn has_at_least(&self, min_len: usize) -> bool {
        self.samples.len() >= min_len
    }

    /// The current window, oldest sample first.
    pub fn window(&mut self) -> &[f32] {
        self.samples.make_contiguous()
    }
}
