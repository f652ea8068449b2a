use std::collections::VecDeque;

use crate::config::BackpressurePolicy;
use crate::drivers::frame::FrameFormat;

/// Bounded byte queue between transport reads and the frame decoder.
pub struct ByteQueue {
    bytes: VecDeque<u8>,
    capacity: usize,
    policy: BackpressurePolicy,
    dropped: u64,
}

impl ByteQueue {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
            policy,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes lost to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// How many bytes the next transport read may ask for.
    pub fn read_budget(&self, chunk: usize) -> usize {
        match self.policy {
            BackpressurePolicy::DropOldest => chunk,
            BackpressurePolicy::BlockProducer => chunk.min(self.capacity - self.bytes.len()),
        }
    }

    /// Appends `data`, returning how many bytes were discarded to stay in bounds.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let discarded = match self.policy {
            BackpressurePolicy::DropOldest => {
                self.bytes.extend(data);
                let excess = self.bytes.len().saturating_sub(self.capacity);
                self.bytes.drain(..excess);
                excess
            }
            BackpressurePolicy::BlockProducer => {
                let room = self.capacity - self.bytes.len();
                let take = room.min(data.len());
                self.bytes.extend(&data[..take]);
                data.len() - take
            }
        };
        self.dropped += discarded as u64;
        discarded
    }

    pub fn as_slice(&mut self) -> &[u8] {
        self.bytes.make_contiguous()
    }

    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n);
    }

    /// Drops the head byte and everything up to the next sync marker.
    /// Returns the number of bytes skipped.
    pub fn skip_to_next_sync(&mut self, format: &dyn FrameFormat) -> usize {
        if self.bytes.is_empty() {
            return 0;
        }
        let slice = self.bytes.make_contiguous();
        let skip = format
            .find_sync(&slice[1..])
            .map(|at| at + 1)
            .unwrap_or(slice.len());
        self.bytes.drain(..skip);
        skip
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Sliding window over the most recent frame outcomes.
pub struct DecodeHealth {
    outcomes: VecDeque<bool>,
    window: usize,
    threshold: f32,
    malformed: usize,
}

impl DecodeHealth {
    pub fn new(window: usize, threshold: f32) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(window),
            window,
            threshold,
            malformed: 0,
        }
    }

    /// Records one frame outcome. Returns true once the malformed count in
    /// the window exceeds `threshold * window`.
    pub fn record(&mut self, ok: bool) -> bool {
        if self.outcomes.len() == self.window {
            if let Some(false) = self.outcomes.pop_front() {
                self.malformed -= 1;
            }
        }
        self.outcomes.push_back(ok);
        if !ok {
            self.malformed += 1;
        }
        self.exceeded()
    }

    pub fn exceeded(&self) -> bool {
        self.malformed as f32 > self.threshold * self.window as f32
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.malformed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::frame::{LovelaceV1, V1_SYNC};

    #[test]
    fn drop_oldest_keeps_the_newest_bytes() {
        let mut queue = ByteQueue::new(4, BackpressurePolicy::DropOldest);
        assert_eq!(queue.read_budget(100), 100);
        assert_eq!(queue.extend(&[1, 2, 3]), 0);
        assert_eq!(queue.extend(&[4, 5, 6]), 2);
        assert_eq!(queue.as_slice(), &[3, 4, 5, 6]);
        assert_eq!(queue.dropped(), 2);
    }

    #[test]
    fn block_producer_limits_reads() {
        let mut queue = ByteQueue::new(4, BackpressurePolicy::BlockProducer);
        queue.extend(&[1, 2, 3]);
        assert_eq!(queue.read_budget(100), 1);
        assert_eq!(queue.extend(&[4, 5]), 1);
        assert_eq!(queue.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(queue.read_budget(100), 0);
        queue.consume(2);
        assert_eq!(queue.read_budget(100), 2);
    }

    #[test]
    fn resync_seeks_past_the_head_byte() {
        let mut queue = ByteQueue::new(64, BackpressurePolicy::DropOldest);
        queue.extend(&[V1_SYNC, 0, 1, V1_SYNC, 7]);
        assert_eq!(queue.skip_to_next_sync(&LovelaceV1), 3);
        assert_eq!(queue.as_slice(), &[V1_SYNC, 7]);
        queue.extend(&[8, 9]);
        queue.consume(1);
        assert_eq!(queue.skip_to_next_sync(&LovelaceV1), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn health_window_slides() {
        let mut health = DecodeHealth::new(4, 0.25);
        assert!(!health.record(false));
        assert!(!health.record(true));
        assert!(health.record(false));
        health.reset();
        for _ in 0..4 {
            health.record(true);
        }
        assert!(!health.record(false));
        for _ in 0..3 {
            assert!(!health.record(true));
        }
        assert_eq!(health.malformed(), 1);
        assert!(!health.record(true));
        assert_eq!(health.malformed(), 0);
    }
}
