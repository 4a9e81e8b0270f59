//! Bounded latest-wins frame mailbox

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::Frame;

/// Bounded MPMC queue that evicts the oldest frame instead of blocking the
/// producer when full.
pub struct FrameQueue {
    tx: Sender<Frame>,
    /// Held by the producer side as well, so it can evict.
    rx: Receiver<Frame>,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: push a frame, dropping the oldest one if the queue is full.
    /// Returns the number of frames evicted to make room.
    pub fn push(&self, frame: Frame) -> usize {
        let mut frame = frame;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    frame = rejected;
                    // A consumer may have raced us to the oldest frame; either
                    // way there is room on the next attempt.
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                // Both ends live in `self`, so the channel cannot disconnect.
                Err(TrySendError::Disconnected(_)) => unreachable!("frame queue disconnected"),
            }
        }

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.stats
                .frames_dropped
                .fetch_add(evicted, Ordering::Relaxed);
            metrics::counter!("astrocam_frames_dropped_total").increment(evicted as u64);
        }
        evicted
    }

    /// Consumer: pop the oldest frame, waiting at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Consumer: pop without waiting.
    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Discard everything buffered.
    pub fn clear(&self) -> usize {
        self.rx.drain().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{PixelFormat, Raster};

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            Raster {
                pixels: vec![0; 3],
                width: 1,
                height: 1,
                format: PixelFormat::Rgb24,
                encoded_len: 0,
            },
            sequence,
        )
    }

    #[test]
    fn third_push_evicts_oldest() {
        let queue = FrameQueue::new(2);
        assert_eq!(queue.push(frame(0)), 0);
        assert_eq!(queue.push(frame(1)), 0);
        assert_eq!(queue.push(frame(2)), 1);
        assert_eq!(queue.len(), 2);

        let seen: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(
            queue.stats(),
            QueueStats {
                written: 3,
                read: 2,
                dropped: 1
            }
        );
    }

    #[test]
    fn never_exceeds_capacity() {
        let queue = FrameQueue::new(2);
        for sequence in 0..50 {
            queue.push(frame(sequence));
            assert!(queue.len() <= 2);
        }
        assert_eq!(queue.pop_timeout(Duration::ZERO).map(|f| f.sequence()), Some(48));
        assert_eq!(queue.pop_timeout(Duration::ZERO).map(|f| f.sequence()), Some(49));
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue = FrameQueue::new(2);
        let started = std::time::Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn clear_empties_queue() {
        let queue = FrameQueue::new(2);
        queue.push(frame(0));
        queue.push(frame(1));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
