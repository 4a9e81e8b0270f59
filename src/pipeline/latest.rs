use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::Frame;

/// Single-slot cell holding the newest decoded frame.
///
/// Reads never consume: every caller sees the same frame until the producer
/// publishes a newer one. Publication is a single atomic pointer swap.
#[derive(Default)]
pub struct LatestFrame {
    slot: ArcSwapOption<Frame>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        self.slot.store(Some(Arc::new(frame)));
    }

    /// Non-destructive peek.
    pub fn get(&self) -> Option<Frame> {
        self.slot.load_full().map(|frame| Frame::clone(&frame))
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }
}
