//! Frame types and the single-slot handoff buffer.
//!
//! A `Frame` is an immutable snapshot of RGB pixel data captured by the
//! camera worker. Frames cross the capture/detection boundary through a
//! `FrameSlot`: a single slot, not a queue, because only the newest frame is
//! ever relevant for live monitoring. Writers overwrite, readers clone the
//! `Arc`, so a slow consumer can never observe a torn frame.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Immutable RGB frame. Never mutated after capture.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Monotonically increasing, unique per capture session.
    pub seq: u64,
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, seq: u64) -> Self {
        Self {
            pixels: pixels.into(),
            width,
            height,
            seq,
            captured_at: SystemTime::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Lightweight frame metadata handed to the validator alongside detections.
#[derive(Clone, Copy, Debug)]
pub struct FrameMeta {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
}

impl From<&Frame> for FrameMeta {
    fn from(frame: &Frame) -> Self {
        Self {
            seq: frame.seq,
            width: frame.width,
            height: frame.height,
            captured_at: frame.captured_at,
        }
    }
}

/// Single-slot frame buffer shared between the capture and detection workers.
///
/// `store` overwrites the previous frame; `latest` hands out a cheap
/// `Arc<Frame>` clone without blocking the writer for long.
#[derive(Default)]
pub struct FrameSlot {
    slot: Mutex<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Frame) {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Arc::new(frame));
    }

    /// Most recent frame, or `None` when nothing has been captured yet.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        let guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Drops the held frame. Used by the reclamation pass.
    pub fn clear(&self) {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![seq as u8; 12], 2, 2, seq)
    }

    #[test]
    fn slot_overwrites_and_reads_latest() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());

        slot.store(frame(1));
        slot.store(frame(2));

        let latest = slot.latest().expect("frame present");
        assert_eq!(latest.seq, 2);
    }

    #[test]
    fn reader_keeps_frame_alive_across_overwrite() {
        let slot = FrameSlot::new();
        slot.store(frame(1));
        let held = slot.latest().expect("frame present");

        slot.store(frame(2));

        // The overwritten frame stays valid for the reader holding it.
        assert_eq!(held.seq, 1);
        assert_eq!(held.pixels()[0], 1);
        assert_eq!(slot.latest().unwrap().seq, 2);
    }

    #[test]
    fn clear_empties_the_slot() {
        let slot = FrameSlot::new();
        slot.store(frame(1));
        slot.clear();
        assert!(slot.latest().is_none());
    }
}
