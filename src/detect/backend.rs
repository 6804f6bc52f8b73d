use anyhow::Result;

use crate::detect::result::{BoundingBox, ObjectClass};

/// A detection produced by a backend, before the engine tags it with the
/// originating frame and backend slot.
#[derive(Clone, Copy, Debug)]
pub struct BackendDetection {
    pub bbox: BoundingBox,
    pub class: ObjectClass,
}

/// One concrete detector implementation in the fallback chain.
///
/// Construction doubles as the initialization probe: a backend that cannot
/// load its model returns an error from its constructor and the engine moves
/// on to the next candidate. `detect` errors are counted by the engine and
/// converted into empty results; they must never panic.
pub trait DetectorBackend: Send {
    /// Backend identifier for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Run inference on an RGB frame.
    ///
    /// Implementations must treat the pixel slice as read-only and ephemeral.
    /// Coordinates are in the coordinate space of the slice handed in; the
    /// engine maps them back to full-frame space after crop/downsample.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<BackendDetection>>;

    /// Optional warm-up hook, called once after the backend becomes active.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
