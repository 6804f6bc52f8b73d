use anyhow::Result;

use crate::detect::backend::{BackendDetection, DetectorBackend};

/// Deterministic no-op backend.
///
/// Used only when every real backend fails to initialize, so the rest of the
/// pipeline remains exercisable and observable. Always returns an empty
/// result and never errors.
#[derive(Default)]
pub struct MockBackend {
    calls: u64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<BackendDetection>> {
        self.calls += 1;
        Ok(Vec::new())
    }
}
