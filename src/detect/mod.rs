//! Multi-stage cat detection: backend chain, motion gating, suppression.

pub mod backend;
pub mod backends;
pub mod engine;
pub mod nms;
pub mod result;

pub use backend::{BackendDetection, DetectorBackend};
pub use engine::{BackendHealth, DetectionEngine, EngineState};
pub use result::{BackendKind, BoundingBox, ObjectClass, RawDetection};
