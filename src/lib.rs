//! cat-sentry: real-time cat detection for single-board computers.
//!
//! A threaded pipeline built for constrained hardware: a capture worker
//! publishes frames into a single-slot buffer, a detection worker runs a
//! multi-stage detector chain with automatic fallback, a validator demands
//! temporal consistency before anything counts as a sighting, and a
//! dispatcher delivers notifications with rate limiting and retry. A
//! resource monitor watches CPU, memory, and temperature and sheds load
//! before the device falls over.

pub mod annotate;
pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod storage;
pub mod validate;

pub use config::{ConfigStore, SentryConfig};
pub use detect::{BackendKind, BoundingBox, DetectionEngine, RawDetection};
pub use frame::{Frame, FrameSlot};
pub use pipeline::{Pipeline, StatusSnapshot};
pub use validate::ValidatedEvent;
