use serde::{Deserialize, Serialize};

/// Integer rectangle with a detection confidence in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }

    /// Intersection-over-union with another box. Zero when disjoint.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width as i32).min(other.x + other.width as i32);
        let y2 = (self.y + self.height as i32).min(other.y + other.height as i32);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) as u64 * (y2 - y1) as u64;
        let union = self.area() + other.area() - intersection;
        if union == 0 {
            return 0.0;
        }
        intersection as f32 / union as f32
    }
}

/// Which backend in the fallback chain produced a detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Primary,
    Secondary,
    Tertiary,
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Primary => "primary",
            BackendKind::Secondary => "secondary",
            BackendKind::Tertiary => "tertiary",
            BackendKind::Mock => "mock",
        }
    }

    /// Next step down the fallback chain, or `None` at the bottom.
    pub fn next(&self) -> Option<BackendKind> {
        match self {
            BackendKind::Primary => Some(BackendKind::Secondary),
            BackendKind::Secondary => Some(BackendKind::Tertiary),
            BackendKind::Tertiary => Some(BackendKind::Mock),
            BackendKind::Mock => None,
        }
    }
}

/// Object classes a backend may report. Only `Cat` survives engine filtering.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    Cat,
    Other,
}

/// A single raw detection as emitted by a backend, before validation.
#[derive(Clone, Copy, Debug)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub backend: BackendKind,
    pub frame_seq: u64,
}
