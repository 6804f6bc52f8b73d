//! Detection validation: static filters plus temporal consistency.
//!
//! Raw detections pass through cheap static filters first (confidence, box
//! size, region of interest), then a temporal stage that associates
//! detections across frames and only counts an object once it has been seen
//! in enough consecutive processed frames. A single-frame flicker from a
//! noisy backend never reaches the notifier, and a cat lingering in view
//! produces one event, not one per frame.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::ValidatorSettings;
use crate::detect::result::{BackendKind, BoundingBox, RawDetection};
use crate::frame::FrameMeta;

/// One frame's worth of temporally confirmed detections.
///
/// Built only by the validator, once per frame on which a new track reaches
/// the consistency requirement. Immutable after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatedEvent {
    /// All boxes surviving every filter on this frame.
    pub boxes: Vec<BoundingBox>,
    pub cat_count: u32,
    /// Maximum confidence among the surviving boxes.
    pub confidence: f32,
    pub backend: BackendKind,
    pub frame_seq: u64,
    /// Capture time as milliseconds since the Unix epoch.
    pub unix_time_ms: u64,
}

struct Track {
    bbox: BoundingBox,
    consecutive_hits: u32,
    last_seen_seq: u64,
    emitted: bool,
}

/// Stateful validator. The per-track temporal counters are its only mutable
/// state; one instance per pipeline.
pub struct DetectionValidator {
    settings: ValidatorSettings,
    tracks: Vec<Track>,
    last_seq: Option<u64>,
    warnings: u64,
}

impl DetectionValidator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self {
            settings,
            tracks: Vec::new(),
            last_seq: None,
            warnings: 0,
        }
    }

    pub fn update_settings(&mut self, settings: ValidatorSettings) {
        self.settings = settings;
    }

    /// Data-integrity warnings: frames seen out of order or twice.
    pub fn warnings(&self) -> u64 {
        self.warnings
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Drop all temporal state. The next event needs a fresh run of
    /// consecutive frames.
    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    /// Process the detections of one frame.
    ///
    /// Emits an event only on the frame where some track newly accumulates
    /// the required consecutive observations; a track that stays validated
    /// on later frames does not re-emit.
    pub fn validate(
        &mut self,
        detections: &[RawDetection],
        meta: FrameMeta,
    ) -> Option<ValidatedEvent> {
        if let Some(last) = self.last_seq {
            if meta.seq <= last {
                self.warnings += 1;
                log::warn!("stale frame seq {} after {} dropped by validator", meta.seq, last);
                return None;
            }
        }
        self.last_seq = Some(meta.seq);

        let passing: Vec<&RawDetection> = detections
            .iter()
            .filter(|d| self.passes_static_filters(&d.bbox))
            .collect();
        let backend = passing.first().map(|d| d.backend);

        let mut matched = vec![false; self.tracks.len()];
        let mut newly_validated = false;

        for detection in &passing {
            match self.best_track(&detection.bbox, &matched) {
                Some(idx) => {
                    matched[idx] = true;
                    let track = &mut self.tracks[idx];
                    track.bbox = detection.bbox;
                    track.consecutive_hits += 1;
                    track.last_seen_seq = meta.seq;
                    if track.consecutive_hits >= self.settings.consistency_frames && !track.emitted
                    {
                        track.emitted = true;
                        newly_validated = true;
                    }
                }
                None => {
                    let emitted = self.settings.consistency_frames <= 1;
                    newly_validated |= emitted;
                    matched.push(true);
                    self.tracks.push(Track {
                        bbox: detection.bbox,
                        consecutive_hits: 1,
                        last_seen_seq: meta.seq,
                        emitted,
                    });
                }
            }
        }

        // A track skipped this frame loses its consecutive run but stays
        // associable until its TTL expires.
        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if idx < matched.len() && !matched[idx] {
                track.consecutive_hits = 0;
                track.emitted = false;
            }
        }
        let ttl = self.settings.track_ttl_frames;
        self.tracks
            .retain(|t| meta.seq.saturating_sub(t.last_seen_seq) <= ttl);

        if !newly_validated {
            return None;
        }

        // Every currently-validated box counts toward the event.
        let consistency = self.settings.consistency_frames;
        let boxes: Vec<BoundingBox> = self
            .tracks
            .iter()
            .filter(|t| t.last_seen_seq == meta.seq && t.consecutive_hits >= consistency)
            .map(|t| t.bbox)
            .collect();
        let confidence = boxes
            .iter()
            .map(|b| b.confidence)
            .fold(0.0f32, f32::max);

        Some(ValidatedEvent {
            cat_count: boxes.len() as u32,
            boxes,
            confidence,
            backend: backend.unwrap_or(BackendKind::Mock),
            frame_seq: meta.seq,
            unix_time_ms: unix_ms(meta.captured_at),
        })
    }

    fn passes_static_filters(&self, bbox: &BoundingBox) -> bool {
        if bbox.confidence < self.settings.confidence_threshold {
            return false;
        }
        let min = self.settings.min_box_side;
        let max = self.settings.max_box_side;
        if bbox.width < min || bbox.height < min || bbox.width > max || bbox.height > max {
            return false;
        }
        self.settings.roi.contains_center(bbox.center())
    }

    /// Best unmatched track by IoU, if any clears the association threshold.
    fn best_track(&self, bbox: &BoundingBox, matched: &[bool]) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (idx, track) in self.tracks.iter().enumerate() {
            if matched.get(idx).copied().unwrap_or(false) {
                continue;
            }
            let iou = track.bbox.iou(bbox);
            if iou < self.settings.association_iou {
                continue;
            }
            if best.map_or(true, |(_, b)| iou > b) {
                best = Some((idx, iou));
            }
        }
        best.map(|(idx, _)| idx)
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
