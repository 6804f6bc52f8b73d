//! Detection engine with backend fallback, motion gating, and NMS.
//!
//! The engine owns an ordered chain of detector backends. The first backend
//! that initializes becomes active; runtime inference failures demote down
//! the chain and never promote back up during the process lifetime, which
//! avoids oscillating between a flaky backend and its fallback.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::{EngineSettings, Roi};
use crate::detect::backend::DetectorBackend;
use crate::detect::nms::non_max_suppression;
use crate::detect::result::{BackendKind, ObjectClass, RawDetection};
use crate::frame::Frame;

/// Health counters for one backend slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct BackendHealth {
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub invocations: u64,
}

/// Snapshot of the engine's operating state, readable by the resource
/// monitor and the status surface.
#[derive(Clone, Debug)]
pub struct EngineState {
    pub active: BackendKind,
    pub health: Vec<(BackendKind, BackendHealth)>,
    pub demotions: u32,
    pub gated_frames: u64,
    pub gate_widen_factor: f32,
}

struct ChainSlot {
    kind: BackendKind,
    backend: Box<dyn DetectorBackend>,
    health: BackendHealth,
}

/// Skips expensive inference on static scenes. Inference re-runs once the
/// configured minimum interval has elapsed or the sampled pixel difference
/// against the previously inferred frame exceeds the configured delta.
struct MotionGate {
    last_run_at: Option<Instant>,
    last_sample: Option<Vec<u8>>,
    last_result: Vec<RawDetection>,
    widen_factor: f32,
}

const GATE_SAMPLE_STRIDE: usize = 97;

impl MotionGate {
    fn new() -> Self {
        Self {
            last_run_at: None,
            last_sample: None,
            last_result: Vec::new(),
            widen_factor: 1.0,
        }
    }

    fn sample(pixels: &[u8]) -> Vec<u8> {
        pixels.iter().step_by(GATE_SAMPLE_STRIDE).copied().collect()
    }

    fn mean_abs_delta(a: &[u8], b: &[u8]) -> f32 {
        if a.is_empty() || a.len() != b.len() {
            // Resolution changed; treat as full motion.
            return f32::MAX;
        }
        let sum: u64 = a
            .iter()
            .zip(b)
            .map(|(&x, &y)| (x as i32 - y as i32).unsigned_abs() as u64)
            .sum();
        sum as f32 / a.len() as f32
    }

    /// Decide whether inference should run for this frame.
    fn should_run(&self, pixels: &[u8], min_interval: Duration, min_pixel_delta: f32) -> bool {
        let Some(last_run_at) = self.last_run_at else {
            return true;
        };
        let widened = min_interval.mul_f32(self.widen_factor.max(1.0));
        if last_run_at.elapsed() >= widened {
            return true;
        }
        match &self.last_sample {
            Some(prev) => Self::mean_abs_delta(prev, &Self::sample(pixels)) >= min_pixel_delta,
            None => true,
        }
    }

    fn record_run(&mut self, pixels: &[u8], result: Vec<RawDetection>) {
        self.last_run_at = Some(Instant::now());
        self.last_sample = Some(Self::sample(pixels));
        self.last_result = result;
    }
}

pub struct DetectionEngine {
    chain: Vec<ChainSlot>,
    active_idx: usize,
    settings: EngineSettings,
    gate: MotionGate,
    demotions: u32,
    gated_frames: u64,
}

impl DetectionEngine {
    /// Build an engine over an explicit backend chain. The first slot is the
    /// active backend. Fails if the chain is empty.
    pub fn with_chain(
        chain: Vec<(BackendKind, Box<dyn DetectorBackend>)>,
        settings: EngineSettings,
    ) -> Result<Self> {
        if chain.is_empty() {
            return Err(anyhow!("detection engine requires at least one backend"));
        }
        let chain = chain
            .into_iter()
            .map(|(kind, backend)| ChainSlot {
                kind,
                backend,
                health: BackendHealth::default(),
            })
            .collect::<Vec<_>>();

        let mut engine = Self {
            chain,
            active_idx: 0,
            settings,
            gate: MotionGate::new(),
            demotions: 0,
            gated_frames: 0,
        };
        if let Err(e) = engine.chain[0].backend.warm_up() {
            log::warn!("backend {} warm-up failed: {}", engine.chain[0].kind.as_str(), e);
        }
        Ok(engine)
    }

    /// Probe the standard fallback chain in priority order: quantized neural
    /// detector, strict cascade, permissive cascade, mock. Backends that fail
    /// to construct are logged and skipped; the mock backend cannot fail, so
    /// the chain is never empty.
    pub fn from_settings(settings: EngineSettings) -> Result<Self> {
        use crate::detect::backends::{CascadeBackend, MockBackend};

        let mut chain: Vec<(BackendKind, Box<dyn DetectorBackend>)> = Vec::new();

        match Self::build_primary(&settings) {
            Ok(backend) => chain.push((BackendKind::Primary, backend)),
            Err(e) => log::warn!("primary backend unavailable: {}", e),
        }
        chain.push((BackendKind::Secondary, Box::new(CascadeBackend::strict())));
        chain.push((BackendKind::Tertiary, Box::new(CascadeBackend::permissive())));
        chain.push((BackendKind::Mock, Box::new(MockBackend::new())));

        let active = chain[0].0;
        let engine = Self::with_chain(chain, settings)?;
        log::info!("detection engine active backend: {}", active.as_str());
        Ok(engine)
    }

    #[cfg(feature = "backend-tract")]
    fn build_primary(settings: &EngineSettings) -> Result<Box<dyn DetectorBackend>> {
        use crate::detect::backends::TractBackend;

        let model_path = settings
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow!("no model path configured"))?;
        let backend = TractBackend::new(
            model_path,
            settings.model_input_width,
            settings.model_input_height,
        )?;
        Ok(Box::new(backend))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn build_primary(_settings: &EngineSettings) -> Result<Box<dyn DetectorBackend>> {
        Err(anyhow!("built without the backend-tract feature"))
    }

    pub fn current_backend(&self) -> BackendKind {
        self.chain[self.active_idx].kind
    }

    pub fn state(&self) -> EngineState {
        EngineState {
            active: self.current_backend(),
            health: self
                .chain
                .iter()
                .map(|slot| (slot.kind, slot.health))
                .collect(),
            demotions: self.demotions,
            gated_frames: self.gated_frames,
            gate_widen_factor: self.gate.widen_factor,
        }
    }

    /// Replace tunable settings from a fresh configuration snapshot. The
    /// backend chain itself is fixed for the process lifetime.
    pub fn update_settings(&mut self, settings: EngineSettings) {
        self.settings = settings;
    }

    /// Stretch the motion-gating interval by `factor` (>= 1.0). Used by the
    /// resource monitor to shed load without changing backends.
    pub fn widen_gate(&mut self, factor: f32) {
        self.gate.widen_factor = factor.max(1.0);
        log::info!("motion gate widened by {:.1}x", self.gate.widen_factor);
    }

    /// Force a switch to `kind`. Only downward moves are honored; the engine
    /// never promotes back up within a process lifetime.
    pub fn force_backend(&mut self, kind: BackendKind) {
        let Some(target_idx) = self.chain.iter().position(|slot| slot.kind == kind) else {
            log::warn!("force_backend: {} not in chain", kind.as_str());
            return;
        };
        if target_idx <= self.active_idx {
            log::warn!(
                "force_backend: refusing promotion from {} to {}",
                self.current_backend().as_str(),
                kind.as_str()
            );
            return;
        }
        let from = self.current_backend();
        self.active_idx = target_idx;
        self.demotions += 1;
        self.gate.last_result.clear();
        log::warn!(
            "backend demoted (forced): {} -> {}",
            from.as_str(),
            kind.as_str()
        );
    }

    /// Run detection for one frame.
    ///
    /// Inference errors are absorbed: they count against the active backend
    /// and yield an empty result for the frame. Detection never crashes the
    /// pipeline.
    pub fn detect(&mut self, frame: &Frame) -> Vec<RawDetection> {
        let prepared = match self.prepare(frame) {
            Ok(prepared) => prepared,
            Err(e) => {
                log::warn!("frame preparation failed: {}", e);
                return Vec::new();
            }
        };

        if !self.gate.should_run(
            &prepared.pixels,
            self.settings.gate_min_interval,
            self.settings.gate_min_pixel_delta,
        ) {
            self.gated_frames += 1;
            return self.gate.last_result.clone();
        }

        let slot = &mut self.chain[self.active_idx];
        slot.health.invocations += 1;
        let result = slot
            .backend
            .detect(&prepared.pixels, prepared.width, prepared.height);

        match result {
            Ok(detections) => {
                slot.health.consecutive_errors = 0;
                let mapped = self.map_and_filter(detections, &prepared, frame.seq);
                self.gate.record_run(&prepared.pixels, mapped.clone());
                mapped
            }
            Err(e) => {
                slot.health.consecutive_errors += 1;
                slot.health.total_errors += 1;
                log::warn!(
                    "inference error on {} ({} consecutive): {}",
                    slot.kind.as_str(),
                    slot.health.consecutive_errors,
                    e
                );
                if slot.health.consecutive_errors >= self.settings.max_consecutive_errors {
                    self.demote();
                }
                self.gate.record_run(&prepared.pixels, Vec::new());
                Vec::new()
            }
        }
    }

    fn demote(&mut self) {
        if self.active_idx + 1 >= self.chain.len() {
            log::error!("backend {} failing with no fallback left", self.current_backend().as_str());
            return;
        }
        let from = self.current_backend();
        self.active_idx += 1;
        self.demotions += 1;
        let to = self.current_backend();
        log::warn!("backend demoted: {} -> {}", from.as_str(), to.as_str());
        if let Err(e) = self.chain[self.active_idx].backend.warm_up() {
            log::warn!("backend {} warm-up failed: {}", to.as_str(), e);
        }
    }

    /// Crop to the configured ROI and downsample before inference.
    fn prepare(&self, frame: &Frame) -> Result<PreparedFrame> {
        let pixels = frame.pixels();
        let expected = frame.width as usize * frame.height as usize * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame {} has {} bytes, expected {}",
                frame.seq,
                pixels.len(),
                expected
            ));
        }

        let roi = self
            .settings
            .roi
            .map(|roi| roi.clamped(frame.width, frame.height))
            .unwrap_or(Roi {
                x: 0,
                y: 0,
                width: frame.width,
                height: frame.height,
            });

        let scale = self.settings.downsample.clamp(0.1, 1.0);
        let out_w = ((roi.width as f32 * scale) as u32).max(1);
        let out_h = ((roi.height as f32 * scale) as u32).max(1);

        let mut out = Vec::with_capacity(out_w as usize * out_h as usize * 3);
        for y in 0..out_h {
            let src_y = roi.y as usize + (y as usize * roi.height as usize / out_h as usize);
            for x in 0..out_w {
                let src_x = roi.x as usize + (x as usize * roi.width as usize / out_w as usize);
                let idx = (src_y * frame.width as usize + src_x) * 3;
                out.extend_from_slice(&pixels[idx..idx + 3]);
            }
        }

        Ok(PreparedFrame {
            pixels: out,
            width: out_w,
            height: out_h,
            offset_x: roi.x,
            offset_y: roi.y,
            scale,
        })
    }

    /// Map backend coordinates back to full-frame space, keep only the
    /// object-of-interest class, and suppress duplicates.
    fn map_and_filter(
        &self,
        detections: Vec<crate::detect::backend::BackendDetection>,
        prepared: &PreparedFrame,
        frame_seq: u64,
    ) -> Vec<RawDetection> {
        let backend = self.current_backend();
        let boxes: Vec<_> = detections
            .into_iter()
            .filter(|d| d.class == ObjectClass::Cat)
            .map(|d| {
                let mut bbox = d.bbox;
                bbox.x = prepared.offset_x + (bbox.x as f32 / prepared.scale) as i32;
                bbox.y = prepared.offset_y + (bbox.y as f32 / prepared.scale) as i32;
                bbox.width = (bbox.width as f32 / prepared.scale) as u32;
                bbox.height = (bbox.height as f32 / prepared.scale) as u32;
                bbox
            })
            .collect();

        non_max_suppression(boxes, self.settings.nms_iou_threshold)
            .into_iter()
            .map(|bbox| RawDetection {
                bbox,
                backend,
                frame_seq,
            })
            .collect()
    }
}

struct PreparedFrame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    offset_x: i32,
    offset_y: i32,
    scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backend::BackendDetection;
    use crate::detect::result::BoundingBox;

    struct ScriptedBackend {
        results: Vec<Result<Vec<BackendDetection>>>,
    }

    impl ScriptedBackend {
        fn always_failing() -> Self {
            Self { results: Vec::new() }
        }

        fn returning(boxes: Vec<BackendDetection>) -> Self {
            Self {
                results: vec![Ok(boxes)],
            }
        }
    }

    impl DetectorBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<BackendDetection>> {
            if self.results.is_empty() {
                Err(anyhow!("scripted failure"))
            } else {
                self.results.remove(0)
            }
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            model_path: None,
            model_input_width: 224,
            model_input_height: 224,
            roi: None,
            downsample: 1.0,
            nms_iou_threshold: 0.5,
            max_consecutive_errors: 5,
            gate_min_interval: Duration::from_secs(0),
            gate_min_pixel_delta: 0.0,
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![128; 64 * 48 * 3], 64, 48, seq)
    }

    fn cat_box(x: i32, conf: f32) -> BackendDetection {
        BackendDetection {
            bbox: BoundingBox::new(x, 10, 20, 20, conf),
            class: ObjectClass::Cat,
        }
    }

    fn chain_of(
        backends: Vec<(BackendKind, Box<dyn DetectorBackend>)>,
    ) -> DetectionEngine {
        DetectionEngine::with_chain(backends, settings()).unwrap()
    }

    #[test]
    fn demotes_after_error_ceiling() {
        let mut engine = chain_of(vec![
            (BackendKind::Primary, Box::new(ScriptedBackend::always_failing())),
            (BackendKind::Secondary, Box::new(ScriptedBackend::returning(vec![]))),
        ]);

        for i in 0..5 {
            assert_eq!(engine.current_backend(), BackendKind::Primary, "iteration {}", i);
            let out = engine.detect(&frame(i));
            assert!(out.is_empty(), "errors must convert to empty results");
        }
        assert_eq!(engine.current_backend(), BackendKind::Secondary);
        assert_eq!(engine.state().demotions, 1);
    }

    #[test]
    fn never_promotes_within_process_lifetime() {
        let mut engine = chain_of(vec![
            (BackendKind::Primary, Box::new(ScriptedBackend::always_failing())),
            (BackendKind::Secondary, Box::new(ScriptedBackend::always_failing())),
        ]);
        for i in 0..5 {
            engine.detect(&frame(i));
        }
        assert_eq!(engine.current_backend(), BackendKind::Secondary);

        // A forced move back up is refused.
        engine.force_backend(BackendKind::Primary);
        assert_eq!(engine.current_backend(), BackendKind::Secondary);
    }

    #[test]
    fn force_backend_demotes_only() {
        let mut engine = chain_of(vec![
            (BackendKind::Secondary, Box::new(ScriptedBackend::returning(vec![]))),
            (BackendKind::Tertiary, Box::new(ScriptedBackend::returning(vec![]))),
        ]);
        engine.force_backend(BackendKind::Tertiary);
        assert_eq!(engine.current_backend(), BackendKind::Tertiary);
        engine.force_backend(BackendKind::Secondary);
        assert_eq!(engine.current_backend(), BackendKind::Tertiary);
    }

    #[test]
    fn filters_non_cat_classes_and_applies_nms() {
        let detections = vec![
            cat_box(0, 0.9),
            cat_box(2, 0.6), // overlaps the first, lower confidence
            BackendDetection {
                bbox: BoundingBox::new(40, 10, 20, 20, 0.95),
                class: ObjectClass::Other,
            },
        ];
        let mut engine = chain_of(vec![(
            BackendKind::Secondary,
            Box::new(ScriptedBackend::returning(detections)),
        )]);

        let out = engine.detect(&frame(1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox.confidence, 0.9);
        assert_eq!(out[0].backend, BackendKind::Secondary);
        assert_eq!(out[0].frame_seq, 1);
    }

    #[test]
    fn motion_gate_returns_last_result_on_static_scene() {
        let mut cfg = settings();
        cfg.gate_min_interval = Duration::from_secs(3600);
        cfg.gate_min_pixel_delta = 1.0;

        let mut engine = DetectionEngine::with_chain(
            vec![(
                BackendKind::Secondary,
                Box::new(ScriptedBackend {
                    results: vec![Ok(vec![cat_box(0, 0.9)])],
                }),
            )],
            cfg,
        )
        .unwrap();

        let first = engine.detect(&frame(1));
        assert_eq!(first.len(), 1);

        // Identical pixels within the interval: gated, result repeated and
        // the backend (now out of scripted results) is not invoked.
        let second = engine.detect(&frame(2));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].bbox.confidence, first[0].bbox.confidence);
        assert_eq!(engine.state().gated_frames, 1);
    }

    #[test]
    fn roi_crop_maps_coordinates_back_to_frame_space() {
        let mut cfg = settings();
        cfg.roi = Some(Roi {
            x: 10,
            y: 8,
            width: 40,
            height: 32,
        });

        let mut engine = DetectionEngine::with_chain(
            vec![(
                BackendKind::Secondary,
                Box::new(ScriptedBackend::returning(vec![cat_box(5, 0.9)])),
            )],
            cfg,
        )
        .unwrap();

        let out = engine.detect(&frame(1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox.x, 15); // roi.x + 5
        assert_eq!(out[0].bbox.y, 18); // roi.y + 10
    }
}
