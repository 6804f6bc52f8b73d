//! Pipeline orchestration.
//!
//! Wires the capture worker, detection loop, validator, event store, and
//! notification dispatcher together, and hosts the supervisor hooks the
//! resource monitor drives. Each stage runs on its own thread; frames flow
//! through the shared `FrameSlot`, events flow store-first so history
//! survives a delivery outage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::capture::{open_camera, CameraDevice, CaptureService, CaptureStatus};
use crate::config::ConfigStore;
use crate::detect::engine::{DetectionEngine, EngineState};
use crate::frame::FrameMeta;
use crate::monitor::{ResourceMonitor, ResourceSnapshot, Supervisor};
use crate::notify::{DispatcherStats, NotificationChannel, NotificationDispatcher};
use crate::storage::EventStore;
use crate::validate::{DetectionValidator, ValidatedEvent};

const DETECT_POLL: Duration = Duration::from_millis(10);
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(2);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Point-in-time view of the whole pipeline for logs and the status surface.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub capture: CaptureStatus,
    pub engine: EngineState,
    pub dispatcher: DispatcherStats,
    pub frames_processed: u64,
    pub events_validated: u64,
    pub stored_events: u64,
    pub resources: Option<ResourceSnapshot>,
    pub latest_event: Option<ValidatedEvent>,
}

struct Shared {
    engine: Mutex<DetectionEngine>,
    validator: Mutex<DetectionValidator>,
    store: Mutex<Box<dyn EventStore>>,
    frames_processed: AtomicU64,
    events_validated: AtomicU64,
    restart_requested: AtomicBool,
    latest_event: Mutex<Option<ValidatedEvent>>,
    latest_annotated: Mutex<Option<Vec<u8>>>,
}

/// Supervisor hooks exposed to the resource monitor.
struct PipelineSupervisor {
    shared: Arc<Shared>,
    capture_slot: Arc<crate::frame::FrameSlot>,
}

impl Supervisor for PipelineSupervisor {
    fn degrade(&self, level: u32) {
        let factor = 1.0 + level as f32 * 3.0;
        let mut engine = self.shared.engine.lock().unwrap_or_else(|e| e.into_inner());
        engine.widen_gate(factor);
        if level > 0 {
            let cheaper = engine.current_backend().next();
            if let Some(kind) = cheaper {
                engine.force_backend(kind);
            }
        }
    }

    fn reclaim(&self) {
        log::warn!("reclaim pass: dropping buffered frame and temporal state");
        self.capture_slot.clear();
        let mut validator = self
            .shared
            .validator
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        validator.reset();
    }

    fn request_restart(&self) {
        log::error!("sustained resource pressure; requesting restart");
        self.shared.restart_requested.store(true, Ordering::Relaxed);
    }
}

pub struct Pipeline {
    shutdown: Arc<AtomicBool>,
    shared: Arc<Shared>,
    capture: Option<CaptureService>,
    dispatcher: Option<NotificationDispatcher>,
    monitor: Option<ResourceMonitor>,
    detect_handle: Option<JoinHandle<()>>,
    housekeeping_handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Production wiring: camera from the configured URL, detector chain
    /// probed from settings.
    pub fn start(
        config: Arc<ConfigStore>,
        store: Box<dyn EventStore>,
        channels: Vec<Box<dyn NotificationChannel>>,
    ) -> Result<Self> {
        let snapshot = config.snapshot();
        let camera = open_camera(&snapshot.camera).context("open camera")?;
        let engine =
            DetectionEngine::from_settings(snapshot.engine.clone()).context("build detector")?;
        Self::start_with(config, engine, camera, store, channels)
    }

    /// Wiring with explicit parts. Production goes through `start`; tests
    /// inject scripted cameras and backends here.
    pub fn start_with(
        config: Arc<ConfigStore>,
        engine: DetectionEngine,
        camera: Box<dyn CameraDevice>,
        store: Box<dyn EventStore>,
        channels: Vec<Box<dyn NotificationChannel>>,
    ) -> Result<Self> {
        let snapshot = config.snapshot();
        let shutdown = Arc::new(AtomicBool::new(false));

        let capture = CaptureService::start(camera, snapshot.camera.clone());
        let dispatcher = NotificationDispatcher::start(channels, snapshot.notify.clone());

        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            validator: Mutex::new(DetectionValidator::new(snapshot.validator.clone())),
            store: Mutex::new(store),
            frames_processed: AtomicU64::new(0),
            events_validated: AtomicU64::new(0),
            restart_requested: AtomicBool::new(false),
            latest_event: Mutex::new(None),
            latest_annotated: Mutex::new(None),
        });

        let supervisor = PipelineSupervisor {
            shared: shared.clone(),
            capture_slot: capture.frame_slot(),
        };
        let monitor = ResourceMonitor::start(snapshot.monitor.clone(), Box::new(supervisor));

        let detect_handle = spawn_detect_worker(
            shared.clone(),
            capture.frame_slot(),
            dispatcher.handle(),
            snapshot.snapshot_dir.clone(),
            shutdown.clone(),
        )?;
        let housekeeping_handle =
            spawn_housekeeping(shared.clone(), config, dispatcher.settings_handle(), shutdown.clone())?;

        Ok(Self {
            shutdown,
            shared,
            capture: Some(capture),
            dispatcher: Some(dispatcher),
            monitor: Some(monitor),
            detect_handle: Some(detect_handle),
            housekeeping_handle: Some(housekeeping_handle),
        })
    }

    pub fn restart_requested(&self) -> bool {
        self.shared.restart_requested.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> StatusSnapshot {
        let engine = {
            let guard = self.shared.engine.lock().unwrap_or_else(|e| e.into_inner());
            guard.state()
        };
        let stored_events = {
            let store = self.shared.store.lock().unwrap_or_else(|e| e.into_inner());
            store.count().unwrap_or(0)
        };
        StatusSnapshot {
            capture: self
                .capture
                .as_ref()
                .map(|c| c.status())
                .unwrap_or_default(),
            engine,
            dispatcher: self
                .dispatcher
                .as_ref()
                .map(|d| d.stats())
                .unwrap_or_default(),
            frames_processed: self.shared.frames_processed.load(Ordering::Relaxed),
            events_validated: self.shared.events_validated.load(Ordering::Relaxed),
            stored_events,
            resources: self.monitor.as_ref().and_then(|m| m.latest()),
            latest_event: self.latest_event(),
        }
    }

    /// The most recent validated event, if any.
    pub fn latest_event(&self) -> Option<ValidatedEvent> {
        let guard = self
            .shared
            .latest_event
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Raw pixels of the last validated frame with its boxes drawn in, for
    /// a status surface or debugging.
    pub fn latest_annotated(&self) -> Option<Vec<u8>> {
        let guard = self
            .shared
            .latest_annotated
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Orderly shutdown: stop producing frames, drain the detection loop,
    /// then stop delivery and monitoring.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(handle) = self.detect_handle.take() {
            if handle.join().is_err() {
                log::error!("detection thread panicked");
            }
        }
        if let Some(handle) = self.housekeeping_handle.take() {
            if handle.join().is_err() {
                log::error!("housekeeping thread panicked");
            }
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.stop();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        log::info!("pipeline stopped");
    }
}

fn spawn_detect_worker(
    shared: Arc<Shared>,
    slot: Arc<crate::frame::FrameSlot>,
    dispatch: crate::notify::DispatchHandle,
    snapshot_dir: Option<std::path::PathBuf>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("detect".to_string())
        .spawn(move || {
            let mut last_seq: Option<u64> = None;
            while !shutdown.load(Ordering::Relaxed) {
                let Some(frame) = slot.latest() else {
                    thread::sleep(DETECT_POLL);
                    continue;
                };
                // Each frame is processed at most once.
                if last_seq == Some(frame.seq) {
                    thread::sleep(DETECT_POLL);
                    continue;
                }
                last_seq = Some(frame.seq);

                let detections = {
                    let mut engine = shared.engine.lock().unwrap_or_else(|e| e.into_inner());
                    engine.detect(&frame)
                };
                shared.frames_processed.fetch_add(1, Ordering::Relaxed);

                let event = {
                    let mut validator =
                        shared.validator.lock().unwrap_or_else(|e| e.into_inner());
                    validator.validate(&detections, FrameMeta::from(frame.as_ref()))
                };
                if let Some(event) = event {
                    shared.events_validated.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "validated: frame {} has {} cat(s), confidence {:.2} via {}",
                        event.frame_seq,
                        event.cat_count,
                        event.confidence,
                        event.backend.as_str()
                    );
                    {
                        let mut store =
                            shared.store.lock().unwrap_or_else(|e| e.into_inner());
                        if let Err(e) = store.save_event(&event) {
                            log::error!("failed to persist event: {}", e);
                        }
                    }

                    let annotated = crate::annotate::annotated_pixels(&frame, &event.boxes);
                    if let Some(dir) = &snapshot_dir {
                        save_snapshot(dir, &frame, &event, &annotated);
                    }
                    {
                        let mut latest = shared
                            .latest_annotated
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        *latest = Some(annotated);
                    }

                    {
                        let mut latest =
                            shared.latest_event.lock().unwrap_or_else(|e| e.into_inner());
                        *latest = Some(event.clone());
                    }
                    // Store-first, then notify.
                    dispatch.dispatch(event);
                }
            }
            log::info!("detection thread exiting");
        })
        .context("spawn detection thread")
}

#[cfg(feature = "snapshot-jpeg")]
fn save_snapshot(
    dir: &std::path::Path,
    frame: &crate::frame::Frame,
    event: &crate::validate::ValidatedEvent,
    pixels: &[u8],
) {
    match crate::annotate::encode_jpeg(pixels, frame.width, frame.height) {
        Ok(jpeg) => {
            let path = dir.join(format!("cat_{}_{}.jpg", event.unix_time_ms, event.frame_seq));
            if let Err(e) = std::fs::write(&path, jpeg) {
                log::warn!("failed to write snapshot {}: {}", path.display(), e);
            }
        }
        Err(e) => log::warn!("snapshot encode failed: {}", e),
    }
}

#[cfg(not(feature = "snapshot-jpeg"))]
fn save_snapshot(
    _dir: &std::path::Path,
    _frame: &crate::frame::Frame,
    _event: &crate::validate::ValidatedEvent,
    _pixels: &[u8],
) {
    log::debug!("snapshot requested but jpeg support is not compiled in");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineSettings, Roi, ValidatorSettings};
    use crate::detect::backends::MockBackend;
    use crate::detect::result::{BackendKind, BoundingBox, RawDetection};
    use crate::frame::{Frame, FrameSlot};
    use crate::storage::InMemoryEventStore;
    use std::time::SystemTime;

    fn engine_settings() -> EngineSettings {
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

    fn validator_settings() -> ValidatorSettings {
        ValidatorSettings {
            confidence_threshold: 0.7,
            min_box_side: 30,
            max_box_side: 300,
            roi: Roi {
                x: 0,
                y: 0,
                width: 640,
                height: 480,
            },
            consistency_frames: 2,
            association_iou: 0.3,
            track_ttl_frames: 25,
        }
    }

    fn supervisor() -> (PipelineSupervisor, Arc<Shared>, Arc<FrameSlot>) {
        let engine = DetectionEngine::with_chain(
            vec![
                (
                    BackendKind::Secondary,
                    Box::new(MockBackend::new()) as Box<dyn crate::detect::DetectorBackend>,
                ),
                (BackendKind::Tertiary, Box::new(MockBackend::new())),
            ],
            engine_settings(),
        )
        .unwrap();
        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            validator: Mutex::new(DetectionValidator::new(validator_settings())),
            store: Mutex::new(Box::new(InMemoryEventStore::new())),
            frames_processed: AtomicU64::new(0),
            events_validated: AtomicU64::new(0),
            restart_requested: AtomicBool::new(false),
            latest_event: Mutex::new(None),
            latest_annotated: Mutex::new(None),
        });
        let slot = Arc::new(FrameSlot::new());
        let supervisor = PipelineSupervisor {
            shared: shared.clone(),
            capture_slot: slot.clone(),
        };
        (supervisor, shared, slot)
    }

    #[test]
    fn degrade_demotes_backend_and_widens_gate() {
        let (supervisor, shared, _) = supervisor();
        supervisor.degrade(1);
        let state = shared.engine.lock().unwrap().state();
        assert_eq!(state.active, BackendKind::Tertiary);
        assert!((state.gate_widen_factor - 4.0).abs() < 1e-6);
    }

    #[test]
    fn degrade_level_zero_restores_gate_without_demoting() {
        let (supervisor, shared, _) = supervisor();
        supervisor.degrade(0);
        let state = shared.engine.lock().unwrap().state();
        assert_eq!(state.active, BackendKind::Secondary);
        assert!((state.gate_widen_factor - 1.0).abs() < 1e-6);
        assert_eq!(state.demotions, 0);
    }

    #[test]
    fn degrade_from_the_last_backend_still_widens() {
        let (supervisor, shared, _) = supervisor();
        supervisor.degrade(1);
        supervisor.degrade(2);
        let state = shared.engine.lock().unwrap().state();
        // Tertiary has no further fallback here; only the gate moves.
        assert_eq!(state.active, BackendKind::Tertiary);
        assert!((state.gate_widen_factor - 7.0).abs() < 1e-6);
    }

    #[test]
    fn reclaim_clears_frame_slot_and_tracks() {
        let (supervisor, shared, slot) = supervisor();
        slot.store(Frame::new(vec![0; 64 * 48 * 3], 64, 48, 1));
        {
            let mut validator = shared.validator.lock().unwrap();
            let detection = RawDetection {
                bbox: BoundingBox::new(100, 100, 60, 60, 0.9),
                backend: BackendKind::Secondary,
                frame_seq: 1,
            };
            validator.validate(
                &[detection],
                crate::frame::FrameMeta {
                    seq: 1,
                    width: 640,
                    height: 480,
                    captured_at: SystemTime::now(),
                },
            );
            assert_eq!(validator.active_tracks(), 1);
        }

        supervisor.reclaim();

        assert!(slot.latest().is_none());
        assert_eq!(shared.validator.lock().unwrap().active_tracks(), 0);
    }
}

fn spawn_housekeeping(
    shared: Arc<Shared>,
    config: Arc<ConfigStore>,
    dispatcher_settings: crate::notify::SettingsHandle,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("housekeeping".to_string())
        .spawn(move || {
            let mut last_purge = Instant::now();
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(HOUSEKEEPING_TICK);
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                if config.poll() {
                    let fresh = config.snapshot();
                    {
                        let mut engine =
                            shared.engine.lock().unwrap_or_else(|e| e.into_inner());
                        engine.update_settings(fresh.engine.clone());
                    }
                    {
                        let mut validator =
                            shared.validator.lock().unwrap_or_else(|e| e.into_inner());
                        validator.update_settings(fresh.validator.clone());
                    }
                    dispatcher_settings.update(fresh.notify.clone());
                }

                if last_purge.elapsed() >= PURGE_INTERVAL {
                    last_purge = Instant::now();
                    let retention = config.snapshot().retention;
                    let cutoff_ms = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0)
                        .saturating_sub(retention.as_millis() as u64);
                    let mut store = shared.store.lock().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = store.purge_older_than(cutoff_ms) {
                        log::error!("retention purge failed: {}", e);
                    }
                }
            }
        })
        .context("spawn housekeeping thread")
}
