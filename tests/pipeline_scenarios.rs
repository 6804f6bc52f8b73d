//! End-to-end pipeline scenarios over the synthetic camera.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use cat_sentry::capture::open_camera;
use cat_sentry::config::{ConfigStore, SentryConfig};
use cat_sentry::detect::backend::{BackendDetection, DetectorBackend};
use cat_sentry::detect::engine::DetectionEngine;
use cat_sentry::detect::result::{BackendKind, BoundingBox, ObjectClass};
use cat_sentry::notify::NotificationChannel;
use cat_sentry::pipeline::{Pipeline, StatusSnapshot};
use cat_sentry::storage::InMemoryEventStore;
use cat_sentry::validate::ValidatedEvent;

/// Backend that reports a fixed cat box on a repeating 2-on/1-off cycle, so
/// the validator keeps producing fresh events.
struct CyclingBackend {
    calls: u64,
    on_frames: u64,
    period: u64,
}

impl CyclingBackend {
    fn steady() -> Self {
        Self {
            calls: 0,
            on_frames: u64::MAX,
            period: u64::MAX,
        }
    }

    fn cycling() -> Self {
        Self {
            calls: 0,
            on_frames: 2,
            period: 3,
        }
    }
}

impl DetectorBackend for CyclingBackend {
    fn name(&self) -> &'static str {
        "cycling"
    }

    fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<BackendDetection>> {
        let n = self.calls;
        self.calls += 1;
        if n % self.period < self.on_frames {
            Ok(vec![BackendDetection {
                bbox: BoundingBox::new(12, 10, 20, 20, 0.9),
                class: ObjectClass::Cat,
            }])
        } else {
            Ok(Vec::new())
        }
    }
}

struct FailingBackend;

impl DetectorBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<BackendDetection>> {
        Err(anyhow::anyhow!("inference crashed"))
    }
}

struct CountingChannel {
    calls: Arc<AtomicU32>,
}

impl NotificationChannel for CountingChannel {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn send(&mut self, _event: &ValidatedEvent) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_config() -> SentryConfig {
    let mut cfg = SentryConfig::load_from(None).expect("defaults");
    cfg.camera.url = "stub://test".to_string();
    cfg.camera.width = 64;
    cfg.camera.height = 48;
    cfg.camera.target_fps = 30.0;
    cfg.engine.gate_min_interval = Duration::from_secs(0);
    cfg.engine.gate_min_pixel_delta = 0.0;
    cfg.validator.min_box_side = 10;
    cfg.notify.cooldown = Duration::from_secs(0);
    cfg.notify.retry_base_delay = Duration::from_millis(10);
    cfg
}

fn start_pipeline(
    cfg: SentryConfig,
    chain: Vec<(BackendKind, Box<dyn DetectorBackend>)>,
    channels: Vec<Box<dyn NotificationChannel>>,
) -> Pipeline {
    let camera = open_camera(&cfg.camera).expect("open stub camera");
    let engine = DetectionEngine::with_chain(chain, cfg.engine.clone()).expect("engine");
    let config = Arc::new(ConfigStore::new(cfg, None));
    Pipeline::start_with(
        config,
        engine,
        camera,
        Box::new(InMemoryEventStore::new()),
        channels,
    )
    .expect("pipeline start")
}

fn wait_until(pipeline: &Pipeline, f: impl Fn(StatusSnapshot) -> bool) -> StatusSnapshot {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = pipeline.status();
        if f(status.clone()) || Instant::now() >= deadline {
            return status;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn steady_detection_flows_to_store_and_channel() {
    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = start_pipeline(
        test_config(),
        vec![(
            BackendKind::Secondary,
            Box::new(CyclingBackend::steady()) as Box<dyn DetectorBackend>,
        )],
        vec![Box::new(CountingChannel {
            calls: calls.clone(),
        })],
    );

    let status = wait_until(&pipeline, |s| s.dispatcher.sent >= 1);
    assert!(status.events_validated >= 1, "validator must emit");
    assert!(status.stored_events >= 1, "event must be stored");
    assert!(status.dispatcher.sent >= 1, "event must be delivered");
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(status.engine.active, BackendKind::Secondary);

    let latest = status.latest_event.expect("latest event surfaced");
    assert_eq!(latest.cat_count, 1);
    assert_eq!(latest.boxes.len(), 1);
    assert!(
        pipeline.latest_annotated().is_some(),
        "annotated frame surfaced"
    );

    pipeline.stop();
}

#[test]
fn failing_backend_demotes_without_stopping_the_pipeline() {
    let pipeline = start_pipeline(
        test_config(),
        vec![
            (
                BackendKind::Primary,
                Box::new(FailingBackend) as Box<dyn DetectorBackend>,
            ),
            (
                BackendKind::Secondary,
                Box::new(CyclingBackend::steady()) as Box<dyn DetectorBackend>,
            ),
        ],
        Vec::new(),
    );

    let status = wait_until(&pipeline, |s| s.engine.active == BackendKind::Secondary);
    assert_eq!(status.engine.active, BackendKind::Secondary);
    assert_eq!(status.engine.demotions, 1);

    // The fallback keeps producing validated events.
    let status = wait_until(&pipeline, |s| s.events_validated >= 1);
    assert!(status.events_validated >= 1);

    pipeline.stop();
}

#[test]
fn cooldown_limits_deliveries_while_events_keep_storing() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut cfg = test_config();
    cfg.notify.cooldown = Duration::from_secs(300);

    let pipeline = start_pipeline(
        cfg,
        vec![(
            BackendKind::Secondary,
            Box::new(CyclingBackend::cycling()) as Box<dyn DetectorBackend>,
        )],
        vec![Box::new(CountingChannel {
            calls: calls.clone(),
        })],
    );

    let status = wait_until(&pipeline, |s| {
        s.dispatcher.sent + s.dispatcher.suppressed_cooldown >= 3
    });
    assert_eq!(status.dispatcher.sent, 1, "only the first clears cooldown");
    assert!(status.dispatcher.suppressed_cooldown >= 2);
    assert!(
        status.stored_events > status.dispatcher.sent,
        "suppressed events are still persisted"
    );

    pipeline.stop();
}

#[test]
fn shutdown_is_clean_with_no_events() {
    let pipeline = start_pipeline(
        test_config(),
        vec![(
            BackendKind::Mock,
            Box::new(cat_sentry::detect::backends::MockBackend::new()) as Box<dyn DetectorBackend>,
        )],
        Vec::new(),
    );
    let status = wait_until(&pipeline, |s| s.frames_processed >= 3);
    assert!(status.frames_processed >= 3);
    assert_eq!(status.events_validated, 0);
    pipeline.stop();
}
