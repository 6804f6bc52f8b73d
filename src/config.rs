//! Typed configuration with file + environment loading and hot reload.
//!
//! Configuration is read from a JSON file (all fields optional, defaults
//! applied), then overridden by `CAT_SENTRY_*` environment variables, then
//! validated. The running pipeline holds a `ConfigStore` which polls the
//! file's mtime and swaps in a fresh snapshot, so threshold changes take
//! effect without a restart.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

const DEFAULT_DB_PATH: &str = "cat_sentry.db";
const DEFAULT_CAMERA_URL: &str = "stub://counter_cam";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: f32 = 1.0;
const DEFAULT_MAX_CAPTURE_FAILURES: u32 = 5;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;
const DEFAULT_MIN_BOX_SIDE: u32 = 30;
const DEFAULT_MAX_BOX_SIDE: u32 = 300;
const DEFAULT_CONSISTENCY_FRAMES: u32 = 2;
const DEFAULT_ASSOCIATION_IOU: f32 = 0.3;
const DEFAULT_TRACK_TTL_FRAMES: u64 = 25;
const DEFAULT_NMS_IOU: f32 = 0.5;
const DEFAULT_MAX_INFERENCE_ERRORS: u32 = 5;
const DEFAULT_GATE_INTERVAL_SECS: f32 = 2.0;
const DEFAULT_GATE_PIXEL_DELTA: f32 = 4.0;
const DEFAULT_MODEL_INPUT: u32 = 224;
const DEFAULT_COOLDOWN_SECS: u64 = 300;
const DEFAULT_RETRY_BASE_SECS: u64 = 5;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_PER_HOUR: u32 = 12;
const DEFAULT_MAX_CPU_PCT: f32 = 80.0;
const DEFAULT_MAX_MEMORY_PCT: f32 = 80.0;
const DEFAULT_MAX_TEMP_C: f32 = 80.0;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;
const DEFAULT_BREACH_STREAK: u32 = 3;
const DEFAULT_HARD_BREACH_STREAK: u32 = 10;
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 30;

/// Region of interest in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn contains_center(&self, center: (i32, i32)) -> bool {
        let (cx, cy) = center;
        cx >= self.x
            && cx <= self.x + self.width as i32
            && cy >= self.y
            && cy <= self.y + self.height as i32
    }

    /// Clamp to frame bounds so a stale configured ROI cannot index out of
    /// the pixel buffer.
    pub fn clamped(&self, frame_width: u32, frame_height: u32) -> Roi {
        let x = self.x.clamp(0, frame_width.saturating_sub(1) as i32);
        let y = self.y.clamp(0, frame_height.saturating_sub(1) as i32);
        let width = self.width.min(frame_width - x as u32).max(1);
        let height = self.height.min(frame_height - y as u32).max(1);
        Roi {
            x,
            y,
            width,
            height,
        }
    }
}

// ----------------------------------------------------------------------------
// File-shaped structs: everything optional, defaults applied in from_file.
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct SentryConfigFile {
    db_path: Option<String>,
    snapshot_dir: Option<PathBuf>,
    camera: Option<CameraConfigFile>,
    engine: Option<EngineConfigFile>,
    validator: Option<ValidatorConfigFile>,
    notify: Option<NotifyConfigFile>,
    monitor: Option<MonitorConfigFile>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<f32>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    model_path: Option<PathBuf>,
    model_input_width: Option<u32>,
    model_input_height: Option<u32>,
    roi: Option<Roi>,
    downsample: Option<f32>,
    nms_iou_threshold: Option<f32>,
    max_consecutive_errors: Option<u32>,
    gate_min_interval_secs: Option<f32>,
    gate_min_pixel_delta: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ValidatorConfigFile {
    confidence_threshold: Option<f32>,
    min_box_side: Option<u32>,
    max_box_side: Option<u32>,
    roi: Option<Roi>,
    consistency_frames: Option<u32>,
    association_iou: Option<f32>,
    track_ttl_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    cooldown_secs: Option<u64>,
    retry_base_secs: Option<u64>,
    max_attempts: Option<u32>,
    max_per_hour: Option<u32>,
    quiet_hours_start: Option<u8>,
    quiet_hours_end: Option<u8>,
    webhook_url: Option<String>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    host: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    max_cpu_pct: Option<f32>,
    max_memory_pct: Option<f32>,
    max_temp_c: Option<f32>,
    sample_interval_secs: Option<u64>,
    breach_streak: Option<u32>,
    hard_breach_streak: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    seconds: Option<u64>,
}

// ----------------------------------------------------------------------------
// Resolved settings
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: f32,
    pub max_consecutive_failures: u32,
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub model_path: Option<PathBuf>,
    pub model_input_width: u32,
    pub model_input_height: u32,
    pub roi: Option<Roi>,
    /// Fixed downsample ratio applied before inference; 1.0 disables.
    pub downsample: f32,
    pub nms_iou_threshold: f32,
    pub max_consecutive_errors: u32,
    pub gate_min_interval: Duration,
    pub gate_min_pixel_delta: f32,
}

#[derive(Clone, Debug)]
pub struct ValidatorSettings {
    pub confidence_threshold: f32,
    pub min_box_side: u32,
    pub max_box_side: u32,
    pub roi: Roi,
    /// K: consecutive overlapping observations before a track validates.
    pub consistency_frames: u32,
    pub association_iou: f32,
    /// M: frames without a match before a track is pruned.
    pub track_ttl_frames: u64,
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
}

#[derive(Clone, Debug)]
pub struct NotifySettings {
    pub cooldown: Duration,
    pub retry_base_delay: Duration,
    pub max_attempts: u32,
    pub max_per_hour: u32,
    /// UTC hours [start, end) during which notifications are suppressed.
    pub quiet_hours: Option<(u8, u8)>,
    pub webhook_url: Option<String>,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub max_cpu_pct: f32,
    pub max_memory_pct: f32,
    pub max_temp_c: f32,
    pub sample_interval: Duration,
    /// Consecutive over-ceiling samples before the graduated response starts.
    pub breach_streak: u32,
    /// Consecutive over-ceiling samples before a restart is requested.
    pub hard_breach_streak: u32,
}

#[derive(Clone, Debug)]
pub struct SentryConfig {
    pub db_path: String,
    /// Directory for annotated event snapshots; disabled when unset.
    pub snapshot_dir: Option<PathBuf>,
    pub camera: CameraSettings,
    pub engine: EngineSettings,
    pub validator: ValidatorSettings,
    pub notify: NotifySettings,
    pub monitor: MonitorSettings,
    pub retention: Duration,
}

impl SentryConfig {
    /// Load from the file named by `CAT_SENTRY_CONFIG` (if set), apply
    /// environment overrides, and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAT_SENTRY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SentryConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentryConfigFile) -> Result<Self> {
        let camera = file.camera.unwrap_or_default();
        let engine = file.engine.unwrap_or_default();
        let validator = file.validator.unwrap_or_default();
        let notify = file.notify.unwrap_or_default();
        let monitor = file.monitor.unwrap_or_default();

        let width = camera.width.unwrap_or(DEFAULT_WIDTH);
        let height = camera.height.unwrap_or(DEFAULT_HEIGHT);

        let quiet_hours = match (notify.quiet_hours_start, notify.quiet_hours_end) {
            (Some(start), Some(end)) => Some((start, end)),
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "quiet_hours_start and quiet_hours_end must be set together"
                ))
            }
        };

        let mqtt = notify.mqtt.and_then(|mqtt| {
            mqtt.host.map(|host| MqttSettings {
                host,
                port: mqtt.port.unwrap_or(1883),
                topic: mqtt
                    .topic
                    .unwrap_or_else(|| "cat_sentry/detections".to_string()),
            })
        });

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            snapshot_dir: file.snapshot_dir,
            camera: CameraSettings {
                url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                width,
                height,
                target_fps: camera.target_fps.unwrap_or(DEFAULT_FPS),
                max_consecutive_failures: camera
                    .max_consecutive_failures
                    .unwrap_or(DEFAULT_MAX_CAPTURE_FAILURES),
            },
            engine: EngineSettings {
                model_path: engine.model_path,
                model_input_width: engine.model_input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                model_input_height: engine.model_input_height.unwrap_or(DEFAULT_MODEL_INPUT),
                roi: engine.roi,
                downsample: engine.downsample.unwrap_or(1.0),
                nms_iou_threshold: engine.nms_iou_threshold.unwrap_or(DEFAULT_NMS_IOU),
                max_consecutive_errors: engine
                    .max_consecutive_errors
                    .unwrap_or(DEFAULT_MAX_INFERENCE_ERRORS),
                gate_min_interval: Duration::from_secs_f32(
                    engine
                        .gate_min_interval_secs
                        .unwrap_or(DEFAULT_GATE_INTERVAL_SECS),
                ),
                gate_min_pixel_delta: engine
                    .gate_min_pixel_delta
                    .unwrap_or(DEFAULT_GATE_PIXEL_DELTA),
            },
            validator: ValidatorSettings {
                confidence_threshold: validator
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                min_box_side: validator.min_box_side.unwrap_or(DEFAULT_MIN_BOX_SIDE),
                max_box_side: validator.max_box_side.unwrap_or(DEFAULT_MAX_BOX_SIDE),
                roi: validator.roi.unwrap_or(Roi {
                    x: 0,
                    y: 0,
                    width,
                    height,
                }),
                consistency_frames: validator
                    .consistency_frames
                    .unwrap_or(DEFAULT_CONSISTENCY_FRAMES),
                association_iou: validator.association_iou.unwrap_or(DEFAULT_ASSOCIATION_IOU),
                track_ttl_frames: validator
                    .track_ttl_frames
                    .unwrap_or(DEFAULT_TRACK_TTL_FRAMES),
            },
            notify: NotifySettings {
                cooldown: Duration::from_secs(notify.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS)),
                retry_base_delay: Duration::from_secs(
                    notify.retry_base_secs.unwrap_or(DEFAULT_RETRY_BASE_SECS),
                ),
                max_attempts: notify.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                max_per_hour: notify.max_per_hour.unwrap_or(DEFAULT_MAX_PER_HOUR),
                quiet_hours,
                webhook_url: notify.webhook_url,
                mqtt,
            },
            monitor: MonitorSettings {
                max_cpu_pct: monitor.max_cpu_pct.unwrap_or(DEFAULT_MAX_CPU_PCT),
                max_memory_pct: monitor.max_memory_pct.unwrap_or(DEFAULT_MAX_MEMORY_PCT),
                max_temp_c: monitor.max_temp_c.unwrap_or(DEFAULT_MAX_TEMP_C),
                sample_interval: Duration::from_secs(
                    monitor
                        .sample_interval_secs
                        .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS),
                ),
                breach_streak: monitor.breach_streak.unwrap_or(DEFAULT_BREACH_STREAK),
                hard_breach_streak: monitor
                    .hard_breach_streak
                    .unwrap_or(DEFAULT_HARD_BREACH_STREAK),
            },
            retention: Duration::from_secs(
                file.retention
                    .and_then(|retention| retention.seconds)
                    .unwrap_or(DEFAULT_RETENTION_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("CAT_SENTRY_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(url) = std::env::var("CAT_SENTRY_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(url) = std::env::var("CAT_SENTRY_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                self.notify.webhook_url = Some(url);
            }
        }
        if let Ok(threshold) = std::env::var("CAT_SENTRY_CONFIDENCE") {
            let value: f32 = threshold
                .parse()
                .map_err(|_| anyhow!("CAT_SENTRY_CONFIDENCE must be a number in [0,1]"))?;
            self.validator.confidence_threshold = value;
        }
        if let Ok(secs) = std::env::var("CAT_SENTRY_COOLDOWN_SECS") {
            let value: u64 = secs
                .parse()
                .map_err(|_| anyhow!("CAT_SENTRY_COOLDOWN_SECS must be an integer"))?;
            self.notify.cooldown = Duration::from_secs(value);
        }
        if let Ok(secs) = std::env::var("CAT_SENTRY_RETENTION_SECS") {
            let value: u64 = secs
                .parse()
                .map_err(|_| anyhow!("CAT_SENTRY_RETENTION_SECS must be an integer"))?;
            self.retention = Duration::from_secs(value);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.validator.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be in [0,1]"));
        }
        if self.validator.min_box_side > self.validator.max_box_side {
            return Err(anyhow!("min_box_side exceeds max_box_side"));
        }
        if self.validator.consistency_frames == 0 {
            return Err(anyhow!("consistency_frames must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.engine.nms_iou_threshold) {
            return Err(anyhow!("nms_iou_threshold must be in [0,1]"));
        }
        if !(0.1..=1.0).contains(&self.engine.downsample) {
            return Err(anyhow!("downsample must be in (0.1, 1.0]"));
        }
        if self.camera.target_fps <= 0.0 || self.camera.target_fps > 30.0 {
            return Err(anyhow!("target_fps must be in (0, 30]"));
        }
        if self.notify.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be at least 1"));
        }
        if let Some((start, end)) = self.notify.quiet_hours {
            if start > 23 || end > 23 {
                return Err(anyhow!("quiet hours must be in 0..=23"));
            }
        }
        if self.retention.as_secs() == 0 {
            return Err(anyhow!("retention must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SentryConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

// ----------------------------------------------------------------------------
// Hot reload
// ----------------------------------------------------------------------------

/// Shared configuration snapshot with mtime-based hot reload.
///
/// Workers call `snapshot()` each loop iteration; `poll()` (driven by the
/// pipeline at a low frequency) re-reads the file when its mtime changes and
/// swaps the snapshot in. A config file that becomes invalid is logged and
/// ignored; the previous snapshot stays active.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: Mutex<Arc<SentryConfig>>,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    pub fn new(config: SentryConfig, path: Option<PathBuf>) -> Self {
        let last_mtime = path.as_ref().and_then(|p| file_mtime(p));
        Self {
            path,
            current: Mutex::new(Arc::new(config)),
            last_mtime: Mutex::new(last_mtime),
        }
    }

    pub fn snapshot(&self) -> Arc<SentryConfig> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Re-read the file if its mtime advanced. Returns true when a new
    /// snapshot was installed.
    pub fn poll(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let Some(mtime) = file_mtime(path) else {
            return false;
        };
        {
            let mut last = self.last_mtime.lock().unwrap_or_else(|e| e.into_inner());
            if *last == Some(mtime) {
                return false;
            }
            *last = Some(mtime);
        }
        match SentryConfig::load_from(Some(path)) {
            Ok(fresh) => {
                let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
                *current = Arc::new(fresh);
                log::info!("configuration reloaded from {}", path.display());
                true
            }
            Err(e) => {
                log::warn!("configuration reload rejected: {}", e);
                false
            }
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = SentryConfig::load_from(None).expect("defaults load");
        assert_eq!(cfg.validator.confidence_threshold, 0.7);
        assert_eq!(cfg.notify.cooldown.as_secs(), 300);
        assert_eq!(cfg.notify.max_attempts, 3);
        assert_eq!(cfg.engine.nms_iou_threshold, 0.5);
        assert_eq!(cfg.validator.consistency_frames, 2);
    }

    #[test]
    fn roi_center_containment() {
        let roi = Roi {
            x: 100,
            y: 100,
            width: 200,
            height: 100,
        };
        assert!(roi.contains_center((150, 150)));
        assert!(roi.contains_center((100, 100)));
        assert!(!roi.contains_center((50, 150)));
        assert!(!roi.contains_center((150, 250)));
    }

    #[test]
    fn roi_clamps_to_frame_bounds() {
        let roi = Roi {
            x: 600,
            y: 400,
            width: 200,
            height: 200,
        };
        let clamped = roi.clamped(640, 480);
        assert!(clamped.x + clamped.width as i32 <= 640);
        assert!(clamped.y + clamped.height as i32 <= 480);
    }

    #[test]
    fn rejects_inverted_size_window() {
        let file = SentryConfigFile {
            validator: Some(ValidatorConfigFile {
                min_box_side: Some(400),
                max_box_side: Some(100),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cfg = SentryConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn quiet_hours_must_be_paired() {
        let file = SentryConfigFile {
            notify: Some(NotifyConfigFile {
                quiet_hours_start: Some(22),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(SentryConfig::from_file(file).is_err());
    }
}
