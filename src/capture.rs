//! Frame acquisition on a dedicated worker thread.
//!
//! A `CameraDevice` produces frames; the `CaptureService` owns the device,
//! paces capture to the configured rate, and publishes every frame into the
//! shared `FrameSlot`. Capture failures are tolerated up to a ceiling, after
//! which the camera is flagged unavailable and the worker stops; a source
//! that dead-ends like that needs outside intervention, not a retry loop
//! burning the camera bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::config::CameraSettings;
use crate::frame::{Frame, FrameSlot};

const FAILURE_PAUSE: Duration = Duration::from_secs(1);

/// One camera source. Implementations are driven from the capture thread
/// only, so `&mut self` capture needs no internal locking.
pub trait CameraDevice: Send {
    /// Human-readable source description for logs.
    fn describe(&self) -> String;

    /// Capture one frame, tagging it with the given sequence number.
    fn grab(&mut self, seq: u64) -> Result<Frame>;
}

/// Open a camera by URL.
///
/// `stub://<name>` is a deterministic synthetic source for development and
/// tests; `stub-flaky://<n>` fails every n-th capture to exercise the failure
/// path. Hardware ingest plugs in behind the same trait.
pub fn open_camera(settings: &CameraSettings) -> Result<Box<dyn CameraDevice>> {
    let url = settings.url.as_str();
    if let Some(name) = url.strip_prefix("stub://") {
        return Ok(Box::new(SyntheticCamera::new(
            name.to_string(),
            settings.width,
            settings.height,
        )));
    }
    if let Some(rest) = url.strip_prefix("stub-flaky://") {
        let every: u64 = rest
            .parse()
            .map_err(|_| anyhow!("stub-flaky:// needs a numeric period, got {:?}", rest))?;
        let mut cam = SyntheticCamera::new(format!("flaky-{}", every), settings.width, settings.height);
        cam.fail_every = Some(every.max(1));
        return Ok(Box::new(cam));
    }
    Err(anyhow!("unsupported camera url: {}", url))
}

/// Deterministic synthetic camera.
///
/// Renders a fixed gradient background and, on a slow cycle, a bright moving
/// block so the motion gate and detectors see periodic scene changes.
pub struct SyntheticCamera {
    name: String,
    width: u32,
    height: u32,
    counter: u64,
    fail_every: Option<u64>,
}

impl SyntheticCamera {
    pub fn new(name: String, width: u32, height: u32) -> Self {
        Self {
            name,
            width,
            height,
            counter: 0,
            fail_every: None,
        }
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let idx = (y * w + x) * 3;
                pixels[idx] = (x * 255 / w.max(1)) as u8;
                pixels[idx + 1] = (y * 255 / h.max(1)) as u8;
                pixels[idx + 2] = 64;
            }
        }
        // Every 8th frame, a bright block walks across the scene.
        if self.counter % 8 == 0 {
            let block = (w.min(h) / 6).max(4);
            let bx = ((self.counter / 8) as usize * block) % w.saturating_sub(block).max(1);
            let by = h / 3;
            for y in by..(by + block).min(h) {
                for x in bx..(bx + block).min(w) {
                    let idx = (y * w + x) * 3;
                    pixels[idx] = 240;
                    pixels[idx + 1] = 240;
                    pixels[idx + 2] = 240;
                }
            }
        }
        pixels
    }
}

impl CameraDevice for SyntheticCamera {
    fn describe(&self) -> String {
        format!("stub://{} {}x{}", self.name, self.width, self.height)
    }

    fn grab(&mut self, seq: u64) -> Result<Frame> {
        self.counter += 1;
        if let Some(every) = self.fail_every {
            if self.counter % every == 0 {
                return Err(anyhow!("synthetic capture failure #{}", self.counter));
            }
        }
        Ok(Frame::new(self.render(), self.width, self.height, seq))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CaptureStatus {
    pub available: bool,
    pub frames_captured: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

/// Capture worker handle. Dropping without `stop()` detaches the thread;
/// orderly shutdown goes through `stop()`.
pub struct CaptureService {
    slot: Arc<FrameSlot>,
    shutdown: Arc<AtomicBool>,
    status: Arc<Mutex<CaptureStatus>>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureService {
    pub fn start(mut device: Box<dyn CameraDevice>, settings: CameraSettings) -> Self {
        let slot = Arc::new(FrameSlot::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(CaptureStatus {
            available: true,
            ..CaptureStatus::default()
        }));

        log::info!("capture starting: {}", device.describe());

        let worker_slot = slot.clone();
        let worker_shutdown = shutdown.clone();
        let worker_status = status.clone();
        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let interval = Duration::from_secs_f32(1.0 / settings.target_fps.max(0.01));
                let mut seq: u64 = 0;
                while !worker_shutdown.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    match device.grab(seq) {
                        Ok(frame) => {
                            worker_slot.store(frame);
                            seq += 1;
                            let mut st =
                                worker_status.lock().unwrap_or_else(|e| e.into_inner());
                            if st.consecutive_failures > 0 {
                                log::info!(
                                    "capture recovered after {} failures",
                                    st.consecutive_failures
                                );
                            }
                            st.consecutive_failures = 0;
                            st.frames_captured += 1;
                        }
                        Err(e) => {
                            let exhausted = {
                                let mut st =
                                    worker_status.lock().unwrap_or_else(|e| e.into_inner());
                                st.consecutive_failures += 1;
                                st.total_failures += 1;
                                log::warn!(
                                    "capture failure ({} consecutive): {}",
                                    st.consecutive_failures,
                                    e
                                );
                                st.consecutive_failures >= settings.max_consecutive_failures
                            };
                            if exhausted {
                                let mut st =
                                    worker_status.lock().unwrap_or_else(|e| e.into_inner());
                                st.available = false;
                                log::error!(
                                    "camera unavailable after {} consecutive failures; capture stopped",
                                    st.consecutive_failures
                                );
                                break;
                            }
                            sleep_interruptible(FAILURE_PAUSE, &worker_shutdown);
                            continue;
                        }
                    }

                    let elapsed = started.elapsed();
                    if elapsed < interval {
                        sleep_interruptible(interval - elapsed, &worker_shutdown);
                    }
                }
                log::info!("capture thread exiting");
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("failed to spawn capture thread: {}", e);
                None
            }
        };

        Self {
            slot,
            shutdown,
            status,
            handle,
        }
    }

    pub fn frame_slot(&self) -> Arc<FrameSlot> {
        self.slot.clone()
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.slot.latest()
    }

    pub fn status(&self) -> CaptureStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("capture thread panicked");
            }
        }
    }
}

/// Sleep in short slices so shutdown is honored promptly.
fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
        thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
}
