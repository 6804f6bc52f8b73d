//! Notification dispatch with rate limiting and retry.
//!
//! Validated events are handed to a dedicated worker thread so delivery
//! latency (slow webhooks, broker reconnects) never stalls the detection
//! loop. The worker applies quiet hours, a cooldown between notifications,
//! and an hourly ceiling before creating delivery tasks; one task is created
//! per channel and each retries independently with exponential backoff up to
//! a fixed attempt count.

mod mqtt;
mod webhook;

pub use mqtt::MqttChannel;
pub use webhook::WebhookChannel;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use crate::config::NotifySettings;
use crate::validate::ValidatedEvent;

/// One delivery target. `send` blocks; it is only ever called from the
/// dispatcher worker thread.
pub trait NotificationChannel: Send {
    fn name(&self) -> &'static str;
    fn send(&mut self, event: &ValidatedEvent) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DispatcherStats {
    /// Channel tasks that delivered successfully.
    pub sent: u64,
    pub suppressed_cooldown: u64,
    pub suppressed_rate: u64,
    pub suppressed_quiet: u64,
    /// Channel tasks that exhausted their attempts.
    pub failed: u64,
}

/// One pending delivery of one event on one channel.
///
/// Created when an event clears the rate limits; destroyed on success or
/// once `attempts` reaches the configured ceiling.
struct NotificationTask {
    event: Arc<ValidatedEvent>,
    channel_idx: usize,
    attempts: u32,
    next_attempt_at: Instant,
}

/// Whether `hour` (UTC, 0..=23) falls inside the suppression window
/// `[start, end)`. Windows may wrap midnight.
fn in_quiet_hours(hour: u8, start: u8, end: u8) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

fn current_utc_hour() -> u8 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ((secs / 3600) % 24) as u8
}

struct Worker {
    channels: Vec<Box<dyn NotificationChannel>>,
    settings: Arc<Mutex<NotifySettings>>,
    stats: Arc<Mutex<DispatcherStats>>,
    shutdown: Arc<AtomicBool>,
    tasks: Vec<NotificationTask>,
    last_accepted: Option<Instant>,
    accepted_window: VecDeque<Instant>,
}

impl Worker {
    fn run(mut self, rx: mpsc::Receiver<ValidatedEvent>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let wait = self.next_due_in().unwrap_or(Duration::from_millis(200));
            match rx.recv_timeout(wait.min(Duration::from_millis(200))) {
                Ok(event) => self.accept(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.run_due_tasks();
        }
        for task in &self.tasks {
            log::warn!(
                "shutdown with undelivered task for channel {} (frame {})",
                self.channels[task.channel_idx].name(),
                task.event.frame_seq
            );
        }
    }

    fn next_due_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.tasks
            .iter()
            .map(|t| t.next_attempt_at.saturating_duration_since(now))
            .min()
    }

    /// Rate-limit an incoming event and create one task per channel if it
    /// passes. Cooldown and hourly ceilings are stamped at acceptance, so a
    /// flaky channel cannot hold the window open.
    fn accept(&mut self, event: ValidatedEvent) {
        let settings = {
            let guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };

        if let Some((start, end)) = settings.quiet_hours {
            if in_quiet_hours(current_utc_hour(), start, end) {
                self.bump(|s| s.suppressed_quiet += 1);
                log::info!("notification suppressed: quiet hours");
                return;
            }
        }
        if let Some(last) = self.last_accepted {
            if last.elapsed() < settings.cooldown {
                self.bump(|s| s.suppressed_cooldown += 1);
                log::debug!("notification suppressed: cooldown");
                return;
            }
        }
        if let Some(hour_ago) = Instant::now().checked_sub(Duration::from_secs(3600)) {
            while self.accepted_window.front().is_some_and(|&t| t < hour_ago) {
                self.accepted_window.pop_front();
            }
        }
        if self.accepted_window.len() as u32 >= settings.max_per_hour {
            self.bump(|s| s.suppressed_rate += 1);
            log::warn!("notification suppressed: hourly ceiling reached");
            return;
        }

        self.last_accepted = Some(Instant::now());
        self.accepted_window.push_back(Instant::now());

        let event = Arc::new(event);
        let now = Instant::now();
        for channel_idx in 0..self.channels.len() {
            self.tasks.push(NotificationTask {
                event: event.clone(),
                channel_idx,
                attempts: 0,
                next_attempt_at: now,
            });
        }
    }

    fn run_due_tasks(&mut self) {
        let settings = {
            let guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let now = Instant::now();
        let mut remaining = Vec::with_capacity(self.tasks.len());

        for mut task in std::mem::take(&mut self.tasks) {
            if task.next_attempt_at > now {
                remaining.push(task);
                continue;
            }
            let channel = &mut self.channels[task.channel_idx];
            task.attempts += 1;
            match channel.send(&task.event) {
                Ok(()) => {
                    log::info!(
                        "notification delivered via {} (frame {}, {} cats, confidence {:.2})",
                        channel.name(),
                        task.event.frame_seq,
                        task.event.cat_count,
                        task.event.confidence
                    );
                    let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                    stats.sent += 1;
                }
                Err(e) if task.attempts >= settings.max_attempts => {
                    log::warn!(
                        "notification terminally failed on {} after {} attempts: {}",
                        channel.name(),
                        task.attempts,
                        e
                    );
                    let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                    stats.failed += 1;
                }
                Err(e) => {
                    let delay =
                        settings.retry_base_delay * 2u32.saturating_pow(task.attempts - 1);
                    log::warn!(
                        "delivery via {} failed (attempt {}/{}), retrying in {:?}: {}",
                        channel.name(),
                        task.attempts,
                        settings.max_attempts,
                        delay,
                        e
                    );
                    task.next_attempt_at = Instant::now() + delay;
                    remaining.push(task);
                }
            }
        }
        self.tasks = remaining;
    }

    fn bump(&self, f: impl FnOnce(&mut DispatcherStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}

/// Cloneable producer side of the dispatch queue, for worker threads that
/// should not own the dispatcher itself.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<ValidatedEvent>,
}

impl DispatchHandle {
    pub fn dispatch(&self, event: ValidatedEvent) {
        if self.tx.send(event).is_err() {
            log::error!("notification worker is gone; event dropped");
        }
    }
}

/// Handle for pushing fresh settings into the running worker.
#[derive(Clone)]
pub struct SettingsHandle {
    settings: Arc<Mutex<NotifySettings>>,
}

impl SettingsHandle {
    pub fn update(&self, fresh: NotifySettings) {
        let mut guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
    }
}

pub struct NotificationDispatcher {
    tx: mpsc::Sender<ValidatedEvent>,
    handle: Option<JoinHandle<()>>,
    settings: Arc<Mutex<NotifySettings>>,
    stats: Arc<Mutex<DispatcherStats>>,
    shutdown: Arc<AtomicBool>,
}

impl NotificationDispatcher {
    pub fn start(channels: Vec<Box<dyn NotificationChannel>>, settings: NotifySettings) -> Self {
        let (tx, rx) = mpsc::channel::<ValidatedEvent>();
        let settings = Arc::new(Mutex::new(settings));
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            channels,
            settings: settings.clone(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
            tasks: Vec::new(),
            last_accepted: None,
            accepted_window: VecDeque::new(),
        };

        let handle = thread::Builder::new()
            .name("notify".to_string())
            .spawn(move || worker.run(rx));
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("failed to spawn notify thread: {}", e);
                None
            }
        };

        Self {
            tx,
            handle,
            settings,
            stats,
            shutdown,
        }
    }

    /// Producer handle for other threads. Events sent after shutdown are
    /// dropped with an error log.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn settings_handle(&self) -> SettingsHandle {
        SettingsHandle {
            settings: self.settings.clone(),
        }
    }

    /// Queue an event for delivery. Never blocks the caller.
    pub fn dispatch(&self, event: ValidatedEvent) {
        if self.tx.send(event).is_err() {
            log::error!("notification worker is gone; event dropped");
        }
    }

    pub fn update_settings(&self, fresh: NotifySettings) {
        let mut guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
    }

    pub fn stats(&self) -> DispatcherStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal shutdown and join the worker. The attempt in flight finishes;
    /// tasks still waiting on a retry are abandoned with a log line.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("notification worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::{BackendKind, BoundingBox};
    use std::sync::atomic::AtomicU32;

    fn event(seq: u64) -> ValidatedEvent {
        ValidatedEvent {
            boxes: vec![BoundingBox::new(100, 100, 60, 60, 0.9)],
            cat_count: 1,
            confidence: 0.9,
            backend: BackendKind::Secondary,
            frame_seq: seq,
            unix_time_ms: 1_700_000_000_000,
        }
    }

    fn settings() -> NotifySettings {
        NotifySettings {
            cooldown: Duration::from_secs(0),
            retry_base_delay: Duration::from_millis(10),
            max_attempts: 3,
            max_per_hour: 12,
            quiet_hours: None,
            webhook_url: None,
            mqtt: None,
        }
    }

    struct CountingChannel {
        calls: Arc<AtomicU32>,
        attempt_times: Arc<Mutex<Vec<Instant>>>,
        fail_first: u32,
    }

    impl CountingChannel {
        fn new(fail_first: u32) -> (Self, Arc<AtomicU32>, Arc<Mutex<Vec<Instant>>>) {
            let calls = Arc::new(AtomicU32::new(0));
            let times = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    calls: calls.clone(),
                    attempt_times: times.clone(),
                    fail_first,
                },
                calls,
                times,
            )
        }
    }

    impl NotificationChannel for CountingChannel {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn send(&mut self, _event: &ValidatedEvent) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.attempt_times.lock().unwrap().push(Instant::now());
            if n <= self.fail_first {
                Err(anyhow::anyhow!("transient failure {}", n))
            } else {
                Ok(())
            }
        }
    }

    fn wait_for(d: &NotificationDispatcher, f: impl Fn(DispatcherStats) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f(d.stats()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn delivers_and_counts() {
        let (channel, calls, _) = CountingChannel::new(0);
        let d = NotificationDispatcher::start(vec![Box::new(channel)], settings());
        d.dispatch(event(1));
        wait_for(&d, |s| s.sent == 1);
        assert_eq!(d.stats().sent, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        d.stop();
    }

    #[test]
    fn retries_with_doubling_delays_then_succeeds() {
        let (channel, calls, times) = CountingChannel::new(2);
        let mut cfg = settings();
        cfg.retry_base_delay = Duration::from_millis(50);
        let d = NotificationDispatcher::start(vec![Box::new(channel)], cfg);
        d.dispatch(event(1));
        wait_for(&d, |s| s.sent == 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let times = times.lock().unwrap();
        let gap1 = times[1] - times[0];
        let gap2 = times[2] - times[1];
        assert!(gap1 >= Duration::from_millis(50), "first delay >= base");
        assert!(gap2 >= Duration::from_millis(100), "second delay doubled");
        d.stop();
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let (channel, calls, _) = CountingChannel::new(u32::MAX);
        let d = NotificationDispatcher::start(vec![Box::new(channel)], settings());
        d.dispatch(event(1));
        wait_for(&d, |s| s.failed == 1);
        assert_eq!(d.stats().failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        d.stop();
    }

    #[test]
    fn channels_fail_independently() {
        let (bad, bad_calls, _) = CountingChannel::new(u32::MAX);
        let (good, good_calls, _) = CountingChannel::new(0);
        let d = NotificationDispatcher::start(vec![Box::new(bad), Box::new(good)], settings());
        d.dispatch(event(1));
        wait_for(&d, |s| s.sent == 1 && s.failed == 1);
        let stats = d.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
        assert_eq!(bad_calls.load(Ordering::SeqCst), 3);
        d.stop();
    }

    #[test]
    fn cooldown_suppresses_back_to_back_events() {
        let (channel, _, _) = CountingChannel::new(0);
        let mut cfg = settings();
        cfg.cooldown = Duration::from_secs(300);
        let d = NotificationDispatcher::start(vec![Box::new(channel)], cfg);
        d.dispatch(event(1));
        d.dispatch(event(2));
        wait_for(&d, |s| s.sent + s.suppressed_cooldown == 2);
        let stats = d.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.suppressed_cooldown, 1);
        d.stop();
    }

    #[test]
    fn hourly_ceiling_suppresses_excess() {
        let (channel, _, _) = CountingChannel::new(0);
        let mut cfg = settings();
        cfg.max_per_hour = 2;
        let d = NotificationDispatcher::start(vec![Box::new(channel)], cfg);
        for i in 0..4 {
            d.dispatch(event(i));
        }
        wait_for(&d, |s| s.sent + s.suppressed_rate == 4);
        let stats = d.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.suppressed_rate, 2);
        d.stop();
    }

    #[test]
    fn quiet_hours_window_logic() {
        assert!(in_quiet_hours(23, 22, 7));
        assert!(in_quiet_hours(3, 22, 7));
        assert!(!in_quiet_hours(12, 22, 7));
        assert!(in_quiet_hours(10, 9, 17));
        assert!(!in_quiet_hours(17, 9, 17));
        assert!(!in_quiet_hours(5, 6, 6));
    }

    #[test]
    fn stop_joins_cleanly_with_empty_queue() {
        let d = NotificationDispatcher::start(Vec::new(), settings());
        d.stop();
    }
}
