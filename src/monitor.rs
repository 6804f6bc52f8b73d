//! Resource monitoring with a graduated pressure response.
//!
//! Samples process CPU share, system memory, and SoC temperature from
//! procfs/sysfs on a slow cadence. Sustained pressure (consecutive over-ceiling samples) walks up a
//! response ladder on the supervised pipeline: first shed load, then reclaim
//! memory, and as a last resort request a process restart. A single noisy
//! sample triggers nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Result};

use crate::config::MonitorSettings;

/// Actions the monitor may request on the running pipeline.
pub trait Supervisor: Send {
    /// Shed load. `level` 0 restores normal operation; higher levels widen
    /// the detection motion gate.
    fn degrade(&self, level: u32);

    /// Drop caches and temporal state to free memory.
    fn reclaim(&self);

    /// Sustained pressure that shedding did not resolve; the process should
    /// exit and let the service manager restart it.
    fn request_restart(&self);
}

#[derive(Clone, Copy, Debug)]
pub struct ResourceSnapshot {
    /// This process's share of total machine CPU time since the last sample.
    pub cpu_pct: f32,
    pub memory_pct: f32,
    pub temp_c: Option<f32>,
    pub sampled_at: SystemTime,
}

/// Jiffy counters for one sample: this process's CPU time against the
/// machine's total across all states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CpuCounters {
    process: u64,
    total: u64,
}

fn parse_total_jiffies(text: &str) -> Result<u64> {
    let line = text
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| anyhow!("no aggregate cpu line in /proc/stat"))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return Err(anyhow!("short cpu line in /proc/stat"));
    }
    Ok(fields.iter().sum())
}

/// utime + stime from /proc/self/stat. The comm field may contain spaces,
/// so parsing starts after the closing paren.
fn parse_self_stat(text: &str) -> Result<u64> {
    let rest = text
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| anyhow!("malformed /proc/self/stat"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Fields after comm: state is the first, utime and stime are the
    // twelfth and thirteenth.
    let utime: u64 = fields
        .get(11)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| anyhow!("utime missing from /proc/self/stat"))?;
    let stime: u64 = fields
        .get(12)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| anyhow!("stime missing from /proc/self/stat"))?;
    Ok(utime + stime)
}

fn cpu_pct(prev: CpuCounters, cur: CpuCounters) -> f32 {
    let total = cur.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let process = cur.process.saturating_sub(prev.process);
    (process as f32 / total as f32) * 100.0
}

fn parse_meminfo(text: &str) -> Result<f32> {
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.split_whitespace().next().and_then(|v| v.parse().ok());
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.split_whitespace().next().and_then(|v| v.parse().ok());
        }
    }
    match (total_kb, available_kb) {
        (Some(total), Some(available)) if total > 0 => {
            Ok(((total.saturating_sub(available)) as f32 / total as f32) * 100.0)
        }
        _ => Err(anyhow!("MemTotal/MemAvailable missing from /proc/meminfo")),
    }
}

/// Millidegrees as exposed by the thermal sysfs.
fn parse_thermal(text: &str) -> Result<f32> {
    let millis: i64 = text
        .trim()
        .parse()
        .map_err(|_| anyhow!("unparseable thermal reading {:?}", text.trim()))?;
    Ok(millis as f32 / 1000.0)
}

const PROC_STAT: &str = "/proc/stat";
const PROC_SELF_STAT: &str = "/proc/self/stat";
const PROC_MEMINFO: &str = "/proc/meminfo";
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

fn read_cpu_counters() -> Result<CpuCounters> {
    let total = parse_total_jiffies(&std::fs::read_to_string(PROC_STAT)?)?;
    let process = parse_self_stat(&std::fs::read_to_string(PROC_SELF_STAT)?)?;
    Ok(CpuCounters { process, total })
}

fn read_memory_pct() -> Result<f32> {
    parse_meminfo(&std::fs::read_to_string(PROC_MEMINFO)?)
}

fn read_temp_c() -> Option<f32> {
    // Absent on hosts without a thermal zone; not an error.
    std::fs::read_to_string(THERMAL_ZONE)
        .ok()
        .and_then(|raw| parse_thermal(&raw).ok())
}

/// Decide the response for a given breach streak. Pure so the ladder is
/// testable without a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Response {
    None,
    Degrade,
    Reclaim,
    Restart,
    Recovered,
}

fn response_for(streak: u32, prev_streak: u32, settings: &MonitorSettings) -> Response {
    if streak == 0 {
        return if prev_streak >= settings.breach_streak {
            Response::Recovered
        } else {
            Response::None
        };
    }
    if streak >= settings.hard_breach_streak {
        Response::Restart
    } else if streak == settings.breach_streak * 2 {
        Response::Reclaim
    } else if streak == settings.breach_streak {
        Response::Degrade
    } else {
        Response::None
    }
}

pub struct ResourceMonitor {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    latest: Arc<Mutex<Option<ResourceSnapshot>>>,
}

impl ResourceMonitor {
    pub fn start(settings: MonitorSettings, supervisor: Box<dyn Supervisor>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let latest: Arc<Mutex<Option<ResourceSnapshot>>> = Arc::new(Mutex::new(None));

        let worker_shutdown = shutdown.clone();
        let worker_latest = latest.clone();
        let handle = thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || {
                let mut prev_cpu = read_cpu_counters().ok();
                let mut streak: u32 = 0;
                let mut restart_requested = false;

                while !worker_shutdown.load(Ordering::Relaxed) {
                    sleep_interruptible(settings.sample_interval, &worker_shutdown);
                    if worker_shutdown.load(Ordering::Relaxed) {
                        break;
                    }

                    let cur_cpu = match read_cpu_counters() {
                        Ok(c) => c,
                        Err(e) => {
                            log::warn!("cpu sample failed: {}", e);
                            continue;
                        }
                    };
                    let cpu = prev_cpu.map(|p| cpu_pct(p, cur_cpu)).unwrap_or(0.0);
                    prev_cpu = Some(cur_cpu);

                    let memory = match read_memory_pct() {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("memory sample failed: {}", e);
                            continue;
                        }
                    };
                    let temp = read_temp_c();

                    let snapshot = ResourceSnapshot {
                        cpu_pct: cpu,
                        memory_pct: memory,
                        temp_c: temp,
                        sampled_at: SystemTime::now(),
                    };
                    {
                        let mut guard =
                            worker_latest.lock().unwrap_or_else(|e| e.into_inner());
                        *guard = Some(snapshot);
                    }

                    let breached = cpu > settings.max_cpu_pct
                        || memory > settings.max_memory_pct
                        || temp.is_some_and(|t| t > settings.max_temp_c);
                    let prev_streak = streak;
                    streak = if breached { streak + 1 } else { 0 };
                    if breached {
                        log::warn!(
                            "resource pressure ({} consecutive): cpu {:.0}% mem {:.0}% temp {}",
                            streak,
                            cpu,
                            memory,
                            temp.map(|t| format!("{:.0}C", t))
                                .unwrap_or_else(|| "n/a".to_string())
                        );
                    }

                    match response_for(streak, prev_streak, &settings) {
                        Response::None => {}
                        Response::Degrade => supervisor.degrade(1),
                        Response::Reclaim => supervisor.reclaim(),
                        Response::Restart => {
                            if !restart_requested {
                                restart_requested = true;
                                supervisor.request_restart();
                            }
                        }
                        Response::Recovered => {
                            log::info!("resource pressure cleared");
                            supervisor.degrade(0);
                            restart_requested = false;
                        }
                    }
                }
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("failed to spawn monitor thread: {}", e);
                None
            }
        };

        Self {
            shutdown,
            handle,
            latest,
        }
    }

    pub fn latest(&self) -> Option<ResourceSnapshot> {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("monitor thread panicked");
            }
        }
    }
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
        thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
}
