//! Resource monitoring: memory sampling and child-process supervision.
//!
//! ## Why active supervision instead of cgroups?
//!
//! The converter runs wherever the host runs, often without permission to
//! create cgroups. A supervisor task sampling the child's resident set once
//! per interval is portable and bounds the overshoot to one interval's worth
//! of allocation.
//!
//! Sampling goes through `sysinfo`, which covers Linux, macOS and Windows.
//! On a platform it does not support every snapshot is zero and the
//! ceiling cannot be enforced; supervision says so once, at warn level.

use crate::output::MemorySnapshot;
use std::sync::Once;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const HIGH_PROCESS_MEMORY_MB: f64 = 1024.0;
const LOW_AVAILABLE_MEMORY_GB: f64 = 1.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

static UNSUPPORTED_WARNING: Once = Once::new();

/// Result of supervising one child process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Supervision {
    /// The child exited on its own (or sampling stopped being possible).
    Completed,
    /// The ceiling was crossed and the child was terminated.
    Exceeded { rss_mb: f64 },
}

impl Supervision {
    /// Whether the process was allowed to complete on its own.
    pub fn completed(&self) -> bool {
        matches!(self, Supervision::Completed)
    }
}

/// Samples memory and supervises converter processes.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    poll_interval: Duration,
    grace_period: Duration,
}

impl ResourceMonitor {
    pub fn new(poll_interval: Duration, grace_period: Duration) -> Self {
        Self {
            poll_interval,
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Sample this process and the system. Never fails: returns a zeroed
    /// snapshot when sampling is unavailable.
    pub fn snapshot(&self) -> MemorySnapshot {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            debug!("Memory sampling unavailable on this platform");
            return MemorySnapshot::default();
        }
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                error!("Failed to resolve own pid for memory sampling: {e}");
                return MemorySnapshot::default();
            }
        };

        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_process(pid);
        let total = sys.total_memory();
        if total == 0 {
            error!("Failed to read system memory information");
            return MemorySnapshot::default();
        }
        let available = sys.available_memory();
        let process = sys.process(pid).map(|p| p.memory()).unwrap_or(0);

        let process_memory_mb = round2(process as f64 / BYTES_PER_MB);
        let system_memory_gb = round2(total as f64 / BYTES_PER_GB);
        let available_memory_gb = round2(available as f64 / BYTES_PER_GB);
        let memory_usage_percent = usage_percent(total, available);

        if process_memory_mb > HIGH_PROCESS_MEMORY_MB {
            warn!("High memory usage: {process_memory_mb:.1}MB");
        }
        if available_memory_gb < LOW_AVAILABLE_MEMORY_GB {
            warn!("Low system memory available: {available_memory_gb:.1}GB");
        }

        MemorySnapshot {
            process_memory_mb,
            system_memory_gb,
            available_memory_gb,
            memory_usage_percent,
        }
    }

    /// Poll `pid`'s resident memory until `exited` is cancelled.
    ///
    /// When the ceiling is crossed: SIGTERM, wait the grace period (or until
    /// `exited` fires), then SIGKILL. The caller cancels `exited` as soon as
    /// its `wait()` on the child returns, which stops polling immediately.
    pub async fn supervise(
        self,
        pid: u32,
        memory_limit_mb: u64,
        exited: CancellationToken,
    ) -> Supervision {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            UNSUPPORTED_WARNING.call_once(|| {
                warn!(
                    "Memory sampling is unsupported on this platform; \
                     the {memory_limit_mb}MB ceiling is not enforced (timeouts still apply)"
                );
            });
            exited.cancelled().await;
            return Supervision::Completed;
        }

        let pid_key = Pid::from_u32(pid);
        let mut sys = System::new();
        loop {
            tokio::select! {
                _ = exited.cancelled() => return Supervision::Completed,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let rss_bytes = if sys.refresh_process(pid_key) {
                sys.process(pid_key).map(|p| p.memory())
            } else {
                None
            };
            let Some(rss_bytes) = rss_bytes else {
                // Process gone: nothing left to police.
                exited.cancelled().await;
                return Supervision::Completed;
            };
            let rss_mb = rss_bytes as f64 / BYTES_PER_MB;
            if rss_mb <= memory_limit_mb as f64 {
                continue;
            }

            warn!("Process exceeding memory limit: {rss_mb:.1}MB > {memory_limit_mb}MB");
            warn!("Terminating process to prevent OOM");
            send_terminate(pid);
            tokio::select! {
                _ = exited.cancelled() => {}
                _ = tokio::time::sleep(self.grace_period) => {
                    warn!("Process {pid} ignored SIGTERM for {:?}, killing", self.grace_period);
                    send_kill(pid);
                }
            }
            return Supervision::Exceeded { rss_mb: round2(rss_mb) };
        }
    }
}

/// Ask a process to terminate gracefully.
#[cfg(unix)]
pub(crate) fn send_terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {pid} failed: {e}");
    }
}

#[cfg(not(unix))]
pub(crate) fn send_terminate(pid: u32) {
    debug!("graceful termination unsupported on this platform (pid {pid})");
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!("SIGKILL to {pid} failed: {e}");
    }
}

#[cfg(not(unix))]
fn send_kill(pid: u32) {
    debug!("forced termination by pid unsupported on this platform (pid {pid})");
}

fn usage_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(total.saturating_sub(available) as f64 / total as f64 * 100.0)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
