//! DB resource monitoring and the process-wide work gate.
//!
//! A single background task polls the server's self-metrics every 10s and
//! flips one shared boolean. Workers never run aggregations while the gate
//! is closed; they poll it with a 30s sleep. The flag is a soft hint, not a
//! consistency primitive, so relaxed atomics are enough.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::Gateway;

/// Poll period of the resource monitor.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Sleep between gate checks on the worker side.
pub const GATE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide pause signal derived from DB self-metrics.
///
/// Written by the resource monitor, read by every worker.
pub struct ResourceGate {
    available: AtomicBool,
}

impl ResourceGate {
    /// A fresh gate starts open; the monitor corrects it within one tick.
    pub fn new() -> ResourceGate {
        ResourceGate {
            available: AtomicBool::new(true),
        }
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    pub fn set(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Block until the gate is open, sleeping between checks.
    pub async fn wait(&self) {
        while !self.available() {
            debug!(
                "pause working for {}s, no resources available",
                GATE_POLL_INTERVAL.as_secs()
            );
            tokio::time::sleep(GATE_POLL_INTERVAL).await;
        }
    }
}

impl Default for ResourceGate {
    fn default() -> Self {
        ResourceGate::new()
    }
}

/// Spawn the resource monitor task.
///
/// Each tick probes the running-task count and then the memory usage; any
/// error, missing value, running task, or memory above `mem_limit` percent
/// closes the gate until a later tick finds the server idle again.
pub fn spawn_monitor<G: Gateway + 'static>(
    gw: Arc<G>,
    gate: Arc<ResourceGate>,
    mem_limit: f64,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let retry = MONITOR_INTERVAL.as_secs();
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("resource monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let tasks = match gw.running_tasks().await {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(error = %e, "pause working, failed to get running tasks, retry after {retry}s");
                            gate.set(false);
                            continue;
                        }
                    };

                    match tasks {
                        None => {
                            warn!("pause working, no running tasks info, retry after {retry}s");
                            gate.set(false);
                            continue;
                        }
                        Some(t) if t > 0.0 => {
                            warn!("pause working, {t:.0} running tasks, retry after {retry}s");
                            gate.set(false);
                            continue;
                        }
                        Some(t) => debug!("{t:.0} running tasks"),
                    }

                    let mem = match gw.memory_used_pct().await {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, "pause working, failed to get mem usage, retry after {retry}s");
                            gate.set(false);
                            continue;
                        }
                    };

                    match mem {
                        None => {
                            warn!("pause working, no allocated memory info, retry after {retry}s");
                            gate.set(false);
                            continue;
                        }
                        Some(m) if m > mem_limit => {
                            warn!("pause working, memory usage {m:.0}%, retry after {retry}s");
                            gate.set(false);
                            continue;
                        }
                        Some(m) => debug!("memory usage {m:.0}%"),
                    }

                    gate.set(true);
                }
            }
        }
    });
}
