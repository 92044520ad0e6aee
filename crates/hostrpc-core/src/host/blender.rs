//! Blender flavour: the queue is drained by a recurring UI timer.
//!
//! Blender's timers return the delay until their next run, or nothing to
//! unregister. [`TimerScheduler`] models that contract; [`ManualTimers`] is
//! an in-process implementation the host loop (or a test) drives by calling
//! [`ManualTimers::run_due`].

use super::HostAdapter;
use crate::config::RpcConfig;
use crate::server::queue::ExecutionQueue;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Timer body. Returns the interval until the next run, `None` to stop.
pub type TimerCallback = Box<dyn FnMut() -> Option<Duration> + Send>;

/// A host scheduler that runs timers on its main thread.
pub trait TimerScheduler: Send + Sync {
    /// Register `callback` to first run after `first_interval`. Persistent
    /// timers survive a file reload.
    fn register(&self, callback: TimerCallback, first_interval: Duration, persistent: bool);
}

struct Timer {
    id: u64,
    due: Instant,
    persistent: bool,
    callback: Option<TimerCallback>,
}

/// Timers driven explicitly from the thread acting as the host main thread.
#[derive(Default)]
pub struct ManualTimers {
    timers: Mutex<Vec<Timer>>,
    next_id: Mutex<u64>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered timers.
    pub fn len(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every timer whose due time has passed. Returns how many ran.
    pub fn run_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<(u64, TimerCallback)> = match self.timers.lock() {
            Ok(mut timers) => timers
                .iter_mut()
                .filter(|timer| timer.due <= now)
                .filter_map(|timer| timer.callback.take().map(|cb| (timer.id, cb)))
                .collect(),
            Err(_) => return 0,
        };

        let ran = due.len();
        for (id, mut callback) in due {
            // Callbacks run outside the lock so they may register new timers.
            let next = callback();
            let Ok(mut timers) = self.timers.lock() else {
                continue;
            };
            match next {
                Some(interval) => {
                    if let Some(timer) = timers.iter_mut().find(|t| t.id == id) {
                        timer.due = Instant::now() + interval;
                        timer.callback = Some(callback);
                    }
                }
                None => timers.retain(|t| t.id != id),
            }
        }
        ran
    }

    /// Drop non-persistent timers, as a file reload does.
    pub fn reload(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.retain(|t| t.persistent);
        }
    }
}

impl TimerScheduler for ManualTimers {
    fn register(&self, callback: TimerCallback, first_interval: Duration, persistent: bool) {
        let id = match self.next_id.lock() {
            Ok(mut next) => {
                *next += 1;
                *next
            }
            Err(_) => return,
        };
        if let Ok(mut timers) = self.timers.lock() {
            timers.push(Timer {
                id,
                due: Instant::now() + first_interval,
                persistent,
                callback: Some(callback),
            });
        }
    }
}

/// Adapter whose queue is drained from a persistent Blender timer.
pub struct BlenderAdapter {
    queue: Arc<ExecutionQueue>,
}

impl BlenderAdapter {
    /// Register the drain timer on `scheduler`.
    pub fn install(scheduler: &dyn TimerScheduler) -> Self {
        let queue = Arc::new(ExecutionQueue::new());
        let drain = Arc::clone(&queue);
        scheduler.register(
            Box::new(move || {
                let ran = drain.execute_queued_calls(RpcConfig::DRAIN_BUDGET);
                if ran > 0 {
                    debug!("Blender timer ran {} queued calls", ran);
                }
                Some(RpcConfig::DRAIN_INTERVAL)
            }),
            Duration::ZERO,
            true,
        );
        info!("Installed Blender queue timer");
        Self { queue }
    }
}

impl HostAdapter for BlenderAdapter {
    fn host_name(&self) -> &str {
        "blender"
    }

    fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }
}
