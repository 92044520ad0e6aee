//! Unreal flavour: the queue is drained from an engine post-tick callback.

use super::HostAdapter;
use crate::config::RpcConfig;
use crate::server::queue::ExecutionQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Post-tick body, called with the frame's delta seconds.
pub type TickCallback = Box<dyn FnMut(f32) + Send>;

/// Handle returned when registering a tick callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickHandle(u64);

/// An engine that calls registered callbacks after every tick.
pub trait TickScheduler: Send + Sync {
    fn register_post_tick(&self, callback: TickCallback) -> TickHandle;

    fn unregister(&self, handle: TickHandle);
}

/// Tick callbacks driven explicitly by the thread acting as the game thread.
#[derive(Default)]
pub struct ManualTicker {
    callbacks: Mutex<Vec<(TickHandle, Option<TickCallback>)>>,
    next_id: AtomicU64,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one engine tick. Returns the number of callbacks invoked.
    pub fn tick(&self, delta_seconds: f32) -> usize {
        let taken: Vec<(TickHandle, TickCallback)> = match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks
                .iter_mut()
                .filter_map(|(handle, cb)| cb.take().map(|cb| (*handle, cb)))
                .collect(),
            Err(_) => return 0,
        };

        let ran = taken.len();
        for (handle, mut callback) in taken {
            callback(delta_seconds);
            if let Ok(mut callbacks) = self.callbacks.lock() {
                // Unregistered while running: drop it.
                if let Some((_, slot)) = callbacks.iter_mut().find(|(h, _)| *h == handle) {
                    *slot = Some(callback);
                }
            }
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TickScheduler for ManualTicker {
    fn register_post_tick(&self, callback: TickCallback) -> TickHandle {
        let handle = TickHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push((handle, Some(callback)));
        }
        handle
    }

    fn unregister(&self, handle: TickHandle) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.retain(|(h, _)| *h != handle);
        }
    }
}

/// Adapter whose queue is drained after every engine tick.
pub struct UnrealAdapter {
    queue: Arc<ExecutionQueue>,
    handle: TickHandle,
}

impl UnrealAdapter {
    /// Register the drain callback on `scheduler`.
    pub fn install(scheduler: &dyn TickScheduler) -> Self {
        let queue = Arc::new(ExecutionQueue::new());
        let drain = Arc::clone(&queue);
        let handle = scheduler.register_post_tick(Box::new(move |_delta| {
            let ran = drain.execute_queued_calls(RpcConfig::DRAIN_BUDGET);
            if ran > 0 {
                debug!("Post-tick ran {} queued calls", ran);
            }
        }));
        info!("Installed Unreal post-tick queue drain");
        Self { queue, handle }
    }

    pub fn tick_handle(&self) -> TickHandle {
        self.handle
    }
}

impl HostAdapter for UnrealAdapter {
    fn host_name(&self) -> &str {
        "unreal"
    }

    fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }
}
