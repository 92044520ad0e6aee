//! Host application adapters.
//!
//! A host is a single-threaded application (a 3D content tool, a game
//! editor) whose API may only be touched from its main thread. An adapter
//! hooks a recurring callback into the host's own scheduler that drains an
//! [`ExecutionQueue`], and hands out [`ThreadSafeCall`]s that defer work onto
//! that queue.

pub mod blender;
pub mod unreal;

use crate::error::Result;
use crate::script::ScriptFault;
use crate::server::queue::{CallOutcome, ExecutionQueue, Ticket};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub use blender::{BlenderAdapter, ManualTimers, TimerCallback, TimerScheduler};
pub use unreal::{ManualTicker, TickCallback, TickHandle, TickScheduler, UnrealAdapter};

/// Something the server can run with positional arguments.
pub trait Callable: Send + Sync {
    fn call(&self, args: &[Value]) -> std::result::Result<Value, ScriptFault>;
}

impl<F> Callable for F
where
    F: Fn(&[Value]) -> std::result::Result<Value, ScriptFault> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> std::result::Result<Value, ScriptFault> {
        self(args)
    }
}

/// A host whose main thread drains an execution queue.
pub trait HostAdapter: Send + Sync {
    fn host_name(&self) -> &str;

    fn queue(&self) -> &Arc<ExecutionQueue>;

    /// Wrap `callable` so that calling it defers execution to the host main
    /// thread and waits at most `timeout` for the outcome.
    fn thread_safe_call(&self, callable: Arc<dyn Callable>, timeout: Duration) -> ThreadSafeCall {
        ThreadSafeCall::new(callable, Arc::clone(self.queue()), timeout)
    }
}

/// A callable bound to a host's execution queue.
#[derive(Clone)]
pub struct ThreadSafeCall {
    callable: Arc<dyn Callable>,
    queue: Arc<ExecutionQueue>,
    timeout: Duration,
}

impl ThreadSafeCall {
    pub fn new(callable: Arc<dyn Callable>, queue: Arc<ExecutionQueue>, timeout: Duration) -> Self {
        Self {
            callable,
            queue,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Queue one call without waiting for it.
    pub fn enqueue(&self, args: Vec<Value>) -> Ticket {
        let callable = Arc::clone(&self.callable);
        self.queue
            .run_in_main_thread(Box::new(move || CallOutcome::from(callable.call(&args))))
    }

    /// Queue one call and wait for the host to run it.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        let ticket = self.enqueue(args);
        self.queue.wait(ticket, self.timeout).await
    }
}
