//! Main-thread execution queue.
//!
//! Network handlers enqueue jobs with [`ExecutionQueue::run_in_main_thread`]
//! and wait on the returned [`Ticket`]. The host drains the queue from its
//! own main thread with [`ExecutionQueue::execute_queued_calls`], never
//! blocking for new work. Each ticket owns its result slot, so concurrent
//! calls never see each other's outcomes.

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::script::ScriptFault;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Work that must run on the host main thread.
pub type Job = Box<dyn FnOnce() -> CallOutcome + Send + 'static>;

/// Correlation id of one queued call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What a queued call produced. Exactly one of the two per call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Return(Value),
    Error(ScriptFault),
}

impl CallOutcome {
    pub fn into_result(self) -> Result<Value> {
        match self {
            CallOutcome::Return(value) => Ok(value),
            CallOutcome::Error(fault) => Err(RpcError::Script(fault)),
        }
    }
}

impl From<std::result::Result<Value, ScriptFault>> for CallOutcome {
    fn from(result: std::result::Result<Value, ScriptFault>) -> Self {
        match result {
            Ok(value) => CallOutcome::Return(value),
            Err(fault) => CallOutcome::Error(fault),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Ready(CallOutcome),
}

/// FIFO of jobs plus one result slot per outstanding ticket.
pub struct ExecutionQueue {
    sender: Mutex<Sender<(Ticket, Job)>>,
    receiver: Mutex<Receiver<(Ticket, Job)>>,
    slots: Mutex<HashMap<Ticket, Slot>>,
    next_ticket: AtomicU64,
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            slots: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Queue `job` for the next drain and return its ticket.
    pub fn run_in_main_thread(&self, job: Job) -> Ticket {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(ticket, Slot::Pending);
        }
        let sent = self
            .sender
            .lock()
            .map(|sender| sender.send((ticket, job)).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!("Execution queue is closed; call {} will never run", ticket.0);
        }
        debug!("Queued call {} for the main thread", ticket.0);
        ticket
    }

    /// Take the outcome of `ticket` if the host has run it.
    ///
    /// Returns `None` while the call is still pending.
    pub fn poll(&self, ticket: Ticket) -> Option<CallOutcome> {
        let mut slots = self.slots.lock().ok()?;
        match slots.get(&ticket) {
            Some(Slot::Ready(_)) => match slots.remove(&ticket) {
                Some(Slot::Ready(outcome)) => Some(outcome),
                _ => None,
            },
            _ => None,
        }
    }

    /// Stop waiting for `ticket`. A result that arrives later is dropped.
    pub fn abandon(&self, ticket: Ticket) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(&ticket);
        }
    }

    /// Wait for `ticket`, checking at [`RpcConfig::POLL_INTERVAL`].
    pub async fn wait(&self, ticket: Ticket, timeout: Duration) -> Result<Value> {
        // A deadline past the clock's range never expires.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            if let Some(outcome) = self.poll(ticket) {
                return outcome.into_result();
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(tokio::time::Instant::now()));
            if remaining == Some(Duration::ZERO) {
                self.abandon(ticket);
                warn!("Call {} timed out after {:?} waiting for the main thread", ticket.0, timeout);
                return Err(RpcError::Timeout(timeout));
            }
            let pause = remaining.map_or(RpcConfig::POLL_INTERVAL, |r| RpcConfig::POLL_INTERVAL.min(r));
            tokio::time::sleep(pause).await;
        }
    }

    /// Number of calls queued but not yet run.
    pub fn pending(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| matches!(s, Slot::Pending)).count())
            .unwrap_or(0)
    }

    /// Run up to `budget` of the calls queued right now, in FIFO order.
    ///
    /// Must be called from the host main thread. Returns how many ran.
    pub fn execute_queued_calls(&self, budget: usize) -> usize {
        let batch: Vec<(Ticket, Job)> = match self.receiver.lock() {
            Ok(receiver) => {
                let mut batch = Vec::new();
                while batch.len() < budget {
                    match receiver.try_recv() {
                        Ok(item) => batch.push(item),
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                batch
            }
            Err(_) => return 0,
        };

        let executed = batch.len();
        for (ticket, job) in batch {
            let outcome = job();
            let Ok(mut slots) = self.slots.lock() else {
                continue;
            };
            match slots.get_mut(&ticket) {
                Some(slot) => *slot = Slot::Ready(outcome),
                None => warn!("Discarding late result of abandoned call {}", ticket.0),
            }
        }
        executed
    }
}
