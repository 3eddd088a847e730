//! Worker boundary: the thing a run actually executes.
//!
//! The scheduler hands each invocation a [`WorkerContext`] carrying the
//! cancellation token and progress emitters. A worker reports exactly one
//! [`WorkerOutcome`] by returning from [`Worker::invoke`].

pub mod command;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{EventKind, EventPublisher};
use crate::scheduler::{RunParameters, Trigger};

pub use self::command::{CommandWorker, CommandWorkerConfig};

/// Terminal result of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Collection finished; `artifact` names the result file.
    Succeeded { summary: String, artifact: String },
    Failed { reason: String },
    Cancelled,
}

/// Per-run handle passed to the worker.
#[derive(Clone)]
pub struct WorkerContext {
    run_id: Uuid,
    trigger: Trigger,
    cancel: CancellationToken,
    events: EventPublisher,
}

impl WorkerContext {
    pub fn new(run_id: Uuid, trigger: Trigger, cancel: CancellationToken, events: EventPublisher) -> Self {
        Self {
            run_id,
            trigger,
            cancel,
            events,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Token the worker should watch at safe points.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn emit(&self, kind: EventKind, message: impl Into<String>) {
        self.events.progress(Some(self.run_id), kind, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(EventKind::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(EventKind::Success, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(EventKind::Error, message);
    }
}

/// Trait for anything that can perform a collection run.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    /// Perform one run. Must return promptly once `ctx` is cancelled.
    async fn invoke(&self, params: RunParameters, ctx: WorkerContext) -> WorkerOutcome;
}

pub type SharedWorker = Arc<dyn Worker>;
