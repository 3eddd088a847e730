//! Progress and completion fan-out to observers.
//!
//! Every observer gets its own bounded view of a single broadcast channel.
//! When an observer falls behind, the oldest events are overwritten and the
//! observer is told how many it missed through an `Error`-kind event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

/// Default per-observer queue depth.
pub const DEFAULT_CAPACITY: usize = 256;

/// Severity tag carried by a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Success,
    Error,
}

/// A single progress line from the active run (or from the scheduler itself).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub kind: EventKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(run_id: Option<Uuid>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            run_id,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Terminal notification for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunCompleted {
    pub run_id: Uuid,
    pub success: bool,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Everything an observer can receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Progress(ProgressEvent),
    RunCompleted(RunCompleted),
}

impl RunEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Progress(_) => "progress",
            RunEvent::RunCompleted(_) => "run_completed",
        }
    }

    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            RunEvent::Progress(p) => p.run_id,
            RunEvent::RunCompleted(c) => Some(c.run_id),
        }
    }
}

/// Cloneable publishing handle shared by the scheduler and its workers.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<RunEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new observer. It only sees events published after this call.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Fan an event out to every current observer.
    ///
    /// Returns how many observers it was queued for; zero observers is fine.
    pub fn publish(&self, event: RunEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn progress(&self, run_id: Option<Uuid>, kind: EventKind, message: impl Into<String>) {
        self.publish(RunEvent::Progress(ProgressEvent::new(run_id, kind, message)));
    }

    pub fn completed(&self, run_id: Uuid, success: bool, message: impl Into<String>) {
        self.publish(RunEvent::RunCompleted(RunCompleted {
            run_id,
            success,
            message: message.into(),
            at: Utc::now(),
        }));
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One observer's receiving end. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<RunEvent>,
}

impl Subscription {
    /// Wait for the next event. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(n)) => Some(dropped_notice(n)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant of [`Subscription::recv`]. `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<RunEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(n)) => Some(dropped_notice(n)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }
}

fn dropped_notice(n: u64) -> RunEvent {
    tracing::warn!(dropped = n, "observer lagged behind, oldest events dropped");
    RunEvent::Progress(ProgressEvent::new(
        None,
        EventKind::Error,
        format!("observer queue overflowed: {n} events dropped"),
    ))
}
