//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hotreel::events::{EventPublisher, RunCompleted, RunEvent, Subscription};
use hotreel::scheduler::{RunParameters, Scheduler, SqliteHistory};
use hotreel::storage::open_memory_pool;
use hotreel::worker::{Worker, WorkerContext, WorkerOutcome};
use tokio::sync::Notify;

/// Emits its messages, then holds the run open until released or cancelled.
pub struct GatedWorker {
    invocations: AtomicUsize,
    messages: Vec<String>,
    outcome: WorkerOutcome,
    pub release: Notify,
}

impl GatedWorker {
    pub fn new(messages: &[&str]) -> Arc<Self> {
        Self::with_outcome(
            messages,
            WorkerOutcome::Succeeded {
                summary: "collection finished".to_string(),
                artifact: "iqiyi_20240501_093000.csv".to_string(),
            },
        )
    }

    pub fn with_outcome(messages: &[&str], outcome: WorkerOutcome) -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicUsize::new(0),
            messages: messages.iter().map(|m| m.to_string()).collect(),
            outcome,
            release: Notify::new(),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Worker for GatedWorker {
    async fn invoke(&self, _params: RunParameters, ctx: WorkerContext) -> WorkerOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        for m in &self.messages {
            ctx.info(m.clone());
        }
        tokio::select! {
            _ = ctx.cancelled() => WorkerOutcome::Cancelled,
            _ = self.release.notified() => self.outcome.clone(),
        }
    }
}

pub fn scheduler(worker: Arc<GatedWorker>) -> Scheduler {
    let history = Arc::new(SqliteHistory::new(open_memory_pool().unwrap()));
    Scheduler::with_grace(worker, history, EventPublisher::new(64), Duration::from_secs(5))
}

pub async fn next_completion(sub: &mut Subscription) -> RunCompleted {
    loop {
        match sub.recv().await {
            Some(RunEvent::RunCompleted(c)) => return c,
            Some(_) => continue,
            None => panic!("publisher closed"),
        }
    }
}
