//! The scheduler: single authority over the run state machine and the
//! recurrence timer.
//!
//! All transitions (start, stop, tick, completion, forced stop) run under one
//! `std::sync::Mutex`, never held across an `.await`. Workers run in their own
//! tokio tasks so progress emission never blocks control operations.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::history::{HistoryRecord, HistoryStore};
use super::params::{ParamError, RunParameters};
use super::state::{
    ActiveRun, RunHandle, RunPhase, RunState, ScheduleConfig, ScheduleStatus, SchedulerStatus,
    Trigger,
};
use crate::events::{EventKind, EventPublisher, Subscription};
use crate::worker::{SharedWorker, WorkerContext, WorkerOutcome};

/// How long a stopped worker gets before it is forcibly abandoned.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] ParamError),

    #[error("a run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("no run is active")]
    NoActiveRun,
}

struct Control {
    run: RunState,
    schedule: Option<ScheduleConfig>,
    generation: u64,
}

struct Inner {
    control: Mutex<Control>,
    worker: SharedWorker,
    history: Arc<dyn HistoryStore>,
    events: EventPublisher,
    stop_grace: Duration,
}

/// Cheap to clone; all clones drive the same state machine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(worker: SharedWorker, history: Arc<dyn HistoryStore>, events: EventPublisher) -> Self {
        Self::with_grace(worker, history, events, DEFAULT_STOP_GRACE)
    }

    pub fn with_grace(
        worker: SharedWorker,
        history: Arc<dyn HistoryStore>,
        events: EventPublisher,
        stop_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                control: Mutex::new(Control {
                    run: RunState::idle(),
                    schedule: None,
                    generation: 0,
                }),
                worker,
                history,
                events,
                stop_grace,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        // A panic while holding the lock leaves the state consistent enough to keep serving.
        self.inner
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    /// Start a run now. Recurring parameters also (re-)arm the timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, params: RunParameters) -> Result<RunHandle, StartError> {
        params.validate()?;

        let mut control = self.lock();
        let handle = self.begin_run(&mut control, params.clone(), Trigger::Manual)?;
        if params.recurring {
            self.arm_locked(&mut control, params);
        }
        Ok(handle)
    }

    /// Request the active run to stop and disarm recurring mode.
    ///
    /// Returns as soon as the cancellation is signalled; the run reaches
    /// `Idle` when the worker acknowledges or the grace period expires.
    pub fn stop(&self) -> Result<(), StopError> {
        let mut control = self.lock();
        if control.run.phase == RunPhase::Idle {
            return Err(StopError::NoActiveRun);
        }

        self.disarm_locked(&mut control);

        if control.run.phase == RunPhase::Stopping {
            return Ok(());
        }
        // phase != Idle always carries an active run
        let Some(active) = control.run.active.as_ref() else {
            return Err(StopError::NoActiveRun);
        };
        let run_id = active.handle.run_id;
        active.cancel.cancel();
        control.run.phase = RunPhase::Stopping;

        info!(%run_id, grace_secs = self.inner.stop_grace.as_secs(), "Stop requested");
        self.inner
            .events
            .progress(Some(run_id), EventKind::Info, "stopping run");

        let scheduler = self.clone();
        let grace = self.inner.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            scheduler.force_idle(run_id);
        });

        Ok(())
    }

    /// Arm recurring mode without starting a run now. The first run fires one
    /// interval from now.
    pub fn arm(&self, mut params: RunParameters) -> Result<(), ParamError> {
        params.recurring = true;
        params.validate()?;
        let mut control = self.lock();
        self.arm_locked(&mut control, params);
        Ok(())
    }

    /// Cancel recurring mode. Returns whether a schedule was armed.
    pub fn disarm(&self) -> bool {
        let mut control = self.lock();
        self.disarm_locked(&mut control)
    }

    pub fn status(&self) -> SchedulerStatus {
        let control = self.lock();
        SchedulerStatus {
            phase: control.run.phase,
            run: control.run.active.as_ref().map(|a| a.handle.clone()),
            schedule: control.schedule.as_ref().map(|s| ScheduleStatus {
                interval_minutes: s.params.interval_minutes,
                next_tick_at: s.next_tick_at,
                params: s.params.clone(),
            }),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.lock().run.phase
    }

    /// Completed runs, most recent first.
    pub fn list_history(&self, limit: Option<usize>) -> anyhow::Result<Vec<HistoryRecord>> {
        self.inner.history.list(limit)
    }

    /// Disarm recurrence and stop any active run. Used on process shutdown.
    pub fn shutdown(&self) {
        self.disarm();
        match self.stop() {
            Ok(()) => info!("Active run stopped for shutdown"),
            Err(StopError::NoActiveRun) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Transitions (caller holds the lock)
    // -----------------------------------------------------------------------

    fn begin_run(
        &self,
        control: &mut Control,
        params: RunParameters,
        trigger: Trigger,
    ) -> Result<RunHandle, StartError> {
        if control.run.phase != RunPhase::Idle {
            return Err(StartError::AlreadyRunning);
        }

        let handle = RunHandle {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            trigger,
            params: params.clone(),
        };
        let run_id = handle.run_id;
        let cancel = CancellationToken::new();
        let ctx = WorkerContext::new(run_id, trigger, cancel.clone(), self.inner.events.clone());

        let worker = Arc::clone(&self.inner.worker);
        let task = tokio::spawn(async move { worker.invoke(params, ctx).await });
        let abort = task.abort_handle();

        control.run = RunState {
            phase: RunPhase::Running,
            active: Some(ActiveRun {
                handle: handle.clone(),
                cancel,
                abort: Some(abort),
            }),
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => WorkerOutcome::Cancelled,
                Err(e) => WorkerOutcome::Failed {
                    reason: format!("worker panicked: {e}"),
                },
            };
            let saved = scheduler.record_success(run_id, &outcome).await;
            scheduler.complete(run_id, outcome, saved);
        });

        info!(
            %run_id,
            %trigger,
            item_count = handle.params.item_count,
            headless = handle.params.headless,
            "Run started"
        );
        Ok(handle)
    }

    fn arm_locked(&self, control: &mut Control, params: RunParameters) {
        self.disarm_locked(control);

        control.generation += 1;
        let generation = control.generation;
        let period = params.interval();
        let timer = CancellationToken::new();
        // Fixed before spawning so a slow first poll cannot shift the phase.
        let first_tick = Instant::now() + period;

        control.schedule = Some(ScheduleConfig {
            params: params.clone(),
            timer: timer.clone(),
            generation,
            next_tick_at: Utc::now() + chrono_period(period),
        });

        info!(interval_minutes = params.interval_minutes, generation, "Recurring mode armed");
        tokio::spawn(recurrence_loop(
            Arc::downgrade(&self.inner),
            generation,
            first_tick,
            period,
            timer,
        ));
    }

    fn disarm_locked(&self, control: &mut Control) -> bool {
        match control.schedule.take() {
            Some(schedule) => {
                schedule.timer.cancel();
                info!(generation = schedule.generation, "Recurring mode disarmed");
                true
            }
            None => false,
        }
    }

    /// Timer-fired. Silently skipped while a run is in flight.
    fn tick(&self, generation: u64) {
        let mut control = self.lock();
        let params = match control.schedule.as_mut() {
            Some(schedule) if schedule.generation == generation => {
                schedule.next_tick_at = Utc::now() + chrono_period(schedule.params.interval());
                schedule.params.clone()
            }
            _ => return,
        };

        if control.run.phase != RunPhase::Idle {
            debug!(phase = %control.run.phase, "Recurrence tick skipped, run in progress");
            return;
        }

        if let Err(e) = self.begin_run(&mut control, params, Trigger::Schedule) {
            warn!("Scheduled run not started: {}", e);
        }
    }

    /// Write the history record for a successful run, off the scheduler lock.
    /// `None` when the outcome is not a success or the run is no longer tracked.
    async fn record_success(
        &self,
        run_id: Uuid,
        outcome: &WorkerOutcome,
    ) -> Option<anyhow::Result<HistoryRecord>> {
        let WorkerOutcome::Succeeded { artifact, .. } = outcome else {
            return None;
        };
        let record = {
            let control = self.lock();
            let active = control
                .run
                .active
                .as_ref()
                .filter(|a| a.handle.run_id == run_id)?;
            HistoryRecord {
                run_id,
                filename: artifact.clone(),
                item_count: active.handle.params.item_count,
                trigger: active.handle.trigger,
                completed_at: Utc::now(),
            }
        };

        let history = Arc::clone(&self.inner.history);
        let saved = tokio::task::spawn_blocking(move || history.append(&record).map(|()| record))
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("history writer panicked: {e}")));
        Some(saved)
    }

    /// Worker-fired terminal transition. `saved` is the result of
    /// [`Scheduler::record_success`].
    fn complete(
        &self,
        run_id: Uuid,
        outcome: WorkerOutcome,
        saved: Option<anyhow::Result<HistoryRecord>>,
    ) {
        let mut control = self.lock();
        if !control.run.is_current(run_id) {
            debug!(%run_id, ?outcome, "Ignoring outcome from a run that is no longer tracked");
            return;
        }
        let events = &self.inner.events;

        let (success, message) = match outcome {
            WorkerOutcome::Succeeded { summary, .. } => {
                match saved {
                    Some(Ok(record)) => {
                        info!(%run_id, filename = %record.filename, "Run succeeded")
                    }
                    Some(Err(e)) => {
                        error!(%run_id, "Failed to record history: {:#}", e);
                        events.progress(
                            Some(run_id),
                            EventKind::Error,
                            format!("run finished but history could not be saved: {e}"),
                        );
                    }
                    None => warn!(%run_id, "Run succeeded but no history record was written"),
                }
                (true, summary)
            }
            WorkerOutcome::Failed { reason } => {
                warn!(%run_id, %reason, "Run failed");
                (false, format!("run failed: {reason}"))
            }
            WorkerOutcome::Cancelled => {
                info!(%run_id, "Run stopped");
                (false, "run stopped".to_string())
            }
        };

        control.run = RunState::idle();
        events.completed(run_id, success, message);
    }

    /// Grace period expired after a stop request.
    fn force_idle(&self, run_id: Uuid) {
        let mut control = self.lock();
        if !control.run.is_current(run_id) || control.run.phase != RunPhase::Stopping {
            return;
        }
        if let Some(abort) = control.run.active.take().and_then(|a| a.abort) {
            abort.abort();
        }
        control.run = RunState::idle();

        let grace = self.inner.stop_grace.as_secs();
        warn!(%run_id, grace_secs = grace, "Worker ignored stop request; forced idle");
        self.inner.events.progress(
            Some(run_id),
            EventKind::Error,
            format!("worker did not stop within {grace}s; run abandoned"),
        );
        self.inner
            .events
            .completed(run_id, false, "run stopped ungracefully");
    }
}

fn chrono_period(period: Duration) -> chrono::Duration {
    chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Fixed-period timer; ends when the token is cancelled or the scheduler is dropped.
async fn recurrence_loop(
    inner: Weak<Inner>,
    generation: u64,
    first_tick: Instant,
    period: Duration,
    timer: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(first_tick, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                Scheduler { inner }.tick(generation);
            }
        }
    }
    debug!(generation, "Recurrence timer stopped");
}
