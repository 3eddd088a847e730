//! Run state machine types shared by the engine, API and CLI.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::params::RunParameters;

/// Lifecycle phase of the (single) collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Stopping,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Running => write!(f, "running"),
            RunPhase::Stopping => write!(f, "stopping"),
        }
    }
}

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Schedule,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Schedule => "schedule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Trigger::Manual),
            "schedule" => Some(Trigger::Schedule),
            _ => None,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Returned by a successful start; identifies the in-flight run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub trigger: Trigger,
    pub params: RunParameters,
}

/// Bookkeeping for the run currently in flight.
pub(crate) struct ActiveRun {
    pub handle: RunHandle,
    pub cancel: CancellationToken,
    /// Set once the worker task is spawned; used to abort an unresponsive worker.
    pub abort: Option<AbortHandle>,
}

/// The process-wide run state. `active` is `Some` iff `phase != Idle`.
pub(crate) struct RunState {
    pub phase: RunPhase,
    pub active: Option<ActiveRun>,
}

impl RunState {
    pub fn idle() -> Self {
        Self {
            phase: RunPhase::Idle,
            active: None,
        }
    }

    /// Whether `run_id` is the run currently tracked.
    pub fn is_current(&self, run_id: Uuid) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.handle.run_id == run_id)
    }
}

/// Armed recurrence. Dropping it does not stop the timer; cancel `timer` first.
pub(crate) struct ScheduleConfig {
    pub params: RunParameters,
    pub timer: CancellationToken,
    /// Distinguishes this arming from earlier ones whose ticks may still be in flight.
    pub generation: u64,
    pub next_tick_at: DateTime<Utc>,
}

/// Serializable view of the recurrence schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub interval_minutes: u32,
    pub next_tick_at: DateTime<Utc>,
    pub params: RunParameters,
}

/// Point-in-time snapshot of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub phase: RunPhase,
    pub run: Option<RunHandle>,
    pub schedule: Option<ScheduleStatus>,
}

impl SchedulerStatus {
    pub fn recurring(&self) -> bool {
        self.schedule.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_round_trips_through_str() {
        for t in [Trigger::Manual, Trigger::Schedule] {
            assert_eq!(Trigger::parse(t.as_str()), Some(t));
        }
        assert_eq!(Trigger::parse("cron"), None);
    }

    #[test]
    fn test_idle_state_has_no_run() {
        let state = RunState::idle();
        assert_eq!(state.phase, RunPhase::Idle);
        assert!(!state.is_current(Uuid::new_v4()));
    }
}
