//! Run orchestration: parameter validation, the run state machine,
//! recurrence and execution history.

pub mod engine;
pub mod history;
pub mod params;
pub mod state;

// Re-export common types
pub use self::engine::{Scheduler, StartError, StopError, DEFAULT_STOP_GRACE};
pub use self::history::{HistoryRecord, HistoryStore, SqliteHistory};
pub use self::params::{ParamError, RunParameters};
pub use self::state::{RunHandle, RunPhase, ScheduleStatus, SchedulerStatus, Trigger};
