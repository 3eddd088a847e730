use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    /// History entries returned when no `limit` is given.
    pub history_limit: usize,
    /// Cancelled when the server begins shutting down; ends open event streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(scheduler: Scheduler, history_limit: usize) -> Self {
        Self {
            scheduler,
            history_limit,
            shutdown: CancellationToken::new(),
        }
    }
}
