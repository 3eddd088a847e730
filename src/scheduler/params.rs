//! Run parameters accepted by `Scheduler::start` and their validation rules.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest number of items a run may collect.
pub const MIN_ITEM_COUNT: u32 = 1;
/// Largest number of items a run may collect.
pub const MAX_ITEM_COUNT: u32 = 20;
/// Recurring runs may not fire more often than this.
pub const MIN_INTERVAL_MINUTES: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("item count {0} out of range (1..=20)")]
    ItemCountOutOfRange(u32),

    #[error("update interval {0} min is below the 30 min minimum")]
    IntervalTooShort(u32),
}

/// Parameters for one collection run.
///
/// The aliases accept the field names older dashboards send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParameters {
    #[serde(alias = "videoCount")]
    pub item_count: u32,
    #[serde(default, alias = "headlessMode")]
    pub headless: bool,
    #[serde(default, alias = "isAutoUpdate")]
    pub recurring: bool,
    #[serde(default = "default_interval", alias = "updateInterval")]
    pub interval_minutes: u32,
}

fn default_interval() -> u32 {
    MIN_INTERVAL_MINUTES
}

impl RunParameters {
    /// One-shot run with the default interval.
    pub fn once(item_count: u32, headless: bool) -> Self {
        Self {
            item_count,
            headless,
            recurring: false,
            interval_minutes: MIN_INTERVAL_MINUTES,
        }
    }

    /// Recurring run re-triggered every `interval_minutes`.
    pub fn every(item_count: u32, headless: bool, interval_minutes: u32) -> Self {
        Self {
            item_count,
            headless,
            recurring: true,
            interval_minutes,
        }
    }

    /// Check the range invariants. The interval only matters when recurring.
    pub fn validate(&self) -> Result<(), ParamError> {
        if !(MIN_ITEM_COUNT..=MAX_ITEM_COUNT).contains(&self.item_count) {
            return Err(ParamError::ItemCountOutOfRange(self.item_count));
        }
        if self.recurring && self.interval_minutes < MIN_INTERVAL_MINUTES {
            return Err(ParamError::IntervalTooShort(self.interval_minutes));
        }
        Ok(())
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }
}
