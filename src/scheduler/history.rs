//! Execution history for completed runs.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use super::state::Trigger;
use crate::storage::Pool;

/// A record of a successfully completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub run_id: Uuid,
    pub filename: String,
    pub item_count: u32,
    pub trigger: Trigger,
    pub completed_at: DateTime<Utc>,
}

/// Append-only store of completed runs.
pub trait HistoryStore: Send + Sync {
    fn append(&self, record: &HistoryRecord) -> Result<()>;

    /// Most recent first. `None` returns everything.
    fn list(&self, limit: Option<usize>) -> Result<Vec<HistoryRecord>>;
}

/// History kept in the `run_history` table.
#[derive(Clone)]
pub struct SqliteHistory {
    pool: Pool,
}

impl SqliteHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl HistoryStore for SqliteHistory {
    fn append(&self, record: &HistoryRecord) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO run_history (run_id, filename, item_count, trigger_source, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.run_id.to_string(),
                record.filename,
                record.item_count,
                record.trigger.as_str(),
                // Fixed-width UTC so text order matches time order.
                record.completed_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .context("Failed to insert history record")?;
        Ok(())
    }

    fn list(&self, limit: Option<usize>) -> Result<Vec<HistoryRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, filename, item_count, trigger_source, completed_at
             FROM run_history ORDER BY completed_at DESC, id DESC LIMIT ?1",
        )?;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = stmt.query_map([limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for r in rows {
            let (run_id, filename, item_count, trigger, completed_at) = r?;
            records.push(HistoryRecord {
                run_id: Uuid::parse_str(&run_id)
                    .with_context(|| format!("bad run_id in history: {run_id}"))?,
                filename,
                item_count,
                trigger: Trigger::parse(&trigger).unwrap_or(Trigger::Manual),
                completed_at: DateTime::parse_from_rfc3339(&completed_at)
                    .with_context(|| format!("bad completed_at in history: {completed_at}"))?
                    .with_timezone(&Utc),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory_pool;
    use chrono::Duration;

    fn record(filename: &str, completed_at: DateTime<Utc>) -> HistoryRecord {
        HistoryRecord {
            run_id: Uuid::new_v4(),
            filename: filename.to_string(),
            item_count: 5,
            trigger: Trigger::Schedule,
            completed_at,
        }
    }

    #[test]
    fn test_list_is_most_recent_first() {
        let history = SqliteHistory::new(open_memory_pool().unwrap());
        let now = Utc::now();
        history.append(&record("b.csv", now - Duration::minutes(30))).unwrap();
        history.append(&record("c.csv", now)).unwrap();
        history.append(&record("a.csv", now - Duration::hours(2))).unwrap();

        let names: Vec<String> = history
            .list(None)
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, vec!["c.csv", "b.csv", "a.csv"]);
    }

    #[test]
    fn test_list_honours_limit() {
        let history = SqliteHistory::new(open_memory_pool().unwrap());
        let now = Utc::now();
        for i in 0..7 {
            history
                .append(&record(&format!("{i}.csv"), now + Duration::seconds(i)))
                .unwrap();
        }
        let top = history.list(Some(5)).unwrap();
        assert_eq!(top.len(), 5);
        assert_eq!(top[0].filename, "6.csv");
    }

    #[test]
    fn test_record_round_trip_fields() {
        let history = SqliteHistory::new(open_memory_pool().unwrap());
        let rec = record("iqiyi_20240501_093000.csv", Utc::now());
        history.append(&rec).unwrap();

        let listed = history.list(Some(1)).unwrap();
        assert_eq!(listed[0].run_id, rec.run_id);
        assert_eq!(listed[0].trigger, Trigger::Schedule);
        assert_eq!(listed[0].item_count, 5);
        assert_eq!(
            listed[0].completed_at.timestamp_micros(),
            rec.completed_at.timestamp_micros()
        );
    }

    #[test]
    fn test_listing_is_idempotent() {
        let history = SqliteHistory::new(open_memory_pool().unwrap());
        history.append(&record("x.csv", Utc::now())).unwrap();
        assert_eq!(history.list(None).unwrap(), history.list(None).unwrap());
    }
}
