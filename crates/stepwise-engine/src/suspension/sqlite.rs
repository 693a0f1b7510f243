use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::RunId;

use super::{SuspendedRun, SuspensionStore};

/// Suspended runs persisted to a SQLite file, so approvals survive restarts.
pub struct SqliteSuspensionStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> StepwiseError + '_ {
    move |e| StepwiseError::Database(format!("{}: {}", context, e))
}

impl SqliteSuspensionStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("Failed to open suspension store"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("Failed to open suspension store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS suspended_runs (
                 run_id TEXT PRIMARY KEY,
                 node_id TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 suspended_at TEXT NOT NULL,
                 expires_at TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_suspended_expires
                 ON suspended_runs(expires_at);",
        )
        .map_err(db_err("Failed to initialize suspension schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StepwiseError::Database(e.to_string()))
    }
}

/// Fixed-width UTC timestamps, so text order in SQL matches time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode(state_json: &str) -> Result<SuspendedRun> {
    Ok(serde_json::from_str(state_json)?)
}

impl SuspensionStore for SqliteSuspensionStore {
    fn save(&self, run: &SuspendedRun) -> Result<()> {
        let state_json = serde_json::to_string(run)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO suspended_runs (run_id, node_id, state_json, suspended_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.run_id.as_str(),
                run.cursor,
                state_json,
                timestamp(run.suspended_at),
                run.expires_at.map(timestamp),
            ],
        )
        .map_err(db_err("Failed to save suspended run"))?;
        info!(run_id = %run.run_id, node_id = %run.cursor, "Run suspended");
        Ok(())
    }

    fn take(&self, run_id: &RunId) -> Result<SuspendedRun> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(db_err("Failed to begin transaction"))?;
        let state_json: Option<String> = tx
            .query_row(
                "SELECT state_json FROM suspended_runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to load suspended run"))?;
        let state_json = state_json.ok_or_else(|| StepwiseError::RunNotFound(run_id.to_string()))?;
        tx.execute(
            "DELETE FROM suspended_runs WHERE run_id = ?1",
            params![run_id.as_str()],
        )
        .map_err(db_err("Failed to delete suspended run"))?;
        tx.commit().map_err(db_err("Failed to commit"))?;
        decode(&state_json)
    }

    fn get(&self, run_id: &RunId) -> Result<Option<SuspendedRun>> {
        let conn = self.lock()?;
        let state_json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM suspended_runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to load suspended run"))?;
        state_json.as_deref().map(decode).transpose()
    }

    fn list(&self) -> Result<Vec<SuspendedRun>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT state_json FROM suspended_runs ORDER BY suspended_at ASC")
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err("Failed to list suspended runs"))?;

        let mut runs = Vec::new();
        for row in rows {
            let state_json = row.map_err(db_err("Failed to read row"))?;
            runs.push(decode(&state_json)?);
        }
        Ok(runs)
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<SuspendedRun>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT state_json FROM suspended_runs
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1
                 ORDER BY expires_at ASC",
            )
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map(params![timestamp(now)], |row| row.get::<_, String>(0))
            .map_err(db_err("Failed to list expired runs"))?;

        let mut runs = Vec::new();
        for row in rows {
            let state_json = row.map_err(db_err("Failed to read row"))?;
            runs.push(decode(&state_json)?);
        }
        Ok(runs)
    }

    fn remove(&self, run_id: &RunId) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM suspended_runs WHERE run_id = ?1",
                params![run_id.as_str()],
            )
            .map_err(db_err("Failed to delete suspended run"))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspension::sample_run;
    use chrono::Duration;

    #[test]
    fn test_save_take_roundtrip() {
        let store = SqliteSuspensionStore::open_in_memory().unwrap();
        let mut run = sample_run("r1", None);
        run.context.record_output("draft", serde_json::json!("draft of x"));
        store.save(&run).unwrap();

        let back = store.take(&RunId::from_string("r1")).unwrap();
        assert_eq!(back.cursor, "approve");
        assert_eq!(back.context.last_output, Some(serde_json::json!("draft of x")));
        assert!(store.get(&RunId::from_string("r1")).unwrap().is_none());
    }

    #[test]
    fn test_take_missing() {
        let store = SqliteSuspensionStore::open_in_memory().unwrap();
        let err = store.take(&RunId::from_string("nope")).unwrap_err();
        assert!(matches!(err, StepwiseError::RunNotFound(_)));
    }

    #[test]
    fn test_expired_query() {
        let store = SqliteSuspensionStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.save(&sample_run("old", Some(now - Duration::minutes(1)))).unwrap();
        store.save(&sample_run("new", Some(now + Duration::minutes(1)))).unwrap();
        store.save(&sample_run("none", None)).unwrap();

        let expired = store.expired(now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].run_id.as_str(), "old");
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        {
            let store = SqliteSuspensionStore::open(&path).unwrap();
            store.save(&sample_run("r1", None)).unwrap();
        }
        let store = SqliteSuspensionStore::open(&path).unwrap();
        let runs = store.list().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(store.remove(&RunId::from_string("r1")).unwrap());
        assert!(store.list().unwrap().is_empty());
    }
}
