#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use assessment_core::{format_rfc3339, now_utc, AssessmentRecord, ClientKey};
use rusqlite::{params, Connection, OptionalExtension};

const HISTORY_MIGRATION_VERSION: i64 = 1;
const STORAGE_KEY_PREFIX: &str = "assessments_";

// One collection per sanitized client key; the value is the client's full
// history as a JSON array in insertion order. The store mutates collections
// only through whole-value read-modify-write (single-writer model).
const SCHEMA_HISTORY_V1: &str = r"
CREATE TABLE IF NOT EXISTS client_histories (
  storage_key TEXT PRIMARY KEY,
  records_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

pub struct SqliteHistoryStore {
    conn: Connection,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_HISTORY_V1)
            .context("failed to apply history schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![HISTORY_MIGRATION_VERSION, now],
            )
            .context("failed to register history schema migration")?;

        Ok(())
    }

    /// Returns the client's full history in insertion order; an absent
    /// collection is an empty history, not an error.
    pub fn list(&self, client: &ClientKey) -> Result<Vec<AssessmentRecord>> {
        match self.kv_get(&storage_key(client))? {
            Some(raw) => decode_history(&raw),
            None => Ok(Vec::new()),
        }
    }

    /// Appends one validated record to the client's history.
    pub fn append(&mut self, client: &ClientKey, record: &AssessmentRecord) -> Result<()> {
        record
            .validate()
            .map_err(|err| anyhow!("record validation failed: {err}"))?;

        let mut history = self.list(client)?;
        if history.iter().any(|existing| existing.id == record.id) {
            return Err(anyhow!(
                "record id {} already exists for client {client}",
                record.id
            ));
        }

        history.push(record.clone());
        self.write_history(client, &history)
    }

    /// Removes the record with the matching id. Returns whether a record was
    /// removed; an absent id is a no-op, not an error.
    pub fn remove(&mut self, client: &ClientKey, id: i64) -> Result<bool> {
        let mut history = self.list(client)?;
        let before = history.len();
        history.retain(|record| record.id != id);

        if history.len() == before {
            return Ok(false);
        }

        self.write_history(client, &history)?;
        Ok(true)
    }

    pub fn find(&self, client: &ClientKey, id: i64) -> Result<Option<AssessmentRecord>> {
        Ok(self
            .list(client)?
            .into_iter()
            .find(|record| record.id == id))
    }

    fn write_history(&mut self, client: &ClientKey, history: &[AssessmentRecord]) -> Result<()> {
        let payload =
            serde_json::to_string(history).context("failed to serialize client history")?;
        self.kv_set(&storage_key(client), &payload)
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT records_json FROM client_histories WHERE storage_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read collection {key}"))
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO client_histories(storage_key, records_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(storage_key) DO UPDATE SET
                   records_json = excluded.records_json,
                   updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("failed to write collection {key}"))?;

        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn storage_key(client: &ClientKey) -> String {
    format!("{STORAGE_KEY_PREFIX}{client}")
}

fn decode_history(raw: &str) -> Result<Vec<AssessmentRecord>> {
    serde_json::from_str(raw).context("invalid stored history JSON")
}
