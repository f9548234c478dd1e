//! # Stage: Journal
//!
//! ## Responsibility
//! Record every tuning iteration in a SQLite file: which run and session it
//! belonged to, the recommendation it received, what the apply changed and
//! how the iteration ended.
//!
//! ## Guarantees
//! - The last recommendation of a session can always be read back, which is
//!   what `smartctl reapply` uses to recover from a partial apply.
//! - Schema creation is idempotent; opening an existing journal keeps its rows.
//!
//! ## NOT Responsible For
//! - Retention or pruning of old runs

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::Result;
use crate::knob::KnobSet;

const JOURNAL_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS iterations (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session         TEXT NOT NULL,
    run_id          TEXT NOT NULL,
    iteration       INTEGER NOT NULL,
    started_at_ms   INTEGER NOT NULL,
    recommendation  TEXT,
    globals_applied TEXT NOT NULL DEFAULT '[]',
    roles_reloaded  TEXT NOT NULL DEFAULT '[]',
    state           TEXT NOT NULL,
    error           TEXT
);
CREATE INDEX IF NOT EXISTS iterations_session ON iterations (session, id);
";

/// One journaled iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub id: i64,
    pub session: String,
    pub run_id: String,
    pub iteration: u32,
    pub started_at_ms: u64,
    pub recommendation: Option<KnobSet>,
    pub globals_applied: Vec<String>,
    pub roles_reloaded: Vec<String>,
    pub state: String,
    pub error: Option<String>,
}

/// How an iteration ended.
#[derive(Debug, Clone, Copy, Default)]
pub struct Outcome<'a> {
    pub state: &'a str,
    pub globals_applied: &'a [String],
    pub roles_reloaded: &'a [String],
    pub error: Option<&'a str>,
}

/// SQLite-backed iteration journal.
pub struct Journal {
    conn: Connection,
}

impl Journal {
    /// Open or create a journal at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(JOURNAL_SCHEMA)?;
        debug!(path = %path.display(), "journal opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(JOURNAL_SCHEMA)?;
        Ok(Self { conn })
    }

    /// Start a row for `iteration` of `run_id`; returns its id.
    pub fn begin_iteration(&self, session: &str, run_id: &str, iteration: u32) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO iterations (session, run_id, iteration, started_at_ms, state) \
             VALUES (?1, ?2, ?3, ?4, 'started')",
            params![session, run_id, iteration, now_millis()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn record_recommendation(&self, id: i64, knobs: &KnobSet) -> Result<()> {
        self.conn.execute(
            "UPDATE iterations SET recommendation = ?1 WHERE id = ?2",
            params![to_json(knobs), id],
        )?;
        Ok(())
    }

    pub fn record_outcome(&self, id: i64, outcome: Outcome<'_>) -> Result<()> {
        self.conn.execute(
            "UPDATE iterations \
             SET state = ?1, globals_applied = ?2, roles_reloaded = ?3, error = ?4 \
             WHERE id = ?5",
            params![
                outcome.state,
                to_json(outcome.globals_applied),
                to_json(outcome.roles_reloaded),
                outcome.error,
                id
            ],
        )?;
        Ok(())
    }

    /// Most recent recommendation journaled for `session`.
    pub fn last_recommendation(&self, session: &str) -> Result<Option<KnobSet>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT recommendation FROM iterations \
                 WHERE session = ?1 AND recommendation IS NOT NULL \
                 ORDER BY id DESC LIMIT 1",
                params![session],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|text| from_json(0, &text)).transpose().map_err(Into::into)
    }

    /// Every entry of `session`, oldest first.
    pub fn entries(&self, session: &str) -> Result<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session, run_id, iteration, started_at_ms, recommendation, \
                    globals_applied, roles_reloaded, state, error \
             FROM iterations WHERE session = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session], entry_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.conn.path())
            .finish_non_exhaustive()
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
    let recommendation: Option<String> = row.get(5)?;
    let globals: String = row.get(6)?;
    let roles: String = row.get(7)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        session: row.get(1)?,
        run_id: row.get(2)?,
        iteration: row.get(3)?,
        started_at_ms: row.get::<_, i64>(4)?.max(0) as u64,
        recommendation: recommendation
            .map(|text| from_json(5, &text))
            .transpose()?,
        globals_applied: from_json(6, &globals)?,
        roles_reloaded: from_json(7, &roles)?,
        state: row.get(8)?,
        error: row.get(9)?,
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn from_json<T: serde::de::DeserializeOwned>(column: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
