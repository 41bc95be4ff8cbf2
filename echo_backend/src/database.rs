use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::proactive::candidate::{Candidate, CandidateCategory};
use crate::signals::{SignalKind, SignalRecord};

pub const LAST_EMISSION_STATE_KEY: &str = "proactive.last_emission_at";

pub struct EchoDatabase {
    conn: Mutex<Connection>,
}

fn conversion_error<E>(column: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}

/// Fixed-width UTC text so `ORDER BY` and range filters on TEXT columns follow time order.
fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(column, e))
}

impl EchoDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS proactive_candidates (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                category TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                trigger_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                dismissed INTEGER NOT NULL DEFAULT 0,
                emitted_at TEXT,
                dismissed_by_user INTEGER NOT NULL DEFAULT 0
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS signal_records (
                id TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                score REAL NOT NULL DEFAULT 0,
                label TEXT,
                title TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (kind, id)
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_signal_records_kind_created ON signal_records(kind, created_at DESC)",
            [],
        )?;

        Ok(())
    }

    /// Get a state value
    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM agent_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a state value
    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO agent_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_last_emission_time(&self) -> Result<Option<DateTime<Utc>>> {
        match self.get_state(LAST_EMISSION_STATE_KEY)? {
            Some(raw) => Ok(Some(
                raw.parse()
                    .with_context(|| format!("Invalid last emission timestamp '{}'", raw))?,
            )),
            None => Ok(None),
        }
    }

    pub fn set_last_emission_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.set_state(LAST_EMISSION_STATE_KEY, &format_timestamp(time))
    }

    // ========================================================================
    // Proactive candidates
    // ========================================================================

    /// Replace the stored candidate set with `candidates`, preserving their order.
    pub fn replace_candidates(&self, candidates: &[Candidate]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM proactive_candidates", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO proactive_candidates
                 (id, seq, category, payload, priority, trigger_key, created_at, dismissed, emitted_at, dismissed_by_user)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (seq, candidate) in candidates.iter().enumerate() {
                stmt.execute(params![
                    candidate.id,
                    seq as i64,
                    candidate.category.as_db_str(),
                    candidate.payload,
                    candidate.priority as i64,
                    candidate.trigger_key,
                    format_timestamp(candidate.created_at),
                    candidate.dismissed,
                    candidate.emitted_at.map(format_timestamp),
                    candidate.dismissed_by_user,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_candidates(&self) -> Result<Vec<Candidate>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, payload, priority, trigger_key, created_at, dismissed, emitted_at,
                    dismissed_by_user
             FROM proactive_candidates
             ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let category_raw: String = row.get(1)?;
                let priority: i64 = row.get(3)?;
                let created_at_raw: String = row.get(5)?;
                let emitted_at_raw: Option<String> = row.get(7)?;
                Ok((
                    row.get::<_, String>(0)?,
                    category_raw,
                    row.get::<_, String>(2)?,
                    priority,
                    row.get::<_, String>(4)?,
                    parse_timestamp(5, &created_at_raw)?,
                    row.get::<_, bool>(6)?,
                    match emitted_at_raw {
                        Some(raw) => Some(parse_timestamp(7, &raw)?),
                        None => None,
                    },
                    row.get::<_, bool>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut candidates = Vec::with_capacity(rows.len());
        for (
            id,
            category_raw,
            payload,
            priority,
            trigger_key,
            created_at,
            dismissed,
            emitted_at,
            dismissed_by_user,
        ) in rows
        {
            let Some(category) = CandidateCategory::from_db(&category_raw) else {
                tracing::warn!(
                    "Skipping stored candidate {} with unknown category '{}'",
                    id,
                    category_raw
                );
                continue;
            };
            candidates.push(Candidate {
                id,
                category,
                payload,
                priority: priority.clamp(0, u8::MAX as i64) as u8,
                created_at,
                trigger_key,
                dismissed,
                emitted_at,
                dismissed_by_user,
            });
        }
        Ok(candidates)
    }

    // ========================================================================
    // Signal records
    // ========================================================================

    pub fn add_signal_record(&self, kind: SignalKind, record: &SignalRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO signal_records
             (id, kind, created_at, score, label, title, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                kind.as_db_str(),
                format_timestamp(record.created_at),
                record.score as f64,
                record.label,
                record.title,
                record.content,
            ],
        )?;
        Ok(())
    }

    /// Records of `kind` created after `cutoff`, newest first.
    pub fn recent_signal_records(
        &self,
        kind: SignalKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, score, label, title, content
             FROM signal_records
             WHERE kind = ?1 AND created_at > ?2
             ORDER BY created_at DESC",
        )?;
        let records = stmt
            .query_map(
                params![kind.as_db_str(), format_timestamp(cutoff)],
                Self::row_to_signal_record,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn latest_signal_record(&self, kind: SignalKind) -> Result<Option<SignalRecord>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, created_at, score, label, title, content
             FROM signal_records
             WHERE kind = ?1
             ORDER BY created_at DESC
             LIMIT 1",
            [kind.as_db_str()],
            Self::row_to_signal_record,
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete records of `kind` created at or before `cutoff`.
    pub fn purge_signal_records(&self, kind: SignalKind, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM signal_records WHERE kind = ?1 AND created_at <= ?2",
            params![kind.as_db_str(), format_timestamp(cutoff)],
        )?;
        Ok(removed)
    }

    fn row_to_signal_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignalRecord> {
        let created_at_raw: String = row.get(1)?;
        let score: f64 = row.get(2)?;
        Ok(SignalRecord {
            id: row.get(0)?,
            created_at: parse_timestamp(1, &created_at_raw)?,
            score: score as f32,
            label: row.get(3)?,
            title: row.get(4)?,
            content: row.get(5)?,
        })
    }
}
