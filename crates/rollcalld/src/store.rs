//! SQLite persistence: attendance rows, enrolled faces and the session log.

use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{
    AttendanceMark, AttendanceRecord, AttendanceStatus, AttendanceStore, GalleryEntry,
    GalleryStore, SessionLog, SessionSummary, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS enrolled_faces (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    embedding   TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS attendance (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL,
    date        TEXT NOT NULL,
    status      TEXT NOT NULL,
    confidence  REAL,
    notes       TEXT NOT NULL DEFAULT '',
    marked_at   TEXT NOT NULL,
    UNIQUE (identity_id, date)
);

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    actor           TEXT,
    started_at      TEXT,
    ended_at        TEXT,
    is_active       INTEGER NOT NULL DEFAULT 0,
    total_recognized INTEGER NOT NULL
);
"#;

/// A single SQLite connection shared behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(backend)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn insert_enrolled(&self, name: &str, embedding_json: &str) -> i64 {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO enrolled_faces (name, embedding) VALUES (?1, ?2)",
            params![name, embedding_json],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[cfg(test)]
    pub fn attendance_count(&self) -> usize {
        self.conn()
            .query_row("SELECT COUNT(*) FROM attendance", [], |r| r.get::<_, i64>(0))
            .unwrap() as usize
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

fn read_record(conn: &Connection, identity: i64, date: &str) -> Result<AttendanceRecord, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, identity_id, date, status, confidence, notes, marked_at
             FROM attendance WHERE identity_id = ?1 AND date = ?2",
            params![identity, date],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()
        .map_err(backend)?
        .ok_or_else(|| StoreError::Corrupt(format!("attendance row for {identity} on {date} vanished")))?;

    let (id, identity, date, status, confidence, notes, marked_at) = row;
    Ok(AttendanceRecord {
        id,
        identity,
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| StoreError::Corrupt(format!("attendance date {date:?}: {e}")))?,
        status: status.parse::<AttendanceStatus>()?,
        confidence: confidence.map(|c| c as f32),
        notes,
        marked_at: DateTime::parse_from_rfc3339(&marked_at)
            .map_err(|e| StoreError::Corrupt(format!("marked_at {marked_at:?}: {e}")))?
            .with_timezone(&Utc),
    })
}

impl AttendanceStore for SqliteStore {
    fn upsert(&self, mark: &AttendanceMark) -> Result<(AttendanceRecord, bool), StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;

        let date = mark.date.format("%Y-%m-%d").to_string();
        let now = Utc::now().to_rfc3339();
        let confidence = mark.confidence.map(f64::from);

        // The unique key decides: a losing racer falls through to the update.
        let inserted = tx
            .execute(
                "INSERT INTO attendance (identity_id, date, status, confidence, notes, marked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (identity_id, date) DO NOTHING",
                params![mark.identity, date, mark.status.as_str(), confidence, mark.notes, now],
            )
            .map_err(backend)?;

        let created = inserted == 1;
        if !created {
            tx.execute(
                "UPDATE attendance SET status = ?3, confidence = ?4, notes = ?5, marked_at = ?6
                 WHERE identity_id = ?1 AND date = ?2",
                params![mark.identity, date, mark.status.as_str(), confidence, mark.notes, now],
            )
            .map_err(backend)?;
        }

        let record = read_record(&tx, mark.identity, &date)?;
        tx.commit().map_err(backend)?;
        Ok((record, created))
    }

    fn count_on(&self, date: NaiveDate, status: AttendanceStatus) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM attendance WHERE date = ?1 AND status = ?2",
                params![date.format("%Y-%m-%d").to_string(), status.as_str()],
                |r| r.get(0),
            )
            .map_err(backend)?;
        Ok(count as usize)
    }
}

impl GalleryStore for SqliteStore {
    fn list_enrolled(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name, embedding FROM enrolled_faces ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(backend)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, name, raw) = row.map_err(backend)?;
            // Malformed JSON becomes an empty vector; the gallery drops it.
            let embedding = serde_json::from_str::<Vec<f32>>(&raw).unwrap_or_else(|e| {
                tracing::warn!(id, name = %name, error = %e, "unparsable stored embedding");
                Vec::new()
            });
            entries.push(GalleryEntry { id, name, embedding });
        }
        Ok(entries)
    }
}

impl SessionLog for SqliteStore {
    fn record_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        let Some(id) = summary.session_id else {
            return Ok(());
        };
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO sessions
                     (id, actor, started_at, ended_at, is_active, total_recognized)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    summary.actor,
                    summary.started_at.map(|t| t.to_rfc3339()),
                    summary.ended_at.map(|t| t.to_rfc3339()),
                    summary.ended_at.is_none(),
                    summary.recognized_count as i64,
                ],
            )
            .map_err(backend)?;
        Ok(())
    }
}
