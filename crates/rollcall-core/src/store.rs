//! Persistence capabilities consumed by the engine.
//!
//! The engine never owns a schema; it only needs an attendance upsert keyed
//! by (identity, date) with a per-day count, a listing of enrolled faces,
//! and a place to log sessions.

use crate::session::SessionSummary;
use crate::types::{GalleryEntry, IdentityId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            "late" => Ok(Self::Late),
            other => Err(StoreError::Corrupt(format!("unknown attendance status {other:?}"))),
        }
    }
}

/// An attendance write request.
#[derive(Debug, Clone)]
pub struct AttendanceMark {
    pub identity: IdentityId,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub confidence: Option<f32>,
    pub notes: String,
}

/// A persisted attendance row; unique per (identity, date).
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity: IdentityId,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub confidence: Option<f32>,
    pub notes: String,
    pub marked_at: DateTime<Utc>,
}

pub trait AttendanceStore: Send + Sync {
    /// Insert or update the record for (identity, date). Returns the stored
    /// record and whether this call created it. Concurrent writers for the
    /// same key must collapse to a single row.
    fn upsert(&self, mark: &AttendanceMark) -> Result<(AttendanceRecord, bool), StoreError>;

    /// Number of records on `date` with `status`.
    fn count_on(&self, date: NaiveDate, status: AttendanceStatus) -> Result<usize, StoreError>;
}

pub trait GalleryStore: Send + Sync {
    fn list_enrolled(&self) -> Result<Vec<GalleryEntry>, StoreError>;
}

pub trait SessionLog: Send + Sync {
    /// Write or overwrite the row for this session. Called when it starts
    /// (no end time yet) and again when it is finalized.
    fn record_session(&self, summary: &SessionSummary) -> Result<(), StoreError>;
}
