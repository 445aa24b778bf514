//! At-most-once-per-day attendance marking.
//!
//! Two layers: the session's recognized set answers "already greeted in this
//! live view" without touching storage; the store's (identity, date) unique
//! key is the authority on "marked today".

use crate::session::Session;
use crate::store::{AttendanceMark, AttendanceStatus, AttendanceStore, StoreError};
use crate::types::IdentityId;
use chrono::{Local, NaiveDate};
use std::sync::Arc;

pub struct Deduplicator {
    store: Arc<dyn AttendanceStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn AttendanceStore>) -> Self {
        Self { store }
    }

    /// Mark `identity` present for today's local date unless this session
    /// already greeted it. Returns whether a new record was created.
    pub fn mark_if_new(
        &self,
        session: &Session,
        identity: IdentityId,
        confidence: f32,
    ) -> Result<bool, StoreError> {
        self.mark_if_new_on(session, identity, confidence, Local::now().date_naive())
    }

    /// [`mark_if_new`](Self::mark_if_new) for an explicit date.
    pub fn mark_if_new_on(
        &self,
        session: &Session,
        identity: IdentityId,
        confidence: f32,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        if session.has_recognized(identity) {
            return Ok(false);
        }

        let mark = AttendanceMark {
            identity,
            date,
            status: AttendanceStatus::Present,
            confidence: Some(confidence),
            notes: format!("Face recognition - {confidence:.2} confidence"),
        };
        let (record, created) = self.store.upsert(&mark)?;

        // Cached even when the store only updated: this view has greeted them.
        session.record_recognized(identity);

        if created {
            tracing::info!(identity, %date, confidence, record = record.id, "attendance marked");
        } else {
            tracing::info!(identity, %date, confidence, record = record.id, "attendance updated");
        }
        Ok(created)
    }

    /// How many people the store holds as present for today's local date.
    pub fn present_today(&self) -> Result<usize, StoreError> {
        self.store
            .count_on(Local::now().date_naive(), AttendanceStatus::Present)
    }
}
