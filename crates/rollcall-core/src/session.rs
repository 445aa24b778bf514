//! A single live attendance session.
//!
//! State is behind a short-held mutex: the frame loop, status readers and
//! the session manager each take it only for a read or a single mutation.

use crate::types::IdentityId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    actor: Option<String>,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

#[derive(Debug)]
struct SessionState {
    active: bool,
    ended_at: Option<DateTime<Utc>>,
    recognized: BTreeSet<IdentityId>,
}

/// Point-in-time copy of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub actor: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub recognized: Vec<IdentityId>,
}

/// What `stop` reports. The default value stands for "no session yet".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Option<Uuid>,
    pub actor: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recognized_count: usize,
}

impl Session {
    /// Create a fresh active session with an empty recognized set.
    pub fn begin(actor: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor,
            started_at: Utc::now(),
            state: Mutex::new(SessionState {
                active: true,
                ended_at: None,
                recognized: BTreeSet::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn has_recognized(&self, identity: IdentityId) -> bool {
        self.state().recognized.contains(&identity)
    }

    /// Add an identity to the recognized set. Returns `true` if it was new.
    pub fn record_recognized(&self, identity: IdentityId) -> bool {
        self.state().recognized.insert(identity)
    }

    pub fn recognized_count(&self) -> usize {
        self.state().recognized.len()
    }

    /// Mark the session ended. Only the first call sets the end timestamp;
    /// returns whether this call did so.
    pub fn finalize(&self) -> bool {
        let mut state = self.state();
        if !state.active {
            return false;
        }
        state.active = false;
        state.ended_at = Some(Utc::now());
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            id: self.id,
            actor: self.actor.clone(),
            started_at: self.started_at,
            ended_at: state.ended_at,
            active: state.active,
            recognized: state.recognized.iter().copied().collect(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.state();
        SessionSummary {
            session_id: Some(self.id),
            actor: self.actor.clone(),
            started_at: Some(self.started_at),
            ended_at: state.ended_at,
            recognized_count: state.recognized.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_is_active_and_empty() {
        let session = Session::begin(Some("front-desk".into()));
        assert!(session.is_active());
        assert_eq!(session.recognized_count(), 0);
        assert_eq!(session.actor(), Some("front-desk"));
        assert!(session.snapshot().ended_at.is_none());
    }

    #[test]
    fn test_record_recognized_is_set_like() {
        let session = Session::begin(None);
        assert!(session.record_recognized(7));
        assert!(!session.record_recognized(7));
        assert!(session.record_recognized(3));
        assert!(session.has_recognized(7));
        assert!(!session.has_recognized(8));
        assert_eq!(session.snapshot().recognized, vec![3, 7]);
    }

    #[test]
    fn test_finalize_once() {
        let session = Session::begin(None);
        assert!(session.finalize());
        let first_end = session.snapshot().ended_at.unwrap();
        assert!(!session.finalize());
        assert_eq!(session.snapshot().ended_at, Some(first_end));
        assert!(!session.is_active());
        assert!(first_end >= session.started_at());
    }

    #[test]
    fn test_summary_counts_recognized() {
        let session = Session::begin(None);
        session.record_recognized(1);
        session.record_recognized(2);
        session.finalize();
        let summary = session.summary();
        assert_eq!(summary.session_id, Some(session.id()));
        assert_eq!(summary.recognized_count, 2);
        assert!(summary.ended_at.is_some());
    }

    #[test]
    fn test_default_summary_is_empty() {
        let summary = SessionSummary::default();
        assert_eq!(summary.session_id, None);
        assert_eq!(summary.recognized_count, 0);
    }
}
