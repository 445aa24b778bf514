//! Camera session lifecycle: `Idle → Active → Idle`.
//!
//! The manager exclusively owns the capture device. A session's frame loop
//! runs on a dedicated OS thread that blocks on device reads; frames go to
//! at most one viewer through a bounded channel, so a slow viewer slows the
//! loop rather than queueing frames. Stopping is cooperative via a
//! cancellation token checked once per iteration.

use crate::pipeline::{FramePipeline, PipelineSettings, Recognition};
use chrono::{DateTime, Utc};
use rollcall_core::{
    GalleryError, GalleryStore, IdentityId, LoadReport, Session, SessionLog, SessionSummary,
};
use rollcall_hw::{CameraError, CaptureDevice};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sending half of a viewer's frame channel.
pub type FrameSink = mpsc::Sender<Vec<u8>>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(#[source] CameraError),
    #[error("cannot spawn session worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("session ended before the stream could attach")]
    Ended,
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// Identity recognized in the current session, with its display name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedIdentity {
    pub id: IdentityId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub session_id: Option<Uuid>,
    pub actor: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recognized_count: usize,
    pub recognized: Vec<RecognizedIdentity>,
    pub enrolled: usize,
    /// People the store holds as present today, across all sessions.
    /// `None` when the store could not be read.
    pub present_today: Option<usize>,
}

struct ActiveSession {
    session: Arc<Session>,
    cancel: CancellationToken,
    viewers: mpsc::UnboundedSender<FrameSink>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    active: Option<ActiveSession>,
    last_summary: SessionSummary,
}

pub struct SessionManager {
    device: Arc<dyn CaptureDevice>,
    recognition: Recognition,
    gallery_store: Arc<dyn GalleryStore>,
    session_log: Arc<dyn SessionLog>,
    settings: PipelineSettings,
    /// Held across teardown and device acquisition; never by status readers.
    lifecycle: Mutex<Lifecycle>,
    /// Most recent session, for status reads.
    current: RwLock<Option<Arc<Session>>>,
}

impl SessionManager {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        recognition: Recognition,
        gallery_store: Arc<dyn GalleryStore>,
        session_log: Arc<dyn SessionLog>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            device,
            recognition,
            gallery_store,
            session_log,
            settings,
            lifecycle: Mutex::new(Lifecycle::default()),
            current: RwLock::new(None),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a session, first fully stopping any active one.
    pub fn start(&self, actor: Option<String>) -> Result<Arc<Session>, SessionError> {
        let mut lifecycle = self.lifecycle();
        self.start_locked(&mut lifecycle, actor)
    }

    /// Stop the active session. While idle, returns the last summary.
    pub fn stop(&self) -> SessionSummary {
        let mut lifecycle = self.lifecycle();
        self.teardown(&mut lifecycle);
        lifecycle.last_summary.clone()
    }

    /// Attach a viewer to the live frame stream, starting a session if none
    /// is running. A newer viewer replaces an older one.
    pub fn subscribe(&self, actor: Option<String>) -> Result<mpsc::Receiver<Vec<u8>>, SessionError> {
        let (tx, rx) = mpsc::channel(1);
        let mut lifecycle = self.lifecycle();

        let running = lifecycle
            .active
            .as_ref()
            .is_some_and(|a| a.session.is_active());
        if !running {
            self.start_locked(&mut lifecycle, actor)?;
        }

        let active = lifecycle.active.as_ref().ok_or(SessionError::Ended)?;
        active.viewers.send(tx).map_err(|_| SessionError::Ended)?;
        tracing::info!(session = %active.session.id(), "viewer attached");
        Ok(rx)
    }

    /// Snapshot of the most recent session. Never waits on the frame loop.
    pub fn status(&self) -> SessionStatus {
        let current = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let gallery = &self.recognition.gallery;
        let present_today = match self.recognition.dedup.present_today() {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "cannot count today's attendance");
                None
            }
        };

        match current {
            Some(session) => {
                let snapshot = session.snapshot();
                SessionStatus {
                    active: snapshot.active,
                    session_id: Some(snapshot.id),
                    actor: snapshot.actor,
                    started_at: Some(snapshot.started_at),
                    ended_at: snapshot.ended_at,
                    recognized_count: snapshot.recognized.len(),
                    recognized: snapshot
                        .recognized
                        .into_iter()
                        .map(|id| RecognizedIdentity {
                            id,
                            name: gallery.name_of(id),
                        })
                        .collect(),
                    enrolled: gallery.len(),
                    present_today,
                }
            }
            None => SessionStatus {
                active: false,
                session_id: None,
                actor: None,
                started_at: None,
                ended_at: None,
                recognized_count: 0,
                recognized: Vec::new(),
                enrolled: gallery.len(),
                present_today,
            },
        }
    }

    /// Replace the gallery with the store's current enrollments.
    pub fn reload_gallery(&self) -> Result<LoadReport, SessionError> {
        let report = self
            .recognition
            .gallery
            .reload_from(self.gallery_store.as_ref())?;
        tracing::info!(loaded = report.loaded, dropped = report.dropped, "gallery reloaded");
        Ok(report)
    }

    fn start_locked(
        &self,
        lifecycle: &mut Lifecycle,
        actor: Option<String>,
    ) -> Result<Arc<Session>, SessionError> {
        self.teardown(lifecycle);

        let source = self.device.open().map_err(|e| {
            tracing::warn!(device = self.device.name(), error = %e, "camera unavailable");
            SessionError::DeviceUnavailable(e)
        })?;

        let session = Arc::new(Session::begin(actor));
        let pipeline = FramePipeline::new(
            source,
            self.recognition.clone(),
            Arc::clone(&session),
            self.settings.clone(),
        );
        let cancel = CancellationToken::new();
        let (viewers_tx, viewers_rx) = mpsc::unbounded_channel();

        let worker = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            let log = Arc::clone(&self.session_log);
            std::thread::Builder::new()
                .name("rollcall-session".into())
                .spawn(move || run_worker(pipeline, session, cancel, viewers_rx, log))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                session.finalize();
                return Err(SessionError::Spawn(e));
            }
        };

        if let Err(e) = self.session_log.record_session(&session.summary()) {
            tracing::warn!(session = %session.id(), error = %e, "session log write failed");
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        lifecycle.active = Some(ActiveSession {
            session: Arc::clone(&session),
            cancel,
            viewers: viewers_tx,
            worker,
        });

        tracing::info!(
            session = %session.id(),
            actor = session.actor().unwrap_or("-"),
            device = self.device.name(),
            "session started"
        );
        Ok(session)
    }

    /// Stop the worker, wait for it to release the device, finalize.
    fn teardown(&self, lifecycle: &mut Lifecycle) {
        let Some(active) = lifecycle.active.take() else {
            return;
        };
        let ActiveSession {
            session,
            cancel,
            viewers,
            worker,
        } = active;

        cancel.cancel();
        drop(viewers);
        if worker.join().is_err() {
            tracing::error!(session = %session.id(), "session worker panicked");
        }

        finish(&session, self.session_log.as_ref());
        lifecycle.last_summary = session.summary();
    }
}

/// Finalize once and record the session.
fn finish(session: &Session, log: &dyn SessionLog) {
    if !session.finalize() {
        return;
    }
    let summary = session.summary();
    tracing::info!(
        session = %session.id(),
        recognized = summary.recognized_count,
        "session ended"
    );
    if let Err(e) = log.record_session(&summary) {
        tracing::warn!(session = %session.id(), error = %e, "session log write failed");
    }
}

enum Delivery {
    Sent,
    ViewerGone,
    Replaced(FrameSink),
    Cancelled,
}

fn run_worker(
    mut pipeline: FramePipeline,
    session: Arc<Session>,
    cancel: CancellationToken,
    mut viewers: mpsc::UnboundedReceiver<FrameSink>,
    log: Arc<dyn SessionLog>,
) {
    let mut sink: Option<FrameSink> = None;

    while !cancel.is_cancelled() && session.is_active() {
        while let Ok(next) = viewers.try_recv() {
            sink = Some(next);
        }
        if sink.as_ref().map_or(true, |s| s.is_closed()) {
            sink = futures::executor::block_on(wait_for_viewer(&cancel, &mut viewers));
        }
        let Some(tx) = sink.as_ref() else {
            break;
        };

        let frame = match pipeline.next_frame() {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() => {
                tracing::warn!(session = %session.id(), error = %e, "camera read failed; ending session");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame skipped");
                continue;
            }
        };

        match futures::executor::block_on(deliver(tx, frame.jpeg, &cancel, &mut viewers)) {
            Delivery::Sent => {}
            Delivery::ViewerGone => {
                tracing::info!(session = %session.id(), "viewer disconnected");
                sink = None;
            }
            Delivery::Replaced(next) => sink = Some(next),
            Delivery::Cancelled => break,
        }
    }

    // Release the camera before the session reads as ended.
    drop(pipeline);
    finish(&session, log.as_ref());
    drop(sink);
}

async fn wait_for_viewer(
    cancel: &CancellationToken,
    viewers: &mut mpsc::UnboundedReceiver<FrameSink>,
) -> Option<FrameSink> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            next = viewers.recv() => match next {
                Some(tx) if !tx.is_closed() => return Some(tx),
                Some(_) => continue,
                None => return None,
            },
        }
    }
}

async fn deliver(
    tx: &FrameSink,
    jpeg: Vec<u8>,
    cancel: &CancellationToken,
    viewers: &mut mpsc::UnboundedReceiver<FrameSink>,
) -> Delivery {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Cancelled,
        next = viewers.recv() => match next {
            Some(tx) => Delivery::Replaced(tx),
            None => Delivery::Cancelled,
        },
        sent = tx.send(jpeg) => match sent {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::ViewerGone,
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::tests::{recognition, unit, ScriptedModel, ScriptedSource};
    use crate::store::SqliteStore;
    use rollcall_hw::{Frame, FrameSource};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Capture device double that tracks how many sources are open at once.
    #[derive(Default)]
    pub(crate) struct FakeDevice {
        pub(crate) frame_limit: Option<usize>,
        pub(crate) corrupt_on: Vec<usize>,
        pub(crate) unavailable: AtomicBool,
        pub(crate) opens: AtomicUsize,
        pub(crate) open_now: Arc<AtomicUsize>,
        pub(crate) max_open: Arc<AtomicUsize>,
    }

    struct TrackedSource {
        inner: ScriptedSource,
        open_now: Arc<AtomicUsize>,
    }

    impl FrameSource for TrackedSource {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(2));
            self.inner.read_frame()
        }
    }

    impl Drop for TrackedSource {
        fn drop(&mut self) {
            self.open_now.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl CaptureDevice for FakeDevice {
        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(CameraError::DeviceBusy);
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open.fetch_max(now, Ordering::SeqCst);
            let mut inner = match self.frame_limit {
                Some(n) => ScriptedSource::limited(n),
                None => ScriptedSource::endless(),
            };
            inner.corrupt_on = self.corrupt_on.clone();
            Ok(Box::new(TrackedSource {
                inner,
                open_now: Arc::clone(&self.open_now),
            }))
        }

        fn name(&self) -> &str {
            "fake0"
        }
    }

    /// One row per session id, overwritten on each write.
    #[derive(Default)]
    pub(crate) struct MemoryLog {
        pub(crate) sessions: Mutex<Vec<SessionSummary>>,
    }

    impl MemoryLog {
        fn row(&self, id: Uuid) -> Option<SessionSummary> {
            let sessions = self.sessions.lock().unwrap();
            sessions.iter().find(|s| s.session_id == Some(id)).cloned()
        }
    }

    impl SessionLog for MemoryLog {
        fn record_session(&self, summary: &SessionSummary) -> Result<(), rollcall_core::StoreError> {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.iter_mut().find(|s| s.session_id == summary.session_id) {
                Some(row) => *row = summary.clone(),
                None => sessions.push(summary.clone()),
            }
            Ok(())
        }
    }

    pub(crate) fn manager_with(device: Arc<FakeDevice>) -> (SessionManager, Arc<MemoryLog>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let log = Arc::new(MemoryLog::default());
        let manager = SessionManager::new(
            device,
            recognition(ScriptedModel::seeing(unit(0)), Arc::clone(&store)),
            store.clone(),
            log.clone(),
            PipelineSettings::default(),
        );
        (manager, log, store)
    }

    #[test]
    fn test_start_stop_cycle() {
        let device = Arc::new(FakeDevice::default());
        let (manager, log, _) = manager_with(device.clone());

        let session = manager.start(Some("desk".into())).unwrap();
        let status = manager.status();
        assert!(status.active);
        assert_eq!(status.session_id, Some(session.id()));
        assert_eq!(status.recognized_count, 0);
        assert_eq!(status.enrolled, 2);
        assert_eq!(status.present_today, Some(0));

        let summary = manager.stop();
        assert_eq!(summary.session_id, Some(session.id()));
        assert!(summary.ended_at.is_some());
        assert!(!manager.status().active);
        assert_eq!(device.open_now.load(Ordering::SeqCst), 0);
        assert_eq!(log.sessions.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stop_while_idle_returns_last_summary() {
        let (manager, log, _) = manager_with(Arc::new(FakeDevice::default()));
        assert_eq!(manager.stop(), SessionSummary::default());

        manager.start(None).unwrap();
        let first = manager.stop();
        let again = manager.stop();
        assert_eq!(first, again);
        assert_eq!(log.sessions.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_restart_finalizes_previous_first() {
        let device = Arc::new(FakeDevice::default());
        let (manager, _, _) = manager_with(device.clone());

        let first = manager.start(None).unwrap();
        let second = manager.start(None).unwrap();

        let ended = first.snapshot().ended_at.unwrap();
        assert!(!first.is_active());
        assert!(ended < second.started_at());
        assert!(second.is_active());
        assert_eq!(device.opens.load(Ordering::SeqCst), 2);
        assert_eq!(device.max_open.load(Ordering::SeqCst), 1);
        manager.stop();
    }

    #[test]
    fn test_device_unavailable_leaves_idle() {
        let device = Arc::new(FakeDevice::default());
        device.unavailable.store(true, Ordering::SeqCst);
        let (manager, _, _) = manager_with(device);

        let Err(err) = manager.start(None) else {
            panic!("start should fail without a camera");
        };
        assert!(matches!(err, SessionError::DeviceUnavailable(CameraError::DeviceBusy)));
        assert!(!manager.status().active);
        assert!(matches!(manager.subscribe(None), Err(SessionError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_subscribe_starts_session_and_streams() {
        let (manager, _, store) = manager_with(Arc::new(FakeDevice::default()));

        let mut rx = manager.subscribe(Some("viewer".into())).unwrap();
        for _ in 0..4 {
            let jpeg = rx.blocking_recv().unwrap();
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        }

        let status = manager.status();
        assert!(status.active);
        assert_eq!(status.actor.as_deref(), Some("viewer"));
        assert_eq!(
            status.recognized,
            vec![RecognizedIdentity { id: 1, name: Some("Ada".into()) }]
        );
        assert_eq!(store.attendance_count(), 1);
        assert_eq!(status.present_today, Some(1));
        manager.stop();
    }

    #[test]
    fn test_present_today_survives_restart() {
        let (manager, _, _) = manager_with(Arc::new(FakeDevice::default()));
        let mut rx = manager.subscribe(None).unwrap();
        rx.blocking_recv().unwrap();
        manager.stop();

        // A new session has greeted nobody, but today's record stands
        manager.start(None).unwrap();
        let status = manager.status();
        assert_eq!(status.recognized_count, 0);
        assert_eq!(status.present_today, Some(1));
        manager.stop();
    }

    #[test]
    fn test_session_logged_when_started() {
        let (manager, log, _) = manager_with(Arc::new(FakeDevice::default()));
        let session = manager.start(Some("desk".into())).unwrap();

        let row = log.row(session.id()).unwrap();
        assert_eq!(row.actor.as_deref(), Some("desk"));
        assert!(row.ended_at.is_none());

        manager.stop();
        assert!(log.row(session.id()).unwrap().ended_at.is_some());
        assert_eq!(log.sessions.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_undecodable_frames_keep_session_alive() {
        let device = Arc::new(FakeDevice {
            corrupt_on: vec![0, 2],
            ..FakeDevice::default()
        });
        let (manager, _, _) = manager_with(device.clone());

        let mut rx = manager.subscribe(None).unwrap();
        for _ in 0..3 {
            assert!(rx.blocking_recv().is_some());
        }
        assert!(manager.status().active);
        assert_eq!(device.opens.load(Ordering::SeqCst), 1);
        manager.stop();
    }

    #[test]
    fn test_subscribe_reuses_running_session() {
        let device = Arc::new(FakeDevice::default());
        let (manager, _, _) = manager_with(device.clone());
        let session = manager.start(None).unwrap();

        let mut rx = manager.subscribe(None).unwrap();
        rx.blocking_recv().unwrap();
        assert_eq!(manager.status().session_id, Some(session.id()));
        assert_eq!(device.opens.load(Ordering::SeqCst), 1);
        manager.stop();
    }

    #[test]
    fn test_newest_viewer_replaces_previous() {
        let (manager, _, _) = manager_with(Arc::new(FakeDevice::default()));
        let mut first = manager.subscribe(None).unwrap();
        first.blocking_recv().unwrap();

        let mut second = manager.subscribe(None).unwrap();
        // The first stream drains and closes once the worker switches
        while first.blocking_recv().is_some() {}
        assert!(second.blocking_recv().is_some());
        assert!(manager.status().active);
        manager.stop();
    }

    #[test]
    fn test_stop_ends_stream() {
        let (manager, _, _) = manager_with(Arc::new(FakeDevice::default()));
        let mut rx = manager.subscribe(None).unwrap();
        rx.blocking_recv().unwrap();

        let summary = manager.stop();
        assert_eq!(summary.recognized_count, 1);
        while rx.blocking_recv().is_some() {}
    }

    #[test]
    fn test_device_failure_ends_session() {
        let device = Arc::new(FakeDevice {
            frame_limit: Some(3),
            ..FakeDevice::default()
        });
        let (manager, log, _) = manager_with(device.clone());

        let mut rx = manager.subscribe(None).unwrap();
        let mut received = 0;
        while rx.blocking_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 3);

        let status = manager.status();
        assert!(!status.active);
        assert!(status.ended_at.is_some());
        assert_eq!(device.open_now.load(Ordering::SeqCst), 0);
        assert_eq!(log.sessions.lock().unwrap().len(), 1);

        // A later subscribe starts a fresh session
        let mut rx = manager.subscribe(None).unwrap();
        assert!(rx.blocking_recv().is_some());
        manager.stop();
        assert_eq!(log.sessions.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_status_not_blocked_by_stalled_viewer() {
        let (manager, _, _) = manager_with(Arc::new(FakeDevice::default()));
        let _rx = manager.subscribe(None).unwrap();

        // Nobody reads: the worker parks on the full channel.
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        assert!(manager.status().active);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Stop still completes while the viewer stalls
        manager.stop();
    }

    #[test]
    fn test_viewer_disconnect_keeps_session() {
        let (manager, _, _) = manager_with(Arc::new(FakeDevice::default()));
        let mut rx = manager.subscribe(None).unwrap();
        rx.blocking_recv().unwrap();
        drop(rx);

        std::thread::sleep(Duration::from_millis(30));
        assert!(manager.status().active);

        let mut rx = manager.subscribe(None).unwrap();
        assert!(rx.blocking_recv().is_some());
        manager.stop();
    }

    #[test]
    fn test_reload_gallery_from_store() {
        let (manager, _, store) = manager_with(Arc::new(FakeDevice::default()));
        store.insert_enrolled("Linus", &serde_json::to_string(&unit(3)).unwrap());

        let report = manager.reload_gallery().unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(manager.status().enrolled, 1);
    }

    #[test]
    fn test_reload_all_invalid_keeps_gallery() {
        let (manager, _, store) = manager_with(Arc::new(FakeDevice::default()));
        store.insert_enrolled("Broken", "[1.0, 2.0]");

        assert!(matches!(
            manager.reload_gallery(),
            Err(SessionError::Gallery(GalleryError::NoValidEntries { .. }))
        ));
        assert_eq!(manager.status().enrolled, 2);
    }
}
