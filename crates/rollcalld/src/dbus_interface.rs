use crate::manager::{SessionError, SessionManager};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus control interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    manager: Arc<SessionManager>,
}

impl AttendanceService {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Run a blocking manager call off the async executor.
    async fn blocking<T, F>(&self, call: F) -> zbus::fdo::Result<T>
    where
        F: FnOnce(&SessionManager) -> T + Send + 'static,
        T: Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || call(&manager))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("manager task failed: {e}")))
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a session, stopping any running one first. Returns the session id.
    async fn start_session(&self, actor: &str) -> zbus::fdo::Result<String> {
        let actor = non_empty(actor);
        tracing::info!(actor = actor.as_deref().unwrap_or("-"), "start_session requested");
        let session = self
            .blocking(move |m| m.start(actor))
            .await?
            .map_err(to_fdo)?;
        Ok(session.id().to_string())
    }

    /// Stop the running session. Returns the session summary as JSON.
    async fn stop_session(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop_session requested");
        let summary = self.blocking(|m| m.stop()).await?;
        to_json(&summary)
    }

    /// Current session status as JSON.
    async fn get_status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.manager.status())
    }

    /// Reload enrolled faces from the database. Returns how many loaded.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload_gallery requested");
        let report = self
            .blocking(|m| m.reload_gallery())
            .await?
            .map_err(to_fdo)?;
        Ok(u32::try_from(report.loaded).unwrap_or(u32::MAX))
    }

    /// Daemon version.
    #[zbus(property)]
    async fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }
}

fn non_empty(actor: &str) -> Option<String> {
    let actor = actor.trim();
    (!actor.is_empty()).then(|| actor.to_string())
}

fn to_fdo(e: SessionError) -> zbus::fdo::Error {
    match e {
        SessionError::DeviceUnavailable(_) => zbus::fdo::Error::Failed(format!("DeviceUnavailable: {e}")),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding reply: {e}")))
}
