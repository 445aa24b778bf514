use anyhow::{Context, Result};
use rollcall_core::{Deduplicator, FaceModel, Gallery, GalleryError, OnnxFaceModel};
use rollcall_hw::V4lDevice;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod http;
mod manager;
mod overlay;
mod pipeline;
mod store;

use config::Config;
use manager::SessionManager;
use pipeline::{PipelineSettings, Recognition};
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    let settings = PipelineSettings::from_config(&config)?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );
    tracing::info!(path = %config.db_path.display(), "database opened");

    // Models load up front so a missing file fails startup, not the first session.
    let model = OnnxFaceModel::load(&config.detector_model_path(), &config.encoder_model_path())
        .context("failed to load face models")?;
    let model: Box<dyn FaceModel> = Box::new(model);

    let gallery = Arc::new(Gallery::new());
    match gallery.reload_from(store.as_ref()) {
        Ok(report) => tracing::info!(
            loaded = report.loaded,
            dropped = report.dropped,
            "gallery loaded"
        ),
        Err(GalleryError::NoValidEntries { dropped }) => {
            tracing::warn!(dropped, "no usable enrolled faces; starting with an empty gallery")
        }
        Err(e) => return Err(e).context("failed to load gallery"),
    }

    let recognition = Recognition {
        model: Arc::new(Mutex::new(model)),
        gallery,
        dedup: Arc::new(Deduplicator::new(store.clone())),
    };
    let device = Arc::new(V4lDevice::new(
        config.camera_device.clone(),
        config.capture_width,
        config.capture_height,
    ));
    let manager = Arc::new(SessionManager::new(
        device,
        recognition,
        store.clone(),
        store.clone(),
        settings,
    ));

    let service = dbus_interface::AttendanceService::new(Arc::clone(&manager));
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(
        name = dbus_interface::BUS_NAME,
        session_bus = config.session_bus,
        "D-Bus interface registered"
    );

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(http::serve(
        config.http_addr,
        Arc::clone(&manager),
        shutdown.clone(),
    ));

    tracing::info!(device = %config.camera_device, "rollcalld ready");

    let exited_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            None
        }
        result = &mut server => Some(result),
    };
    tracing::info!("rollcalld shutting down");

    shutdown.cancel();
    let stopper = Arc::clone(&manager);
    let summary = tokio::task::spawn_blocking(move || stopper.stop()).await?;
    tracing::info!(recognized = summary.recognized_count, "final session stopped");

    match exited_early {
        Some(result) => result?,
        None => server.await?,
    }
}
