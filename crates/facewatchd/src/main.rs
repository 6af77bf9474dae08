use anyhow::{Context, Result};
use facewatch_core::{FaceAnalyzer, OnnxAnalyzer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod gallery;
mod monitor;
mod sessions;
mod store;

use config::{BusKind, Config, StoreKind};
use dbus_interface::{MonitorService, BUS_NAME, OBJECT_PATH};
use engine::{spawn_engine, FaceEngine, ModelState};
use gallery::Gallery;
use sessions::SessionManager;
use store::rest::RestStore;
use store::sqlite::SqliteStore;
use store::DetectionStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facewatchd starting");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        camera = %config.camera,
        gallery = %config.gallery_dir.display(),
        models = %config.model_dir.display(),
        "configuration loaded"
    );

    let model_dir = config.model_dir.clone();
    let engine = spawn_engine(move || {
        let analyzer = OnnxAnalyzer::load(&model_dir)?;
        Ok(Box::new(analyzer) as Box<dyn FaceAnalyzer>)
    })
    .context("failed to start engine thread")?;

    let loading = engine.clone();
    tokio::spawn(async move {
        if let ModelState::Failed(reason) = loading.loaded().await {
            tracing::warn!(%reason, "sessions cannot start until the models are fixed");
        }
    });

    let gallery = Gallery::open(&config.gallery_dir)
        .with_context(|| format!("failed to open gallery {}", config.gallery_dir.display()))?;

    let store: Arc<dyn DetectionStore> = match config.store {
        StoreKind::Sqlite => Arc::new(
            SqliteStore::open(&config.db_path, &config.screenshot_dir, config.max_records)
                .await
                .with_context(|| format!("failed to open {}", config.db_path.display()))?,
        ),
        StoreKind::Rest => {
            let url = config
                .rest_url
                .as_deref()
                .context("store = \"rest\" requires rest_url")?;
            Arc::new(RestStore::new(url, config.rest_token.clone())?)
        }
    };
    tracing::info!(store = ?config.store, "detection store ready");

    let engine: Arc<dyn FaceEngine> = Arc::new(engine);
    let sessions = Arc::new(SessionManager::new(
        engine,
        gallery,
        store,
        config.monitor_settings(),
        config.camera.clone(),
    ));

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, MonitorService::new(Arc::clone(&sessions)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facewatchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facewatchd shutting down");
    sessions.stop().await;

    Ok(())
}
