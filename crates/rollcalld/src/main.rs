use anyhow::{Context, Result};
use rollcall_core::pipeline::PipelineOptions;
use rollcall_core::{ArcFaceEmbedder, FaceEmbedder, ScrfdDetector};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::Config;
use dbus_interface::RollcallService;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();

    // Load both ONNX models up front (fail-fast).
    let detector = ScrfdDetector::load(&config.scrfd_model_path())
        .context("loading SCRFD detection model")?;
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path())
        .context("loading ArcFace recognition model")?;
    let embedding_dim = embedder.dim();

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let store = Arc::new(
        Store::open(&config.db_path, embedding_dim)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    tracing::info!(
        db = %config.db_path.display(),
        embedding_dim,
        roster_size = store.identity_count().unwrap_or(0),
        "store opened"
    );

    let options = PipelineOptions {
        match_threshold: config.match_threshold,
        max_faces: config.max_faces,
        strategies: config.strategies.clone(),
    };
    tracing::info!(
        threshold = options.match_threshold,
        max_faces = options.max_faces,
        strategies = ?options.strategies,
        "pipeline configured"
    );

    let engine = engine::spawn_engine(detector, embedder, options, store.clone());

    let service = RollcallService::new(
        engine,
        store,
        Duration::from_secs(config.recognize_timeout_secs),
    );
    let _connection = zbus::connection::Builder::session()
        .context("connecting to session bus")?
        .name("org.rollcall.Rollcall1")?
        .serve_at("/org/rollcall/Rollcall1", service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!("rollcalld ready on org.rollcall.Rollcall1");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
