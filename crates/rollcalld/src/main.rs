use anyhow::{Context, Result};
use rollcall_core::{ArcFaceRecognizer, ScrfdDetector};
use rollcall_engine::Engine;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::{Bus, Config};
use dbus_interface::RollcallService;

const BUS_NAME: &str = "org.rollcall.Rollcall1";
const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        model_dir = %config.model_dir.display(),
        bus = ?config.bus,
        "configuration loaded"
    );

    let detector = ScrfdDetector::load(&config.scrfd_model_path(), config.inference_sessions)
        .context("loading detection model")?;
    let recognizer = ArcFaceRecognizer::load(&config.arcface_model_path(), config.inference_sessions)
        .context("loading recognition model")?;
    tracing::info!(sessions = config.inference_sessions, "vision models loaded");

    let engine = Arc::new(Engine::start(config.engine_config(), detector, recognizer).await?);

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(Arc::clone(&engine)))?
        .build()
        .await
        .context("registering on the message bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
