use anyhow::{Context, Result};
use rollcall_core::detector::Detector;
use rollcall_core::pipeline::AttendanceService;
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::AttendanceInterface;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        backend = config.backend.as_str(),
        db = %config.db_path().display(),
        threshold = config.similarity_threshold,
        "configuration loaded"
    );

    let store = SqliteStore::open(config.db_path())
        .await
        .with_context(|| format!("opening database {}", config.db_path().display()))?;
    let detector = config.build_detector().context("constructing detector")?;
    let service = Arc::new(AttendanceService::new(detector, store, config.match_config()));

    if config.warmup {
        // Requests arriving during warm-up wait on the same initialization.
        let warm = Arc::clone(&service);
        tokio::spawn(async move {
            match warm.detector().warm_up().await {
                Ok(()) => tracing::info!(backend = warm.detector().backend(), "detector ready"),
                Err(e) => tracing::warn!(error = %e, "detector warm-up failed; will retry on first request"),
            }
        });
    }

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceInterface::new(service))?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
