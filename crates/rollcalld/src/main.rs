use anyhow::{Context, Result};
use rollcall_core::{AttendanceStore, DecisionEngine};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    let policy = config.load_policy()?;
    tracing::info!(
        policy = %config.policy_path.display(),
        sites = policy.sites.len(),
        match_threshold = policy.match_threshold,
        debounce_window_secs = policy.debounce_window_secs,
        "policy loaded"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let store: Arc<dyn AttendanceStore> = Arc::new(store);

    let engine = DecisionEngine::bootstrap(policy, store)
        .await
        .context("failed to load enrollments")?;
    tracing::info!(
        enrolled_users = engine.gallery().snapshot().len(),
        "enrollments loaded"
    );

    let service = AttendanceService::new(Arc::new(engine));
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME}"))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
