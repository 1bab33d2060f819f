mod config;
mod server;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lattice_store::{SqliteStore, Stores};
use russh::server::Server as _;
use tracing::{info, warn};

/// How long outstanding sessions get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = config::Settings::load()?;
    info!(fs_root = %settings.fs_root.display(), "storage root");

    let backend =
        Arc::new(SqliteStore::open(&settings.db_path).context("opening metadata database")?);
    let stores = Stores::from_backend(backend);

    let key = russh::keys::load_secret_key(&settings.host_key_path, None)
        .with_context(|| format!("reading host key {}", settings.host_key_path.display()))?;

    let ssh_config = Arc::new(russh::server::Config {
        keys: vec![key],
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    });

    let mut gateway = server::Gateway::new(stores, settings.fs_root.clone());
    let active = gateway.active_sessions();

    info!(host = %settings.host, port = settings.port, "starting ssh server");
    tokio::select! {
        result = gateway.run_on_address(ssh_config, (settings.host.as_str(), settings.port)) => {
            result.context("ssh server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("stopping ssh server");
            let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
            while active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            let remaining = active.load(Ordering::SeqCst);
            if remaining > 0 {
                warn!(remaining, "dropping sessions still open after grace window");
            }
        }
    }

    Ok(())
}
