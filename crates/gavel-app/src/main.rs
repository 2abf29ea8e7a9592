// Gavel auction server entry point.
//
// Startup sequence:
// 1. Initialize tracing
// 2. Load config
// 3. Open database
// 4. Build the auction engine
// 5. Spawn the automation driver
// 6. Spawn the WebSocket server
// 7. Wait for Ctrl+C, then shut both down

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use gavel_app::config;
use gavel_app::ws_server;
use gavel_core::clock::system_clock;
use gavel_core::driver::AutomationDriver;
use gavel_core::{AuctionEngine, Database};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Gavel starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    let timing = config.auction_timing();
    info!(
        "Config loaded: listen={}, countdowns {}s/{}s/{}s",
        config.listen_addr(),
        timing.opening_countdown.num_seconds(),
        timing.bid_countdown.num_seconds(),
        timing.relist_countdown.num_seconds()
    );

    // 3. Open database
    let db_path = config.db_path().context("failed to resolve database path")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db_path_str = db_path.to_string_lossy();
    let store = Arc::new(Database::open(&db_path_str).context("failed to open database")?);
    info!("Database opened at {}", db_path.display());

    // 4. Build the auction engine
    let engine = AuctionEngine::new(store, system_clock(), timing);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 5. Spawn the automation driver
    let driver = AutomationDriver::new(engine.clone(), config.automation_tick());
    let driver_handle = tokio::spawn(driver.run(shutdown_rx.clone()));

    // 6. Spawn the WebSocket server
    let listen_addr = config.listen_addr();
    let ws_handle = tokio::spawn(async move {
        match ws_server::TungsteniteListener::bind(&listen_addr).await {
            Ok(listener) => {
                if let Err(e) = ws_server::run(listener, engine, shutdown_rx).await {
                    error!("WebSocket server error: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to bind WebSocket server on {}: {}", listen_addr, e);
            }
        }
    });

    // 7. Wait for Ctrl+C
    info!("Gavel ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = driver_handle.await;
        let _ = ws_handle.await;
    })
    .await;
    if finished.is_err() {
        warn!("Background tasks did not stop within 5s");
    }

    info!("Gavel shut down cleanly");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("gavel=info,gavel_app=info,gavel_core=info,warn")
            }),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
