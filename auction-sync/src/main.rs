// Auction monitor entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Create mpsc channels
// 4. Build REST client and connection manager
// 5. Spawn the sync engine task
// 6. Queue joins for the configured watch list
// 7. Consume UI updates until Ctrl+C
// 8. Cleanup on exit

use std::sync::Arc;

use auction_sync::api::ApiClient;
use auction_sync::config;
use auction_sync::connection::{ConnectionManager, WsConnector};
use auction_sync::engine::{EngineCommand, SyncEngine};
use auction_sync::protocol::{NoticeClass, UiUpdate};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing (log to file, not terminal)
    init_tracing()?;
    info!("Auction monitor starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: ws={}, api={}, watching {} auction(s)",
        config.server.ws_url,
        config.server.api_url,
        config.watch.auction_ids.len()
    );

    // 3. Create mpsc channels
    let (event_tx, event_rx) = mpsc::channel(config.engine.event_channel_capacity);
    let (cmd_tx, cmd_rx) = mpsc::channel(config.engine.command_channel_capacity);
    let (ui_tx, mut ui_rx) = mpsc::channel(config.engine.event_channel_capacity);

    // 4. Build REST client and connection manager
    let api = Arc::new(ApiClient::new(
        config.server.api_url.clone(),
        config.auth.token.clone(),
        config.auth.dev_user_id.clone(),
    ));
    let connector = Box::new(WsConnector::new(config.server.ws_url.clone()));
    let conn = ConnectionManager::new(
        connector,
        config.auth.clone(),
        config.reconnect.clone(),
        event_tx,
    );

    // 5. Spawn the sync engine task
    let engine = SyncEngine::new(&config, conn, api, ui_tx);
    let engine_handle = tokio::spawn(async move {
        if let Err(e) = engine.run(event_rx, cmd_rx).await {
            error!("Sync engine error: {}", e);
        }
    });

    // 6. Queue joins for the configured watch list
    for auction_id in &config.watch.auction_ids {
        cmd_tx
            .send(EngineCommand::JoinAuction {
                auction_id: auction_id.clone(),
            })
            .await
            .context("engine stopped before startup joins completed")?;
    }

    // 7. Consume UI updates until Ctrl+C
    info!("Auction monitor ready");
    loop {
        tokio::select! {
            update = ui_rx.recv() => {
                match update {
                    Some(update) => log_update(update),
                    None => {
                        warn!("UI update stream closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                let _ = cmd_tx.send(EngineCommand::Shutdown).await;
                break;
            }
        }
    }

    // 8. Cleanup: wait for the engine task to finish (with timeout)
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = engine_handle.await;
    })
    .await;

    info!("Auction monitor shut down cleanly");
    Ok(())
}

fn log_update(update: UiUpdate) {
    match update {
        UiUpdate::ConnectionStatus(status) => info!("connection: {:?}", status),
        UiUpdate::Notice { class, text } => match class {
            NoticeClass::Error => error!("{}", text),
            NoticeClass::Warning => warn!("{}", text),
            NoticeClass::Info => info!("{}", text),
        },
        UiUpdate::Pulse(_) => {}
        UiUpdate::AuctionChanged { auction_id } => info!("auction {} updated", auction_id),
        UiUpdate::TimerTick {
            auction_id,
            seconds_remaining,
        } => {
            // One line per tick is too chatty even for a log follower.
            if seconds_remaining <= 10 || seconds_remaining % 60 == 0 {
                info!("auction {}: {}s remaining", auction_id, seconds_remaining);
            }
        }
        UiUpdate::WinnerCelebration { auction_id } => {
            info!("you won auction {}!", auction_id)
        }
        UiUpdate::BalanceChanged { stars, ton } => {
            info!("balance: {} stars, {} TON", stars, ton)
        }
        UiUpdate::LeaderboardChanged { board } => info!("leaderboard {} updated", board),
        UiUpdate::AutoBidChanged { auction_id } => {
            info!("auto-bid state changed for auction {}", auction_id)
        }
    }
}

/// Initialize tracing to log to a file (not the terminal, which carries the
/// update feed).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("bidwatch.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("auction_sync=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
