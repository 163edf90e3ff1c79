// Sync engine: the single event loop that owns all client state.
//
// Multiplexes the socket event stream, user commands, background REST
// task results, the local timer tick, and the auto-bid poll sweep over
// one `tokio::select!` loop. Every reconciliation handler runs to
// completion before the next queued event is processed, so no two
// handlers for the same store ever interleave mid-mutation. Background
// REST work (bid placement, auction seeding, auto-bid refresh) runs in
// spawned tasks that report back through an internal task-result channel;
// nothing blocks the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, AuctionDetail, AutoBidStatus, BidResponse};
use crate::autobid::{self, AutoBidCache, AutoBidState};
use crate::config::Config;
use crate::connection::{ConnEvent, ConnectionManager};
use crate::optimistic::BidCoordinator;
use crate::protocol::{ClientCommand, ConnectionStatus, NoticeClass, UiUpdate};
use crate::reconcile::{self, Effect};
use crate::store::wallet::Ticket;
use crate::store::AuctionStore;
use crate::timer::TimerEngine;

// ---------------------------------------------------------------------------
// Commands and task results
// ---------------------------------------------------------------------------

/// Commands the UI (or the monitor binary) issues to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    JoinAuction { auction_id: String },
    LeaveAuction { auction_id: String },
    PlaceBid { auction_id: String, amount: u64 },
    SetupAutoBid { auction_id: String, max_amount: u64 },
    CancelAutoBid { auction_id: String },
    SubscribeLeaderboard { board: String },
    UnsubscribeLeaderboard { board: String },
    /// Re-arm the connection after the retry budget was exhausted.
    RetryConnection,
    Shutdown,
}

/// Results reported back by spawned REST tasks.
#[derive(Debug)]
enum TaskResult {
    AuctionSeeded {
        auction_id: String,
        result: Result<AuctionDetail, ApiError>,
    },
    BidResolved {
        ticket: Ticket,
        auction_id: String,
        result: Result<BidResponse, ApiError>,
    },
    AutoBidFetched {
        auction_id: String,
        result: Result<AutoBidStatus, ApiError>,
    },
    AutoBidSetup {
        auction_id: String,
        result: Result<AutoBidStatus, ApiError>,
    },
    AutoBidCancelled {
        auction_id: String,
        result: Result<AutoBidStatus, ApiError>,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: AuctionStore,
    timers: TimerEngine,
    coordinator: BidCoordinator,
    autobid: AutoBidCache,
    api: Arc<ApiClient>,
    conn: ConnectionManager,
    ui_tx: mpsc::Sender<UiUpdate>,
    task_tx: mpsc::Sender<TaskResult>,
    /// Taken by `run`; present only before the loop starts.
    task_rx: Option<mpsc::Receiver<TaskResult>>,
    tick_interval: Duration,
    poll_interval: Duration,
    connection_status: ConnectionStatus,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        conn: ConnectionManager,
        api: Arc<ApiClient>,
        ui_tx: mpsc::Sender<UiUpdate>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel(config.engine.event_channel_capacity);
        SyncEngine {
            store: AuctionStore::new(),
            timers: TimerEngine::new(),
            coordinator: BidCoordinator::new(),
            autobid: AutoBidCache::new(config.autobid.status_ttl_secs),
            api,
            conn,
            ui_tx,
            task_tx,
            task_rx: Some(task_rx),
            tick_interval: Duration::from_millis(config.engine.tick_ms),
            poll_interval: Duration::from_secs(config.autobid.poll_interval_secs),
            connection_status: ConnectionStatus::Connecting,
        }
    }

    pub fn store(&self) -> &AuctionStore {
        &self.store
    }

    /// Run the engine event loop until shutdown.
    pub async fn run(
        mut self,
        mut conn_rx: mpsc::Receiver<ConnEvent>,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
    ) -> anyhow::Result<()> {
        info!("sync engine started");
        let mut task_rx = match self.task_rx.take() {
            Some(rx) => rx,
            None => anyhow::bail!("engine event loop started twice"),
        };
        self.conn.connect();

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.tick().await;
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.tick().await;

        loop {
            tokio::select! {
                conn_event = conn_rx.recv() => {
                    match conn_event {
                        Some(event) => self.handle_conn_event(event).await,
                        None => {
                            info!("connection channel closed, shutting down");
                            break;
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Shutdown) | None => {
                            info!("shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                task = task_rx.recv() => {
                    // The engine holds its own task_tx, so this arm never
                    // yields None while the loop runs.
                    if let Some(task) = task {
                        self.handle_task_result(task).await;
                    }
                }

                _ = tick.tick() => self.handle_tick().await,

                _ = poll.tick() => self.poll_autobid_statuses(),
            }
        }

        self.conn.shutdown().await;
        info!("sync engine exiting");
        Ok(())
    }

    // -- connection events -------------------------------------------------

    async fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Up => {
                self.set_status(ConnectionStatus::Connecting).await;
            }
            ConnEvent::Authenticated { user_id } => {
                self.store.set_local_user(user_id);
                self.set_status(ConnectionStatus::Connected).await;
            }
            ConnEvent::AuthFailed { message } => {
                self.set_status(ConnectionStatus::Disconnected).await;
                self.notify(NoticeClass::Error, format!("Authentication failed: {message}"))
                    .await;
            }
            ConnEvent::Down { reason } => {
                debug!(%reason, "connection lost");
                self.set_status(ConnectionStatus::Disconnected).await;
            }
            ConnEvent::GaveUp => {
                self.set_status(ConnectionStatus::GaveUp).await;
                self.notify(
                    NoticeClass::Error,
                    "Connection lost; tap retry to reconnect".to_string(),
                )
                .await;
            }
            ConnEvent::Event(event) => {
                let effects = reconcile::apply_event(
                    &mut self.store,
                    &mut self.timers,
                    &mut self.autobid,
                    &mut self.coordinator,
                    event,
                    Utc::now(),
                );
                self.execute_effects(effects).await;
            }
        }
    }

    async fn execute_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notice { class, text } => self.notify(class, text).await,
                Effect::Pulse(intensity) => {
                    let _ = self.ui_tx.send(UiUpdate::Pulse(intensity)).await;
                }
                Effect::AuctionChanged { auction_id } => {
                    let _ = self
                        .ui_tx
                        .send(UiUpdate::AuctionChanged { auction_id })
                        .await;
                }
                Effect::TimerChanged { auction_id } => {
                    if let Some(seconds_remaining) =
                        self.timers.seconds_remaining(&auction_id, Utc::now())
                    {
                        let _ = self
                            .ui_tx
                            .send(UiUpdate::TimerTick {
                                auction_id,
                                seconds_remaining,
                            })
                            .await;
                    }
                }
                Effect::BalanceChanged => self.push_balance().await,
                Effect::LeaderboardChanged { board } => {
                    let _ = self
                        .ui_tx
                        .send(UiUpdate::LeaderboardChanged { board })
                        .await;
                }
                Effect::AutoBidChanged { auction_id } => {
                    let _ = self
                        .ui_tx
                        .send(UiUpdate::AutoBidChanged { auction_id })
                        .await;
                }
                Effect::RefreshAutoBid { auction_id } => {
                    self.spawn_autobid_fetch(auction_id);
                }
                Effect::WinnerCelebration { auction_id } => {
                    let _ = self
                        .ui_tx
                        .send(UiUpdate::WinnerCelebration { auction_id })
                        .await;
                }
            }
        }
    }

    // -- commands ----------------------------------------------------------

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::JoinAuction { auction_id } => {
                self.conn.join_auction(&auction_id);
                // Seed the store and timer over REST before events stream in.
                let api = self.api.clone();
                let task_tx = self.task_tx.clone();
                tokio::spawn(async move {
                    let result = api.fetch_auction(&auction_id).await;
                    let _ = task_tx
                        .send(TaskResult::AuctionSeeded { auction_id, result })
                        .await;
                });
            }

            EngineCommand::LeaveAuction { auction_id } => {
                self.conn.leave_auction(&auction_id);
                self.timers.untrack(&auction_id);
                self.autobid.remove(&auction_id);
                if self.store.remove_auction(&auction_id) {
                    let _ = self
                        .ui_tx
                        .send(UiUpdate::AuctionChanged { auction_id })
                        .await;
                }
            }

            EngineCommand::PlaceBid { auction_id, amount } => {
                match self
                    .coordinator
                    .place(&mut self.store, &auction_id, amount, Utc::now())
                {
                    Ok(ticket) => {
                        let _ = self
                            .ui_tx
                            .send(UiUpdate::AuctionChanged {
                                auction_id: auction_id.clone(),
                            })
                            .await;
                        self.push_balance().await;

                        let api = self.api.clone();
                        let task_tx = self.task_tx.clone();
                        tokio::spawn(async move {
                            let result = api.place_bid(&auction_id, amount).await;
                            let _ = task_tx
                                .send(TaskResult::BidResolved {
                                    ticket,
                                    auction_id,
                                    result,
                                })
                                .await;
                        });
                    }
                    Err(e) => {
                        self.notify(NoticeClass::Error, e.to_string()).await;
                    }
                }
            }

            EngineCommand::SetupAutoBid {
                auction_id,
                max_amount,
            } => {
                let current_price = self
                    .store
                    .auction(&auction_id)
                    .map(|a| a.current_price)
                    .unwrap_or(0);
                let balance = self.store.wallet.displayed_stars();
                if let Err(e) = autobid::precheck_setup(max_amount, current_price, balance) {
                    self.notify(NoticeClass::Error, e.to_string()).await;
                    return;
                }
                let api = self.api.clone();
                let task_tx = self.task_tx.clone();
                tokio::spawn(async move {
                    let result = api.setup_autobid(&auction_id, max_amount).await;
                    let _ = task_tx
                        .send(TaskResult::AutoBidSetup { auction_id, result })
                        .await;
                });
            }

            EngineCommand::CancelAutoBid { auction_id } => {
                let api = self.api.clone();
                let task_tx = self.task_tx.clone();
                tokio::spawn(async move {
                    let result = api.cancel_autobid(&auction_id).await;
                    let _ = task_tx
                        .send(TaskResult::AutoBidCancelled { auction_id, result })
                        .await;
                });
            }

            EngineCommand::SubscribeLeaderboard { board } => {
                self.conn.send(ClientCommand::SubscribeLeaderboard { board });
            }

            EngineCommand::UnsubscribeLeaderboard { board } => {
                self.conn
                    .send(ClientCommand::UnsubscribeLeaderboard { board });
            }

            EngineCommand::RetryConnection => {
                self.set_status(ConnectionStatus::Connecting).await;
                self.conn.reconnect();
            }

            // Shutdown is intercepted by the run loop before dispatch.
            EngineCommand::Shutdown => {}
        }
    }

    // -- task results ------------------------------------------------------

    async fn handle_task_result(&mut self, task: TaskResult) {
        match task {
            TaskResult::AuctionSeeded { auction_id, result } => match result {
                Ok(detail) => {
                    self.timers.track(&auction_id, detail.end_time);
                    self.store.seed_auction(detail.into());
                    let _ = self
                        .ui_tx
                        .send(UiUpdate::AuctionChanged { auction_id })
                        .await;
                }
                Err(e) => {
                    warn!(%auction_id, "auction seed failed: {e}");
                    self.notify(
                        NoticeClass::Error,
                        format!("Could not load auction: {e}"),
                    )
                    .await;
                }
            },

            TaskResult::BidResolved {
                ticket,
                auction_id,
                result,
            } => {
                match result {
                    Ok(response) => {
                        self.coordinator.confirm(
                            &mut self.store,
                            ticket,
                            response.bid_id,
                            response.new_price,
                            response.new_balance,
                        );
                    }
                    Err(e) => {
                        // The request failed outright; no event will follow
                        // to fix the display, so roll back here. Mutations
                        // are never auto-retried.
                        self.coordinator.rollback(&mut self.store, ticket);
                        let reason = match e {
                            ApiError::Rejected { reason } => reason,
                            other => other.to_string(),
                        };
                        self.notify(NoticeClass::Error, format!("Bid failed: {reason}"))
                            .await;
                    }
                }
                let _ = self
                    .ui_tx
                    .send(UiUpdate::AuctionChanged { auction_id })
                    .await;
                self.push_balance().await;
            }

            TaskResult::AutoBidFetched { auction_id, result } => match result {
                Ok(status) => {
                    self.adopt_autobid_status(&auction_id, status).await;
                }
                Err(e) => {
                    // Background refresh; the stale entry stays and the
                    // next sweep retries.
                    warn!(%auction_id, "auto-bid status fetch failed: {e}");
                }
            },

            TaskResult::AutoBidSetup { auction_id, result } => match result {
                Ok(status) => {
                    self.adopt_autobid_status(&auction_id, status).await;
                    self.autobid.invalidate(&auction_id, Utc::now());
                    self.notify(NoticeClass::Info, "Auto-bid armed".to_string())
                        .await;
                }
                Err(e) => {
                    // Automation failures go to the alert channel; cached
                    // state is left unchanged.
                    self.notify(NoticeClass::Error, format!("Auto-bid setup failed: {e}"))
                        .await;
                }
            },

            TaskResult::AutoBidCancelled { auction_id, result } => match result {
                Ok(_) => {
                    self.autobid
                        .store(&auction_id, AutoBidState::Idle, Utc::now());
                    self.autobid.invalidate(&auction_id, Utc::now());
                    self.store.views.bump_active_autobids();
                    let _ = self
                        .ui_tx
                        .send(UiUpdate::AutoBidChanged { auction_id })
                        .await;
                    self.notify(NoticeClass::Info, "Auto-bid cancelled".to_string())
                        .await;
                }
                Err(e) => {
                    self.notify(NoticeClass::Error, format!("Auto-bid cancel failed: {e}"))
                        .await;
                }
            },
        }
    }

    async fn adopt_autobid_status(&mut self, auction_id: &str, status: AutoBidStatus) {
        self.autobid
            .store(auction_id, AutoBidState::from(status), Utc::now());
        let _ = self
            .ui_tx
            .send(UiUpdate::AutoBidChanged {
                auction_id: auction_id.to_string(),
            })
            .await;
    }

    // -- periodic work -----------------------------------------------------

    async fn handle_tick(&mut self) {
        let now = Utc::now();
        let completed = self.timers.tick(now);
        for auction_id in completed {
            // Zero-crossing completion effect; the authoritative ended
            // transition still arrives as an auction:ended event.
            let _ = self
                .ui_tx
                .send(UiUpdate::TimerTick {
                    auction_id: auction_id.clone(),
                    seconds_remaining: 0,
                })
                .await;
            let _ = self
                .ui_tx
                .send(UiUpdate::AuctionChanged { auction_id })
                .await;
        }

        let ids: Vec<String> = self.store.auction_ids().map(|s| s.to_string()).collect();
        for auction_id in ids {
            if let Some(seconds_remaining) = self.timers.seconds_remaining(&auction_id, now) {
                if seconds_remaining > 0 {
                    let _ = self
                        .ui_tx
                        .send(UiUpdate::TimerTick {
                            auction_id,
                            seconds_remaining,
                        })
                        .await;
                }
            }
        }
    }

    fn poll_autobid_statuses(&mut self) {
        let joined = self.conn.joined_auctions();
        let due = self
            .autobid
            .due_for_refresh(joined.iter().map(|s| s.as_str()), Utc::now());
        for auction_id in due {
            self.spawn_autobid_fetch(auction_id);
        }
    }

    fn spawn_autobid_fetch(&self, auction_id: String) {
        let api = self.api.clone();
        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let result = api.autobid_status(&auction_id).await;
            let _ = task_tx
                .send(TaskResult::AutoBidFetched { auction_id, result })
                .await;
        });
    }

    // -- helpers -----------------------------------------------------------

    async fn set_status(&mut self, status: ConnectionStatus) {
        if self.connection_status != status {
            info!(?status, "connection status changed");
            self.connection_status = status.clone();
            let _ = self.ui_tx.send(UiUpdate::ConnectionStatus(status)).await;
        }
    }

    async fn notify(&mut self, class: NoticeClass, text: String) {
        let _ = self.ui_tx.send(UiUpdate::Notice { class, text }).await;
    }

    async fn push_balance(&mut self) {
        let _ = self
            .ui_tx
            .send(UiUpdate::BalanceChanged {
                stars: self.store.wallet.displayed_stars(),
                ton: self.store.wallet.displayed_ton(),
            })
            .await;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, ReconnectConfig};
    use crate::connection::{ConnError, Connector, Transport};
    use crate::protocol::ServerEvent;
    use async_trait::async_trait;

    /// Connector whose transports authenticate and then stay silent.
    struct QuietConnector;

    struct QuietTransport {
        sent_auth_ok: bool,
    }

    #[async_trait]
    impl Transport for QuietTransport {
        async fn send(&mut self, _text: String) -> Result<(), ConnError> {
            Ok(())
        }
        async fn recv(&mut self) -> Option<Result<String, ConnError>> {
            if !self.sent_auth_ok {
                self.sent_auth_ok = true;
                return Some(Ok(r#"{"type":"auth:ok","userId":"me"}"#.to_string()));
            }
            std::future::pending().await
        }
        async fn close(&mut self) {}
    }

    #[async_trait]
    impl Connector for QuietConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>, ConnError> {
            Ok(Box::new(QuietTransport {
                sent_auth_ok: false,
            }))
        }
    }

    fn make_engine(ui_tx: mpsc::Sender<UiUpdate>) -> (SyncEngine, mpsc::Sender<crate::connection::ConnEvent>) {
        let config = test_config();
        let (event_tx, _event_rx) = mpsc::channel(64);
        let conn = ConnectionManager::new(
            Box::new(QuietConnector),
            AuthConfig {
                token: "tok".into(),
                dev_user_id: None,
            },
            ReconnectConfig::default(),
            event_tx.clone(),
        );
        // Point at a closed port; unit tests never await the spawned calls.
        let api = Arc::new(ApiClient::new(
            "http://127.0.0.1:9".into(),
            "tok".into(),
            None,
        ));
        (SyncEngine::new(&config, conn, api, ui_tx), event_tx)
    }

    fn test_config() -> Config {
        toml::from_str(
            r#"
[server]
ws_url = "ws://127.0.0.1:9/ws"
api_url = "http://127.0.0.1:9"

[auth]
token = "tok"
"#,
        )
        .unwrap()
    }

    async fn drain_updates(rx: &mut mpsc::Receiver<UiUpdate>) -> Vec<UiUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn reconciled_event_effects_reach_the_ui_stream() {
        let (ui_tx, mut ui_rx) = mpsc::channel(64);
        let (mut engine, _event_tx) = make_engine(ui_tx);

        engine
            .handle_conn_event(ConnEvent::Authenticated {
                user_id: "me".into(),
            })
            .await;
        engine
            .handle_conn_event(ConnEvent::Event(ServerEvent::ServerError {
                message: "boom".into(),
            }))
            .await;

        let updates = drain_updates(&mut ui_rx).await;
        assert!(updates.contains(&UiUpdate::ConnectionStatus(ConnectionStatus::Connected)));
        assert!(updates.iter().any(|u| matches!(
            u,
            UiUpdate::Notice { class: NoticeClass::Error, text } if text.contains("boom")
        )));
    }

    #[tokio::test]
    async fn place_bid_precondition_failure_is_surfaced_not_leaked() {
        let (ui_tx, mut ui_rx) = mpsc::channel(64);
        let (mut engine, _event_tx) = make_engine(ui_tx);

        // No auction in the store yet.
        engine
            .handle_command(EngineCommand::PlaceBid {
                auction_id: "ghost".into(),
                amount: 100,
            })
            .await;

        let updates = drain_updates(&mut ui_rx).await;
        assert!(updates.iter().any(|u| matches!(
            u,
            UiUpdate::Notice { class: NoticeClass::Error, .. }
        )));
        assert_eq!(engine.store.wallet.held_stars(), 0);
    }

    #[tokio::test]
    async fn autobid_setup_precheck_rejects_before_any_request() {
        let (ui_tx, mut ui_rx) = mpsc::channel(64);
        let (mut engine, _event_tx) = make_engine(ui_tx);
        engine.store.wallet.adopt_confirmed(100, 0.0);

        engine
            .handle_command(EngineCommand::SetupAutoBid {
                auction_id: "a1".into(),
                max_amount: 500,
            })
            .await;

        let updates = drain_updates(&mut ui_rx).await;
        assert!(updates.iter().any(|u| matches!(
            u,
            UiUpdate::Notice { class: NoticeClass::Error, text } if text.contains("balance")
        )));
    }

    #[tokio::test]
    async fn leave_auction_releases_per_view_state() {
        let (ui_tx, mut ui_rx) = mpsc::channel(64);
        let (mut engine, _event_tx) = make_engine(ui_tx);

        engine
            .store
            .seed_auction(crate::store::tests::make_auction("a1", 100));
        engine.timers.track("a1", Utc::now());
        engine
            .autobid
            .store("a1", AutoBidState::Idle, Utc::now());

        engine
            .handle_command(EngineCommand::LeaveAuction {
                auction_id: "a1".into(),
            })
            .await;

        assert!(engine.store.auction("a1").is_none());
        assert_eq!(engine.timers.phase("a1"), None);
        let updates = drain_updates(&mut ui_rx).await;
        assert!(updates.contains(&UiUpdate::AuctionChanged {
            auction_id: "a1".into()
        }));
    }
}
