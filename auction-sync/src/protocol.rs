// Wire protocol: the closed union of server-pushed events, the outbound
// client commands, and the UI update stream the engine produces.
//
// Inbound frames are JSON objects tagged by a `type` field (e.g.
// `"bid:placed"`) with camelCase payload fields. Unknown event kinds fail
// deserialization and are dropped at the transport boundary, so every
// variant that reaches the reconciler has a handler by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Every event kind the server can push over the socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Auth handshake accepted; carries the authenticated user's identity.
    #[serde(rename = "auth:ok", rename_all = "camelCase")]
    AuthOk { user_id: String },

    /// Auth handshake rejected. A credential problem, not a transient fault.
    #[serde(rename = "auth:error")]
    AuthError { message: String },

    /// Someone placed a bid on an auction the client has joined.
    #[serde(rename = "bid:placed", rename_all = "camelCase")]
    BidPlaced {
        auction_id: String,
        bid: BidPayload,
        new_price: u64,
        /// Server-side bid total, when provided. May run ahead of the
        /// locally counted total under lossy delivery.
        #[serde(default)]
        total_bids: Option<u64>,
        /// Present when this bid outbid someone and the server bundled the
        /// refund notice into the same frame.
        #[serde(default)]
        outbid: Option<OutbidPayload>,
    },

    /// The local user was outbid; their escrowed amount is refunded.
    #[serde(rename = "bid:outbid", rename_all = "camelCase")]
    Outbid {
        auction_id: String,
        outbid_user_id: String,
        outbid_amount: u64,
        /// Id of the bid that superseded ours. Refund dedup key.
        superseding_bid_id: i64,
    },

    /// Anti-snipe round extension: the auction's end time moved later.
    #[serde(rename = "auction:extended", rename_all = "camelCase")]
    AuctionExtended {
        auction_id: String,
        end_time: DateTime<Utc>,
    },

    /// Server-authoritative countdown push.
    #[serde(rename = "timer:sync", rename_all = "camelCase")]
    TimerSync {
        auction_id: String,
        seconds_remaining: u64,
        #[serde(default)]
        extended: bool,
    },

    #[serde(rename = "auction:started", rename_all = "camelCase")]
    AuctionStarted { auction_id: String },

    #[serde(rename = "auction:ended", rename_all = "camelCase")]
    AuctionEnded {
        auction_id: String,
        #[serde(default)]
        winner_id: Option<String>,
        #[serde(default)]
        winner_name: Option<String>,
        final_price: u64,
    },

    /// Partial-update escape hatch; also the full-resync vehicle.
    #[serde(rename = "auction:update", rename_all = "camelCase")]
    AuctionUpdate {
        auction_id: String,
        #[serde(flatten)]
        patch: AuctionPatch,
    },

    /// Wholesale replacement of one leaderboard (last write wins).
    #[serde(rename = "leaderboard:update", rename_all = "camelCase")]
    LeaderboardUpdate {
        board: String,
        entries: Vec<LeaderboardEntry>,
    },

    /// Absolute wallet snapshot from the server ledger.
    #[serde(rename = "balance:update", rename_all = "camelCase")]
    BalanceUpdate { balance: u64, ton_balance: f64 },

    /// The user's auto-bid agent placed a bid on their behalf.
    #[serde(rename = "autobid:triggered", rename_all = "camelCase")]
    AutoBidTriggered {
        auction_id: String,
        amount: u64,
        max_amount: u64,
        bid_count: u32,
    },

    /// The user's auto-bid agent stopped.
    #[serde(rename = "autobid:stopped", rename_all = "camelCase")]
    AutoBidStopped {
        auction_id: String,
        #[serde(rename = "stoppedReason")]
        reason: StopReason,
    },

    /// Server-side fault report. Never fatal to the connection.
    #[serde(rename = "error")]
    ServerError { message: String },
}

/// A single bid as carried on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidPayload {
    pub id: i64,
    pub bidder_id: String,
    pub bidder_name: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_auto_bid: bool,
}

/// Refund notice piggybacked on a `bid:placed` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutbidPayload {
    pub outbid_user_id: String,
    pub outbid_amount: u64,
}

/// All-optional partial update for an auction record. Absent fields are
/// left untouched by the merge.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionPatch {
    #[serde(default)]
    pub gift_name: Option<String>,
    #[serde(default)]
    pub current_price: Option<u64>,
    #[serde(default)]
    pub increment_amount: Option<u64>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<AuctionStatus>,
    #[serde(default)]
    pub total_bids: Option<u64>,
    #[serde(default)]
    pub winner_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub user_id: String,
    pub user_name: String,
    pub score: u64,
}

/// Why an auto-bid agent stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxReached,
    Outbid,
    AuctionEnded,
    InsufficientBalance,
    Manual,
    None,
}

impl StopReason {
    /// Fixed lookup table mapping stop reasons to display text.
    pub fn display_text(self) -> &'static str {
        match self {
            StopReason::MaxReached => "maximum bid amount reached",
            StopReason::Outbid => "outbid beyond your maximum",
            StopReason::AuctionEnded => "auction ended",
            StopReason::InsufficientBalance => "insufficient balance",
            StopReason::Manual => "cancelled manually",
            StopReason::None => "stopped",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

/// Client-to-server commands sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "auth", rename_all = "camelCase")]
    Auth {
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dev_user_id: Option<String>,
    },

    #[serde(rename = "room:join", rename_all = "camelCase")]
    JoinRoom { auction_id: String },

    #[serde(rename = "room:leave", rename_all = "camelCase")]
    LeaveRoom { auction_id: String },

    /// Socket convenience path for bid placement. The REST path is the
    /// authoritative one; both converge on the same server-side effect.
    #[serde(rename = "bid:place", rename_all = "camelCase")]
    PlaceBid { auction_id: String, amount: u64 },

    #[serde(rename = "leaderboard:subscribe")]
    SubscribeLeaderboard { board: String },

    #[serde(rename = "leaderboard:unsubscribe")]
    UnsubscribeLeaderboard { board: String },
}

// ---------------------------------------------------------------------------
// UI update stream
// ---------------------------------------------------------------------------

/// Severity class for user-facing notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeClass {
    Info,
    Warning,
    Error,
}

/// Intensity of a haptic/visual pulse requested by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseIntensity {
    Light,
    Medium,
}

/// Connection state as surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Retry budget exhausted; requires an explicit user-triggered retry.
    GaveUp,
}

/// Updates the sync engine pushes to the rendering layer. The monitor
/// binary logs these; a real UI would re-render from them.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    ConnectionStatus(ConnectionStatus),
    Notice { class: NoticeClass, text: String },
    Pulse(PulseIntensity),
    /// An auction record (or its derived views) changed.
    AuctionChanged { auction_id: String },
    /// Countdown value for one auction, for timer displays.
    TimerTick {
        auction_id: String,
        seconds_remaining: u64,
    },
    /// The local user won; hand off to the celebration workflow.
    WinnerCelebration { auction_id: String },
    /// Displayed wallet balance changed (confirmed minus pending holds).
    BalanceChanged { stars: u64, ton: f64 },
    LeaderboardChanged { board: String },
    AutoBidChanged { auction_id: String },
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bid_placed_round_trips_from_wire_shape() {
        let frame = json!({
            "type": "bid:placed",
            "auctionId": "a1",
            "bid": {
                "id": 42,
                "bidderId": "u9",
                "bidderName": "Mara",
                "amount": 110,
                "createdAt": "2026-03-01T12:00:00Z",
                "isAutoBid": false
            },
            "newPrice": 110
        });

        let event: ServerEvent = serde_json::from_value(frame).unwrap();
        match event {
            ServerEvent::BidPlaced {
                auction_id,
                bid,
                new_price,
                total_bids,
                outbid,
            } => {
                assert_eq!(auction_id, "a1");
                assert_eq!(bid.id, 42);
                assert_eq!(bid.amount, 110);
                assert_eq!(new_price, 110);
                assert_eq!(total_bids, None);
                assert!(outbid.is_none());
            }
            other => panic!("expected BidPlaced, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_kind_fails_deserialization() {
        let frame = json!({ "type": "mystery:event", "auctionId": "a1" });
        assert!(serde_json::from_value::<ServerEvent>(frame).is_err());
    }

    #[test]
    fn timer_sync_defaults_extended_to_false() {
        let frame = json!({
            "type": "timer:sync",
            "auctionId": "a1",
            "secondsRemaining": 42
        });
        let event: ServerEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(
            event,
            ServerEvent::TimerSync {
                auction_id: "a1".into(),
                seconds_remaining: 42,
                extended: false,
            }
        );
    }

    #[test]
    fn autobid_stopped_parses_snake_case_reason() {
        let frame = json!({
            "type": "autobid:stopped",
            "auctionId": "a1",
            "stoppedReason": "max_reached"
        });
        let event: ServerEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(
            event,
            ServerEvent::AutoBidStopped {
                auction_id: "a1".into(),
                reason: StopReason::MaxReached,
            }
        );
    }

    #[test]
    fn auction_update_flattens_patch_fields() {
        let frame = json!({
            "type": "auction:update",
            "auctionId": "a1",
            "currentPrice": 95,
            "status": "active"
        });
        let event: ServerEvent = serde_json::from_value(frame).unwrap();
        match event {
            ServerEvent::AuctionUpdate { auction_id, patch } => {
                assert_eq!(auction_id, "a1");
                assert_eq!(patch.current_price, Some(95));
                assert_eq!(patch.status, Some(AuctionStatus::Active));
                assert_eq!(patch.end_time, None);
            }
            other => panic!("expected AuctionUpdate, got {other:?}"),
        }
    }

    #[test]
    fn auth_command_omits_missing_dev_user() {
        let cmd = ClientCommand::Auth {
            token: "tok".into(),
            dev_user_id: None,
        };
        let text = serde_json::to_string(&cmd).unwrap();
        assert_eq!(text, r#"{"type":"auth","token":"tok"}"#);
    }

    #[test]
    fn join_room_serializes_camel_case() {
        let cmd = ClientCommand::JoinRoom {
            auction_id: "a1".into(),
        };
        let text = serde_json::to_string(&cmd).unwrap();
        assert_eq!(text, r#"{"type":"room:join","auctionId":"a1"}"#);
    }

    #[test]
    fn stop_reason_lookup_covers_all_variants() {
        let reasons = [
            StopReason::MaxReached,
            StopReason::Outbid,
            StopReason::AuctionEnded,
            StopReason::InsufficientBalance,
            StopReason::Manual,
            StopReason::None,
        ];
        for reason in reasons {
            assert!(!reason.display_text().is_empty());
        }
    }
}
