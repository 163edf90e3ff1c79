// Event reconciler: one exhaustive match over the closed event union.
//
// Every handler is a deterministic transform of (state, payload) that
// mutates the store/timer/cache and returns side-effect descriptions for
// the engine to execute; no handler performs I/O. Handlers are idempotent
// so duplicate or out-of-order delivery degrades gracefully, and a
// malformed or unknown-auction event never halts processing or corrupts
// other auctions' state.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::autobid::{AutoBidCache, AutoBidState};
use crate::optimistic::BidCoordinator;
use crate::protocol::{NoticeClass, PulseIntensity, ServerEvent};
use crate::store::{AuctionStore, BidApplied};
use crate::timer::{SyncOutcome, TimerEngine};

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Side effects a handler requests. The engine translates these into UI
/// updates, celebration hand-off, and background refresh tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Notice { class: NoticeClass, text: String },
    Pulse(PulseIntensity),
    AuctionChanged { auction_id: String },
    TimerChanged { auction_id: String },
    BalanceChanged,
    LeaderboardChanged { board: String },
    AutoBidChanged { auction_id: String },
    /// Ask the engine to refetch this auction's auto-bid status.
    RefreshAutoBid { auction_id: String },
    /// The local user won; hand off to the celebration workflow.
    WinnerCelebration { auction_id: String },
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Reconcile one inbound event against client state.
pub fn apply_event(
    store: &mut AuctionStore,
    timers: &mut TimerEngine,
    autobid: &mut AutoBidCache,
    coordinator: &mut BidCoordinator,
    event: ServerEvent,
    now: DateTime<Utc>,
) -> Vec<Effect> {
    let mut effects = Vec::new();

    match event {
        ServerEvent::AuthOk { user_id } => {
            store.set_local_user(user_id);
        }

        ServerEvent::AuthError { message } => {
            effects.push(Effect::Notice {
                class: NoticeClass::Error,
                text: format!("Authentication failed: {message}"),
            });
        }

        ServerEvent::BidPlaced {
            auction_id,
            bid,
            new_price,
            total_bids,
            outbid,
        } => {
            let bid_id = bid.id;
            let bidder_id = bid.bidder_id.clone();
            let bidder_name = bid.bidder_name.clone();
            let amount = bid.amount;

            // Bundled refund notice: the new bid outbid the local user.
            // Dedup key is the superseding bid's id, shared with the
            // standalone `bid:outbid` path so the refund credits once no
            // matter which frame arrives (or if both do). The refund does
            // not depend on the auction being known to the client.
            if let Some(outbid) = outbid {
                if store.is_local_user(&outbid.outbid_user_id)
                    && store.credit_refund_once(bid_id, outbid.outbid_amount)
                {
                    effects.push(Effect::BalanceChanged);
                }
            }

            // A bid we placed optimistically comes back as confirmation,
            // not as a second bid.
            let adopted =
                coordinator.adopt_server_bid(store, &auction_id, bid_id, &bidder_id, amount);
            if adopted {
                effects.push(Effect::AuctionChanged {
                    auction_id: auction_id.clone(),
                });
            } else {
                match store.apply_bid(&auction_id, bid.into(), new_price, total_bids) {
                    BidApplied::Applied => {
                        effects.push(Effect::AuctionChanged {
                            auction_id: auction_id.clone(),
                        });
                        if !store.is_local_user(&bidder_id) {
                            effects.push(Effect::Notice {
                                class: NoticeClass::Info,
                                text: format!("{bidder_name} bid {amount} stars"),
                            });
                        }
                    }
                    BidApplied::Duplicate => {}
                    BidApplied::UnknownAuction => {
                        warn!(auction_id, bid_id, "bid for unknown auction dropped");
                    }
                }
            }
        }

        ServerEvent::Outbid {
            auction_id,
            outbid_user_id,
            outbid_amount,
            superseding_bid_id,
        } => {
            if !store.is_local_user(&outbid_user_id) {
                debug!(auction_id, "outbid event for another user ignored");
                return effects;
            }
            // Duplicate delivery must be fully silent: the notification and
            // cache invalidation follow the refund's exactly-once gate.
            if store.credit_refund_once(superseding_bid_id, outbid_amount) {
                effects.push(Effect::BalanceChanged);
                effects.push(Effect::Notice {
                    class: NoticeClass::Warning,
                    text: format!("You were outbid; {outbid_amount} stars refunded"),
                });
                autobid.invalidate(&auction_id, now);
                effects.push(Effect::AutoBidChanged { auction_id });
            } else {
                debug!(auction_id, superseding_bid_id, "duplicate outbid frame ignored");
            }
        }

        ServerEvent::AuctionExtended {
            auction_id,
            end_time,
        } => {
            if store.extend_end_time(&auction_id, end_time) {
                timers.record_extension(&auction_id, end_time);
                effects.push(Effect::Pulse(PulseIntensity::Medium));
                effects.push(Effect::TimerChanged { auction_id });
            }
        }

        ServerEvent::TimerSync {
            auction_id,
            seconds_remaining,
            extended,
        } => match timers.apply_sync(&auction_id, seconds_remaining, extended) {
            SyncOutcome::Accepted => {
                if extended {
                    effects.push(Effect::Pulse(PulseIntensity::Light));
                }
                effects.push(Effect::TimerChanged { auction_id });
            }
            SyncOutcome::RejectedStale => {
                debug!(auction_id, seconds_remaining, "stale sync rejected");
            }
            SyncOutcome::AlreadyEnded | SyncOutcome::Untracked => {}
        },

        ServerEvent::AuctionStarted { auction_id } => {
            if store.mark_started(&auction_id) {
                let name = store
                    .auction(&auction_id)
                    .map(|a| a.gift_name.clone())
                    .unwrap_or_else(|| auction_id.clone());
                effects.push(Effect::Notice {
                    class: NoticeClass::Info,
                    text: format!("Auction for {name} started"),
                });
                effects.push(Effect::AuctionChanged { auction_id });
            }
        }

        ServerEvent::AuctionEnded {
            auction_id,
            winner_id,
            winner_name,
            final_price,
        } => {
            let first = store.mark_ended(&auction_id, final_price, winner_name.clone());
            timers.end(&auction_id);
            if first {
                let label = winner_name.unwrap_or_else(|| "someone".to_string());
                effects.push(Effect::Notice {
                    class: NoticeClass::Info,
                    text: format!("Auction ended at {final_price} stars, won by {label}"),
                });
                if winner_id
                    .as_deref()
                    .is_some_and(|id| store.is_local_user(id))
                {
                    effects.push(Effect::WinnerCelebration {
                        auction_id: auction_id.clone(),
                    });
                }
                effects.push(Effect::AuctionChanged { auction_id });
            }
        }

        ServerEvent::AuctionUpdate { auction_id, patch } => {
            let end_time = patch.end_time;
            if store.merge_patch(&auction_id, patch) {
                if let Some(end_time) = end_time {
                    timers.track(&auction_id, end_time);
                }
                effects.push(Effect::AuctionChanged { auction_id });
            } else {
                warn!(auction_id, "update for unknown auction dropped");
            }
        }

        ServerEvent::LeaderboardUpdate { board, entries } => {
            store.replace_leaderboard(board.clone(), entries);
            effects.push(Effect::LeaderboardChanged { board });
        }

        ServerEvent::BalanceUpdate {
            balance,
            ton_balance,
        } => {
            // Absolute snapshot becomes the confirmed component; pending
            // optimistic holds stay subtracted from the displayed total.
            store.wallet.adopt_confirmed(balance, ton_balance);
            effects.push(Effect::BalanceChanged);
        }

        ServerEvent::AutoBidTriggered {
            auction_id,
            amount,
            max_amount,
            bid_count,
        } => {
            autobid.store(
                &auction_id,
                AutoBidState::Active {
                    max_amount,
                    current_bid: amount,
                    bid_count,
                },
                now,
            );
            autobid.invalidate(&auction_id, now);
            effects.push(Effect::Notice {
                class: NoticeClass::Info,
                text: format!(
                    "Auto-bid placed {amount} stars ({} of max {max_amount} left, bid #{bid_count})",
                    max_amount.saturating_sub(amount)
                ),
            });
            effects.push(Effect::RefreshAutoBid {
                auction_id: auction_id.clone(),
            });
            store.views.bump_detail(&auction_id);
            effects.push(Effect::AuctionChanged { auction_id });
        }

        ServerEvent::AutoBidStopped { auction_id, reason } => {
            autobid.store(&auction_id, AutoBidState::Stopped(reason), now);
            autobid.invalidate(&auction_id, now);
            store.views.bump_active_autobids();
            effects.push(Effect::Notice {
                class: NoticeClass::Warning,
                text: format!("Auto-bid stopped: {}", reason.display_text()),
            });
            effects.push(Effect::AutoBidChanged { auction_id });
        }

        ServerEvent::ServerError { message } => {
            effects.push(Effect::Notice {
                class: NoticeClass::Error,
                text: format!("Server error: {message}"),
            });
        }
    }

    effects
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
