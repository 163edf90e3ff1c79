// Optimistic bid coordinator.
//
// A bid intent is reflected in the store synchronously, before the REST
// round-trip resolves: a synthetic bid (negative id) enters the history,
// the price and bid total advance, and a wallet hold covers the amount.
// Each application is keyed by a ticket holding the rollback snapshot.
//
// Convergence is idempotent in both arrival orders: a socket `bid:placed`
// carrying the same bid may land before or after the REST response, and
// either way the bid is counted once and the hold settles once. A REST
// failure rolls back price, history, bid total, and the hold in full --
// no later socket event is relied on to repair a bid the server refused.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::protocol::AuctionStatus;
use crate::store::wallet::Ticket;
use crate::store::{AuctionStore, Bid};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BidError {
    #[error("auction {auction_id} is not known to the client")]
    UnknownAuction { auction_id: String },

    #[error("auction {auction_id} is not active")]
    NotActive { auction_id: String },

    #[error("bid {amount} does not beat the current price {current_price}")]
    AmountTooLow { amount: u64, current_price: u64 },

    #[error("bid {amount} exceeds your balance {balance}")]
    InsufficientBalance { amount: u64, balance: u64 },

    /// Business-rule rejection reported by the server.
    #[error("bid rejected: {reason}")]
    Rejected { reason: String },

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    current_price: u64,
}

#[derive(Debug)]
struct PendingBid {
    auction_id: String,
    amount: u64,
    synthetic_bid_id: i64,
    /// Set once a socket `bid:placed` confirmed this bid; the id is the
    /// server-assigned one.
    confirmed_bid_id: Option<i64>,
    snapshot: Snapshot,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct BidCoordinator {
    next_ticket: u64,
    next_synthetic_id: i64,
    pending: HashMap<Ticket, PendingBid>,
}

impl BidCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Apply a bid optimistically. Preconditions are advisory pre-checks
    /// mirroring the server's rules; the server remains authoritative.
    pub fn place(
        &mut self,
        store: &mut AuctionStore,
        auction_id: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Ticket, BidError> {
        let auction = store
            .auction(auction_id)
            .ok_or_else(|| BidError::UnknownAuction {
                auction_id: auction_id.to_string(),
            })?;

        if auction.status != AuctionStatus::Active {
            return Err(BidError::NotActive {
                auction_id: auction_id.to_string(),
            });
        }
        if amount <= auction.current_price {
            return Err(BidError::AmountTooLow {
                amount,
                current_price: auction.current_price,
            });
        }
        let balance = store.wallet.displayed_stars();
        if amount > balance {
            return Err(BidError::InsufficientBalance { amount, balance });
        }

        let snapshot = Snapshot {
            current_price: auction.current_price,
        };

        self.next_ticket += 1;
        self.next_synthetic_id -= 1;
        let ticket = Ticket(self.next_ticket);
        let synthetic_id = self.next_synthetic_id;

        let bidder_id = store.local_user_id().unwrap_or("local").to_string();
        let bid = Bid {
            id: synthetic_id,
            bidder_id,
            bidder_name: "You".to_string(),
            amount,
            created_at: now,
            is_auto_bid: false,
        };
        store.apply_bid(auction_id, bid, amount, None);
        store.wallet.place_hold(ticket, amount);

        self.pending.insert(
            ticket,
            PendingBid {
                auction_id: auction_id.to_string(),
                amount,
                synthetic_bid_id: synthetic_id,
                confirmed_bid_id: None,
                snapshot,
            },
        );

        info!(auction_id, amount, ?ticket, "optimistic bid applied");
        Ok(ticket)
    }

    /// Offer an inbound socket bid for adoption. When it matches an
    /// unconfirmed pending bid by the local user (same auction, same
    /// amount), the synthetic entry takes the server id and the event is
    /// treated as confirmation rather than a second bid. Returns `true`
    /// if adopted; the caller then skips its normal apply path.
    pub fn adopt_server_bid(
        &mut self,
        store: &mut AuctionStore,
        auction_id: &str,
        bid_id: i64,
        bidder_id: &str,
        amount: u64,
    ) -> bool {
        if !store.is_local_user(bidder_id) {
            return false;
        }
        let Some((_, pending)) = self.pending.iter_mut().find(|(_, p)| {
            p.auction_id == auction_id && p.amount == amount && p.confirmed_bid_id.is_none()
        }) else {
            return false;
        };

        pending.confirmed_bid_id = Some(bid_id);
        if store.rebind_bid_id(auction_id, pending.synthetic_bid_id, bid_id) {
            debug!(auction_id, bid_id, "socket event adopted as confirmation");
        }
        true
    }

    /// Reconcile a successful REST response with the authoritative price,
    /// bid id, and balance. Idempotent with respect to a socket event that
    /// already confirmed the same bid.
    pub fn confirm(
        &mut self,
        store: &mut AuctionStore,
        ticket: Ticket,
        bid_id: Option<i64>,
        new_price: u64,
        new_balance: Option<u64>,
    ) {
        let Some(pending) = self.pending.remove(&ticket) else {
            warn!(?ticket, "confirm for unknown ticket ignored");
            return;
        };

        // Adopt the server bid id unless the socket path got there first.
        if pending.confirmed_bid_id.is_none() {
            if let Some(id) = bid_id {
                store.rebind_bid_id(&pending.auction_id, pending.synthetic_bid_id, id);
            }
        }

        if let Some(auction) = store.auction_mut(&pending.auction_id) {
            auction.current_price = auction.current_price.max(new_price);
        }
        store.wallet.settle_hold(ticket, new_balance);
        store.views.bump_detail(&pending.auction_id);
        info!(auction_id = %pending.auction_id, ?ticket, "bid confirmed");
    }

    /// Roll back a rejected bid in full: the synthetic entry leaves the
    /// history, the bid total steps back, the price is recomputed from the
    /// surviving newest bid (so concurrent server-asserted bids are never
    /// clobbered), and the wallet hold is released.
    pub fn rollback(&mut self, store: &mut AuctionStore, ticket: Ticket) {
        let Some(pending) = self.pending.remove(&ticket) else {
            warn!(?ticket, "rollback for unknown ticket ignored");
            return;
        };

        store.wallet.release_hold(ticket);

        if pending.confirmed_bid_id.is_some() {
            // The server asserted this bid over the socket, so the REST
            // failure is moot; keep the confirmed state.
            warn!(
                auction_id = %pending.auction_id,
                "rollback after socket confirmation, keeping confirmed bid"
            );
            return;
        }

        let removed = store
            .remove_bid(&pending.auction_id, pending.synthetic_bid_id)
            .is_some();
        if let Some(auction) = store.auction_mut(&pending.auction_id) {
            if removed {
                auction.total_bids = auction.total_bids.saturating_sub(1);
            }
            let surviving_top = auction.bids.first().map(|b| b.amount).unwrap_or(0);
            auction.current_price = pending.snapshot.current_price.max(surviving_top);
        }
        store.views.bump_list();
        info!(auction_id = %pending.auction_id, ?ticket, "optimistic bid rolled back");
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
