// Normalized auction store: the single writable source of truth for
// auction state on the client.
//
// Every mutation is an idempotent patch over whatever the store currently
// holds, never a blind snapshot replace, so reconciliation handlers stay
// correct under duplicate and out-of-order delivery. Derived read views
// (list/detail projections) live in `views` and are recomputed from here;
// the wallet keeps the confirmed balance separate from pending holds.

pub mod views;
pub mod wallet;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::protocol::{AuctionPatch, AuctionStatus, BidPayload, LeaderboardEntry};

use views::Views;
use wallet::Wallet;

/// Newest-first bid history is capped at this many entries per auction.
pub const BID_HISTORY_CAP: usize = 50;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One bid as held in the store. Immutable once created. Optimistic bids
/// carry negative synthetic ids until the server id is known.
#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub id: i64,
    pub bidder_id: String,
    pub bidder_name: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
    pub is_auto_bid: bool,
}

impl From<BidPayload> for Bid {
    fn from(p: BidPayload) -> Self {
        Bid {
            id: p.id,
            bidder_id: p.bidder_id,
            bidder_name: p.bidder_name,
            amount: p.amount,
            created_at: p.created_at,
            is_auto_bid: p.is_auto_bid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Auction {
    pub id: String,
    pub gift_name: String,
    pub starting_price: u64,
    pub current_price: u64,
    pub increment_amount: u64,
    pub end_time: DateTime<Utc>,
    pub status: AuctionStatus,
    pub total_bids: u64,
    /// Newest-first by application order, capped at [`BID_HISTORY_CAP`].
    pub bids: Vec<Bid>,
    pub winner_name: Option<String>,
}

impl Auction {
    /// Minimum acceptable next bid.
    pub fn min_next_bid(&self) -> u64 {
        self.current_price + self.increment_amount.max(1)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Outcome of applying a bid to an auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidApplied {
    /// The bid entered the history and the price/total advanced.
    Applied,
    /// A bid with this id was already present; nothing changed.
    Duplicate,
    /// The auction is not in the store; nothing changed.
    UnknownAuction,
}

#[derive(Debug, Default)]
pub struct AuctionStore {
    auctions: HashMap<String, Auction>,
    leaderboards: HashMap<String, Vec<LeaderboardEntry>>,
    /// Refund dedup keys (superseding bid ids) already credited.
    credited_refunds: HashSet<i64>,
    local_user_id: Option<String>,
    pub wallet: Wallet,
    pub views: Views,
}

impl AuctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- identity ----------------------------------------------------------

    pub fn set_local_user(&mut self, user_id: String) {
        self.local_user_id = Some(user_id);
    }

    pub fn local_user_id(&self) -> Option<&str> {
        self.local_user_id.as_deref()
    }

    pub fn is_local_user(&self, user_id: &str) -> bool {
        self.local_user_id.as_deref() == Some(user_id)
    }

    // -- auction lifecycle -------------------------------------------------

    /// Insert or refresh an auction record (REST seeding on room join, or
    /// first reference from an event). Refreshing keeps the larger of the
    /// known and incoming price so a stale seed cannot walk the price back.
    pub fn seed_auction(&mut self, auction: Auction) {
        match self.auctions.get_mut(&auction.id) {
            Some(existing) => {
                let price = existing.current_price.max(auction.current_price);
                let total = existing.total_bids.max(auction.total_bids);
                *existing = auction;
                existing.current_price = price;
                existing.total_bids = total;
            }
            None => {
                self.auctions.insert(auction.id.clone(), auction);
            }
        }
        self.views.bump_list();
    }

    /// Drop an auction and its per-auction bookkeeping (user navigated away).
    pub fn remove_auction(&mut self, auction_id: &str) -> bool {
        let removed = self.auctions.remove(auction_id).is_some();
        if removed {
            self.views.bump_list();
            self.views.drop_detail(auction_id);
        }
        removed
    }

    pub fn auction(&self, auction_id: &str) -> Option<&Auction> {
        self.auctions.get(auction_id)
    }

    pub fn auction_mut(&mut self, auction_id: &str) -> Option<&mut Auction> {
        self.auctions.get_mut(auction_id)
    }

    pub fn auction_ids(&self) -> impl Iterator<Item = &str> {
        self.auctions.keys().map(|s| s.as_str())
    }

    // -- bids --------------------------------------------------------------

    /// Apply a bid to an auction: prepend to the history (cap 50, dedup by
    /// bid id), advance the price monotonically, bump the bid total.
    ///
    /// `server_total`, when present, is adopted if it is larger than the
    /// locally counted total (lossy delivery can skip events).
    pub fn apply_bid(
        &mut self,
        auction_id: &str,
        bid: Bid,
        new_price: u64,
        server_total: Option<u64>,
    ) -> BidApplied {
        let Some(auction) = self.auctions.get_mut(auction_id) else {
            return BidApplied::UnknownAuction;
        };

        if auction.bids.iter().any(|b| b.id == bid.id) {
            debug!(auction_id, bid_id = bid.id, "duplicate bid dropped");
            return BidApplied::Duplicate;
        }

        let amount = bid.amount;
        auction.bids.insert(0, bid);
        auction.bids.truncate(BID_HISTORY_CAP);

        // Replaced, never decremented (full resync goes through merge_patch).
        auction.current_price = auction.current_price.max(new_price).max(amount);
        auction.total_bids += 1;
        if let Some(total) = server_total {
            auction.total_bids = auction.total_bids.max(total);
        }

        self.views.bump_list();
        self.views.bump_detail(auction_id);
        BidApplied::Applied
    }

    /// Remove a bid by id (optimistic rollback). Returns the removed bid.
    pub fn remove_bid(&mut self, auction_id: &str, bid_id: i64) -> Option<Bid> {
        let auction = self.auctions.get_mut(auction_id)?;
        let pos = auction.bids.iter().position(|b| b.id == bid_id)?;
        let bid = auction.bids.remove(pos);
        self.views.bump_list();
        self.views.bump_detail(auction_id);
        Some(bid)
    }

    /// Swap a synthetic optimistic bid id for the server-assigned one,
    /// leaving price and totals untouched.
    pub fn rebind_bid_id(&mut self, auction_id: &str, old_id: i64, new_id: i64) -> bool {
        let Some(auction) = self.auctions.get_mut(auction_id) else {
            return false;
        };
        match auction.bids.iter_mut().find(|b| b.id == old_id) {
            Some(bid) => {
                bid.id = new_id;
                self.views.bump_detail(auction_id);
                true
            }
            None => false,
        }
    }

    // -- transitions -------------------------------------------------------

    /// pending -> active. Idempotent; any other starting state is left
    /// alone (a started event racing an ended one must not resurrect the
    /// auction).
    pub fn mark_started(&mut self, auction_id: &str) -> bool {
        let Some(auction) = self.auctions.get_mut(auction_id) else {
            return false;
        };
        if auction.status != AuctionStatus::Pending {
            return false;
        }
        auction.status = AuctionStatus::Active;
        self.views.bump_list();
        self.views.bump_detail(auction_id);
        true
    }

    /// Terminal transition to completed. Returns `true` only on the first
    /// application so completion side effects fire exactly once.
    pub fn mark_ended(
        &mut self,
        auction_id: &str,
        final_price: u64,
        winner_name: Option<String>,
    ) -> bool {
        let Some(auction) = self.auctions.get_mut(auction_id) else {
            return false;
        };
        if auction.status == AuctionStatus::Completed {
            return false;
        }
        auction.status = AuctionStatus::Completed;
        auction.current_price = auction.current_price.max(final_price);
        if winner_name.is_some() {
            auction.winner_name = winner_name;
        }
        self.views.bump_list();
        self.views.bump_detail(auction_id);
        true
    }

    /// Anti-snipe extension: later end time only.
    pub fn extend_end_time(&mut self, auction_id: &str, end_time: DateTime<Utc>) -> bool {
        let Some(auction) = self.auctions.get_mut(auction_id) else {
            return false;
        };
        if end_time <= auction.end_time {
            return false;
        }
        auction.end_time = end_time;
        self.views.bump_detail(auction_id);
        true
    }

    /// Shallow-merge a partial update. This is the full-resync escape
    /// hatch, so unlike `apply_bid` it may lower `current_price`.
    pub fn merge_patch(&mut self, auction_id: &str, patch: AuctionPatch) -> bool {
        let Some(auction) = self.auctions.get_mut(auction_id) else {
            return false;
        };
        if let Some(v) = patch.gift_name {
            auction.gift_name = v;
        }
        if let Some(v) = patch.current_price {
            auction.current_price = v;
        }
        if let Some(v) = patch.increment_amount {
            auction.increment_amount = v;
        }
        if let Some(v) = patch.end_time {
            auction.end_time = v;
        }
        if let Some(v) = patch.status {
            auction.status = v;
        }
        if let Some(v) = patch.total_bids {
            auction.total_bids = v;
        }
        if let Some(v) = patch.winner_name {
            auction.winner_name = Some(v);
        }
        self.views.bump_list();
        self.views.bump_detail(auction_id);
        true
    }

    // -- refunds -----------------------------------------------------------

    /// Credit an outbid refund to the wallet exactly once per dedup key
    /// (the superseding bid's id). Returns `true` if the credit applied.
    pub fn credit_refund_once(&mut self, dedup_key: i64, amount: u64) -> bool {
        if !self.credited_refunds.insert(dedup_key) {
            debug!(dedup_key, "duplicate refund dropped");
            return false;
        }
        self.wallet.credit_stars(amount);
        true
    }

    // -- leaderboards ------------------------------------------------------

    /// Last-write-wins replacement; no merge with the prior ordering.
    pub fn replace_leaderboard(&mut self, board: String, entries: Vec<LeaderboardEntry>) {
        self.leaderboards.insert(board, entries);
        self.views.bump_leaderboards();
    }

    pub fn leaderboard(&self, board: &str) -> Option<&[LeaderboardEntry]> {
        self.leaderboards.get(board).map(|v| v.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn make_auction(id: &str, starting_price: u64) -> Auction {
        Auction {
            id: id.to_string(),
            gift_name: "Astral Shard".into(),
            starting_price,
            current_price: starting_price,
            increment_amount: 10,
            end_time: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            status: AuctionStatus::Active,
            total_bids: 0,
            bids: Vec::new(),
            winner_name: None,
        }
    }

    pub(crate) fn make_bid(id: i64, bidder: &str, amount: u64) -> Bid {
        Bid {
            id,
            bidder_id: bidder.to_string(),
            bidder_name: bidder.to_uppercase(),
            amount,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap(),
            is_auto_bid: false,
        }
    }

    #[test]
    fn apply_bid_prepends_and_advances_price() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));

        let out = store.apply_bid("a1", make_bid(1, "alice", 110), 110, None);
        assert_eq!(out, BidApplied::Applied);

        let auction = store.auction("a1").unwrap();
        assert_eq!(auction.current_price, 110);
        assert_eq!(auction.total_bids, 1);
        assert_eq!(auction.bids.len(), 1);
        assert_eq!(auction.bids[0].bidder_id, "alice");
    }

    #[test]
    fn duplicate_bid_id_is_dropped() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));

        store.apply_bid("a1", make_bid(1, "alice", 110), 110, None);
        let out = store.apply_bid("a1", make_bid(1, "alice", 110), 110, None);
        assert_eq!(out, BidApplied::Duplicate);

        let auction = store.auction("a1").unwrap();
        assert_eq!(auction.total_bids, 1);
        assert_eq!(auction.bids.len(), 1);
    }

    #[test]
    fn bid_history_is_capped_at_fifty() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));

        for i in 1..=60 {
            store.apply_bid("a1", make_bid(i, "alice", 100 + i as u64), 100 + i as u64, None);
        }

        let auction = store.auction("a1").unwrap();
        assert_eq!(auction.bids.len(), BID_HISTORY_CAP);
        // Newest-first: the last applied bid is at the front.
        assert_eq!(auction.bids[0].id, 60);
        assert_eq!(auction.total_bids, 60);
    }

    #[test]
    fn out_of_order_bid_never_lowers_price() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));

        store.apply_bid("a1", make_bid(2, "bob", 130), 130, None);
        // A reordered earlier bid arrives late.
        store.apply_bid("a1", make_bid(1, "alice", 110), 110, None);

        let auction = store.auction("a1").unwrap();
        assert_eq!(auction.current_price, 130);
        assert_eq!(auction.total_bids, 2);
        assert_eq!(auction.bids[0].id, 1, "history is ordered by application");
    }

    #[test]
    fn server_total_is_adopted_when_larger() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));

        store.apply_bid("a1", make_bid(5, "bob", 150), 150, Some(5));
        let auction = store.auction("a1").unwrap();
        assert_eq!(auction.total_bids, 5, "server saw bids we never received");
    }

    #[test]
    fn mark_ended_fires_once() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));

        assert!(store.mark_ended("a1", 150, Some("ALICE".into())));
        assert!(!store.mark_ended("a1", 150, Some("ALICE".into())));

        let auction = store.auction("a1").unwrap();
        assert_eq!(auction.status, AuctionStatus::Completed);
        assert_eq!(auction.current_price, 150);
        assert_eq!(auction.winner_name.as_deref(), Some("ALICE"));
    }

    #[test]
    fn mark_started_only_from_pending() {
        let mut store = AuctionStore::new();
        let mut auction = make_auction("a1", 100);
        auction.status = AuctionStatus::Pending;
        store.seed_auction(auction);

        assert!(store.mark_started("a1"));
        assert!(!store.mark_started("a1"));

        store.mark_ended("a1", 150, None);
        assert!(!store.mark_started("a1"), "ended auction must stay ended");
    }

    #[test]
    fn extend_rejects_earlier_end_time() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));
        let original = store.auction("a1").unwrap().end_time;

        assert!(!store.extend_end_time("a1", original - chrono::Duration::seconds(30)));
        assert!(store.extend_end_time("a1", original + chrono::Duration::seconds(30)));
    }

    #[test]
    fn merge_patch_may_lower_price() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));
        store.apply_bid("a1", make_bid(1, "alice", 500), 500, None);

        // Full resync corrects a bad price downward.
        let patch = AuctionPatch {
            current_price: Some(110),
            ..Default::default()
        };
        assert!(store.merge_patch("a1", patch));
        assert_eq!(store.auction("a1").unwrap().current_price, 110);
    }

    #[test]
    fn refund_credits_exactly_once_per_key() {
        let mut store = AuctionStore::new();
        store.wallet.adopt_confirmed(890, 0.0);

        assert!(store.credit_refund_once(42, 110));
        assert!(!store.credit_refund_once(42, 110));
        assert_eq!(store.wallet.displayed_stars(), 1000);
    }

    #[test]
    fn seed_refresh_keeps_larger_price() {
        let mut store = AuctionStore::new();
        store.seed_auction(make_auction("a1", 100));
        store.apply_bid("a1", make_bid(1, "alice", 140), 140, None);

        // Stale REST snapshot from before the bid.
        store.seed_auction(make_auction("a1", 100));
        assert_eq!(store.auction("a1").unwrap().current_price, 140);
    }

    #[test]
    fn leaderboard_replace_is_wholesale() {
        let mut store = AuctionStore::new();
        let first = vec![LeaderboardEntry {
            user_id: "u1".into(),
            user_name: "A".into(),
            score: 10,
        }];
        let second = vec![LeaderboardEntry {
            user_id: "u2".into(),
            user_name: "B".into(),
            score: 3,
        }];

        store.replace_leaderboard("weekly".into(), first);
        store.replace_leaderboard("weekly".into(), second.clone());
        assert_eq!(store.leaderboard("weekly").unwrap(), second.as_slice());
    }
}
