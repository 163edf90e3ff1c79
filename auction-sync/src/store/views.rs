// Derived read views over the auction store.
//
// The store is the one writable source of truth; consumers read through
// projections recomputed on demand. Generation counters tell cached
// renderers when a projection they hold is stale, replacing the ad-hoc
// cross-store patching that dual mutable stores would need.

use std::collections::HashMap;

use crate::protocol::AuctionStatus;

use super::{Auction, AuctionStore};

/// Monotonic invalidation counters for the derived views.
#[derive(Debug, Default)]
pub struct Views {
    list_gen: u64,
    detail_gens: HashMap<String, u64>,
    leaderboard_gen: u64,
    active_autobids_gen: u64,
}

impl Views {
    pub fn list_generation(&self) -> u64 {
        self.list_gen
    }

    pub fn detail_generation(&self, auction_id: &str) -> u64 {
        self.detail_gens.get(auction_id).copied().unwrap_or(0)
    }

    pub fn leaderboard_generation(&self) -> u64 {
        self.leaderboard_gen
    }

    pub fn active_autobids_generation(&self) -> u64 {
        self.active_autobids_gen
    }

    pub(crate) fn bump_list(&mut self) {
        self.list_gen += 1;
    }

    pub(crate) fn bump_detail(&mut self, auction_id: &str) {
        *self.detail_gens.entry(auction_id.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn drop_detail(&mut self, auction_id: &str) {
        self.detail_gens.remove(auction_id);
    }

    pub(crate) fn bump_leaderboards(&mut self) {
        self.leaderboard_gen += 1;
    }

    pub fn bump_active_autobids(&mut self) {
        self.active_autobids_gen += 1;
    }
}

/// One row of the auctions-list projection.
#[derive(Debug, Clone, PartialEq)]
pub struct AuctionSummary {
    pub id: String,
    pub gift_name: String,
    pub current_price: u64,
    pub status: AuctionStatus,
    pub total_bids: u64,
    pub winner_name: Option<String>,
}

impl From<&Auction> for AuctionSummary {
    fn from(a: &Auction) -> Self {
        AuctionSummary {
            id: a.id.clone(),
            gift_name: a.gift_name.clone(),
            current_price: a.current_price,
            status: a.status,
            total_bids: a.total_bids,
            winner_name: a.winner_name.clone(),
        }
    }
}

/// Recompute the auctions-list projection: active auctions first, then by
/// descending price, with the id as a stable tiebreak.
pub fn auction_list(store: &AuctionStore) -> Vec<AuctionSummary> {
    let mut rows: Vec<AuctionSummary> = store
        .auction_ids()
        .filter_map(|id| store.auction(id))
        .map(AuctionSummary::from)
        .collect();
    rows.sort_by(|a, b| {
        let a_active = a.status == AuctionStatus::Active;
        let b_active = b.status == AuctionStatus::Active;
        b_active
            .cmp(&a_active)
            .then(b.current_price.cmp(&a.current_price))
            .then(a.id.cmp(&b.id))
    });
    rows
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
