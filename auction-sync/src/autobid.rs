// Auto-bid status cache.
//
// Per-auction automation state with a hybrid freshness model: entries
// expire after a short TTL (the engine polls stale entries), and any
// autobid event or successful setup/cancel call marks the entry stale
// immediately so the next poll refreshes it without waiting out the TTL.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::protocol::StopReason;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AutoBidError {
    #[error("max amount {max_amount} must exceed the current price {current_price}")]
    MaxBelowPrice { max_amount: u64, current_price: u64 },

    #[error("max amount {max_amount} exceeds your balance {balance}")]
    MaxAboveBalance { max_amount: u64, balance: u64 },

    #[error("auto-bid request rejected: {reason}")]
    Rejected { reason: String },
}

/// Automation state for one auction. At most one active subscription per
/// auction at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoBidState {
    Idle,
    Active {
        max_amount: u64,
        current_bid: u64,
        bid_count: u32,
    },
    Stopped(StopReason),
}

#[derive(Debug)]
struct CacheEntry {
    state: AutoBidState,
    fetched_at: DateTime<Utc>,
    /// Set by event invalidation; forces a refresh regardless of age.
    stale: bool,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AutoBidCache {
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl AutoBidCache {
    pub fn new(ttl_secs: u64) -> Self {
        AutoBidCache {
            ttl: Duration::seconds(ttl_secs as i64),
            entries: HashMap::new(),
        }
    }

    /// Last known state for an auction. `Idle` when nothing is cached.
    pub fn state(&self, auction_id: &str) -> AutoBidState {
        self.entries
            .get(auction_id)
            .map(|e| e.state.clone())
            .unwrap_or(AutoBidState::Idle)
    }

    /// Adopt a freshly fetched (or event-carried) state.
    pub fn store(&mut self, auction_id: &str, state: AutoBidState, now: DateTime<Utc>) {
        self.entries.insert(
            auction_id.to_string(),
            CacheEntry {
                state,
                fetched_at: now,
                stale: false,
            },
        );
    }

    /// Mark an entry stale so the next poll refreshes it immediately.
    /// Unknown auctions get a stale `Idle` placeholder so they are polled
    /// at all.
    pub fn invalidate(&mut self, auction_id: &str, now: DateTime<Utc>) {
        self.entries
            .entry(auction_id.to_string())
            .and_modify(|e| e.stale = true)
            .or_insert(CacheEntry {
                state: AutoBidState::Idle,
                fetched_at: now,
                stale: true,
            });
    }

    pub fn remove(&mut self, auction_id: &str) {
        self.entries.remove(auction_id);
    }

    /// Whether a refresh is due, either by explicit invalidation or TTL
    /// expiry. Auctions never cached need a first fetch.
    pub fn needs_refresh(&self, auction_id: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(auction_id) {
            None => true,
            Some(e) => e.stale || now - e.fetched_at >= self.ttl,
        }
    }

    /// Ids of the given auctions due for a refresh on this poll sweep.
    pub fn due_for_refresh<'a, I>(&self, auction_ids: I, now: DateTime<Utc>) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        auction_ids
            .into_iter()
            .filter(|id| self.needs_refresh(id, now))
            .map(|id| id.to_string())
            .collect()
    }
}

/// Advisory client-side pre-checks for auto-bid setup. The server remains
/// authoritative; these only catch requests that cannot possibly succeed.
pub fn precheck_setup(
    max_amount: u64,
    current_price: u64,
    balance: u64,
) -> Result<(), AutoBidError> {
    if max_amount <= current_price {
        return Err(AutoBidError::MaxBelowPrice {
            max_amount,
            current_price,
        });
    }
    if max_amount > balance {
        return Err(AutoBidError::MaxAboveBalance {
            max_amount,
            balance,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
