// Wallet: the user's star and TON balances.
//
// The confirmed balance (last server-asserted snapshot plus confirmed
// deltas) is kept separate from pending optimistic holds. The displayed
// balance is confirmed minus outstanding holds, so a balance snapshot
// arriving mid-flight can never clobber an optimistic deduction that has
// not yet been confirmed by its own event.

use std::collections::HashMap;

use tracing::debug;

/// Client-local key identifying one optimistic mutation from apply
/// through confirm/rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

/// A confirmed relative balance change (outbid refund, prize credit).
/// The only way event handlers can move the confirmed star balance
/// other than adopting a full server snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceDelta {
    pub stars: i64,
}

#[derive(Debug, Default)]
pub struct Wallet {
    confirmed_stars: u64,
    confirmed_ton: f64,
    /// Pending deductions backing unconfirmed optimistic bids.
    holds: HashMap<Ticket, u64>,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance as shown to the user: confirmed minus pending holds.
    pub fn displayed_stars(&self) -> u64 {
        self.confirmed_stars.saturating_sub(self.held_stars())
    }

    pub fn displayed_ton(&self) -> f64 {
        self.confirmed_ton
    }

    pub fn confirmed_stars(&self) -> u64 {
        self.confirmed_stars
    }

    pub fn held_stars(&self) -> u64 {
        self.holds.values().sum()
    }

    /// Adopt a server-asserted absolute snapshot as the new confirmed
    /// component. Holds are preserved: the displayed balance still
    /// subtracts them until each in-flight bid resolves.
    pub fn adopt_confirmed(&mut self, stars: u64, ton: f64) {
        self.confirmed_stars = stars;
        self.confirmed_ton = ton;
    }

    /// Apply a confirmed relative change (e.g. an outbid refund).
    pub fn apply_delta(&mut self, delta: BalanceDelta) {
        if delta.stars >= 0 {
            self.confirmed_stars = self.confirmed_stars.saturating_add(delta.stars as u64);
        } else {
            self.confirmed_stars = self
                .confirmed_stars
                .saturating_sub(delta.stars.unsigned_abs());
        }
    }

    pub fn credit_stars(&mut self, amount: u64) {
        self.apply_delta(BalanceDelta {
            stars: amount as i64,
        });
    }

    /// Place a hold backing an optimistic bid. Replaces any prior hold
    /// under the same ticket.
    pub fn place_hold(&mut self, ticket: Ticket, amount: u64) {
        if self.holds.insert(ticket, amount).is_some() {
            debug!(?ticket, "hold replaced under existing ticket");
        }
    }

    /// Release a hold without adopting a balance (rollback path).
    pub fn release_hold(&mut self, ticket: Ticket) -> bool {
        self.holds.remove(&ticket).is_some()
    }

    /// Resolve a hold on server success: the hold is released and, when
    /// the server returned the post-bid balance, it becomes the new
    /// confirmed component.
    pub fn settle_hold(&mut self, ticket: Ticket, new_confirmed_stars: Option<u64>) -> bool {
        let released = self.holds.remove(&ticket).is_some();
        if let Some(stars) = new_confirmed_stars {
            self.confirmed_stars = stars;
        }
        released
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
