// Per-auction countdown engine.
//
// Each tracked auction moves through three phases:
//   LocalEstimate  -- seconds computed from `end_time - now` on each tick
//   ServerSynced   -- frozen at the last accepted `timer:sync` value;
//                     never locally decremented between syncs
//   Ended          -- terminal; the completion effect fires exactly once
//
// The transition to ServerSynced is one-way for the life of the entry, and
// all views read the remaining seconds through the engine, so concurrently
// mounted displays for the same auction can never drift apart. The clock
// is an explicit argument on every operation so tests control time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    LocalEstimate,
    ServerSynced { seconds_remaining: u64 },
    Ended,
}

/// Outcome of offering a `timer:sync` value to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Accepted,
    /// Larger than the current value with no extension to justify it:
    /// stale reordering, dropped.
    RejectedStale,
    /// The auction's timer already ended; syncs are ignored.
    AlreadyEnded,
    Untracked,
}

#[derive(Debug)]
struct TimerEntry {
    phase: TimerPhase,
    end_time: DateTime<Utc>,
    /// Set by a round extension; permits the next sync to carry a larger
    /// value than the previous one.
    extension_pending: bool,
    completion_fired: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TimerEngine {
    entries: HashMap<String, TimerEntry>,
}

impl TimerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an auction's countdown from its end time.
    /// Re-tracking an existing entry only updates the end time; phase and
    /// completion state are preserved.
    pub fn track(&mut self, auction_id: &str, end_time: DateTime<Utc>) {
        self.entries
            .entry(auction_id.to_string())
            .and_modify(|e| e.end_time = end_time)
            .or_insert(TimerEntry {
                phase: TimerPhase::LocalEstimate,
                end_time,
                extension_pending: false,
                completion_fired: false,
            });
    }

    /// Stop tracking (user navigated away).
    pub fn untrack(&mut self, auction_id: &str) {
        self.entries.remove(auction_id);
    }

    pub fn phase(&self, auction_id: &str) -> Option<TimerPhase> {
        self.entries.get(auction_id).map(|e| e.phase)
    }

    /// Remaining seconds as every display must render them.
    pub fn seconds_remaining(&self, auction_id: &str, now: DateTime<Utc>) -> Option<u64> {
        let entry = self.entries.get(auction_id)?;
        Some(match entry.phase {
            TimerPhase::LocalEstimate => local_estimate(entry.end_time, now),
            TimerPhase::ServerSynced { seconds_remaining } => seconds_remaining,
            TimerPhase::Ended => 0,
        })
    }

    /// A round extension moved the end time; remember it so the next sync
    /// may legitimately carry a larger value.
    pub fn record_extension(&mut self, auction_id: &str, end_time: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(auction_id) {
            if entry.phase == TimerPhase::Ended {
                return;
            }
            entry.end_time = end_time;
            entry.extension_pending = true;
        }
    }

    /// Offer a server-pushed countdown value.
    ///
    /// Acceptance policy: the first sync always wins; afterwards a sync is
    /// accepted only if it does not increase the remaining seconds, carries
    /// `extended=true`, or follows a recorded round extension. Anything
    /// else is reordering of a stale frame.
    pub fn apply_sync(&mut self, auction_id: &str, seconds: u64, extended: bool) -> SyncOutcome {
        let Some(entry) = self.entries.get_mut(auction_id) else {
            return SyncOutcome::Untracked;
        };

        match entry.phase {
            TimerPhase::Ended => SyncOutcome::AlreadyEnded,
            TimerPhase::LocalEstimate => {
                // One-way transition: from here on the server owns the value.
                entry.phase = TimerPhase::ServerSynced {
                    seconds_remaining: seconds,
                };
                entry.extension_pending = false;
                SyncOutcome::Accepted
            }
            TimerPhase::ServerSynced { seconds_remaining } => {
                let justified = seconds <= seconds_remaining || extended || entry.extension_pending;
                if !justified {
                    debug!(
                        auction_id,
                        have = seconds_remaining,
                        got = seconds,
                        "stale timer sync dropped"
                    );
                    return SyncOutcome::RejectedStale;
                }
                entry.phase = TimerPhase::ServerSynced {
                    seconds_remaining: seconds,
                };
                entry.extension_pending = false;
                SyncOutcome::Accepted
            }
        }
    }

    /// Advance local estimates against the wall clock. Returns the auction
    /// ids whose completion effect fires on this tick (first zero-crossing
    /// only; repeated crossings never re-trigger).
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut completed = Vec::new();
        for (id, entry) in &mut self.entries {
            let remaining = match entry.phase {
                TimerPhase::LocalEstimate => local_estimate(entry.end_time, now),
                TimerPhase::ServerSynced { seconds_remaining } => seconds_remaining,
                TimerPhase::Ended => continue,
            };
            if remaining == 0 {
                entry.phase = TimerPhase::Ended;
                if !entry.completion_fired {
                    entry.completion_fired = true;
                    completed.push(id.clone());
                }
            }
        }
        completed.sort();
        completed
    }

    /// Force an entry to the terminal phase (auction ended event). Returns
    /// `true` if the completion effect fires now.
    pub fn end(&mut self, auction_id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(auction_id) else {
            return false;
        };
        entry.phase = TimerPhase::Ended;
        if entry.completion_fired {
            false
        } else {
            entry.completion_fired = true;
            true
        }
    }
}

fn local_estimate(end_time: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (end_time - now).num_seconds().max(0) as u64
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
