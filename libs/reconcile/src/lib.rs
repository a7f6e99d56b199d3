//! Reconciliation primitives.
//!
//! Helpers for loops that converge recorded state toward observed state
//! (the health monitor) and for loops that take corrective action on their
//! own (automatic recovery). Key concepts:
//!
//! - **Evidence ordering**: an observation is only applied if it is newer
//!   than the last one applied for the same key.
//! - **Bounded automation**: automatic corrective actions have a budget;
//!   once spent, only an explicit clear re-arms them.
//!
//! # Invariants
//!
//! - Applying stale evidence is a no-op
//! - Decisions are deterministic given the same inputs
//! - Budgets never refill on their own unless a window is configured

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Tracks the newest applied sequence number per key.
///
/// Sequence numbers are issued when an observation is *started* (e.g. when a
/// probe is dispatched), so a slow probe that finishes after a faster, later
/// one carries the lower number and is rejected.
#[derive(Debug, Clone)]
pub struct SequenceGuard<K: Ord> {
    applied: BTreeMap<K, u64>,
}

impl<K: Ord> Default for SequenceGuard<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord> SequenceGuard<K> {
    pub fn new() -> Self {
        Self {
            applied: BTreeMap::new(),
        }
    }

    /// Records `seq` for `key` if it is newer than anything applied so far.
    ///
    /// Returns false (and changes nothing) for stale or duplicate evidence.
    pub fn admit(&mut self, key: K, seq: u64) -> bool {
        match self.applied.get(&key) {
            Some(last) if seq <= *last => false,
            _ => {
                self.applied.insert(key, seq);
                true
            }
        }
    }

    /// Check whether `seq` would be rejected for `key`.
    pub fn is_stale(&self, key: &K, seq: u64) -> bool {
        self.applied.get(key).is_some_and(|last| seq <= *last)
    }

    /// Last applied sequence for `key`.
    pub fn last(&self, key: &K) -> Option<u64> {
        self.applied.get(key).copied()
    }

    /// Forget a key (the resource was decommissioned).
    pub fn forget(&mut self, key: &K) {
        self.applied.remove(key);
    }
}

/// Budget of automatic attempts per key.
///
/// With no window, a spent budget stays spent until [`AttemptBudget::clear`]
/// is called, which is how "one automatic recovery, then a human" is
/// expressed. With a window, failures older than the window are forgotten.
#[derive(Debug, Clone)]
pub struct AttemptBudget<K: Ord> {
    /// Failed attempts tolerated before the budget is exhausted.
    max_failures: u32,

    /// Optional window after which failures are forgotten.
    window: Option<Duration>,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<K, (u32, DateTime<Utc>)>,
}

impl<K: Ord + Clone> AttemptBudget<K> {
    pub fn new(max_failures: u32, window: Option<Duration>) -> Self {
        Self {
            max_failures,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failed attempt at `now`.
    ///
    /// Returns true if the budget is now exhausted.
    pub fn record_failure(&mut self, key: &K, now: DateTime<Utc>) -> bool {
        let window = self.window;
        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        if let Some(window) = window {
            if elapsed(*first, now) > window {
                *count = 0;
                *first = now;
            }
        }

        *count += 1;
        *count >= self.max_failures
    }

    /// Check whether another automatic attempt is allowed at `now`.
    pub fn allows(&self, key: &K, now: DateTime<Utc>) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return true;
        };

        if let Some(window) = self.window {
            if elapsed(*first, now) > window {
                return true;
            }
        }

        *count < self.max_failures
    }

    /// Failures recorded for `key`.
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Re-arm the budget (success, or an explicit operator clear).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

/// Counts consecutive misses per key (heartbeats, probes).
#[derive(Debug, Clone)]
pub struct MissCounter<K: Ord> {
    misses: BTreeMap<K, u32>,
}

impl<K: Ord> Default for MissCounter<K> {
    fn default() -> Self {
        Self {
            misses: BTreeMap::new(),
        }
    }
}

impl<K: Ord> MissCounter<K> {
    /// Record a miss and return the consecutive count.
    pub fn miss(&mut self, key: K) -> u32 {
        let count = self.misses.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Record a hit, resetting the consecutive count.
    pub fn hit(&mut self, key: &K) {
        self.misses.remove(key);
    }

    pub fn get(&self, key: &K) -> u32 {
        self.misses.get(key).copied().unwrap_or(0)
    }
}

/// Default probe interval.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Default probe timeout. Kept well below the probe interval so a failure is
/// detected within one interval.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of automatic recovery failures before a human is needed.
pub const DEFAULT_RECOVERY_ATTEMPTS: u32 = 1;
