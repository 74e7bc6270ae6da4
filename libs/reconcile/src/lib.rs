//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing level-triggered
//! reconciliation loops over an optimistically-locked store. Key concepts:
//!
//! - **Action**: what the caller's scheduler should do after a pass.
//! - **Backoff**: delay between retries of a failing key.
//! - **Conflict tracking**: detection of objects stuck in a conflict cycle.
//!
//! # Invariants
//!
//! - A pass never retries in-process; retries are expressed as an [`Action`]
//!   or an error and executed by the scheduler.
//! - Decisions are deterministic given the same inputs.
//! - Trigger tokens only ever increase.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha2::{Digest, Sha256};

/// Outcome of a successful reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged for now. Only a new event re-runs the key.
    Done,

    /// Run the key again right away, after anything already queued.
    Requeue,

    /// Run the key again after a delay.
    RequeueAfter(Duration),
}

/// A content digest for deterministic comparison and logging.
///
/// Used to tag deliveries so two pushes of the same merged configuration
/// can be told apart from pushes of different ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| {
                    format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Exponential backoff with jitter for keys whose pass returned an error.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Tracks optimistic-concurrency conflicts per object.
///
/// A conflict is expected and harmless once; an object that keeps conflicting
/// inside the window is a stuck convergence and should be logged loudly.
#[derive(Debug, Clone)]
pub struct ConflictTracker {
    /// Conflicts tolerated before an object counts as stuck.
    threshold: u32,

    /// Window in which conflicts are counted.
    window: Duration,

    /// Tracked conflicts: object key -> (count, first_conflict_time).
    conflicts: BTreeMap<String, (u32, Instant)>,
}

impl ConflictTracker {
    /// Create a new conflict tracker.
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            conflicts: BTreeMap::new(),
        }
    }

    /// Record a conflict for an object.
    ///
    /// Returns the number of conflicts in the current window and whether the
    /// object is now considered stuck.
    pub fn record(&mut self, key: &str) -> (u32, bool) {
        let now = Instant::now();

        let (count, first) = self.conflicts.entry(key.to_string()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        (*count, *count > self.threshold)
    }

    /// Number of objects with conflicts on record.
    pub fn tracked(&self) -> usize {
        self.conflicts.len()
    }

    /// Clear conflict tracking for an object (on a successful write).
    pub fn clear(&mut self, key: &str) {
        self.conflicts.remove(key);
    }

    /// Drop entries whose window has passed.
    ///
    /// Objects deleted after a conflict never see a successful write, so
    /// only pruning removes them.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.conflicts
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

impl Default for ConflictTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_THRESHOLD, DEFAULT_CONFLICT_WINDOW)
    }
}

/// Next value for a delivery trigger token.
///
/// Tokens are Unix milliseconds, bumped past `previous` when the clock has
/// not moved (or moved backwards) so a stamped object always changes.
pub fn next_trigger_token(previous: Option<&str>) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    next_token_after(previous.and_then(|p| p.parse::<u64>().ok()), now).to_string()
}

fn next_token_after(previous: Option<u64>, now: u64) -> u64 {
    match previous {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}

/// Default delay before re-checking when there is nothing to converge onto.
pub const DEFAULT_EMPTY_REQUEUE: Duration = Duration::from_secs(5);

/// Conflicts tolerated per object before it is reported as stuck.
pub const DEFAULT_CONFLICT_THRESHOLD: u32 = 5;

/// Default conflict window.
pub const DEFAULT_CONFLICT_WINDOW: Duration = Duration::from_secs(5 * 60);
