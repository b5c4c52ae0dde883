//! Pluggable counter store: the single concurrency boundary of the limiter.
//!
//! A store keeps, for each `(key, window)`, a natural-number rate counter
//! and a non-negative cost accumulator with a wall-clock expiration.
//! Windows are fixed-size tumbling intervals identified by
//! `floor(now / window_seconds)`; the full storage key is
//! `{logical-key}:{window-seconds}:{window-index}`, so counters for
//! different window lengths coexist under one logical key.
//!
//! Two backends ship with the crate:
//!
//! - [`memory::MemoryStore`] - process-local, sharded-mutex counters
//! - [`shared::SharedStore`] - REST key-value client for multi-instance
//!   deployments
//!
//! The contract every backend must honor:
//!
//! - `peek_*` never creates or mutates state
//! - `commit_*` is atomic: increment and expiration set under one guard
//! - `reset` clears every window counter under the logical key

use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod memory;
pub mod shared;

/// Store failure classes.
///
/// `Unavailable` is transient I/O and is subject to the limiter's
/// fail-open/fail-closed policy. `Invalid` is a contract violation
/// (programmer error): fatal at startup, logged and treated as unavailable
/// at runtime.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store contract violation: {0}")]
    Invalid(String),
}

/// Non-mutating view of a rate counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    /// Events already recorded in the current window.
    pub current: u64,
    /// Seconds until the current window expires.
    pub reset_in: u64,
}

/// Result of an atomic rate increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCommit {
    /// Post-increment count.
    pub current: u64,
    pub reset_in: u64,
    /// `current > limit` after the increment.
    pub exceeded: bool,
}

/// Non-mutating view of a cost accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostSnapshot {
    pub current: f64,
    pub reset_in: u64,
}

/// Result of an atomic cost addition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostCommit {
    /// Post-add accumulated cost.
    pub current: f64,
    pub reset_in: u64,
    /// `current > cap` after the addition.
    pub exceeded: bool,
    /// The cap the commit was checked against, echoed back.
    pub cap: f64,
}

/// The store abstraction. All limiter state lives behind this trait.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads the rate counter for the current window without creating
    /// state. `limit` is advisory context only; a peek never enforces.
    async fn peek_rate(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateSnapshot, StoreError>;

    /// Atomically increments the rate counter for the current window by
    /// one.
    async fn commit_rate(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateCommit, StoreError>;

    /// Reads the cost accumulator for the current window without creating
    /// state.
    async fn peek_cost(&self, key: &str, window_seconds: u64) -> Result<CostSnapshot, StoreError>;

    /// Atomically adds `amount` (>= 0) to the cost accumulator for the
    /// current window.
    async fn commit_cost(
        &self,
        key: &str,
        amount: f64,
        cap: f64,
        window_seconds: u64,
    ) -> Result<CostCommit, StoreError>;

    /// Clears every window counter under `key`. Used by tests and admin
    /// tooling.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

/// Current wall-clock time as epoch seconds.
pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Full storage key for the window containing `now`.
pub(crate) fn window_key(logical: &str, window_seconds: u64, now: u64) -> String {
    format!("{}:{}:{}", logical, window_seconds, now / window_seconds)
}

/// Seconds until the window containing `now` rolls over.
pub(crate) fn seconds_until_reset(window_seconds: u64, now: u64) -> u64 {
    window_seconds - (now % window_seconds)
}

/// Rejects the degenerate window lengths no caller should ever pass.
pub(crate) fn check_window(window_seconds: u64) -> Result<(), StoreError> {
    if window_seconds == 0 {
        return Err(StoreError::Invalid("window of zero seconds".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keys_embed_length_and_index() {
        let key = window_key("rate:user-a:POST|/api/ask", 60, 120);
        assert_eq!(key, "rate:user-a:POST|/api/ask:60:2");
    }

    #[test]
    fn different_window_lengths_do_not_collide() {
        let now = 7_200;
        assert_ne!(window_key("k", 60, now), window_key("k", 3_600, now));
    }

    #[test]
    fn reset_counts_down_within_the_window() {
        assert_eq!(seconds_until_reset(60, 0), 60);
        assert_eq!(seconds_until_reset(60, 59), 1);
        assert_eq!(seconds_until_reset(60, 61), 59);
    }

    #[test]
    fn zero_window_is_a_contract_violation() {
        assert!(matches!(check_window(0), Err(StoreError::Invalid(_))));
        assert!(check_window(60).is_ok());
    }
}
