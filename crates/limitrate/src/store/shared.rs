//! REST key-value store client for multi-instance deployments.
//!
//! Counters live in a shared key-value service that every limiter instance
//! talks to over HTTP. The service owns atomicity: its increment endpoint
//! performs the add and the TTL stamp server-side in one step, so two
//! instances committing the same key serialize there.
//!
//! Wire contract (JSON bodies, bearer-token auth):
//!
//! - `POST {url}/v1/incr` with `{key, amount, ttl}` → `{value}` -- atomic
//!   increment, creating the key with `ttl` seconds to live when absent
//! - `GET {url}/v1/get/{key}` → `{value}`; 404 when the key does not exist
//! - `DELETE {url}/v1/del/{key}` -- removes every key with the given
//!   prefix
//!
//! Window arithmetic stays client-side: the window index is baked into the
//! key, and the TTL sent with each increment is the remaining window time
//! plus a small grace period. Tumbling windows therefore assume reasonably
//! synchronized instance clocks.

use super::{
    check_window, now_epoch, seconds_until_reset, window_key, CostCommit, CostSnapshot,
    RateCommit, RateSnapshot, Store, StoreError,
};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-call timeout for store round-trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra seconds a key outlives its window, so a commit racing the window
/// edge still lands on a live key.
const TTL_GRACE_SECS: u64 = 5;

#[derive(Debug, Serialize)]
struct IncrRequest<'a> {
    key: &'a str,
    amount: f64,
    ttl: u64,
}

#[derive(Debug, Deserialize)]
struct ValueResponse {
    value: f64,
}

/// [`Store`] backed by a shared REST key-value service.
#[derive(Debug, Clone)]
pub struct SharedStore {
    client: Client,
    base_url: String,
    token: String,
}

impl SharedStore {
    /// Builds a client for the service at `url`. The URL is used as-is
    /// (no trailing slash) and `token` is sent as a bearer credential on
    /// every call.
    pub fn new(url: &str, token: &str) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| StoreError::Invalid(format!("http client construction failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn transport_err(e: reqwest::Error) -> StoreError {
        StoreError::Unavailable(format!("store request failed: {}", e))
    }

    /// Maps a non-success response to the store failure classes: client
    /// errors are contract violations, everything else is transient.
    async fn status_err(resp: reqwest::Response) -> StoreError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            StoreError::Invalid(format!("store rejected request ({}): {}", status, body))
        } else {
            StoreError::Unavailable(format!("store error ({}): {}", status, body))
        }
    }

    async fn incr(&self, key: &str, amount: f64, ttl: u64) -> Result<f64, StoreError> {
        let resp = self
            .client
            .post(format!("{}/v1/incr", self.base_url))
            .bearer_auth(&self.token)
            .json(&IncrRequest { key, amount, ttl })
            .send()
            .await
            .map_err(Self::transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::status_err(resp).await);
        }
        let parsed: ValueResponse = resp.json().await.map_err(Self::transport_err)?;
        Ok(parsed.value)
    }

    /// Reads a key's value; a missing key reads as zero.
    async fn get(&self, key: &str) -> Result<f64, StoreError> {
        let resp = self
            .client
            .get(format!("{}/v1/get/{}", self.base_url, key))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::transport_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(0.0);
        }
        if !resp.status().is_success() {
            return Err(Self::status_err(resp).await);
        }
        let parsed: ValueResponse = resp.json().await.map_err(Self::transport_err)?;
        Ok(parsed.value)
    }
}

#[async_trait]
impl Store for SharedStore {
    async fn peek_rate(
        &self,
        key: &str,
        _limit: u64,
        window_seconds: u64,
    ) -> Result<RateSnapshot, StoreError> {
        check_window(window_seconds)?;
        let now = now_epoch();
        let value = self.get(&window_key(key, window_seconds, now)).await?;
        Ok(RateSnapshot {
            current: value.max(0.0) as u64,
            reset_in: seconds_until_reset(window_seconds, now),
        })
    }

    async fn commit_rate(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateCommit, StoreError> {
        check_window(window_seconds)?;
        let now = now_epoch();
        let reset_in = seconds_until_reset(window_seconds, now);
        let value = self
            .incr(&window_key(key, window_seconds, now), 1.0, reset_in + TTL_GRACE_SECS)
            .await?;
        let current = value.max(0.0) as u64;
        debug!("shared store commit_rate {}: {}", key, current);
        Ok(RateCommit {
            current,
            reset_in,
            exceeded: current > limit,
        })
    }

    async fn peek_cost(&self, key: &str, window_seconds: u64) -> Result<CostSnapshot, StoreError> {
        check_window(window_seconds)?;
        let now = now_epoch();
        let value = self.get(&window_key(key, window_seconds, now)).await?;
        Ok(CostSnapshot {
            current: value.max(0.0),
            reset_in: seconds_until_reset(window_seconds, now),
        })
    }

    async fn commit_cost(
        &self,
        key: &str,
        amount: f64,
        cap: f64,
        window_seconds: u64,
    ) -> Result<CostCommit, StoreError> {
        check_window(window_seconds)?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(StoreError::Invalid(format!(
                "cost amount {} is not a finite non-negative number",
                amount
            )));
        }
        let now = now_epoch();
        let reset_in = seconds_until_reset(window_seconds, now);
        let current = self
            .incr(&window_key(key, window_seconds, now), amount, reset_in + TTL_GRACE_SECS)
            .await?;
        Ok(CostCommit {
            current,
            reset_in,
            exceeded: current > cap,
            cap,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(format!("{}/v1/del/{}", self.base_url, key))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::transport_err)?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::status_err(resp).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let store = SharedStore::new("http://kv.internal:7000/", "t").unwrap();
        assert_eq!(store.base_url, "http://kv.internal:7000");
    }

    #[tokio::test]
    async fn unreachable_store_reports_unavailable() {
        // Nothing listens on this port; the client must surface a
        // transient failure, not a panic or a contract violation.
        let store = SharedStore::new("http://127.0.0.1:1", "t").unwrap();
        let err = store.peek_rate("rate:u:e", 10, 60).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
