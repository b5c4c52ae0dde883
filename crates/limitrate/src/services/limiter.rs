//! The limiter engine: two-pass peek-then-commit admission over a
//! pluggable [`Store`].
//!
//! The peek pass gathers every configured window's counter without
//! mutating anything; if any window would exceed with a `block` action the
//! request is denied before a single counter moves. Otherwise the commit
//! pass increments every configured counter unconditionally. Two racers
//! may both pass the peek on the same key; the store's atomic commit then
//! reports a truthful `exceeded` for both and the configured action is
//! applied post-commit, which can downgrade an admission to a block.
//!
//! The peek primitive doubles as the status-inspection read, so the
//! user-visible `remaining` and the enforcement path can never disagree on
//! keying or windowing.

use crate::models::event::{EventType, LimitEvent};
use crate::models::policy::{Action, EndpointPolicy, WindowKind};
use crate::models::verdict::{
    Admission, BlockReason, CounterAxis, RateHeaders, Verdict, WindowObservation,
};
use crate::services::emitter::EventEmitter;
use crate::store::{Store, StoreError};
use log::{error, warn};
use std::sync::Arc;

/// Identity and request facts the engine needs for one admission.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    pub user: &'a str,
    pub plan: &'a str,
    pub endpoint_key: &'a str,
    /// Cost of this request in monetary units, when a cost policy applies.
    pub estimated_cost: Option<f64>,
}

/// Tightest-window rate counters for the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatusView {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_in: u64,
}

/// How a store failure resolves for the current request.
enum Outage {
    /// Skip the window and keep going (fail-open, or `Invalid` at runtime).
    SkipWindow,
    /// Deny the request (fail-closed).
    Deny,
}

/// The admission engine. Holds no per-request state; safe to share.
#[derive(Clone)]
pub struct LimiterEngine {
    store: Arc<dyn Store>,
    fail_open: bool,
    default_slowdown_ms: u64,
    emitter: EventEmitter,
}

/// Logical key for a user's rate counters on one endpoint.
pub fn rate_key(user: &str, endpoint_key: &str) -> String {
    format!("rate:{}:{}", user, endpoint_key)
}

/// Logical key for a user's cost accumulators on one endpoint.
pub fn cost_key(user: &str, endpoint_key: &str) -> String {
    format!("cost:{}:{}", user, endpoint_key)
}

/// Clamps estimator output to the valid domain. Negative, NaN and
/// infinite estimates count as zero.
fn sanitize_estimate(raw: f64, user: &str, endpoint_key: &str) -> f64 {
    if raw.is_finite() && raw >= 0.0 {
        raw
    } else {
        warn!(
            "cost estimate {} for user={} endpoint={} clamped to 0",
            raw, user, endpoint_key
        );
        0.0
    }
}

impl LimiterEngine {
    pub fn new(
        store: Arc<dyn Store>,
        fail_open: bool,
        default_slowdown_ms: u64,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            store,
            fail_open,
            default_slowdown_ms,
            emitter,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Resolves a store failure against the fail-open policy, emitting the
    /// outage event where the contract asks for one.
    fn on_store_error(&self, err: &StoreError, ctx: &AdmissionContext<'_>) -> Outage {
        match err {
            StoreError::Invalid(msg) => {
                // Contract violations at runtime degrade to fail-open for
                // this request only.
                error!(
                    "store contract violation for user={} endpoint={}: {}",
                    ctx.user, ctx.endpoint_key, msg
                );
                Outage::SkipWindow
            }
            StoreError::Unavailable(msg) => {
                warn!(
                    "store unavailable for user={} endpoint={}: {}",
                    ctx.user, ctx.endpoint_key, msg
                );
                self.emitter.emit(LimitEvent::new(
                    EventType::StoreUnavailable,
                    ctx.user,
                    ctx.plan,
                    ctx.endpoint_key,
                ));
                if self.fail_open {
                    Outage::SkipWindow
                } else {
                    Outage::Deny
                }
            }
        }
    }

    fn exceeded_event(
        &self,
        axis: CounterAxis,
        window: WindowKind,
        value: f64,
        threshold: f64,
        ctx: &AdmissionContext<'_>,
    ) {
        let event_type = match axis {
            CounterAxis::Rate => EventType::RateExceeded,
            CounterAxis::Cost => EventType::CostExceeded,
        };
        self.emitter.emit(
            LimitEvent::new(event_type, ctx.user, ctx.plan, ctx.endpoint_key)
                .with_window(window, value, threshold),
        );
    }

    /// Runs the full admission for one request. Never returns an error:
    /// store failures resolve through the fail-open policy into the
    /// verdict itself.
    pub async fn admit(&self, policy: &EndpointPolicy, ctx: &AdmissionContext<'_>) -> Admission {
        let rate_windows = policy.rate.as_ref().map(|r| r.windows()).unwrap_or_default();
        let cost_caps = policy.cost.as_ref().map(|c| c.caps()).unwrap_or_default();

        if rate_windows.is_empty() && cost_caps.is_empty() {
            return Admission {
                verdict: Verdict::Allow,
                observations: Vec::new(),
                headers: None,
            };
        }

        let estimate = ctx
            .estimated_cost
            .map(|raw| sanitize_estimate(raw, ctx.user, ctx.endpoint_key))
            .unwrap_or(0.0);
        let rate_action = policy.rate.as_ref().map(|r| r.action_on_exceed);
        let cost_action = policy.cost.as_ref().map(|c| c.action_on_exceed);
        let user_rate_key = rate_key(ctx.user, ctx.endpoint_key);
        let user_cost_key = cost_key(ctx.user, ctx.endpoint_key);

        // Pass 1: peek every configured window. Nothing is mutated; a
        // would-exceed window whose action is `block` denies right here.
        let mut observations: Vec<WindowObservation> = Vec::new();
        let mut peek_blocks: Vec<(BlockReason, WindowKind, f64, f64, u64)> = Vec::new();

        for &(window, limit) in &rate_windows {
            match self.store.peek_rate(&user_rate_key, limit, window.seconds()).await {
                Ok(snap) => {
                    let would_exceed = snap.current + 1 > limit;
                    observations.push(WindowObservation {
                        axis: CounterAxis::Rate,
                        window,
                        current: snap.current as f64,
                        limit: limit as f64,
                        remaining: limit.saturating_sub(snap.current) as f64,
                        reset_in: snap.reset_in,
                        exceeded: would_exceed,
                    });
                    if would_exceed && rate_action == Some(Action::Block) {
                        peek_blocks.push((
                            BlockReason::RateExceeded,
                            window,
                            snap.current as f64,
                            limit as f64,
                            snap.reset_in,
                        ));
                    }
                }
                Err(err) => match self.on_store_error(&err, ctx) {
                    Outage::SkipWindow => continue,
                    Outage::Deny => {
                        return Admission::blocked(BlockReason::StoreUnavailable, 1, observations)
                    }
                },
            }
        }

        for &(window, cap) in &cost_caps {
            match self.store.peek_cost(&user_cost_key, window.seconds()).await {
                Ok(snap) => {
                    let would_exceed = snap.current + estimate > cap;
                    observations.push(WindowObservation {
                        axis: CounterAxis::Cost,
                        window,
                        current: snap.current,
                        limit: cap,
                        remaining: (cap - snap.current).max(0.0),
                        reset_in: snap.reset_in,
                        exceeded: would_exceed,
                    });
                    if would_exceed && cost_action == Some(Action::Block) {
                        peek_blocks.push((
                            BlockReason::CostExceeded,
                            window,
                            snap.current,
                            cap,
                            snap.reset_in,
                        ));
                    }
                }
                Err(err) => match self.on_store_error(&err, ctx) {
                    Outage::SkipWindow => continue,
                    Outage::Deny => {
                        return Admission::blocked(BlockReason::StoreUnavailable, 1, observations)
                    }
                },
            }
        }

        if !peek_blocks.is_empty() {
            let mut retry_after = u64::MAX;
            for &(reason, window, value, threshold, reset_in) in &peek_blocks {
                let axis = match reason {
                    BlockReason::CostExceeded => CounterAxis::Cost,
                    _ => CounterAxis::Rate,
                };
                self.exceeded_event(axis, window, value, threshold, ctx);
                retry_after = retry_after.min(reset_in);
            }
            let reason = peek_blocks[0].0;
            return Admission::blocked(reason, retry_after, observations);
        }

        // Pass 2: commit every configured window unconditionally. A commit
        // that reports exceeded applies its action here, which covers two
        // requests racing past the peek on the same key.
        let mut block: Option<(BlockReason, u64)> = None;
        let mut pending: Option<Action> = None;
        let mut slowdown_ms = self.default_slowdown_ms;
        if let Some(rate) = policy.rate.as_ref() {
            if let Some(ms) = rate.slowdown_ms {
                slowdown_ms = ms;
            }
        }

        for &(window, limit) in &rate_windows {
            match self.store.commit_rate(&user_rate_key, limit, window.seconds()).await {
                Ok(commit) => {
                    upsert_observation(
                        &mut observations,
                        WindowObservation {
                            axis: CounterAxis::Rate,
                            window,
                            current: commit.current as f64,
                            limit: limit as f64,
                            remaining: limit.saturating_sub(commit.current) as f64,
                            reset_in: commit.reset_in,
                            exceeded: commit.exceeded,
                        },
                    );
                    if commit.exceeded {
                        self.exceeded_event(
                            CounterAxis::Rate,
                            window,
                            commit.current as f64,
                            limit as f64,
                            ctx,
                        );
                        match rate_action.unwrap_or_default() {
                            Action::Block => {
                                block = match block {
                                    Some((reason, r)) => Some((reason, r.min(commit.reset_in))),
                                    None => Some((BlockReason::RateExceeded, commit.reset_in)),
                                };
                            }
                            action => pending = merge_action(pending, action),
                        }
                    }
                }
                Err(err) => match self.on_store_error(&err, ctx) {
                    Outage::SkipWindow => continue,
                    Outage::Deny => {
                        return Admission::blocked(BlockReason::StoreUnavailable, 1, observations)
                    }
                },
            }
        }

        for &(window, cap) in &cost_caps {
            match self
                .store
                .commit_cost(&user_cost_key, estimate, cap, window.seconds())
                .await
            {
                Ok(commit) => {
                    upsert_observation(
                        &mut observations,
                        WindowObservation {
                            axis: CounterAxis::Cost,
                            window,
                            current: commit.current,
                            limit: commit.cap,
                            remaining: (commit.cap - commit.current).max(0.0),
                            reset_in: commit.reset_in,
                            exceeded: commit.exceeded,
                        },
                    );
                    if commit.exceeded {
                        self.exceeded_event(CounterAxis::Cost, window, commit.current, commit.cap, ctx);
                        match cost_action.unwrap_or_default() {
                            Action::Block => {
                                block = match block {
                                    Some((reason, r)) => Some((reason, r.min(commit.reset_in))),
                                    None => Some((BlockReason::CostExceeded, commit.reset_in)),
                                };
                            }
                            action => pending = merge_action(pending, action),
                        }
                    }
                }
                Err(err) => match self.on_store_error(&err, ctx) {
                    Outage::SkipWindow => continue,
                    Outage::Deny => {
                        return Admission::blocked(BlockReason::StoreUnavailable, 1, observations)
                    }
                },
            }
        }

        let headers = tightest_rate_headers(&observations);

        if let Some((reason, retry_after)) = block {
            return Admission {
                verdict: Verdict::Blocked { reason, retry_after },
                observations,
                headers: None,
            };
        }

        let verdict = match pending {
            Some(Action::Slowdown) => Verdict::Delayed(slowdown_ms),
            Some(Action::AllowAndLog) => Verdict::AllowLogged,
            _ => Verdict::Allow,
        };

        Admission {
            verdict,
            observations,
            headers,
        }
    }

    /// Peek-only view of the tightest configured rate window, for the
    /// status-inspection endpoint. Returns `None` when no rate policy
    /// applies.
    pub async fn rate_status(
        &self,
        policy: &EndpointPolicy,
        user: &str,
        endpoint_key: &str,
    ) -> Result<Option<RateStatusView>, StoreError> {
        let windows = match policy.rate.as_ref() {
            Some(rate) => rate.windows(),
            None => return Ok(None),
        };
        let Some(&(window, limit)) = windows.first() else {
            return Ok(None);
        };
        let snap = self
            .store
            .peek_rate(&rate_key(user, endpoint_key), limit, window.seconds())
            .await?;
        Ok(Some(RateStatusView {
            used: snap.current,
            limit,
            remaining: limit.saturating_sub(snap.current),
            reset_in: snap.reset_in,
        }))
    }

    /// Clears every counter for one `(user, endpoint)` pair. Admin and
    /// test tooling only.
    pub async fn reset(&self, user: &str, endpoint_key: &str) -> Result<(), StoreError> {
        self.store.reset(&rate_key(user, endpoint_key)).await?;
        self.store.reset(&cost_key(user, endpoint_key)).await
    }
}

impl std::fmt::Debug for LimiterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterEngine")
            .field("fail_open", &self.fail_open)
            .field("default_slowdown_ms", &self.default_slowdown_ms)
            .finish()
    }
}

/// Replaces a peek observation with its post-commit counterpart.
fn upsert_observation(observations: &mut Vec<WindowObservation>, obs: WindowObservation) {
    if let Some(existing) = observations
        .iter_mut()
        .find(|o| o.axis == obs.axis && o.window == obs.window)
    {
        *existing = obs;
    } else {
        observations.push(obs);
    }
}

/// Keeps the most severe non-block action seen so far.
fn merge_action(current: Option<Action>, incoming: Action) -> Option<Action> {
    match current {
        Some(held) if held.severity() >= incoming.severity() => Some(held),
        _ => Some(incoming),
    }
}

/// Advisory header values from the post-commit rate observation with the
/// least headroom; ties go to the shorter window.
fn tightest_rate_headers(observations: &[WindowObservation]) -> Option<RateHeaders> {
    observations
        .iter()
        .filter(|o| o.axis == CounterAxis::Rate)
        .min_by(|a, b| {
            (a.remaining, a.window.seconds())
                .partial_cmp(&(b.remaining, b.window.seconds()))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|o| RateHeaders {
            limit: o.limit as u64,
            remaining: o.remaining as u64,
            reset_in: o.reset_in,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_action_respects_precedence() {
        assert_eq!(
            merge_action(Some(Action::AllowAndLog), Action::Slowdown),
            Some(Action::Slowdown)
        );
        assert_eq!(
            merge_action(Some(Action::Slowdown), Action::AllowAndLog),
            Some(Action::Slowdown)
        );
        assert_eq!(merge_action(None, Action::AllowAndLog), Some(Action::AllowAndLog));
    }

    #[test]
    fn sanitize_estimate_clamps_invalid_values() {
        assert_eq!(sanitize_estimate(0.05, "u", "e"), 0.05);
        assert_eq!(sanitize_estimate(-1.0, "u", "e"), 0.0);
        assert_eq!(sanitize_estimate(f64::NAN, "u", "e"), 0.0);
        assert_eq!(sanitize_estimate(f64::INFINITY, "u", "e"), 0.0);
    }

    #[test]
    fn logical_keys_embed_user_and_endpoint() {
        assert_eq!(rate_key("user-a", "POST|/api/ask"), "rate:user-a:POST|/api/ask");
        assert_eq!(cost_key("user-a", "POST|/api/ask"), "cost:user-a:POST|/api/ask");
    }

    #[test]
    fn tightest_headers_prefer_least_remaining() {
        let observations = vec![
            WindowObservation {
                axis: CounterAxis::Rate,
                window: WindowKind::Minute,
                current: 2.0,
                limit: 10.0,
                remaining: 8.0,
                reset_in: 30,
                exceeded: false,
            },
            WindowObservation {
                axis: CounterAxis::Rate,
                window: WindowKind::Hour,
                current: 98.0,
                limit: 100.0,
                remaining: 2.0,
                reset_in: 1_800,
                exceeded: false,
            },
        ];
        let headers = tightest_rate_headers(&observations).unwrap();
        assert_eq!(headers.limit, 100);
        assert_eq!(headers.remaining, 2);
    }
}
