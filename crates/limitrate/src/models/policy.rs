//! Policy tree types: plans, per-endpoint policies, and the rate/cost
//! sub-policies they carry.
//!
//! A configuration declares a map of plan names to [`PlanPolicy`] values.
//! Each plan maps endpoint keys (`METHOD|PATH`, see
//! [`crate::utils::endpoint_key`]) to an [`EndpointPolicy`], with an optional
//! `defaults` policy that applies when no endpoint entry matches. Policies
//! are plain values: the whole tree is captured once at middleware
//! construction and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What to do when a budget is exceeded.
///
/// Serialized forms match the configuration vocabulary: `"block"`,
/// `"slowdown"`, `"allow-and-log"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Deny the request with a 429 response.
    #[default]
    Block,
    /// Admit the request after an artificial delay.
    Slowdown,
    /// Admit the request normally but emit an event for the operator.
    AllowAndLog,
}

impl Action {
    /// Strict precedence used when merging verdicts from several windows:
    /// `block ≻ slowdown ≻ allow-and-log`.
    pub(crate) fn severity(self) -> u8 {
        match self {
            Action::Block => 3,
            Action::Slowdown => 2,
            Action::AllowAndLog => 1,
        }
    }
}

/// The tumbling windows a budget can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    /// Window length in seconds.
    pub fn seconds(self) -> u64 {
        match self {
            WindowKind::Minute => 60,
            WindowKind::Hour => 3_600,
            WindowKind::Day => 86_400,
        }
    }

    /// Stable lowercase label, used in events and logs.
    pub fn label(self) -> &'static str {
        match self {
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
        }
    }
}

/// Request-rate budget: calls per rolling window.
///
/// Absent windows are unlimited. `slowdown_ms` only applies when
/// `action_on_exceed` is [`Action::Slowdown`]; when it is `None` the
/// limiter-wide default delay is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RatePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_hour: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_day: Option<u64>,
    #[serde(default)]
    pub action_on_exceed: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slowdown_ms: Option<u64>,
}

impl RatePolicy {
    /// Configured `(window, limit)` pairs, tightest window first.
    pub fn windows(&self) -> Vec<(WindowKind, u64)> {
        let mut out = Vec::with_capacity(3);
        if let Some(limit) = self.max_per_minute {
            out.push((WindowKind::Minute, limit));
        }
        if let Some(limit) = self.max_per_hour {
            out.push((WindowKind::Hour, limit));
        }
        if let Some(limit) = self.max_per_day {
            out.push((WindowKind::Day, limit));
        }
        out
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.windows().is_empty() {
            return Err("rate policy declares no windows".to_string());
        }
        if self.action_on_exceed == Action::Slowdown {
            if let Some(0) = self.slowdown_ms {
                return Err("slowdownMs must be greater than zero".to_string());
            }
        }
        Ok(())
    }
}

/// Spend budget: accumulated monetary units per rolling window.
///
/// The per-request amount comes from `per_request` when present, otherwise
/// from the caller-supplied cost estimator hook. Caps are independent of the
/// rate windows; absent caps are unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CostPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_request: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_cap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_cap: Option<f64>,
    #[serde(default)]
    pub action_on_exceed: Action,
}

impl CostPolicy {
    /// Configured `(window, cap)` pairs, tightest window first.
    pub fn caps(&self) -> Vec<(WindowKind, f64)> {
        let mut out = Vec::with_capacity(2);
        if let Some(cap) = self.hourly_cap {
            out.push((WindowKind::Hour, cap));
        }
        if let Some(cap) = self.daily_cap {
            out.push((WindowKind::Day, cap));
        }
        out
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(amount) = self.per_request {
            if !amount.is_finite() || amount < 0.0 {
                return Err("perRequest must be a finite, non-negative number".to_string());
            }
        }
        for (window, cap) in self.caps() {
            if !cap.is_finite() || cap < 0.0 {
                return Err(format!(
                    "{} cost cap must be a finite, non-negative number",
                    window.label()
                ));
            }
        }
        if self.caps().is_empty() {
            return Err("cost policy declares no caps".to_string());
        }
        Ok(())
    }
}

/// The policy applied to a single `(plan, endpoint)` pair.
///
/// Both axes are independent; either may be absent, which means unlimited on
/// that axis. The empty policy admits everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<RatePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostPolicy>,
}

impl EndpointPolicy {
    /// A policy with no limits on either axis.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when neither axis is configured.
    pub fn is_unlimited(&self) -> bool {
        self.rate.is_none() && self.cost.is_none()
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref rate) = self.rate {
            rate.validate()?;
        }
        if let Some(ref cost) = self.cost {
            cost.validate()?;
        }
        Ok(())
    }
}

/// Per-plan policy: endpoint-keyed entries plus an optional fallback.
///
/// Resolution is winner-takes-all: a matching endpoint entry is used as-is
/// and never merged with `defaults`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlanPolicy {
    /// Endpoint key (`METHOD|PATH`, placeholders allowed) to policy.
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointPolicy>,
    /// Applied when no endpoint entry matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<EndpointPolicy>,
}

impl PlanPolicy {
    pub fn validate(&self) -> Result<(), String> {
        for (key, policy) in &self.endpoints {
            if !key.contains('|') {
                return Err(format!(
                    "endpoint key '{}' is not in METHOD|PATH form",
                    key
                ));
            }
            policy
                .validate()
                .map_err(|e| format!("endpoint '{}': {}", key, e))?;
        }
        if let Some(ref defaults) = self.defaults {
            defaults.validate().map_err(|e| format!("defaults: {}", e))?;
        }
        Ok(())
    }
}
