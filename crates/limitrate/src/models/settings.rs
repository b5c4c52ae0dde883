//! Serde model of the limiter configuration file.
//!
//! The file declares the policy tree plus store selection and the handful of
//! operational toggles. Code-level hooks (identity, cost estimation, the
//! event sink) are attached at construction through
//! [`crate::middleware::limit::LimitRateBuilder`] and deliberately have no
//! file representation.
//!
//! # Configuration File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "basePlan": "free",
//!   "failOpen": true,
//!   "defaultSlowdownMs": 500,
//!   "trustProxy": false,
//!   "store": { "type": "memory" },
//!   "plans": {
//!     "free": {
//!       "endpoints": {
//!         "POST|/api/ask": {
//!           "rate": { "maxPerMinute": 10, "actionOnExceed": "block" },
//!           "cost": { "perRequest": 0.03, "hourlyCap": 0.10, "actionOnExceed": "block" }
//!         }
//!       },
//!       "defaults": { "rate": { "maxPerMinute": 60, "actionOnExceed": "block" } }
//!     },
//!     "pro": {
//!       "defaults": { "rate": { "maxPerMinute": 600, "actionOnExceed": "slowdown", "slowdownMs": 500 } }
//!     }
//!   }
//! }
//! ```

use crate::models::policy::PlanPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Backing store selection. The `type` tag is the discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreSettings {
    /// Process-local counters. Multi-instance deployments must use `shared`.
    #[default]
    Memory,
    /// Shared REST key-value store reachable by every instance.
    Shared {
        url: String,
        #[serde(default)]
        token: String,
    },
}

/// Complete limiter configuration as loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Configuration schema version, currently `1`.
    pub version: u8,

    /// Plan that unknown plan names collapse to.
    #[serde(default = "default_base_plan")]
    pub base_plan: String,

    /// On store outage: admit (`true`, the default) or deny requests.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,

    /// Delay applied by `slowdown` actions that don't set their own.
    #[serde(default = "default_slowdown_ms")]
    pub default_slowdown_ms: u64,

    /// Use forwarded-for headers when falling back to the peer address
    /// for identity.
    #[serde(default)]
    pub trust_proxy: bool,

    /// Per-IP requests-per-second cap on the status-inspection endpoint.
    #[serde(default = "default_peek_cap")]
    pub peek_cap_per_second: u32,

    #[serde(default)]
    pub store: StoreSettings,

    /// Plan name to policy. Must contain the base plan for unknown-plan
    /// collapse to work.
    pub plans: HashMap<String, PlanPolicy>,
}

fn default_base_plan() -> String {
    "free".to_string()
}

fn default_fail_open() -> bool {
    true
}

fn default_slowdown_ms() -> u64 {
    500
}

fn default_peek_cap() -> u32 {
    100
}

impl Settings {
    /// Structural validation: every policy in the tree is checked, plus the
    /// cross-cutting constraints the policy types can't see themselves.
    ///
    /// Returns the first error encountered. Richer reporting (warnings,
    /// recommendations) lives in [`crate::config::validation`].
    pub fn validate(&self) -> Result<(), String> {
        if self.version != 1 {
            return Err(format!("unsupported configuration version {}", self.version));
        }
        if self.base_plan.trim().is_empty() {
            return Err("basePlan must not be empty".to_string());
        }
        if self.default_slowdown_ms == 0 {
            return Err("defaultSlowdownMs must be greater than zero".to_string());
        }
        if let StoreSettings::Shared { ref url, .. } = self.store {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("shared store url '{}' must include a protocol", url));
            }
        }
        for (name, plan) in &self.plans {
            if name.trim().is_empty() {
                return Err("plan names must not be empty".to_string());
            }
            plan.validate().map_err(|e| format!("plan '{}': {}", name, e))?;
        }
        Ok(())
    }
}
