//! Comprehensive configuration validation with categorized reporting.
//!
//! [`Settings::validate`] answers "can this configuration run at all";
//! this module answers "should it". The validator re-runs the structural
//! checks and layers operational ones on top, splitting findings into
//! errors (refuse to start), warnings (runs, but something looks off), and
//! recommendations (works fine, could be better).

use crate::models::policy::{Action, EndpointPolicy};
use crate::models::settings::{Settings, StoreSettings};
use log::{info, warn};

/// A slowdown above this many milliseconds holds connections long enough
/// to become its own resource problem.
const SLOWDOWN_WARN_MS: u64 = 10_000;

/// Result of comprehensive validation, categorized by severity.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Whether the configuration is usable (no errors).
    pub is_valid: bool,
    /// Critical problems that must be fixed before startup.
    pub errors: Vec<String>,
    /// Non-critical issues worth an operator's attention.
    pub warnings: Vec<String>,
    /// Suggestions for improving the configuration.
    pub recommendations: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_recommendation(&mut self, recommendation: String) {
        self.recommendations.push(recommendation);
    }
}

/// Validates limiter configuration beyond the structural minimum.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Runs every check and returns the categorized report. Logs a
    /// summary at the end.
    pub fn validate_comprehensive(settings: &Settings) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = settings.validate() {
            result.add_error(e);
        }

        Self::check_plans(settings, &mut result);
        Self::check_store(settings, &mut result);

        if settings.peek_cap_per_second < 10 {
            result.add_warning(format!(
                "peekCapPerSecond of {} is low enough to throttle ordinary dashboard polling",
                settings.peek_cap_per_second
            ));
        }

        if result.is_valid {
            info!(
                "configuration valid: {} plans, {} warnings, {} recommendations",
                settings.plans.len(),
                result.warnings.len(),
                result.recommendations.len()
            );
        } else {
            warn!("configuration invalid: {} errors", result.errors.len());
        }
        result
    }

    fn check_plans(settings: &Settings, result: &mut ValidationResult) {
        if settings.plans.is_empty() {
            result.add_warning(
                "no plans declared; every request resolves to the empty policy".to_string(),
            );
            return;
        }
        if !settings.plans.contains_key(&settings.base_plan) {
            result.add_warning(format!(
                "base plan '{}' has no policy entry; unknown plans will be unlimited",
                settings.base_plan
            ));
        }

        for (name, plan) in &settings.plans {
            if plan.defaults.is_none() && plan.endpoints.is_empty() {
                result.add_warning(format!("plan '{}' declares no policies at all", name));
            } else if plan.defaults.is_none() {
                result.add_recommendation(format!(
                    "plan '{}' has endpoint policies but no defaults; unlisted endpoints are unlimited",
                    name
                ));
            }
            for (key, policy) in &plan.endpoints {
                Self::check_endpoint_policy(name, key, policy, result);
            }
            if let Some(ref defaults) = plan.defaults {
                Self::check_endpoint_policy(name, "defaults", defaults, result);
            }
        }
    }

    fn check_endpoint_policy(
        plan: &str,
        key: &str,
        policy: &EndpointPolicy,
        result: &mut ValidationResult,
    ) {
        if let Some(ref rate) = policy.rate {
            for (window, limit) in rate.windows() {
                if limit == 0 {
                    result.add_warning(format!(
                        "plan '{}', '{}': {} limit of 0 blocks every request",
                        plan,
                        key,
                        window.label()
                    ));
                }
            }
            // A wider window allowing less than a tighter one makes the
            // tighter limit unreachable.
            if let (Some(minute), Some(hour)) = (rate.max_per_minute, rate.max_per_hour) {
                if hour < minute {
                    result.add_warning(format!(
                        "plan '{}', '{}': maxPerHour ({}) is below maxPerMinute ({})",
                        plan, key, hour, minute
                    ));
                }
            }
            if let (Some(hour), Some(day)) = (rate.max_per_hour, rate.max_per_day) {
                if day < hour {
                    result.add_warning(format!(
                        "plan '{}', '{}': maxPerDay ({}) is below maxPerHour ({})",
                        plan, key, day, hour
                    ));
                }
            }
            if rate.action_on_exceed == Action::Slowdown {
                if let Some(ms) = rate.slowdown_ms {
                    if ms > SLOWDOWN_WARN_MS {
                        result.add_warning(format!(
                            "plan '{}', '{}': slowdownMs of {} holds connections open for a long time",
                            plan, key, ms
                        ));
                    }
                }
            }
        }
        if let Some(ref cost) = policy.cost {
            if let (Some(hourly), Some(daily)) = (cost.hourly_cap, cost.daily_cap) {
                if daily < hourly {
                    result.add_warning(format!(
                        "plan '{}', '{}': dailyCap ({}) is below hourlyCap ({})",
                        plan, key, daily, hourly
                    ));
                }
            }
        }
    }

    fn check_store(settings: &Settings, result: &mut ValidationResult) {
        match &settings.store {
            StoreSettings::Memory => {
                result.add_recommendation(
                    "memory store is process-local; use the shared store when running more than one instance"
                        .to_string(),
                );
            }
            StoreSettings::Shared { url, token } => {
                if token.is_empty() {
                    result.add_warning(format!(
                        "shared store at '{}' has no auth token configured",
                        url
                    ));
                }
                if url.starts_with("http://") && !url.contains("localhost") && !url.contains("127.0.0.1") {
                    result.add_recommendation(format!(
                        "shared store '{}' uses plain http; counters and tokens travel unencrypted",
                        url
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(json: &str) -> Settings {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn valid_config_passes_with_memory_store_recommendation() {
        let result = ConfigValidator::validate_comprehensive(&settings(
            r#"{
                "version": 1,
                "plans": {
                    "free": { "defaults": { "rate": { "maxPerMinute": 10 } } }
                }
            }"#,
        ));
        assert!(result.is_valid);
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("process-local")));
    }

    #[test]
    fn inverted_window_limits_warn() {
        let result = ConfigValidator::validate_comprehensive(&settings(
            r#"{
                "version": 1,
                "plans": {
                    "free": {
                        "defaults": { "rate": { "maxPerMinute": 100, "maxPerHour": 10 } }
                    }
                }
            }"#,
        ));
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("maxPerHour")));
    }

    #[test]
    fn missing_base_plan_warns() {
        let result = ConfigValidator::validate_comprehensive(&settings(
            r#"{
                "version": 1,
                "basePlan": "starter",
                "plans": {
                    "free": { "defaults": { "rate": { "maxPerMinute": 10 } } }
                }
            }"#,
        ));
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("starter")));
    }

    #[test]
    fn structural_failure_is_an_error() {
        let result = ConfigValidator::validate_comprehensive(&settings(
            r#"{
                "version": 3,
                "plans": {}
            }"#,
        ));
        assert!(!result.is_valid);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn shared_store_without_token_warns() {
        let result = ConfigValidator::validate_comprehensive(&settings(
            r#"{
                "version": 1,
                "store": { "type": "shared", "url": "http://kv.internal:7000" },
                "plans": {
                    "free": { "defaults": { "rate": { "maxPerMinute": 10 } } }
                }
            }"#,
        ));
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("auth token")));
    }
}
