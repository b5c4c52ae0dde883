//! Typed event records handed to the operator-supplied sink.
//!
//! Every terminal decision produces exactly one of `allowed`, `blocked`,
//! `slowdown_applied` or `validation_failed`; threshold crossings
//! additionally produce `rate_exceeded` / `cost_exceeded`, and store outages
//! produce `store_unavailable`. Delivery is at-least-once: the sink is
//! invoked synchronously on the request path before the response is
//! finalized.

use crate::models::policy::WindowKind;
use serde::Serialize;

/// Discriminator for [`LimitEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RateExceeded,
    CostExceeded,
    SlowdownApplied,
    Allowed,
    Blocked,
    ValidationFailed,
    StoreUnavailable,
}

/// One event record. Serializes to the archive schema used by the
/// dashboard: epoch-millisecond timestamp, identity, endpoint key, and the
/// optional window/value/threshold triple for budget crossings.
#[derive(Debug, Clone, Serialize)]
pub struct LimitEvent {
    /// Epoch milliseconds at emission time.
    pub timestamp: i64,
    pub user: String,
    pub plan: String,
    /// Canonical endpoint key (`METHOD|PATH`).
    pub endpoint: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowKind>,
    /// Observed counter value when a threshold was involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// The cap that was hit (or would have been hit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl LimitEvent {
    /// A record with the window/value/threshold fields unset.
    pub fn new(event_type: EventType, user: &str, plan: &str, endpoint: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            user: user.to_string(),
            plan: plan.to_string(),
            endpoint: endpoint.to_string(),
            event_type,
            window: None,
            value: None,
            threshold: None,
        }
    }

    pub fn with_window(mut self, window: WindowKind, value: f64, threshold: f64) -> Self {
        self.window = Some(window);
        self.value = Some(value);
        self.threshold = Some(threshold);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_snake_case_type() {
        let event = LimitEvent::new(EventType::RateExceeded, "user-a", "free", "POST|/api/ask")
            .with_window(WindowKind::Minute, 11.0, 10.0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "rate_exceeded");
        assert_eq!(json["window"], "minute");
        assert_eq!(json["value"], 11.0);
        assert_eq!(json["threshold"], 10.0);
        assert_eq!(json["endpoint"], "POST|/api/ask");
    }

    #[test]
    fn optional_fields_are_omitted_when_unset() {
        let event = LimitEvent::new(EventType::Allowed, "user-a", "free", "GET|/api/ping");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("window").is_none());
        assert!(json.get("value").is_none());
        assert!(json.get("threshold").is_none());
    }
}
