//! Error taxonomy for the limiter.
//!
//! Admission-path failures are converted to verdicts and never bubble as
//! `Err` through the middleware; the variants here carry enough state to
//! render the corresponding HTTP response directly. Only [`LimitError::Config`]
//! is fatal, and only during construction.

use actix_web::http::header;
use actix_web::HttpResponse;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
    /// The identity hook produced an unusable (empty) user. Surfaced as 500.
    #[error("identity hook returned an empty user")]
    Identity,

    /// Invalid policy or wiring detected at construction time.
    #[error("invalid limiter configuration: {0}")]
    Config(String),

    /// Request-rate budget exhausted.
    #[error("rate limit exceeded, retry in {retry_after}s")]
    RateExceeded {
        retry_after: u64,
        upgrade_hint: Option<String>,
    },

    /// Spend budget exhausted.
    #[error("cost cap exceeded, retry in {retry_after}s")]
    CostExceeded {
        retry_after: u64,
        upgrade_hint: Option<String>,
    },

    /// Pre-flight validation rejected the prompt. Surfaced as 400 with
    /// suggested alternative models; no counters were consumed.
    #[error("prompt validation failed: {reason}")]
    Validation {
        reason: String,
        suggested_models: Vec<String>,
    },

    /// Counter store unreachable while the limiter is fail-closed.
    #[error("counter store unavailable")]
    StoreUnavailable,
}

fn exceeded_body(error: &str, retry_after: u64, upgrade_hint: &Option<String>) -> serde_json::Value {
    let mut body = json!({
        "error": error,
        "retryAfter": retry_after,
    });
    if let Some(hint) = upgrade_hint {
        body["upgradeHint"] = json!(hint);
    }
    body
}

impl actix_web::error::ResponseError for LimitError {
    fn error_response(&self) -> HttpResponse {
        match self {
            LimitError::Identity => HttpResponse::InternalServerError().json(json!({
                "error": "identity",
                "message": self.to_string(),
            })),
            LimitError::Config(msg) => HttpResponse::InternalServerError().json(json!({
                "error": "config",
                "message": msg,
            })),
            LimitError::RateExceeded { retry_after, upgrade_hint } => {
                HttpResponse::TooManyRequests()
                    .insert_header((header::RETRY_AFTER, retry_after.to_string()))
                    .json(exceeded_body("rate_exceeded", *retry_after, upgrade_hint))
            }
            LimitError::CostExceeded { retry_after, upgrade_hint } => {
                HttpResponse::TooManyRequests()
                    .insert_header((header::RETRY_AFTER, retry_after.to_string()))
                    .json(exceeded_body("cost_exceeded", *retry_after, upgrade_hint))
            }
            LimitError::Validation { reason, suggested_models } => {
                HttpResponse::BadRequest().json(json!({
                    "error": "validation_failed",
                    "reason": reason,
                    "suggestedModels": suggested_models,
                }))
            }
            LimitError::StoreUnavailable => {
                HttpResponse::ServiceUnavailable().json(json!({
                    "error": "store_unavailable",
                    "message": self.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::error::ResponseError;
    use actix_web::http::StatusCode;

    #[test]
    fn rate_exceeded_maps_to_429_with_retry_after() {
        let err = LimitError::RateExceeded {
            retry_after: 37,
            upgrade_hint: Some("upgrade to pro".to_string()),
        };
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            "37"
        );
    }

    #[test]
    fn upgrade_hint_is_omitted_when_absent() {
        let body = exceeded_body("cost_exceeded", 10, &None);
        assert!(body.get("upgradeHint").is_none());
        assert_eq!(body["error"], "cost_exceeded");
        assert_eq!(body["retryAfter"], 10);
    }

    #[test]
    fn validation_maps_to_400() {
        let err = LimitError::Validation {
            reason: "prompt exceeds context window".to_string(),
            suggested_models: vec!["gpt-4-turbo".to_string()],
        };
        assert_eq!(err.error_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn identity_maps_to_500() {
        assert_eq!(
            LimitError::Identity.error_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
