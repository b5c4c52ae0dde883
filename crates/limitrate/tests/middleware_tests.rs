//! End-to-end middleware tests through Actix Web's test harness: header
//! emission, 429 shaping, slowdown timing, pre-flight rejection, the skip
//! hook, and the status-inspection endpoint.

use actix_web::body::to_bytes;
use actix_web::http::StatusCode;
use actix_web::{test, web, App, HttpResponse};
use limitrate::middleware::limit::LimitRate;
use limitrate::models::event::{EventType, LimitEvent};
use limitrate::models::settings::Settings;
use limitrate::routes::status::{configure_status, StatusHandler};
use limitrate::services::validator::{
    validate_prompt, PromptInput, Tokenizer, TokenizerError, ValidationRequest,
};
use limitrate::store::memory::MemoryStore;
use limitrate::store::Store;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;

async fn ask_handler() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "answer": 42 }))
}

fn settings(json: &str) -> Settings {
    serde_json::from_str(json).expect("test settings must parse")
}

fn free_plan_10_per_minute() -> Settings {
    settings(
        r#"{
            "version": 1,
            "plans": {
                "free": {
                    "endpoints": {
                        "POST|/api/ask": {
                            "rate": { "maxPerMinute": 10, "actionOnExceed": "block" }
                        }
                    }
                }
            }
        }"#,
    )
}

fn user_header_hook(req: &actix_web::HttpRequest) -> Option<String> {
    req.headers()
        .get("x-api-user")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn plan_header_hook(req: &actix_web::HttpRequest) -> Option<String> {
    req.headers()
        .get("x-api-plan")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn collecting_sink() -> (Arc<Mutex<Vec<LimitEvent>>>, impl Fn(&LimitEvent) + Send + Sync) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_in_sink = events.clone();
    (events, move |event: &LimitEvent| {
        events_in_sink.lock().unwrap().push(event.clone());
    })
}

#[actix_web::test]
async fn rate_headers_count_down_and_eleventh_request_is_429() {
    let limiter = LimitRate::builder(free_plan_10_per_minute())
        .identify_user(user_header_hook)
        .upgrade_hint(|plan| {
            (plan == "free").then(|| "upgrade to pro for higher limits".to_string())
        })
        .build()
        .unwrap();

    let app = test::init_service(
        App::new()
            .wrap(limiter.clone())
            .route("/api/ask", web::post().to(ask_handler)),
    )
    .await;

    for i in 0..10u64 {
        let req = test::TestRequest::post()
            .uri("/api/ask")
            .insert_header(("x-api-user", "user-a"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("ratelimit-limit").unwrap().to_str().unwrap(),
            "10"
        );
        let remaining: u64 = resp
            .headers()
            .get("ratelimit-remaining")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(remaining, 9 - i);
        let reset: u64 = resp
            .headers()
            .get("ratelimit-reset")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(reset >= 1 && reset <= 60);
    }

    let req = test::TestRequest::post()
        .uri("/api/ask")
        .insert_header(("x-api-user", "user-a"))
        .to_request();
    let err = test::try_call_service(&app, req)
        .await
        .expect_err("eleventh request must be denied");
    let resp = HttpResponse::from_error(err);
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = resp
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after <= 60);

    let body: Value = serde_json::from_slice(&to_bytes(resp.into_body()).await.unwrap()).unwrap();
    assert_eq!(body["error"], "rate_exceeded");
    assert!(body["retryAfter"].as_u64().unwrap() <= 60);
    assert_eq!(body["upgradeHint"], "upgrade to pro for higher limits");
}

#[actix_web::test]
async fn other_users_keep_their_own_budget() {
    let limiter = LimitRate::builder(free_plan_10_per_minute())
        .identify_user(user_header_hook)
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .wrap(limiter.clone())
            .route("/api/ask", web::post().to(ask_handler)),
    )
    .await;

    for _ in 0..10 {
        let req = test::TestRequest::post()
            .uri("/api/ask")
            .insert_header(("x-api-user", "user-a"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    // user-a is exhausted, user-b is untouched.
    let req = test::TestRequest::post()
        .uri("/api/ask")
        .insert_header(("x-api-user", "user-b"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("ratelimit-remaining").unwrap().to_str().unwrap(),
        "9"
    );
}

#[actix_web::test]
async fn slowdown_plan_delays_the_third_request() {
    let config = settings(
        r#"{
            "version": 1,
            "plans": {
                "free": {},
                "pro": {
                    "endpoints": {
                        "POST|/api/ask": {
                            "rate": {
                                "maxPerMinute": 2,
                                "actionOnExceed": "slowdown",
                                "slowdownMs": 500
                            }
                        }
                    }
                }
            }
        }"#,
    );
    let (events, sink) = collecting_sink();
    let limiter = LimitRate::builder(config)
        .identify_user(user_header_hook)
        .identify_plan(plan_header_hook)
        .on_event(sink)
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .wrap(limiter.clone())
            .route("/api/ask", web::post().to(ask_handler)),
    )
    .await;

    let request = || {
        test::TestRequest::post()
            .uri("/api/ask")
            .insert_header(("x-api-user", "pro-user"))
            .insert_header(("x-api-plan", "pro"))
            .to_request()
    };

    assert_eq!(test::call_service(&app, request()).await.status(), StatusCode::OK);
    assert_eq!(test::call_service(&app, request()).await.status(), StatusCode::OK);

    let started = Instant::now();
    let resp = test::call_service(&app, request()).await;
    let elapsed = started.elapsed();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        elapsed.as_millis() >= 500,
        "third request should be delayed, took {:?}",
        elapsed
    );

    let slowdowns = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type == EventType::SlowdownApplied)
        .count();
    assert_eq!(slowdowns, 1);
}

#[actix_web::test]
async fn allow_and_log_returns_normal_status_and_one_event() {
    let config = settings(
        r#"{
            "version": 1,
            "basePlan": "enterprise",
            "plans": {
                "enterprise": {
                    "defaults": {
                        "rate": { "maxPerMinute": 1, "actionOnExceed": "allow-and-log" }
                    }
                }
            }
        }"#,
    );
    let (events, sink) = collecting_sink();
    let limiter = LimitRate::builder(config)
        .identify_user(user_header_hook)
        .on_event(sink)
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .wrap(limiter.clone())
            .route("/api/ask", web::post().to(ask_handler)),
    )
    .await;

    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri("/api/ask")
            .insert_header(("x-api-user", "ent-1"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    let collected = events.lock().unwrap();
    let exceeded = collected
        .iter()
        .filter(|e| e.event_type == EventType::RateExceeded)
        .count();
    assert_eq!(exceeded, 1);
    // Both terminal decisions were admissions.
    let allowed = collected
        .iter()
        .filter(|e| e.event_type == EventType::Allowed)
        .count();
    assert_eq!(allowed, 2);
}

#[actix_web::test]
async fn skip_hook_bypasses_the_limiter() {
    let limiter = LimitRate::builder(free_plan_10_per_minute())
        .identify_user(user_header_hook)
        .skip(|req| req.headers().contains_key("x-internal"))
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .wrap(limiter.clone())
            .route("/api/ask", web::post().to(ask_handler)),
    )
    .await;

    // Far more requests than the budget allows, all skipped.
    for _ in 0..20 {
        let req = test::TestRequest::post()
            .uri("/api/ask")
            .insert_header(("x-api-user", "user-a"))
            .insert_header(("x-internal", "1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        // Skipped requests carry no advisory headers.
        assert!(resp.headers().get("ratelimit-limit").is_none());
    }
}

struct FixedTokenizer(u32);

impl Tokenizer for FixedTokenizer {
    fn count_tokens(&self, _text: &str) -> Result<u32, TokenizerError> {
        Ok(self.0)
    }
}

#[actix_web::test]
async fn preflight_rejection_is_400_and_consumes_no_budget() {
    let store = Arc::new(MemoryStore::new());
    let (events, sink) = collecting_sink();
    let limiter = LimitRate::builder(free_plan_10_per_minute())
        .store(store.clone())
        .identify_user(user_header_hook)
        .on_event(sink)
        .preflight(|req| {
            let tokens: u32 = req
                .headers()
                .get("x-prompt-tokens")?
                .to_str()
                .ok()?
                .parse()
                .ok()?;
            let request = ValidationRequest {
                model: "gpt-4",
                input: PromptInput::Text(""),
                max_output_tokens: None,
                custom_limits: None,
            };
            validate_prompt(&request, &FixedTokenizer(tokens)).ok()
        })
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .wrap(limiter.clone())
            .route("/api/ask", web::post().to(ask_handler)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/ask")
        .insert_header(("x-api-user", "user-a"))
        .insert_header(("x-prompt-tokens", "200000"))
        .to_request();
    let err = test::try_call_service(&app, req)
        .await
        .expect_err("oversized prompt must be rejected");
    let resp = HttpResponse::from_error(err);
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&to_bytes(resp.into_body()).await.unwrap()).unwrap();
    assert_eq!(body["error"], "validation_failed");
    let suggestions = body["suggestedModels"].as_array().unwrap();
    assert!(!suggestions.is_empty());

    // No counter was touched.
    let snap = store
        .peek_rate("rate:user-a:POST|/api/ask", 10, 60)
        .await
        .unwrap();
    assert_eq!(snap.current, 0);

    let validation_events = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type == EventType::ValidationFailed)
        .count();
    assert_eq!(validation_events, 1);

    // A fitting prompt passes straight through.
    let req = test::TestRequest::post()
        .uri("/api/ask")
        .insert_header(("x-api-user", "user-a"))
        .insert_header(("x-prompt-tokens", "1000"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
}

#[actix_web::test]
async fn status_endpoint_reports_usage_without_consuming_it() {
    let config = settings(
        r#"{
            "version": 1,
            "plans": {
                "free": {
                    "endpoints": {
                        "POST|/api/ask": {
                            "rate": { "maxPerMinute": 50, "actionOnExceed": "block" }
                        }
                    }
                }
            }
        }"#,
    );
    let limiter = LimitRate::builder(config)
        .identify_user(user_header_hook)
        .build()
        .unwrap();
    let status = StatusHandler::new(limiter.runtime());
    let app = test::init_service(
        App::new()
            .wrap(limiter.clone())
            .configure(|cfg| configure_status(cfg, status.clone()))
            .route("/api/ask", web::post().to(ask_handler)),
    )
    .await;

    for _ in 0..3 {
        let req = test::TestRequest::post()
            .uri("/api/ask")
            .insert_header(("x-api-user", "user-a"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    // Ten status reads in a row: same answer every time, nothing consumed.
    for _ in 0..10 {
        let req = test::TestRequest::get()
            .uri("/limits?path=/api/ask&method=POST")
            .insert_header(("x-api-user", "user-a"))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["used"], 3);
        assert_eq!(body["limit"], 50);
        assert_eq!(body["remaining"], 47);
        assert_eq!(body["percentage"], 6);
        assert_eq!(body["plan"], "free");
        assert!(body["resetIn"].as_u64().unwrap() <= 60);
    }
}

#[actix_web::test]
async fn status_endpoint_requires_a_path() {
    let limiter = LimitRate::builder(free_plan_10_per_minute())
        .identify_user(user_header_hook)
        .build()
        .unwrap();
    let status = StatusHandler::new(limiter.runtime());
    let app = test::init_service(
        App::new().configure(|cfg| configure_status(cfg, status.clone())),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/limits")
        .insert_header(("x-api-user", "user-a"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn unpoliced_endpoints_pass_without_headers() {
    let limiter = LimitRate::builder(free_plan_10_per_minute())
        .identify_user(user_header_hook)
        .build()
        .unwrap();
    let app = test::init_service(
        App::new()
            .wrap(limiter.clone())
            .route("/api/other", web::post().to(ask_handler)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/other")
        .insert_header(("x-api-user", "user-a"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("ratelimit-limit").is_none());
}
