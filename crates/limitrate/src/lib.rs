//! # LimitRate
//!
//! Dual-budget HTTP rate limiting middleware for multi-tenant API
//! backends built on Actix Web. Every request is gated against two
//! orthogonal budgets per tenant: a **request-rate** budget (calls per
//! rolling window) and a **cost** budget (monetary units per rolling
//! window), with per-plan, per-endpoint policies and pluggable counter
//! storage.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use actix_web::{web, App, HttpResponse, HttpServer};
//! use limitrate::middleware::limit::LimitRate;
//! use limitrate::routes::status::{configure_status, StatusHandler};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let settings = limitrate::config::settings::load_settings()
//!         .expect("failed to load configuration");
//!
//!     let limiter = LimitRate::builder(settings)
//!         .identify_user(|req| {
//!             req.headers()
//!                 .get("x-api-user")
//!                 .and_then(|v| v.to_str().ok())
//!                 .map(str::to_string)
//!         })
//!         .identify_plan(|req| {
//!             req.headers()
//!                 .get("x-api-plan")
//!                 .and_then(|v| v.to_str().ok())
//!                 .map(str::to_string)
//!         })
//!         .on_event(|event| log::info!("limit event: {:?}", event.event_type))
//!         .build()
//!         .expect("invalid limiter configuration");
//!
//!     let status = StatusHandler::new(limiter.runtime());
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(limiter.clone())
//!             .configure(|cfg| configure_status(cfg, status.clone()))
//!             .route("/api/ask", web::post().to(|| async { HttpResponse::Ok().finish() }))
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Policy resolution
//! Requests map to a `(user, plan, endpoint-key)` tuple. The endpoint key
//! is the canonical `METHOD|PATH` string, preferring the route template so
//! `/users/42` and `/users/43` share one budget. Resolution is
//! winner-takes-all: an endpoint entry beats the plan's defaults and is
//! never merged with them.
//!
//! ### Peek / commit duality
//! Admission runs two passes over the [`store::Store`]: a non-mutating
//! peek of every configured window, then an unconditional atomic commit
//! once nothing block-worthy was seen. The status endpoint uses the same
//! peek on the same keys, so the `remaining` a frontend displays can never
//! drift from what enforcement sees.
//!
//! ### Actions
//! Each budget axis carries its own action on exceed: `block` (429 with
//! `Retry-After`), `slowdown` (admit after a delay), or `allow-and-log`
//! (admit and emit an event). Verdicts from multiple windows merge under
//! strict precedence `block ≻ slowdown ≻ allow-and-log ≻ allow`.
//!
//! ### Fail-open / fail-closed
//! Store outages resolve per configuration (default: fail-open with a
//! `store_unavailable` event). Contract violations are fatal at startup
//! and degrade to fail-open at runtime.
//!
//! ## Module Organization
//!
//! - **[`config`]** - Configuration loading and comprehensive validation
//! - **[`models`]** - Policy tree, verdicts, events, errors, settings
//! - **[`services`]** - Resolver, limiter engine, validator, emitter
//! - **[`store`]** - Store abstraction, memory and shared backends
//! - **[`middleware`]** - The Actix Web middleware and its builder
//! - **[`routes`]** - Status-inspection and health handlers
//! - **[`utils`]** - Endpoint keying and pattern compilation
//! - **[`logs`]** - Logging configuration
//!
//! ## Environment Variables
//!
//! - `LIMITRATE_CONFIG_PATH`: configuration file path (default
//!   `./limitrate.json`)
//! - `RUST_LOG`: log level filtering
//! - `NO_COLOR`: disable colored log output

pub mod config;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod utils;
