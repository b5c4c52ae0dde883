//! Status-inspection endpoint: peek-only budget visibility for frontends.
//!
//! Returns the caller's current usage against the tightest configured rate
//! window without mutating any counter, so a dashboard can poll it freely
//! without eating into the budget it displays. The handler shares the
//! middleware's runtime (same keyer, same resolver, same store), which is
//! what keeps the reported `remaining` consistent with enforcement.
//!
//! A process-local per-IP counter with a one-second window caps calls to
//! this endpoint. It is the one piece of global mutable state outside the
//! store, lives only as long as the handler, and never persists anywhere.

use crate::middleware::limit::LimitRuntime;
use crate::models::error::LimitError;
use crate::store::now_epoch;
use crate::utils::endpoint_key::endpoint_key;
use actix_web::{web, HttpRequest, HttpResponse};
use ahash::HashMap as AHashMap;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Entries kept in the guard map before an opportunistic sweep.
const GUARD_SWEEP_THRESHOLD: usize = 10_000;

/// Per-IP one-second counter bounding status-endpoint traffic.
struct PeekGuard {
    cap: u32,
    hits: Mutex<AHashMap<String, (u64, u32)>>,
}

impl PeekGuard {
    fn new(cap: u32) -> Self {
        Self {
            cap,
            hits: Mutex::new(AHashMap::default()),
        }
    }

    /// Counts one call from `ip` and reports whether it is within the cap.
    fn admit(&self, ip: &str) -> bool {
        let now = now_epoch();
        let mut hits = match self.hits.lock() {
            Ok(guard) => guard,
            // A poisoned guard map must not take the endpoint down.
            Err(poisoned) => poisoned.into_inner(),
        };
        if hits.len() > GUARD_SWEEP_THRESHOLD {
            hits.retain(|_, (second, _)| *second == now);
        }
        let entry = hits.entry(ip.to_string()).or_insert((now, 0));
        if entry.0 != now {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= self.cap
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Path (or route template) of the endpoint to inspect.
    pub path: Option<String>,
    /// HTTP method of the endpoint to inspect; defaults to `GET`.
    pub method: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    used: u64,
    limit: u64,
    remaining: u64,
    reset_in: u64,
    plan: String,
    percentage: u32,
}

/// `min(100, round(100 * used / limit))`, and `0` when the limit is zero.
fn percentage(used: u64, limit: u64) -> u32 {
    if limit == 0 {
        return 0;
    }
    let raw = (100.0 * used as f64 / limit as f64).round() as u64;
    raw.min(100) as u32
}

/// Handler for the status-inspection endpoint, sharing the middleware's
/// runtime.
pub struct StatusHandler {
    runtime: Arc<LimitRuntime>,
    guard: PeekGuard,
}

impl StatusHandler {
    pub fn new(runtime: Arc<LimitRuntime>) -> Arc<Self> {
        let cap = runtime.peek_cap_per_second;
        Arc::new(Self {
            runtime,
            guard: PeekGuard::new(cap),
        })
    }

    /// Answers one status query. Peek-only: no counter moves, however
    /// often this is called.
    pub async fn handle(
        &self,
        req: &HttpRequest,
        query: &StatusQuery,
    ) -> Result<HttpResponse, LimitError> {
        let ip = req
            .connection_info()
            .peer_addr()
            .unwrap_or("unknown")
            .to_string();
        if !self.guard.admit(&ip) {
            warn!("status endpoint cap hit for {}", ip);
            return Ok(HttpResponse::TooManyRequests().json(json!({
                "error": "status_rate_exceeded",
            })));
        }

        let Some(ref path) = query.path else {
            return Ok(HttpResponse::BadRequest().json(json!({
                "error": "missing_path",
                "message": "query parameter 'path' is required",
            })));
        };
        let method = query.method.as_deref().unwrap_or("GET");
        let key = endpoint_key(method, path, None);

        let user = self.runtime.identify_user(req)?;
        let plan = self.runtime.identify_plan(req);
        let policy = self.runtime.policies.resolve(&plan, &key);

        let view = self
            .runtime
            .engine
            .rate_status(policy, &user, &key)
            .await
            .map_err(|e| {
                warn!("status peek failed for user={} endpoint={}: {}", user, key, e);
                LimitError::StoreUnavailable
            })?;

        let body = match view {
            Some(view) => StatusBody {
                used: view.used,
                limit: view.limit,
                remaining: view.remaining,
                reset_in: view.reset_in,
                plan,
                percentage: percentage(view.used, view.limit),
            },
            // No rate policy on this endpoint: report an unlimited view.
            None => StatusBody {
                used: 0,
                limit: 0,
                remaining: 0,
                reset_in: 0,
                plan,
                percentage: 0,
            },
        };
        Ok(HttpResponse::Ok().json(body))
    }
}

async fn status_endpoint(
    handler: web::Data<StatusHandler>,
    req: HttpRequest,
    query: web::Query<StatusQuery>,
) -> Result<HttpResponse, LimitError> {
    handler.handle(&req, &query).await
}

/// Registers `GET /limits` backed by `handler`.
pub fn configure_status(cfg: &mut web::ServiceConfig, handler: Arc<StatusHandler>) {
    cfg.app_data(web::Data::from(handler))
        .route("/limits", web::get().to(status_endpoint));
}
