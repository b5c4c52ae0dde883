//! The LimitRate middleware: dual-budget admission for Actix Web.
//!
//! Gates every request against the resolved plan's request-rate and cost
//! budgets. Identity, plan, cost estimation, pre-flight validation, the
//! upgrade hint, and the event sink are all caller-supplied hooks attached
//! through [`LimitRateBuilder`]; the policy tree and store selection come
//! from [`Settings`]. The configuration is captured once at `build()` and
//! is immutable afterwards; replacing configuration means replacing the
//! middleware at the host-framework layer.
//!
//! # Examples
//!
//! ```rust,no_run
//! use actix_web::{web, App, HttpResponse, HttpServer};
//! use limitrate::middleware::limit::LimitRate;
//! use limitrate::models::settings::Settings;
//!
//! # fn settings() -> Settings {
//! #     serde_json::from_str(r#"{"version":1,"plans":{"free":{"defaults":{"rate":{"maxPerMinute":60}}}}}"#).unwrap()
//! # }
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let limiter = LimitRate::builder(settings())
//!         .identify_user(|req| {
//!             req.headers()
//!                 .get("x-api-user")
//!                 .and_then(|v| v.to_str().ok())
//!                 .map(str::to_string)
//!         })
//!         .build()
//!         .expect("invalid limiter configuration");
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(limiter.clone())
//!             .route("/api/ask", web::post().to(|| async { HttpResponse::Ok().finish() }))
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```

use crate::models::error::LimitError;
use crate::models::event::{EventType, LimitEvent};
use crate::models::policy::EndpointPolicy;
use crate::models::settings::{Settings, StoreSettings};
use crate::models::verdict::{BlockReason, RateHeaders, Verdict};
use crate::services::emitter::{EventEmitter, EventSink};
use crate::services::limiter::{AdmissionContext, LimiterEngine};
use crate::services::resolver::PolicySet;
use crate::services::validator::ValidationOutcome;
use crate::store::memory::MemoryStore;
use crate::store::shared::SharedStore;
use crate::store::Store;
use crate::utils::endpoint_key::endpoint_key;

use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{Error as ActixError, HttpRequest};
use futures::future::{LocalBoxFuture, Ready};
use log::debug;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{sleep, Duration};

/// Extracts an identity string from a request. `None` falls through to the
/// next link of the fallback chain.
pub type IdentityFn = Arc<dyn Fn(&HttpRequest) -> Option<String> + Send + Sync>;

/// Estimates this request's cost in monetary units. Called at most once
/// per request, only when the resolved policy has a cost axis without a
/// fixed `perRequest` amount.
pub type CostEstimatorFn = Arc<dyn Fn(&HttpRequest) -> f64 + Send + Sync>;

/// Maps a plan name to the optional upgrade hint included in 429 bodies.
pub type UpgradeHintFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Bypasses the middleware entirely when it returns `true`.
pub type SkipFn = Arc<dyn Fn(&HttpRequest) -> bool + Send + Sync>;

/// Pre-flight check run before any budget is touched. `Some(outcome)` with
/// `valid == false` rejects the request with a 400 and leaves every
/// counter untouched; `None` means the check did not apply.
pub type PreflightFn = Arc<dyn Fn(&HttpRequest) -> Option<ValidationOutcome> + Send + Sync>;

/// Everything the middleware (and the status endpoint) needs at request
/// time. Built once, shared via `Arc`, never mutated.
pub struct LimitRuntime {
    pub(crate) policies: PolicySet,
    pub(crate) engine: LimiterEngine,
    pub(crate) emitter: EventEmitter,
    pub(crate) base_plan: String,
    pub(crate) trust_proxy: bool,
    pub(crate) peek_cap_per_second: u32,
    identify_user: Option<IdentityFn>,
    identify_plan: Option<IdentityFn>,
    estimate_cost: Option<CostEstimatorFn>,
    upgrade_hint: Option<UpgradeHintFn>,
    skip: Option<SkipFn>,
    preflight: Option<PreflightFn>,
}

impl LimitRuntime {
    /// Resolves the user identity. Chain: hook result → network peer
    /// address (forwarded-for when `trust_proxy`) → `"anonymous"`. A hook
    /// that returns an empty string is a hard identity failure.
    pub(crate) fn identify_user(&self, req: &HttpRequest) -> Result<String, LimitError> {
        if let Some(hook) = &self.identify_user {
            match hook(req) {
                Some(user) if !user.trim().is_empty() => return Ok(user),
                Some(_) => return Err(LimitError::Identity),
                None => {}
            }
        }
        let conn = req.connection_info();
        let peer = if self.trust_proxy {
            conn.realip_remote_addr()
        } else {
            conn.peer_addr()
        };
        Ok(peer.map(str::to_string).unwrap_or_else(|| "anonymous".to_string()))
    }

    /// Resolves the plan name; unknown and missing plans collapse to the
    /// base plan.
    pub(crate) fn identify_plan(&self, req: &HttpRequest) -> String {
        self.identify_plan
            .as_ref()
            .and_then(|hook| hook(req))
            .filter(|plan| !plan.trim().is_empty())
            .unwrap_or_else(|| self.base_plan.clone())
    }

    /// Cost of this request under `policy`: the fixed `perRequest` amount
    /// when configured, else the estimator hook.
    pub(crate) fn estimated_cost(&self, policy: &EndpointPolicy, req: &HttpRequest) -> Option<f64> {
        let cost = policy.cost.as_ref()?;
        if let Some(amount) = cost.per_request {
            return Some(amount);
        }
        Some(self.estimate_cost.as_ref().map(|hook| hook(req)).unwrap_or(0.0))
    }

    pub(crate) fn upgrade_hint_for(&self, plan: &str) -> Option<String> {
        self.upgrade_hint.as_ref().and_then(|hook| hook(plan))
    }
}

impl std::fmt::Debug for LimitRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitRuntime")
            .field("base_plan", &self.base_plan)
            .field("trust_proxy", &self.trust_proxy)
            .finish()
    }
}

/// Builder for [`LimitRate`]. Settings carry the policy tree; hooks carry
/// the code-level collaborators.
pub struct LimitRateBuilder {
    settings: Settings,
    store: Option<Arc<dyn Store>>,
    identify_user: Option<IdentityFn>,
    identify_plan: Option<IdentityFn>,
    estimate_cost: Option<CostEstimatorFn>,
    upgrade_hint: Option<UpgradeHintFn>,
    skip: Option<SkipFn>,
    preflight: Option<PreflightFn>,
    sink: Option<EventSink>,
}

impl LimitRateBuilder {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            store: None,
            identify_user: None,
            identify_plan: None,
            estimate_cost: None,
            upgrade_hint: None,
            skip: None,
            preflight: None,
            sink: None,
        }
    }

    /// Overrides the store selected by the settings file.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn identify_user<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.identify_user = Some(Arc::new(hook));
        self
    }

    pub fn identify_plan<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.identify_plan = Some(Arc::new(hook));
        self
    }

    pub fn cost_estimator<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpRequest) -> f64 + Send + Sync + 'static,
    {
        self.estimate_cost = Some(Arc::new(hook));
        self
    }

    pub fn upgrade_hint<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.upgrade_hint = Some(Arc::new(hook));
        self
    }

    pub fn skip<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(hook));
        self
    }

    pub fn preflight<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HttpRequest) -> Option<ValidationOutcome> + Send + Sync + 'static,
    {
        self.preflight = Some(Arc::new(hook));
        self
    }

    pub fn on_event<F>(mut self, sink: F) -> Self
    where
        F: Fn(&LimitEvent) + Send + Sync + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Validates the configuration and assembles the middleware. The only
    /// fatal error path in the crate: everything after `build()` converts
    /// failures into verdicts instead.
    pub fn build(self) -> Result<LimitRate, LimitError> {
        self.settings.validate().map_err(LimitError::Config)?;

        // A cost axis without a fixed amount needs the estimator hook,
        // otherwise every request would count as zero spend.
        if self.estimate_cost.is_none() {
            for (plan_name, plan) in &self.settings.plans {
                let all_policies = plan
                    .endpoints
                    .iter()
                    .map(|(key, policy)| (key.as_str(), policy))
                    .chain(plan.defaults.as_ref().map(|d| ("defaults", d)));
                for (key, policy) in all_policies {
                    if let Some(cost) = &policy.cost {
                        if cost.per_request.is_none() {
                            return Err(LimitError::Config(format!(
                                "plan '{}', '{}': cost policy without perRequest requires a cost estimator",
                                plan_name, key
                            )));
                        }
                    }
                }
            }
        }

        let policies = PolicySet::new(&self.settings.plans, &self.settings.base_plan)?;
        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => match &self.settings.store {
                StoreSettings::Memory => Arc::new(MemoryStore::new()),
                StoreSettings::Shared { url, token } => Arc::new(
                    SharedStore::new(url, token)
                        .map_err(|e| LimitError::Config(e.to_string()))?,
                ),
            },
        };

        let emitter = EventEmitter::new(self.sink);
        let engine = LimiterEngine::new(
            store,
            self.settings.fail_open,
            self.settings.default_slowdown_ms,
            emitter.clone(),
        );

        Ok(LimitRate {
            runtime: Arc::new(LimitRuntime {
                policies,
                engine,
                emitter,
                base_plan: self.settings.base_plan.clone(),
                trust_proxy: self.settings.trust_proxy,
                peek_cap_per_second: self.settings.peek_cap_per_second,
                identify_user: self.identify_user,
                identify_plan: self.identify_plan,
                estimate_cost: self.estimate_cost,
                upgrade_hint: self.upgrade_hint,
                skip: self.skip,
                preflight: self.preflight,
            }),
        })
    }
}

/// Middleware factory. Clone freely; all clones share one runtime and one
/// store.
#[derive(Clone)]
pub struct LimitRate {
    runtime: Arc<LimitRuntime>,
}

impl LimitRate {
    pub fn builder(settings: Settings) -> LimitRateBuilder {
        LimitRateBuilder::new(settings)
    }

    /// Shared runtime handle, used to construct the status-inspection
    /// handler over the same policies and store.
    pub fn runtime(&self) -> Arc<LimitRuntime> {
        self.runtime.clone()
    }
}

impl<S, B> Transform<S, ServiceRequest> for LimitRate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Transform = LimitRateMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        futures::future::ready(Ok(LimitRateMiddleware {
            service: Arc::new(service),
            runtime: self.runtime.clone(),
        }))
    }
}

/// Per-worker middleware instance.
pub struct LimitRateMiddleware<S> {
    service: Arc<S>,
    runtime: Arc<LimitRuntime>,
}

impl<S, B> Service<ServiceRequest> for LimitRateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let runtime = self.runtime.clone();

        Box::pin(async move {
            if let Some(skip) = runtime.skip.as_ref() {
                if skip(req.request()) {
                    return service.call(req).await;
                }
            }

            let key = endpoint_key(
                req.method().as_str(),
                req.path(),
                req.match_pattern().as_deref(),
            );

            let user = match runtime.identify_user(req.request()) {
                Ok(user) => user,
                Err(err) => {
                    runtime.emitter.emit(LimitEvent::new(
                        EventType::Blocked,
                        "unknown",
                        &runtime.base_plan,
                        &key,
                    ));
                    return Err(err.into());
                }
            };
            let plan = runtime.identify_plan(req.request());

            // Pre-flight runs before any budget is touched; a rejection
            // consumes no counters.
            if let Some(preflight) = runtime.preflight.as_ref() {
                if let Some(outcome) = preflight(req.request()) {
                    if !outcome.valid {
                        let mut event =
                            LimitEvent::new(EventType::ValidationFailed, &user, &plan, &key);
                        event.value = Some(f64::from(outcome.input_tokens));
                        event.threshold = outcome.max_input_tokens.map(f64::from);
                        runtime.emitter.emit(event);
                        return Err(LimitError::Validation {
                            reason: outcome
                                .reason
                                .unwrap_or_else(|| "prompt validation failed".to_string()),
                            suggested_models: outcome.suggested_models,
                        }
                        .into());
                    }
                }
            }

            let policy = runtime.policies.resolve(&plan, &key);
            let estimated_cost = runtime.estimated_cost(policy, req.request());
            let ctx = AdmissionContext {
                user: &user,
                plan: &plan,
                endpoint_key: &key,
                estimated_cost,
            };
            let admission = runtime.engine.admit(policy, &ctx).await;

            match admission.verdict {
                Verdict::Blocked { reason, retry_after } => {
                    debug!("blocked user={} plan={} endpoint={}: {:?}", user, plan, key, reason);
                    runtime
                        .emitter
                        .emit(LimitEvent::new(EventType::Blocked, &user, &plan, &key));
                    let upgrade_hint = runtime.upgrade_hint_for(&plan);
                    let err = match reason {
                        BlockReason::RateExceeded => LimitError::RateExceeded {
                            retry_after,
                            upgrade_hint,
                        },
                        BlockReason::CostExceeded => LimitError::CostExceeded {
                            retry_after,
                            upgrade_hint,
                        },
                        BlockReason::StoreUnavailable => LimitError::StoreUnavailable,
                    };
                    Err(err.into())
                }
                Verdict::Delayed(delay_ms) => {
                    runtime
                        .emitter
                        .emit(LimitEvent::new(EventType::SlowdownApplied, &user, &plan, &key));
                    let headers = admission.headers;
                    sleep(Duration::from_millis(delay_ms)).await;
                    let mut res = service.call(req).await?;
                    apply_rate_headers(&mut res, headers);
                    Ok(res)
                }
                Verdict::Allow | Verdict::AllowLogged => {
                    runtime
                        .emitter
                        .emit(LimitEvent::new(EventType::Allowed, &user, &plan, &key));
                    let headers = admission.headers;
                    let mut res = service.call(req).await?;
                    apply_rate_headers(&mut res, headers);
                    Ok(res)
                }
            }
        })
    }
}

/// Advisory `RateLimit-*` headers on admitted responses.
fn apply_rate_headers<B>(res: &mut ServiceResponse<B>, headers: Option<RateHeaders>) {
    let Some(headers) = headers else { return };
    let entries = [
        (HeaderName::from_static("ratelimit-limit"), headers.limit),
        (HeaderName::from_static("ratelimit-remaining"), headers.remaining),
        (HeaderName::from_static("ratelimit-reset"), headers.reset_in),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            res.headers_mut().insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::{Action, CostPolicy, PlanPolicy, RatePolicy};
    use std::collections::HashMap;

    fn settings_with_cost(per_request: Option<f64>) -> Settings {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "POST|/api/ask".to_string(),
            EndpointPolicy {
                rate: Some(RatePolicy {
                    max_per_minute: Some(10),
                    max_per_hour: None,
                    max_per_day: None,
                    action_on_exceed: Action::Block,
                    slowdown_ms: None,
                }),
                cost: Some(CostPolicy {
                    per_request,
                    hourly_cap: Some(0.10),
                    daily_cap: None,
                    action_on_exceed: Action::Block,
                }),
            },
        );
        let mut plans = HashMap::new();
        plans.insert(
            "free".to_string(),
            PlanPolicy {
                endpoints,
                defaults: None,
            },
        );
        serde_json::from_value(serde_json::json!({
            "version": 1,
            "plans": serde_json::to_value(&plans).unwrap(),
        }))
        .unwrap()
    }

    #[test]
    fn build_rejects_cost_policy_without_estimator_or_fixed_amount() {
        let err = LimitRate::builder(settings_with_cost(None)).build();
        assert!(matches!(err, Err(LimitError::Config(_))));
    }

    #[test]
    fn build_accepts_fixed_per_request_cost() {
        assert!(LimitRate::builder(settings_with_cost(Some(0.03))).build().is_ok());
    }

    #[test]
    fn build_accepts_estimator_in_place_of_fixed_amount() {
        let limiter = LimitRate::builder(settings_with_cost(None))
            .cost_estimator(|_req| 0.02)
            .build();
        assert!(limiter.is_ok());
    }
}
