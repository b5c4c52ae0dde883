//! LimitRate demo gateway.
//!
//! A small API server showing the intended wiring of the limiter: settings
//! from disk, identity and plan from request headers, events to the log,
//! the status-inspection endpoint beside the protected routes, and an
//! outer per-IP governor as a coarse first line in front of the
//! plan-aware budgets.

use limitrate::config::settings::load_settings;
use limitrate::config::validation::ConfigValidator;
use limitrate::logs::logger::configure_logger;
use limitrate::middleware::limit::LimitRate;
use limitrate::models::settings::Settings;
use limitrate::routes::health;
use limitrate::routes::status::{configure_status, StatusHandler};

use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer};
use log::{error, info};
use tokio::signal;

async fn ask_handler(body: web::Json<serde_json::Value>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "echo": *body,
        "answer": "this endpoint is protected by per-plan budgets",
    }))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let config: Settings = load_settings().expect("failed to load settings");
    info!("starting limitrate gateway, {} plans configured", config.plans.len());

    let validation_result = ConfigValidator::validate_comprehensive(&config);
    if !validation_result.is_valid {
        error!("configuration validation failed:");
        for err in &validation_result.errors {
            error!("  - {}", err);
        }
        std::process::exit(1);
    }
    for warning in &validation_result.warnings {
        info!("config warning: {}", warning);
    }

    let limiter = LimitRate::builder(config)
        .identify_user(|req| {
            req.headers()
                .get("x-api-user")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .identify_plan(|req| {
            req.headers()
                .get("x-api-plan")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .upgrade_hint(|plan| match plan {
            "free" => Some("upgrade to pro for higher limits".to_string()),
            "pro" => Some("enterprise plans have custom budgets".to_string()),
            _ => None,
        })
        .on_event(|event| {
            info!(
                "limit event: {:?} user={} plan={} endpoint={}",
                event.event_type, event.user, event.plan, event.endpoint
            );
        })
        .build()
        .expect("invalid limiter configuration");

    let status_handler = StatusHandler::new(limiter.runtime());

    let host = std::env::var("LIMITRATE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("LIMITRATE_PORT")
        .unwrap_or_else(|_| "5900".to_string())
        .parse::<u16>()
        .unwrap_or(5900);

    // Coarse per-IP guard in front of the plan-aware limiter.
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(100)
        .burst_size(200)
        .finish()
        .unwrap();

    info!("listening on {}:{}", host, port);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(limiter.clone())
            .wrap(Governor::new(&governor_conf))
            .wrap(Logger::new(r#"%a "%r" %s %b %T"#))
            .configure(health::configure_health)
            .configure(|cfg| configure_status(cfg, status_handler.clone()))
            .route("/api/ask", web::post().to(ask_handler))
    })
    .bind((host.as_str(), port))?
    .run();

    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("server stopped gracefully"),
                Err(e) => error!("server error: {}", e),
            }
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal, stopping server");
        }
    }

    Ok(())
}
