mod handlers;
mod middleware;

pub use middleware::{ApiKey, RateLimiter, SecurityConfig, DEVICE_KEY_HEADER};

use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::service::VerificationService;

/// Router with authentication disabled.
pub fn create_router(service: VerificationService) -> Router {
    create_router_with_config(service, SecurityConfig::disabled())
}

pub fn create_router_with_config(service: VerificationService, config: SecurityConfig) -> Router {
    let mut protected = Router::new()
        // Roster
        .route("/students", get(handlers::list_students))
        .route("/students", post(handlers::create_student))
        .route("/students/{id}/attendance", get(handlers::student_attendance))
        // Sessions
        .route("/sessions", post(handlers::open_session))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/close", post(handlers::close_session))
        .route("/sessions/{id}/events", post(handlers::record_events))
        .route("/sessions/{id}/windows", get(handlers::session_verdicts))
        .route("/classes/{class_id}/sessions", get(handlers::list_class_sessions))
        // Ingest
        .route("/attendance", post(handlers::record_scan))
        .route("/attendance", get(handlers::list_scans))
        .route("/headcount", post(handlers::record_headcount))
        .route("/headcount", get(handlers::list_headcounts))
        // Verification
        .route("/verify/{class_id}", get(handlers::verify))
        .route("/headcounts/{class_id}", get(handlers::headcounts))
        .route("/history/{class_id}", get(handlers::history))
        .layer(from_fn_with_state(config.clone(), middleware::auth_middleware));

    if let Some(limiter) = config.rate_limiter.clone() {
        protected = protected.layer(from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    let api = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected);

    Router::new()
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&config)),
        )
        .with_state(service)
}

fn cors_layer(config: &SecurityConfig) -> CorsLayer {
    match &config.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match origin.parse() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    }
}
