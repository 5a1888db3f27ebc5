//! HTTP surface: the rate limiting gate and the routes behind it.

mod gate;
mod routes;
mod server;

use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Router};

use crate::config::FloodgateConfig;
use crate::ratelimit::RateLimiter;

pub use gate::{ClientIp, RateLimitExceeded};
pub use server::HttpServer;

/// State shared by every request handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The rate limiter guarding `/api`
    pub limiter: RateLimiter,
    /// Namespace for client keys in the counter store
    pub key_prefix: String,
    /// Whether forwarding headers identify the client
    pub trust_proxy: bool,
    /// Deployment environment, reported by `/health`
    pub environment: String,
}

impl AppState {
    /// Build the state from the loaded configuration.
    pub fn new(limiter: RateLimiter, config: &FloodgateConfig) -> Self {
        Self {
            limiter,
            key_prefix: config.rate_limiting.key_prefix.clone(),
            trust_proxy: config.server.trust_proxy,
            environment: config.environment.clone(),
        }
    }
}

/// Build the application router.
///
/// Everything under `/api` passes through the rate limiting gate, unknown
/// `/api` paths included; `/health` and other routes do not.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/items", get(routes::list_items).post(routes::create_item))
        .route("/test", get(routes::test))
        .route("/data", get(routes::data))
        .fallback(routes::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), gate::rate_limit));

    Router::new()
        .route("/health", get(routes::health))
        .nest("/api", api)
        .fallback(routes::not_found)
        .layer(middleware::from_fn(gate::trace_request))
        .with_state(state)
}
