//! Rate limiting middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use super::AppState;
use crate::ratelimit::{resolve_client_ip, ClientKey, Decision, WindowPolicy};

/// The resolved client address, attached to admitted requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Body of the response sent when a client is over its limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitExceeded {
    /// Error classification
    pub error: String,
    /// Human-readable description of the limit
    pub message: String,
    /// Seconds until the client's window closes
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
}

impl RateLimitExceeded {
    pub fn new(policy: WindowPolicy, retry_after: u64) -> Self {
        Self {
            error: "Too many requests".to_string(),
            message: format!(
                "Rate limit exceeded. Max {} requests per {} seconds.",
                policy.max_requests(),
                policy.window_secs()
            ),
            retry_after,
        }
    }
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, self.retry_after.to_string())],
            Json(self),
        )
            .into_response()
    }
}

/// Admit or reject a request according to its client's window.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = resolve_client_ip(request.headers(), remote_addr, state.trust_proxy);
    let key = ClientKey::new(&state.key_prefix, &ip);

    match state.limiter.decide(&key).await {
        Decision::Admit => {
            request.extensions_mut().insert(ClientIp(ip));
            next.run(request).await
        }
        Decision::Reject { retry_after_secs } => {
            debug!(client = %ip, retry_after_secs, "Rejecting request");
            RateLimitExceeded::new(state.limiter.policy(), retry_after_secs).into_response()
        }
    }
}

/// Run each request inside a span carrying a fresh request id.
pub async fn trace_request(request: Request, next: Next) -> Response {
    let span = info_span!(
        "request",
        request_id = %Uuid::new_v4(),
        method = %request.method(),
        path = %request.uri().path(),
    );

    async move {
        let response = next.run(request).await;
        debug!(status = response.status().as_u16(), "Request completed");
        response
    }
    .instrument(span)
    .await
}
