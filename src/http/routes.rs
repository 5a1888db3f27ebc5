//! Route handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use serde_json::{json, Value};

use super::gate::ClientIp;
use super::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "timestamp": Utc::now().to_rfc3339(),
        "environment": state.environment,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn list_items() -> &'static str {
    "Get items"
}

pub async fn create_item() -> &'static str {
    "Create item"
}

pub async fn test(client_ip: Option<Extension<ClientIp>>) -> Json<Value> {
    let ip = client_ip.map(|Extension(ClientIp(ip))| ip);
    Json(json!({
        "message": "API request successful",
        "timestamp": Utc::now().to_rfc3339(),
        "ip": ip,
    }))
}

pub async fn data() -> Json<Value> {
    Json(json!({
        "data": "Some sample data",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Route not found" })),
    )
}
