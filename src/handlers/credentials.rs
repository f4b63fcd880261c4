// src/handlers/credentials.rs
//! API key status and selection

use crate::AppState;
use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct SelectKeyRequest {
    pub api_key: String,
}

/// GET /api/credentials - Whether a usable key is selected
pub async fn get_credentials(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": state.credentials.status() }))
}

/// POST /api/credentials - Select a new key
pub async fn select_credentials(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<SelectKeyRequest>,
) -> Response {
    let api_key = body.api_key.trim();
    if api_key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "API key must not be empty" })),
        )
            .into_response();
    }

    state.credentials.select(api_key.to_string()).await;
    Json(serde_json::json!({ "status": state.credentials.status() })).into_response()
}

pub fn credential_routes() -> Router {
    Router::new().route(
        "/api/credentials",
        get(get_credentials).post(select_credentials),
    )
}
