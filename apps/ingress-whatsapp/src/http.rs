//! HTTP surface of the ingress service.
//!
//! ```text
//! GET  /gateway/{usage}/{token}/update   subscription handshake
//! POST /gateway/{usage}/{token}/update   webhook delivery, always `200 {}`
//! GET  /healthz
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use security::SIGNATURE_HEADER;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::dispatch::{Dispatcher, UpdateRequest};

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route(
            "/gateway/{usage}/{token}/update",
            get(subscribe).post(receive),
        )
        .route("/healthz", get(healthz))
        .with_state(AppState { dispatcher })
}

#[derive(Debug, Deserialize)]
struct SubscribeQs {
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn subscribe(
    State(state): State<AppState>,
    Path((usage, token)): Path<(String, String)>,
    Query(q): Query<SubscribeQs>,
) -> impl IntoResponse {
    let echo = state
        .dispatcher
        .handle_subscription(
            &usage,
            &token,
            q.verify_token.as_deref(),
            q.challenge.as_deref(),
        )
        .await;
    (StatusCode::OK, echo.unwrap_or_default())
}

async fn receive(
    State(state): State<AppState>,
    Path((usage, token)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    state
        .dispatcher
        .handle_update(UpdateRequest {
            usage: &usage,
            token: &token,
            signature,
            body: &body,
        })
        .await;
    Json(json!({}))
}

async fn healthz() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
