//! REST surface: `POST /agents/:id/locations`, `GET /agents/:id`,
//! `GET /agents`.

use crate::service::PresenceService;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

async fn track_handler(
    State(service): State<Arc<PresenceService>>,
    Path(agent_id): Path<String>,
    Json(body): Json<TrackRequest>,
) -> impl IntoResponse {
    match service
        .track(&agent_id, body.lat, body.lon, body.timestamp_ms, body.metadata)
        .await
    {
        Ok(sample) => (StatusCode::OK, Json(sample)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_agent_handler(
    State(service): State<Arc<PresenceService>>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    match service.get_agent_state(&agent_id).await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_agents_handler(State(service): State<Arc<PresenceService>>) -> impl IntoResponse {
    match service.get_all_agents().await {
        Ok(agents) => (StatusCode::OK, Json(agents)).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: presence_core::PresenceError) -> axum::response::Response {
    let status = match &err {
        presence_core::PresenceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        presence_core::PresenceError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

pub fn create_router(service: Arc<PresenceService>) -> Router {
    Router::new()
        .route("/agents/:id/locations", post(track_handler))
        .route("/agents/:id", get(get_agent_handler))
        .route("/agents", get(list_agents_handler))
        .route("/events", get(super::ws::ws_handler))
        .with_state(service)
}
