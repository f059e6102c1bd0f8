//! Thin peripheral HTTP/WebSocket gateway. Translates REST/WebSocket calls
//! into [`crate::service::PresenceService`] calls; carries no decision
//! logic of its own.

mod routes;
mod ws;

use crate::service::PresenceService;
use axum::Router;
use std::sync::Arc;

pub fn routes(service: Arc<PresenceService>) -> Router {
    routes::create_router(service)
}
