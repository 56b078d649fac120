use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::event_bus::EventBus;
use crate::websocket::ws_handler;

/// Shared state behind the HTTP surface.
pub struct ApiState {
    pub event_bus: EventBus,
}

impl ApiState {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }
}

/// Build the router: the event stream plus a liveness probe.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_builds() {
        let state = Arc::new(ApiState::new(EventBus::new()));
        let _router = router(state);
    }
}
