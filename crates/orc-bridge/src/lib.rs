//! orc-bridge -- the event plane: typed orchestration events, an in-process
//! pub/sub bus with per-subscriber bounded buffers, and the axum WebSocket
//! endpoint that streams events to UI clients.

pub mod event_bus;
pub mod http_api;
pub mod protocol;
pub mod websocket;
