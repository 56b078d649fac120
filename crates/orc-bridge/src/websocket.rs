use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::event_bus::EventFilter;
use crate::http_api::ApiState;
use crate::protocol::EventKind;

/// Filter parameters for `GET /ws`. Comma-separated lists; anything omitted
/// matches everything.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct WsQuery {
    project: Option<String>,
    task: Option<String>,
    events: Option<String>,
}

impl WsQuery {
    fn into_filter(self) -> EventFilter {
        EventFilter {
            projects: split_csv(self.project),
            tasks: split_csv(self.task),
            kinds: split_csv(self.events)
                .iter()
                .filter_map(|raw| serde_json::from_value(serde_json::json!(raw)).ok())
                .collect::<Vec<EventKind>>(),
        }
    }
}

fn split_csv(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// WebSocket GET /ws -- real-time event streaming with heartbeat.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let filter = query.into_filter();
    ws.on_upgrade(move |socket| handle_ws(socket, state, filter))
}

/// Internal handler that forwards bus events to the socket until either side
/// closes. A 30s heartbeat ping keeps intermediaries from timing the
/// connection out.
async fn handle_ws(socket: WebSocket, state: Arc<ApiState>, filter: EventFilter) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let sub = state.event_bus.subscribe(filter);

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            // Forward events from the bus to the WebSocket client
            event = sub.recv() => {
                match event {
                    Some(event) => {
                        let json = serde_json::to_string(&*event).unwrap_or_default();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Heartbeat ping every 30s
            _ = heartbeat.tick() => {
                let ping = serde_json::json!({
                    "type": "ping",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                });
                if ws_tx.send(Message::Text(ping.to_string().into())).await.is_err() {
                    break;
                }
            }

            // Handle incoming messages from the client (pong, close, etc.)
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // ignore pongs and client text
                }
            }
        }
    }

    if sub.is_lagged() {
        tracing::warn!("websocket subscriber lagged; events were dropped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parses_csv_lists() {
        let q = WsQuery {
            project: Some("p1, p2".into()),
            task: None,
            events: Some("state,tokens".into()),
        };
        let filter = q.into_filter();
        assert_eq!(filter.projects, vec!["p1", "p2"]);
        assert!(filter.tasks.is_empty());
        assert_eq!(filter.kinds, vec![EventKind::State, EventKind::Tokens]);
    }

    #[test]
    fn unknown_event_names_are_ignored() {
        let q = WsQuery {
            project: None,
            task: None,
            events: Some("state,bogus".into()),
        };
        let filter = q.into_filter();
        assert_eq!(filter.kinds, vec![EventKind::State]);
    }
}
