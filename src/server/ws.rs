//! Run event stream: `GET /ws`, optionally narrowed with `?run_id=N`.

use std::time::Duration;

use axum::{
    extract::Query,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::RunEvent;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before the connection counts as dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub run_id: Option<i64>,
}

impl EventFilter {
    /// Whether a serialized event should reach this subscriber. Events that
    /// fail to parse only reach unfiltered subscribers.
    pub fn admits(&self, event: &str) -> bool {
        match self.run_id {
            None => true,
            Some(run_id) => serde_json::from_str::<RunEvent>(event).is_ok_and(|e| e.run_id() == run_id),
        }
    }
}

pub async fn run_events_handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<EventFilter>,
    tx: broadcast::Sender<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, filter, tx))
}

async fn handle_socket(socket: WebSocket, filter: EventFilter, tx: broadcast::Sender<String>) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    debug!(run_id = ?filter.run_id, "run event subscriber connected");
    run_socket_loop(sender, receiver, rx, &filter).await;
    debug!(run_id = ?filter.run_id, "run event subscriber disconnected");
}

/// Forward matching run events to one client, with ping/pong keepalive.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    filter: &EventFilter,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick fires immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) if !filter.admits(&msg) => {}
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "subscriber lagged behind run events");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(run_id: i64) -> String {
        serde_json::to_string(&RunEvent::PhaseCompleted {
            run_id,
            phase: "quality_gate".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_unfiltered_subscriber_gets_everything() {
        let filter = EventFilter::default();
        assert!(filter.admits(&event(1)));
        assert!(filter.admits("not json"));
    }

    #[test]
    fn test_run_filter_drops_other_runs() {
        let filter = EventFilter { run_id: Some(7) };
        assert!(filter.admits(&event(7)));
        assert!(!filter.admits(&event(8)));
        assert!(!filter.admits("not json"));
    }
}
