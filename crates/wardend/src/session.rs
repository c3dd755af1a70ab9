//! One live stream session over a WebSocket.
//!
//! A session moves Connecting → Open → Closed. While open it multiplexes
//! two event sources: frames from the client and cache-invalidation
//! notices from the background worker. Frame failures are reported to
//! this client only and never close the session; the transport going
//! away does.

use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Deserialize)]
struct FramePayload {
    frame: Option<String>,
}

pub async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Joining the broadcast group and loading the cache completes the
    // Connecting → Open transition.
    let mut reload_rx = state.reload_tx.subscribe();
    if let Err(err) = state.cache.reload().await {
        tracing::warn!(error = %err, "initial cache load failed; session starts with previous snapshot");
    }
    tracing::info!("stream session open");

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = handle_frame_message(&state, &text).await else {
                        continue;
                    };
                    if sender.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong: ignored
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "stream transport error");
                    break;
                }
            },

            notice = reload_rx.recv() => match notice {
                Ok(notice) => {
                    if let Err(err) = state.cache.reload().await {
                        tracing::error!(error = %err, "cache reload after invalidation failed");
                    }
                    let update = status_update(&notice.message);
                    if sender.send(Message::Text(update.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Missed notices collapse into one reload.
                    tracing::warn!(skipped, "session lagged behind invalidation broadcasts; reloading");
                    if let Err(err) = state.cache.reload().await {
                        tracing::error!(error = %err, "cache reload after lag failed");
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    // Dropping the broadcast receiver leaves the group.
    tracing::info!("stream session closed");
}

/// Notice sent to the client after a cache reload.
fn status_update(message: &str) -> serde_json::Value {
    json!({ "type": "status_update", "message": message })
}

/// Process one client text message; `None` means nothing to send back.
async fn handle_frame_message(state: &AppState, text: &str) -> Option<serde_json::Value> {
    let payload: FramePayload = match serde_json::from_str(text) {
        Ok(payload) => payload,
        Err(err) => {
            return Some(json!({ "status": "frame_error", "error": format!("malformed message: {err}") }));
        }
    };
    // Messages without a frame are ignored, matching keepalive chatter.
    let frame = payload.frame?;

    let result = tokio::time::timeout(state.frame_timeout, state.processor.process(&frame)).await;

    let reply = match result {
        Ok(Ok(output)) => {
            let mut reply = json!({
                "status": "processed",
                "detections": output.detections,
            });
            if let Some(annotated) = output.annotated_frame {
                reply["frame"] = json!(annotated);
            }
            reply
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "frame processing failed");
            json!({ "status": "frame_error", "error": err.to_string() })
        }
        Err(_) => {
            tracing::warn!(timeout = ?state.frame_timeout, "frame processing timed out");
            json!({ "status": "frame_error", "error": crate::pipeline::FrameError::Timeout.to_string() })
        }
    };

    Some(reply)
}
