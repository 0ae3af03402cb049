use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use super::BroadcastGroups;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const CHANNEL_PREFIX: &str = "logs:";
const MAX_ID_LEN: usize = 128;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe { channel: String },
}

/// Deployment id named by a client message. Accepts
/// `{"type":"subscribe","channel":"logs:<id>"}`, `logs:<id>` or a bare id.
pub fn parse_subscription(text: &str) -> Result<String, String> {
    let text = text.trim();
    let channel = if text.starts_with('{') {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe { channel }) => channel,
            Err(e) => return Err(format!("Unsupported message: {}", e)),
        }
    } else {
        text.to_string()
    };

    let id = channel.trim();
    let id = id.strip_prefix(CHANNEL_PREFIX).unwrap_or(id);
    if id.is_empty() {
        return Err("Channel must name a deployment".to_string());
    }
    if id.len() > MAX_ID_LEN || id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("Invalid deployment id '{}'", id));
    }
    Ok(id.to_string())
}

fn error_frame(message: &str) -> Message {
    Message::Text(serde_json::json!({ "error": message }).to_string().into())
}

pub async fn ws_handler(upgrade: WebSocketUpgrade, groups: Arc<BroadcastGroups>) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| run_session(socket, groups))
}

/// One client session: subscription requests in, joined groups' lines out,
/// with ping/pong keepalive. Membership ends with the session.
async fn run_session(socket: WebSocket, groups: Arc<BroadcastGroups>) {
    let (conn, mut outbound) = groups.connect();
    let (mut sender, mut receiver) = socket.split();
    debug!(conn, "Live log session opened");

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            queued = outbound.recv() => {
                match queued {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_subscription(text.as_str()) {
                        Ok(deployment_id) => {
                            groups.join(conn, &deployment_id);
                        }
                        Err(e) => {
                            if sender.send(error_frame(&e)).await.is_err() {
                                break;
                            }
                        }
                    },
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

    groups.disconnect(conn);
    let _ = sender.send(Message::Close(None)).await;
    debug!(conn, "Live log session closed");
}
