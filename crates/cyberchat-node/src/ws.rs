//! WebSocket sessions for attached UIs.
//!
//! Sessions are accepted only from loopback with a loopback Origin.
//! Each session gets a reader task (liveness + inbound submissions)
//! and a writer task draining its event-bus queue; the writer pings on
//! an interval and the reader enforces the read deadline.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cyberchat_shared::constants::{SESSION_PING_INTERVAL, SESSION_READ_DEADLINE};
use cyberchat_shared::NewMessageRequest;

use crate::state::AppState;

/// Inbound frames a session may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
enum SessionCommand {
    Message(NewMessageRequest),
    Ping,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !addr.ip().is_loopback() {
        return (
            StatusCode::FORBIDDEN,
            "WebSocket connections only allowed from localhost",
        )
            .into_response();
    }
    if !origin_is_loopback(&headers) {
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    ws.on_upgrade(move |socket| run_session(socket, state, addr))
}

fn origin_is_loopback(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    ["https://localhost:", "https://127.0.0.1:", "http://localhost:", "http://127.0.0.1:"]
        .iter()
        .any(|prefix| origin.starts_with(prefix))
}

async fn run_session(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (session_id, mut queue) = state.bus.register();
    info!(session = %session_id, peer = %addr, "ui session connected");

    let (mut sink, mut source) = socket.split();

    // Writer: drain the session queue, ping on the heartbeat interval.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(SESSION_PING_INTERVAL);
        ping.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                queued = queue.recv() => match queued {
                    Some(json) => {
                        if sink.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: any frame counts as liveness; silence past the deadline
    // closes the session.
    loop {
        match tokio::time::timeout(SESSION_READ_DEADLINE, source.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                handle_session_frame(&state, session_id, addr, text.as_str());
            }
            Ok(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_)))) => continue,
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => {
                debug!(session = %session_id, error = %e, "session read error");
                break;
            }
            Err(_) => {
                debug!(session = %session_id, "session read deadline exceeded");
                break;
            }
        }
    }

    state.bus.unregister(session_id);
    writer.abort();
    info!(session = %session_id, "ui session closed");
}

fn handle_session_frame(state: &AppState, session_id: Uuid, addr: SocketAddr, raw: &str) {
    let command: SessionCommand = match serde_json::from_str(raw) {
        Ok(command) => command,
        Err(e) => {
            warn!(session = %session_id, error = %e, "unparsable session frame");
            return;
        }
    };

    match command {
        SessionCommand::Message(request) => {
            let message = request.into_message(state.identity.guid());
            if let Err(e) = message.validate_content() {
                warn!(session = %session_id, error = %e, "rejecting session message");
                return;
            }
            let pipeline = state.pipeline.clone();
            let source = addr.to_string();
            // The report goes unread here; sessions follow progress
            // through the delivery events instead.
            tokio::spawn(async move {
                pipeline.process(message, Some(source)).await;
            });
        }
        SessionCommand::Ping => {
            state
                .bus
                .send_to(session_id, r#"{"type":"pong"}"#.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(origin: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(origin) = origin {
            headers.insert(header::ORIGIN, origin.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_origin_gate() {
        assert!(origin_is_loopback(&headers(Some("https://127.0.0.1:7331"))));
        assert!(origin_is_loopback(&headers(Some("http://localhost:7331"))));
        assert!(!origin_is_loopback(&headers(Some("https://evil.example:443"))));
        assert!(!origin_is_loopback(&headers(Some("https://localhost.evil.example:1"))));
        assert!(!origin_is_loopback(&headers(None)));
    }

    #[test]
    fn test_session_commands_parse() {
        let frame = r#"{"type":"message","content":{"type":"text","content":"hi","receiver_guid":"","scope":"broadcast"}}"#;
        let command: SessionCommand = serde_json::from_str(frame).unwrap();
        assert!(matches!(command, SessionCommand::Message(_)));

        let ping: SessionCommand = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, SessionCommand::Ping));
    }
}
