//! HTTP surface: the LAN-facing peer endpoints and the loopback-only
//! client API, assembled into one router behind TLS.

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use cyberchat_shared::constants::{ACTIVE_PEER_TIMEOUT, MAX_MESSAGE_SIZE};
use cyberchat_shared::{
    NewMessageRequest, Peer, PeerListing, PeerSummary, WebMessage, WhoamiResponse, WireMessage,
};
use cyberchat_store::{FileRecord, StoredMessage};

use crate::error::ServerError;
use crate::files::{transfer_stream, Transfer};
use crate::state::AppState;
use crate::ws;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        // Peer-facing wire, open to the LAN.
        .route("/api/v1/whoami", get(whoami))
        .route("/api/v1/discovery", get(discovery_listing))
        .route("/api/v1/message", post(inbound_message))
        .route("/api/v1/file/{file_id}", get(download_file))
        // Session-facing wire, loopback only.
        .route("/api/v1/client/auth", get(client_auth))
        .route(
            "/api/v1/client/message",
            get(client_get_messages).post(client_post_message),
        )
        .route("/api/v1/client/message/truncate", post(client_truncate_messages))
        .route("/api/v1/client/name", post(client_update_name))
        .route("/api/v1/client/peers", get(client_peers))
        .route("/api/v1/client/files", get(client_list_files))
        .route("/api/v1/client/file", post(client_register_file))
        .route("/api/v1/client/file/truncate", post(client_truncate_files))
        // Event-bus sessions.
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_SIZE + 16 * 1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Source address for inbound peer traffic, honoring a forwarding
/// proxy on the same host.
fn source_address(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| addr.to_string())
}

fn client_address(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Client API gate: loopback origin plus the issued API key.
fn authorize_client(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
) -> Result<(), ServerError> {
    if !addr.ip().is_loopback() {
        return Err(ServerError::Unauthorized);
    }
    let key = headers
        .get("x-client-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if key != state.client_api_key {
        return Err(ServerError::Unauthorized);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Peer-facing handlers
// ---------------------------------------------------------------------------

async fn whoami(State(state): State<AppState>) -> Result<Json<WhoamiResponse>, ServerError> {
    let name = state.db.lock().display_name()?;
    let public_key = state
        .identity
        .public_key_pem()
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    Ok(Json(WhoamiResponse {
        guid: state.identity.guid(),
        public_key,
        name,
    }))
}

async fn discovery_listing(State(state): State<AppState>) -> Json<Vec<PeerListing>> {
    let listing = merge_peer_sets(state.discovery.active_peers(), state.peers.active_peers())
        .into_iter()
        .map(|p| p.listing())
        .collect();
    Json(listing)
}

/// Union of the engine's and the manager's active views, preferring
/// the engine's copy for duplicates.
fn merge_peer_sets(discovery: Vec<Peer>, manager: Vec<Peer>) -> Vec<Peer> {
    let seen: HashSet<Uuid> = discovery.iter().map(|p| p.guid).collect();
    let mut merged = discovery;
    merged.extend(manager.into_iter().filter(|p| !seen.contains(&p.guid)));
    merged
}

async fn inbound_message(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let source_ip = source_address(&headers, addr);

    // Encrypted wire form first; the intra-host bridge shape second.
    if let Ok(wire) = serde_json::from_slice::<WireMessage>(&body) {
        let report = state.pipeline.handle_inbound_wire(wire, source_ip).await?;
        return Ok((StatusCode::ACCEPTED, Json(report)).into_response());
    }

    let request: NewMessageRequest = serde_json::from_slice(&body)
        .map_err(|e| ServerError::BadRequest(format!("Failed to parse message: {e}")))?;
    let message = request.into_message(state.identity.guid());
    message
        .validate_content()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let report = state.pipeline.process(message, Some(source_ip)).await;
    Ok((StatusCode::ACCEPTED, Json(report)).into_response())
}

async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let record = state
        .db
        .lock()
        .get_file(file_id)?
        .ok_or_else(|| ServerError::NotFound(format!("file {file_id}")))?;

    let file = tokio::fs::File::open(&record.path)
        .await
        .map_err(|e| ServerError::Internal(format!("failed to open {}: {e}", record.path)))?;

    let transfer = Transfer::new(state.bus.clone(), &record, client_address(&headers, addr));
    transfer.emit_starting();

    let body = axum::body::Body::from_stream(transfer_stream(file, transfer));
    Response::builder()
        .header(header::CONTENT_TYPE, record.mime_type.as_str())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", record.filename),
        )
        .header(header::CONTENT_LENGTH, record.size)
        .body(body)
        .map_err(|e| ServerError::Internal(e.to_string()))
}

// ---------------------------------------------------------------------------
// Client API handlers
// ---------------------------------------------------------------------------

async fn client_auth(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if !addr.ip().is_loopback() {
        return Err(ServerError::Unauthorized);
    }
    Ok(Json(serde_json::json!({ "api_key": state.client_api_key })))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    since: Option<DateTime<Utc>>,
    limit: Option<u32>,
}

async fn client_get_messages(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<WebMessage>>, ServerError> {
    authorize_client(&state, addr, &headers)?;

    let since = query.since.unwrap_or_else(|| Utc::now() - ChronoDuration::hours(24));
    let limit = query.limit.unwrap_or(100);
    if limit == 0 || limit > 1000 {
        return Err(ServerError::BadRequest("Invalid limit parameter".into()));
    }

    let messages = state.db.lock().get_messages(since, limit)?;
    Ok(Json(messages.into_iter().map(stored_to_web).collect()))
}

fn stored_to_web(message: StoredMessage) -> WebMessage {
    WebMessage {
        id: message.id.to_string(),
        sender_guid: message.sender_guid.to_string(),
        receiver_guid: message.receiver_guid,
        message_type: message.message_type,
        scope: message.scope,
        content: String::from_utf8_lossy(&message.content).into_owned(),
        timestamp: message.timestamp,
    }
}

async fn client_post_message(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<NewMessageRequest>,
) -> Result<Response, ServerError> {
    authorize_client(&state, addr, &headers)?;

    let message = request.into_message(state.identity.guid());
    message
        .validate_content()
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let source_ip = addr.to_string();
    let report = state.pipeline.process(message, Some(source_ip)).await;
    Ok((StatusCode::ACCEPTED, Json(report)).into_response())
}

async fn client_truncate_messages(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize_client(&state, addr, &headers)?;
    state.db.lock().truncate_messages()?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "All messages truncated",
    })))
}

#[derive(Debug, Deserialize)]
struct NameRequest {
    name: String,
}

async fn client_update_name(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<NameRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize_client(&state, addr, &headers)?;

    if request.name.is_empty() {
        return Err(ServerError::BadRequest("Name cannot be empty".into()));
    }

    state
        .db
        .lock()
        .set_setting(cyberchat_store::settings::SETTING_NAME, &request.name)?;

    // Re-announce under the new name; the stored name is already
    // updated, so a rebind failure only delays the broadcast.
    if let Err(e) = state.discovery.update_name(&request.name) {
        warn!(error = %e, "failed to re-announce name change");
    }

    Ok(Json(serde_json::json!({
        "status": "success",
        "name": request.name,
    })))
}

async fn client_peers(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Vec<PeerSummary>>, ServerError> {
    authorize_client(&state, addr, &headers)?;

    let cutoff = Utc::now() - ACTIVE_PEER_TIMEOUT;
    let peers = state
        .peers
        .peers_seen_after(cutoff)
        .into_iter()
        .map(|p| p.summary())
        .collect();
    Ok(Json(peers))
}

async fn client_list_files(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Vec<FileRecord>>, ServerError> {
    authorize_client(&state, addr, &headers)?;
    Ok(Json(state.db.lock().list_files()?))
}

#[derive(Debug, Deserialize)]
struct RegisterFileRequest {
    file_path: String,
    #[serde(default)]
    file_id: Option<Uuid>,
    #[serde(default)]
    receiver_guid: Option<Uuid>,
}

async fn client_register_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<RegisterFileRequest>,
) -> Result<Json<FileRecord>, ServerError> {
    authorize_client(&state, addr, &headers)?;

    let metadata = tokio::fs::metadata(&request.file_path)
        .await
        .map_err(|_| ServerError::BadRequest("File not found or inaccessible".into()))?;
    if !metadata.is_file() {
        return Err(ServerError::BadRequest("Path is not a regular file".into()));
    }

    let filename = std::path::Path::new(&request.file_path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ServerError::BadRequest("Invalid file path".into()))?
        .to_string();
    let mime_type = mime_guess::from_path(&request.file_path)
        .first_or_octet_stream()
        .to_string();

    let record = FileRecord {
        file_id: request.file_id.unwrap_or_else(Uuid::new_v4),
        sender_guid: state.identity.guid(),
        receiver_guid: request.receiver_guid,
        filename,
        path: request.file_path,
        size: metadata.len() as i64,
        mime_type,
        created_at: Utc::now(),
    };
    state.db.lock().insert_file(&record)?;

    Ok(Json(record))
}

async fn client_truncate_files(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ServerError> {
    authorize_client(&state, addr, &headers)?;
    state.db.lock().truncate_files()?;
    Ok(Json(serde_json::json!({ "status": "success" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(guid: Uuid, name: &str) -> Peer {
        Peer {
            guid,
            name: name.into(),
            ip: "192.168.1.30".parse().unwrap(),
            port: 7331,
            public_key_pem: None,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_merge_prefers_discovery_copy() {
        let shared = Uuid::new_v4();
        let only_manager = Uuid::new_v4();

        let merged = merge_peer_sets(
            vec![peer(shared, "from-discovery")],
            vec![peer(shared, "from-manager"), peer(only_manager, "extra")],
        );

        assert_eq!(merged.len(), 2);
        let copy = merged.iter().find(|p| p.guid == shared).unwrap();
        assert_eq!(copy.name, "from-discovery");
        assert!(merged.iter().any(|p| p.guid == only_manager));
    }

    #[test]
    fn test_source_address_prefers_forwarded() {
        let addr: SocketAddr = "192.168.1.9:41000".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(source_address(&headers, addr), "192.168.1.9:41000");

        headers.insert("x-forwarded-for", "10.0.0.7".parse().unwrap());
        assert_eq!(source_address(&headers, addr), "10.0.0.7");
    }

    #[test]
    fn test_client_address() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let headers = HeaderMap::new();
        assert_eq!(client_address(&headers, addr), "127.0.0.1");
    }
}
