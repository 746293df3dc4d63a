//! The real-time event bus feeding attached UI sessions.
//!
//! Many writers, many readers. Each session holds a bounded outbound
//! queue; publication serializes the event once and enqueues without
//! blocking. A session whose queue cannot take the event is dropped:
//! a stalled UI must never stall the core. FIFO holds within a
//! session; nothing is ordered across sessions.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};
use uuid::Uuid;

use cyberchat_shared::{PeerSummary, WebMessage};

use crate::peers::PeerUpdateListener;

/// Outbound queue depth per session.
const SESSION_QUEUE: usize = 256;

/// Everything a session can observe, serialized as
/// `{"type": "...", "content": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Event {
    Message(WebMessage),
    Peer(PeerSummary),
    PeerOffline(PeerOfflinePayload),
    PeerDiscovered(PeerDiscoveredPayload),
    PeerDiscoveryFailed(PeerDiscoveryFailedPayload),
    FileTransfer(FileTransferPayload),
    DeliveryStatus(DeliveryStatusPayload),
    DeliveryProgress(DeliveryProgressPayload),
    DeliveryFinal(DeliveryFinalPayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerOfflinePayload {
    pub guid: Uuid,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerDiscoveredPayload {
    pub guid: Uuid,
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerDiscoveryFailedPayload {
    pub guid: Uuid,
    pub ip: String,
    pub error: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStatusPayload {
    pub message_id: Uuid,
    pub status: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_guid: Option<Uuid>,
}

impl DeliveryStatusPayload {
    pub fn processing(message_id: Uuid) -> Self {
        Self {
            message_id,
            status: "processing".into(),
            details: "Starting message delivery...".into(),
            total: None,
            peer_guid: None,
        }
    }

    pub fn broadcasting(message_id: Uuid, total: usize) -> Self {
        Self {
            message_id,
            status: "broadcasting".into(),
            details: format!("Broadcasting to {total} peers..."),
            total: Some(total),
            peer_guid: None,
        }
    }

    pub fn sending(message_id: Uuid, peer_guid: Uuid) -> Self {
        Self {
            message_id,
            status: "sending".into(),
            details: format!("Sending private message to {peer_guid}..."),
            total: None,
            peer_guid: Some(peer_guid),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryProgressPayload {
    pub message_id: Uuid,
    pub peer_guid: Uuid,
    pub peer_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: ProgressCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryFinalPayload {
    pub message_id: Uuid,
    pub status: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
    pub counts: Option<ProgressCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_guid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileTransferPayload {
    pub file_id: Uuid,
    pub filename: String,
    pub size: i64,
    pub client_ip: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    pub transfer_id: Uuid,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct EventBus {
    sessions: RwLock<HashMap<Uuid, mpsc::Sender<String>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a session; the receiver is drained by the session's
    /// writer task.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let id = Uuid::new_v4();
        self.sessions.write().insert(id, tx);
        debug!(session = %id, "event-bus session attached");
        (id, rx)
    }

    pub fn unregister(&self, id: Uuid) {
        if self.sessions.write().remove(&id).is_some() {
            debug!(session = %id, "event-bus session detached");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Fan an event out to every attached session. Serialization
    /// happens once; sessions that cannot take the event are dropped.
    pub fn publish(&self, event: &Event) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize event");
                return;
            }
        };

        let mut dead = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, tx) in sessions.iter() {
                match tx.try_send(payload.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(session = %id, "session queue full, dropping session");
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write();
            for id in dead {
                sessions.remove(&id);
            }
        }
    }

    /// Direct send to one session (pong replies). Returns false when
    /// the session is gone or its queue is full.
    pub fn send_to(&self, id: Uuid, payload: String) -> bool {
        let sessions = self.sessions.read();
        sessions
            .get(&id)
            .map(|tx| tx.try_send(payload).is_ok())
            .unwrap_or(false)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer-manager change callback: every merged observation becomes a
/// `peer` event. Enqueue-only, so the manager's consumer never blocks.
impl PeerUpdateListener for EventBus {
    fn on_peer_update(&self, peer: &cyberchat_shared::Peer) {
        self.publish(&Event::Peer(peer.summary()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: usize) -> Event {
        Event::Message(WebMessage::system(format!("notice {n}")))
    }

    #[tokio::test]
    async fn test_publish_reaches_all_sessions_in_order() {
        let bus = EventBus::new();
        let (_a, mut rx_a) = bus.register();
        let (_b, mut rx_b) = bus.register();

        bus.publish(&event(1));
        bus.publish(&event(2));

        for rx in [&mut rx_a, &mut rx_b] {
            let first = rx.try_recv().unwrap();
            let second = rx.try_recv().unwrap();
            assert!(first.contains("notice 1"));
            assert!(second.contains("notice 2"));
        }
    }

    #[tokio::test]
    async fn test_wire_shape() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.register();

        bus.publish(&Event::DeliveryStatus(DeliveryStatusPayload::processing(
            Uuid::new_v4(),
        )));

        let raw = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "delivery_status");
        assert_eq!(value["content"]["status"], "processing");
    }

    #[tokio::test]
    async fn test_slow_session_dropped() {
        let bus = EventBus::new();
        let (_id, rx) = bus.register();
        // Session never drains its queue.
        std::mem::forget(rx);

        for n in 0..SESSION_QUEUE + 1 {
            bus.publish(&event(n));
        }
        assert_eq!(bus.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.register();
        assert_eq!(bus.session_count(), 1);

        bus.unregister(id);
        assert_eq!(bus.session_count(), 0);

        bus.publish(&event(0));
        assert!(rx.try_recv().is_err());
    }
}
