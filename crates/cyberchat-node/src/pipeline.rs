//! The message pipeline: stamping, duplicate suppression, store-first
//! persistence, per-recipient encryption and fan-out, delivery-report
//! aggregation, failure-driven eviction, and opportunistic discovery
//! of peers that message us before we have seen their advertisement.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cyberchat_discovery::DiscoveryService;
use cyberchat_shared::constants::{DELIVERY_TIMEOUT, PROBE_PORTS, PROBE_TIMEOUT};
use cyberchat_shared::{
    parse_public_key_pem, DeliveryError, DeliveryReport, DeliveryStatus, Identity, Message,
    MessageScope, Peer, WebMessage, WhoamiResponse, WireMessage,
};

use crate::cooldown::FailureCooldown;
use crate::error::ServerError;
use crate::events::{
    DeliveryFinalPayload, DeliveryProgressPayload, DeliveryStatusPayload, Event,
    PeerDiscoveredPayload, PeerDiscoveryFailedPayload, PeerOfflinePayload, ProgressCounts,
};
use crate::peers::PeerManager;
use crate::state::SharedDb;

/// Build a client that swallows self-signed certificates and bounds
/// the whole exchange (dial, TLS handshake, request) to `budget`.
pub fn insecure_client(budget: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .connect_timeout(budget)
        .timeout(budget)
        .build()
}

pub struct MessagePipeline {
    identity: Arc<Identity>,
    db: SharedDb,
    bus: Arc<crate::events::EventBus>,
    peers: Arc<PeerManager>,
    discovery: Arc<DiscoveryService>,
    cooldown: FailureCooldown,
    delivery_client: reqwest::Client,
    probe_client: reqwest::Client,
}

impl MessagePipeline {
    pub fn new(
        identity: Arc<Identity>,
        db: SharedDb,
        bus: Arc<crate::events::EventBus>,
        peers: Arc<PeerManager>,
        discovery: Arc<DiscoveryService>,
        delivery_client: reqwest::Client,
        probe_client: reqwest::Client,
    ) -> Self {
        Self {
            identity,
            db,
            bus,
            peers,
            discovery,
            cooldown: FailureCooldown::new(),
            delivery_client,
            probe_client,
        }
    }

    fn guid(&self) -> Uuid {
        self.identity.guid()
    }

    /// Process one message (locally submitted or decrypted inbound)
    /// and return the delivery report.
    ///
    /// Ordering: the store write fences all fan-out, and the
    /// `delivery_status` event precedes every `delivery_progress`,
    /// which precede the single `delivery_final`.
    pub async fn process(self: &Arc<Self>, msg: Message, source_ip: Option<String>) -> DeliveryReport {
        let mut report = DeliveryReport::new(msg.id);

        match self.db.lock().message_exists(msg.id) {
            Ok(true) => {
                debug!(message = %msg.id, "skipping duplicate message");
                return report;
            }
            Ok(false) => {}
            Err(e) => warn!(message = %msg.id, error = %e, "duplicate check failed"),
        }

        // Store first. Failure is logged and the send proceeds; the
        // local copy may be lost if persistence was down.
        match self.db.lock().insert_message(&msg, source_ip.as_deref()) {
            Ok(true) => {}
            Ok(false) => {
                debug!(message = %msg.id, "skipping duplicate message");
                return report;
            }
            Err(e) => error!(message = %msg.id, error = %e, "failed to store message"),
        }

        self.bus.publish(&Event::Message(msg.to_web()));

        if msg.sender_guid == self.guid() {
            info!(
                message = %msg.id,
                scope = ?msg.scope,
                "processing locally originated message"
            );
            self.bus
                .publish(&Event::DeliveryStatus(DeliveryStatusPayload::processing(
                    msg.id,
                )));

            match msg.scope {
                MessageScope::Broadcast => self.fan_out_broadcast(&msg, &mut report).await,
                MessageScope::Private => self.send_private(&msg, &mut report).await,
            }
        } else {
            info!(
                message = %msg.id,
                sender = %msg.sender_guid,
                scope = ?msg.scope,
                "received message from peer"
            );
        }

        report.finalize(msg.scope);
        if report.total_peers > 0 {
            info!(
                message = %msg.id,
                succeeded = report.succeeded,
                failed = report.failed,
                total = report.total_peers,
                "delivery complete"
            );
        }
        report
    }

    /// Fan a broadcast out to every active peer except the sender.
    /// Recipients run in parallel, each under its own delivery budget;
    /// progress events carry rolling counts in completion order.
    async fn fan_out_broadcast(self: &Arc<Self>, msg: &Message, report: &mut DeliveryReport) {
        let targets: Vec<Peer> = self
            .peers
            .active_peers()
            .into_iter()
            .filter(|p| p.guid != msg.sender_guid)
            .collect();
        report.total_peers = targets.len();

        if targets.is_empty() {
            info!(message = %msg.id, "no peers available for broadcast");
            self.bus.publish(&Event::DeliveryFinal(DeliveryFinalPayload {
                message_id: msg.id,
                status: "completed".into(),
                details: "No peers available for broadcast".into(),
                success_rate: None,
                counts: Some(ProgressCounts {
                    succeeded: 0,
                    failed: 0,
                    total: 0,
                }),
                peer_guid: None,
                success: None,
                error: None,
            }));
            return;
        }

        self.bus
            .publish(&Event::DeliveryStatus(DeliveryStatusPayload::broadcasting(
                msg.id,
                targets.len(),
            )));

        let mut deliveries = JoinSet::new();
        for peer in targets {
            let pipeline = Arc::clone(self);
            let mut peer_msg = msg.clone();
            peer_msg.receiver_guid = Some(peer.guid);
            deliveries.spawn(async move {
                let status = pipeline.deliver_to_peer(&peer_msg, &peer).await;
                (peer, status)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            let Ok((peer, status)) = joined else { continue };

            if status.success {
                info!(peer = %peer.guid, name = %peer.name, "delivered");
            } else {
                warn!(
                    peer = %peer.guid,
                    name = %peer.name,
                    error = status.error.as_deref().unwrap_or(""),
                    "delivery failed"
                );
                self.handle_delivery_failure(&peer, status.error.as_deref().unwrap_or("unknown"));
            }

            report.record(status.clone());
            self.bus
                .publish(&Event::DeliveryProgress(DeliveryProgressPayload {
                    message_id: msg.id,
                    peer_guid: status.peer_guid,
                    peer_name: status.peer_name.clone(),
                    success: status.success,
                    error: status.error.clone(),
                    progress: ProgressCounts {
                        succeeded: report.succeeded,
                        failed: report.failed,
                        total: report.total_peers,
                    },
                }));
        }

        let rate = report.success_rate();
        self.bus.publish(&Event::DeliveryFinal(DeliveryFinalPayload {
            message_id: msg.id,
            status: "completed".into(),
            details: format!(
                "Delivery complete: {}/{} successful ({:.1}%)",
                report.succeeded, report.total_peers, rate
            ),
            success_rate: Some(rate),
            counts: Some(ProgressCounts {
                succeeded: report.succeeded,
                failed: report.failed,
                total: report.total_peers,
            }),
            peer_guid: None,
            success: None,
            error: None,
        }));
    }

    /// Deliver a private message to its single receiver, iff that peer
    /// is currently in the active set. No store-and-forward: an
    /// offline receiver is reported as a failure, never queued.
    async fn send_private(self: &Arc<Self>, msg: &Message, report: &mut DeliveryReport) {
        report.total_peers = 1;
        let receiver = msg.receiver_guid;
        let target = receiver.and_then(|guid| self.peers.get_peer(guid));

        match target {
            Some(peer) => {
                self.bus
                    .publish(&Event::DeliveryStatus(DeliveryStatusPayload::sending(
                        msg.id, peer.guid,
                    )));

                let mut peer_msg = msg.clone();
                peer_msg.receiver_guid = Some(peer.guid);
                let status = self.deliver_to_peer(&peer_msg, &peer).await;

                if !status.success {
                    warn!(
                        peer = %peer.guid,
                        error = status.error.as_deref().unwrap_or(""),
                        "private delivery failed"
                    );
                    self.handle_delivery_failure(
                        &peer,
                        status.error.as_deref().unwrap_or("unknown"),
                    );
                }

                report.record(status.clone());
                self.bus.publish(&Event::DeliveryFinal(DeliveryFinalPayload {
                    message_id: msg.id,
                    status: "completed".into(),
                    details: format!(
                        "Private message delivery to {} {}",
                        peer.name,
                        if status.success { "succeeded" } else { "failed" }
                    ),
                    success_rate: None,
                    counts: None,
                    peer_guid: Some(peer.guid),
                    success: Some(status.success),
                    error: status.error,
                }));
            }
            None => {
                let reason = DeliveryError::UnknownPeer.to_string();
                let guid = receiver.unwrap_or_else(Uuid::nil);
                warn!(peer = %guid, "private delivery failed: receiver not active");

                report.record(DeliveryStatus::failure(
                    guid,
                    "Unknown".into(),
                    reason.clone(),
                ));
                self.bus.publish(&Event::DeliveryFinal(DeliveryFinalPayload {
                    message_id: msg.id,
                    status: "failed".into(),
                    details: format!("Failed to deliver private message: peer {guid} not found"),
                    success_rate: None,
                    counts: None,
                    peer_guid: Some(guid),
                    success: Some(false),
                    error: Some(reason),
                }));
            }
        }
    }

    async fn deliver_to_peer(&self, msg: &Message, peer: &Peer) -> DeliveryStatus {
        match self.try_deliver(msg, peer).await {
            Ok(()) => DeliveryStatus::success(peer.guid, peer.name.clone()),
            Err(e) => DeliveryStatus::failure(peer.guid, peer.name.clone(), e.to_string()),
        }
    }

    async fn try_deliver(&self, msg: &Message, peer: &Peer) -> Result<(), DeliveryError> {
        // Prefer the manager's cached key; fall back to an on-demand
        // fetch from the peer itself.
        let pem = match self
            .peers
            .get_peer(peer.guid)
            .and_then(|p| p.public_key_pem)
            .or_else(|| peer.public_key_pem.clone())
        {
            Some(pem) => pem,
            None => self
                .discovery
                .fetch_public_key(peer)
                .await
                .map_err(|e| DeliveryError::KeyFetch(e.to_string()))?,
        };
        let key = parse_public_key_pem(&pem).map_err(|e| DeliveryError::KeyFetch(e.to_string()))?;

        let wire = msg
            .encrypt(&key)
            .map_err(|e| DeliveryError::Encryption(e.to_string()))?;

        let url = format!("https://{}:{}/api/v1/message", peer.ip, peer.port);
        let response = self
            .delivery_client
            .post(&url)
            .json(&wire)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(DELIVERY_TIMEOUT.as_millis() as u64)
                } else {
                    DeliveryError::Unreachable(e.to_string())
                }
            })?;

        if response.status() != reqwest::StatusCode::ACCEPTED {
            return Err(DeliveryError::PeerHttp {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Failure-driven eviction, deduplicated by the 5-second per-peer
    /// suppressor: drop the peer from both in-memory maps, announce it
    /// offline, and synthesize a system message. The persisted row is
    /// retained for re-discovery.
    pub(crate) fn handle_delivery_failure(&self, peer: &Peer, reason: &str) {
        if !self.cooldown.begin_eviction(peer.guid) {
            return;
        }

        let name = self
            .peers
            .get_peer(peer.guid)
            .map(|p| p.name)
            .unwrap_or_else(|| peer.name.clone());

        self.peers.remove_inactive(peer.guid);
        self.discovery.remove_peer(peer.guid);

        warn!(
            peer = %peer.guid,
            name = %name,
            reason,
            "removing unreachable peer from active set"
        );

        self.bus.publish(&Event::PeerOffline(PeerOfflinePayload {
            guid: peer.guid,
            name: name.clone(),
            reason: reason.to_string(),
        }));
        self.bus.publish(&Event::Message(WebMessage::system(format!(
            "Peer {} ({}) went offline: {}",
            name, peer.guid, reason
        ))));
    }

    /// Inbound encrypted envelope from a peer. Rejects envelopes not
    /// addressed to this node; decryption failures do not evict the
    /// sender (they may be transient cipher confusion).
    pub async fn handle_inbound_wire(
        self: &Arc<Self>,
        wire: WireMessage,
        source_ip: String,
    ) -> Result<DeliveryReport, ServerError> {
        if wire.receiver_guid != self.guid() {
            warn!(
                receiver = %wire.receiver_guid,
                "inbound message not addressed to this node"
            );
            return Err(ServerError::InvalidReceiver);
        }

        let msg = wire
            .decrypt(self.identity.private_key())
            .map_err(|e| {
                warn!(message = %wire.id, error = %e, "failed to decrypt inbound message");
                ServerError::DecryptionFailed
            })?;

        debug!(message = %msg.id, sender = %msg.sender_guid, "decrypted inbound message");

        if msg.sender_guid != self.guid() {
            let pipeline = Arc::clone(self);
            let sender = msg.sender_guid;
            let source = source_ip.clone();
            tokio::spawn(async move {
                pipeline.discover_peer_from_message(sender, &source).await;
            });
        }

        Ok(self.process(msg, Some(source_ip)).await)
    }

    /// A peer we do not know just messaged us: probe its source IP
    /// across the well-known ports and adopt the first whoami whose
    /// GUID matches the message sender. Total failure starts the
    /// 5-minute cooldown.
    pub async fn discover_peer_from_message(self: &Arc<Self>, sender: Uuid, source_ip: &str) {
        if sender == self.guid() {
            return;
        }

        if let Some(known) = self.peers.get_peer(sender) {
            // Already tracked; treat the message as a liveness signal.
            self.peers.handle_observation(known);
            return;
        }

        if self.cooldown.in_discovery_cooldown(sender) {
            debug!(peer = %sender, "skipping discovery probe, peer in cooldown");
            return;
        }

        let host = source_ip
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(source_ip);
        let Ok(ip) = host.parse::<IpAddr>() else {
            debug!(source = source_ip, "unparsable source address");
            return;
        };

        let mut last_error = String::from("no response on any port");
        for port in PROBE_PORTS {
            let url = format!("https://{ip}:{port}/api/v1/whoami");
            match self.probe_whoami(&url).await {
                Ok(who) if who.guid == sender => {
                    info!(peer = %sender, name = %who.name, ip = %ip, port, "discovered peer from inbound message");
                    let peer = Peer {
                        guid: sender,
                        name: who.name.clone(),
                        ip,
                        port,
                        public_key_pem: Some(who.public_key),
                        last_seen: Utc::now(),
                    };
                    self.peers.handle_observation(peer);
                    self.bus
                        .publish(&Event::PeerDiscovered(PeerDiscoveredPayload {
                            guid: sender,
                            name: who.name,
                            ip_address: ip.to_string(),
                            port,
                            status: "active".into(),
                        }));
                    return;
                }
                Ok(who) => {
                    last_error = format!(
                        "GUID mismatch: message claims {sender} but whoami reports {}",
                        who.guid
                    );
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        warn!(peer = %sender, ip = %ip, error = %last_error, "failed to discover peer");
        self.cooldown.mark(sender);
        self.bus
            .publish(&Event::PeerDiscoveryFailed(PeerDiscoveryFailedPayload {
                guid: sender,
                ip: ip.to_string(),
                error: last_error,
                status: "unreachable".into(),
            }));
    }

    async fn probe_whoami(&self, url: &str) -> Result<WhoamiResponse, reqwest::Error> {
        // PROBE_TIMEOUT bounds each attempt independently.
        self.probe_client
            .get(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .json()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::peers::PeerManager;
    use cyberchat_shared::MessageType;
    use cyberchat_store::Database;
    use parking_lot::Mutex;
    use tokio::sync::{mpsc, watch};

    struct Harness {
        pipeline: Arc<MessagePipeline>,
        bus: Arc<EventBus>,
        peers: Arc<PeerManager>,
        db: SharedDb,
        identity: Arc<Identity>,
        _observations: mpsc::Receiver<Peer>,
    }

    fn harness() -> Harness {
        let identity = Arc::new(Identity::generate().unwrap());
        let db: SharedDb = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let bus = Arc::new(EventBus::new());
        let peers = Arc::new(PeerManager::new(db.clone(), bus.clone()));

        let (_tx, shutdown) = watch::channel(false);
        let (discovery, observations) = DiscoveryService::new(
            identity.guid(),
            7331,
            "test-node".into(),
            shutdown,
        )
        .unwrap();

        let pipeline = Arc::new(MessagePipeline::new(
            identity.clone(),
            db.clone(),
            bus.clone(),
            peers.clone(),
            discovery,
            insecure_client(DELIVERY_TIMEOUT).unwrap(),
            insecure_client(PROBE_TIMEOUT).unwrap(),
        ));

        Harness {
            pipeline,
            bus,
            peers,
            db,
            identity,
            _observations: observations,
        }
    }

    fn drain_event_types(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            types.push(value["type"].as_str().unwrap().to_string());
        }
        types
    }

    /// Peer entry pointing at a port nothing listens on; delivery
    /// fails fast with connection refused.
    fn dead_peer(identity_of_peer: &Identity) -> Peer {
        Peer {
            guid: identity_of_peer.guid(),
            name: "casper".into(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 1,
            public_key_pem: Some(identity_of_peer.public_key_pem().unwrap()),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_solo_broadcast() {
        let h = harness();
        let (_session, mut rx) = h.bus.register();

        let msg = Message::new(
            h.identity.guid(),
            None,
            MessageType::Text,
            b"hello".to_vec(),
            None,
        );
        let id = msg.id;
        let report = h.pipeline.process(msg, None).await;

        assert_eq!(report.total_peers, 0);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.summary, "No peers available for broadcast");
        assert!(h.db.lock().message_exists(id).unwrap());

        assert_eq!(
            drain_event_types(&mut rx),
            vec!["message", "delivery_status", "delivery_final"]
        );
    }

    #[tokio::test]
    async fn test_private_to_unknown_peer() {
        let h = harness();
        let (_session, mut rx) = h.bus.register();

        let msg = Message::new(
            h.identity.guid(),
            Some(Uuid::new_v4()),
            MessageType::Text,
            b"ping".to_vec(),
            None,
        );
        let report = h.pipeline.process(msg, None).await;

        assert_eq!(report.total_peers, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.peer_statuses[0].error.as_deref(),
            Some("Peer not found in active peers list")
        );

        let types = drain_event_types(&mut rx);
        assert_eq!(types, vec!["message", "delivery_status", "delivery_final"]);
    }

    #[tokio::test]
    async fn test_duplicate_message_dropped() {
        let h = harness();
        let (_session, mut rx) = h.bus.register();

        let msg = Message::new(
            h.identity.guid(),
            None,
            MessageType::Text,
            b"once".to_vec(),
            None,
        );

        let first = h.pipeline.process(msg.clone(), None).await;
        assert_eq!(first.summary, "No peers available for broadcast");

        let second = h.pipeline.process(msg.clone(), None).await;
        assert!(second.summary.is_empty());
        assert_eq!(second.total_peers, 0);

        // One stored row, one message event.
        let stored = h
            .db
            .lock()
            .get_messages(Utc::now() - chrono::Duration::hours(1), 100)
            .unwrap();
        assert_eq!(stored.len(), 1);

        let types = drain_event_types(&mut rx);
        assert_eq!(types.iter().filter(|t| *t == "message").count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_with_dead_peer_evicts() {
        let h = harness();
        let receiver_identity = Identity::generate().unwrap();
        let peer = dead_peer(&receiver_identity);
        h.peers.handle_observation(peer.clone());

        let (_session, mut rx) = h.bus.register();

        let msg = Message::new(
            h.identity.guid(),
            None,
            MessageType::Text,
            b"hi".to_vec(),
            None,
        );
        let report = h.pipeline.process(msg, None).await;

        assert_eq!(report.total_peers, 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.summary, "Delivered to 0/1 peers (0.0% success)");

        // The dead peer was evicted from the active set.
        assert!(h.peers.active_peers().is_empty());

        let types = drain_event_types(&mut rx);
        assert_eq!(
            types.iter().filter(|t| *t == "peer_offline").count(),
            1
        );
        // Ordering law within the session: status < progress < final.
        let status = types.iter().position(|t| t == "delivery_status").unwrap();
        let progress = types.iter().position(|t| t == "delivery_progress").unwrap();
        let fin = types.iter().position(|t| t == "delivery_final").unwrap();
        assert!(status < progress && progress < fin);
    }

    #[tokio::test]
    async fn test_eviction_suppressed_within_window() {
        let h = harness();
        let receiver_identity = Identity::generate().unwrap();
        let peer = dead_peer(&receiver_identity);
        h.peers.handle_observation(peer.clone());

        let (_session, mut rx) = h.bus.register();

        // A burst of failures for the same peer within the window.
        for _ in 0..5 {
            h.pipeline.handle_delivery_failure(&peer, "connection refused");
        }

        let types = drain_event_types(&mut rx);
        assert_eq!(types.iter().filter(|t| *t == "peer_offline").count(), 1);
        // Exactly one synthesized system message accompanies it.
        assert_eq!(types.iter().filter(|t| *t == "message").count(), 1);
    }

    #[tokio::test]
    async fn test_inbound_wire_for_other_node_rejected() {
        let h = harness();
        let other = Identity::generate().unwrap();

        let msg = Message::new(
            other.guid(),
            Some(other.guid()),
            MessageType::Text,
            b"misdirected".to_vec(),
            None,
        );
        let wire = msg.encrypt(other.public_key()).unwrap();

        let result = h
            .pipeline
            .handle_inbound_wire(wire, "127.0.0.1:9999".into())
            .await;
        assert!(matches!(result, Err(ServerError::InvalidReceiver)));
    }

    #[tokio::test]
    async fn test_inbound_wire_decrypts_and_stores() {
        let h = harness();
        let sender = Identity::generate().unwrap();

        let mut msg = Message::new(
            sender.guid(),
            Some(h.identity.guid()),
            MessageType::Text,
            b"ping".to_vec(),
            None,
        );
        msg.scope = MessageScope::Private;
        let wire = msg.encrypt(h.identity.public_key()).unwrap();

        let (_session, mut rx) = h.bus.register();
        let report = h
            .pipeline
            .handle_inbound_wire(wire.clone(), "127.0.0.1:9999".into())
            .await
            .unwrap();

        // Inbound messages are stored but not re-fanned-out.
        assert_eq!(report.total_peers, 0);
        assert!(h.db.lock().message_exists(msg.id).unwrap());

        let stored = h
            .db
            .lock()
            .get_messages(Utc::now() - chrono::Duration::hours(1), 10)
            .unwrap();
        assert_eq!(stored[0].content, b"ping");

        let types = drain_event_types(&mut rx);
        assert!(types.contains(&"message".to_string()));

        // Replay of the same envelope: no second row.
        let replay = h
            .pipeline
            .handle_inbound_wire(wire, "127.0.0.1:9999".into())
            .await
            .unwrap();
        assert_eq!(replay.total_peers, 0);
        let stored = h
            .db
            .lock()
            .get_messages(Utc::now() - chrono::Duration::hours(1), 10)
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_decryption_failure_does_not_evict() {
        let h = harness();
        let sender = Identity::generate().unwrap();

        // Envelope encrypted for a third party but addressed to us.
        let third = Identity::generate().unwrap();
        let mut msg = Message::new(
            sender.guid(),
            Some(h.identity.guid()),
            MessageType::Text,
            b"garbled".to_vec(),
            None,
        );
        msg.scope = MessageScope::Private;
        let wire = msg.encrypt(third.public_key()).unwrap();

        let result = h
            .pipeline
            .handle_inbound_wire(wire, "127.0.0.1:9999".into())
            .await;
        assert!(matches!(result, Err(ServerError::DecryptionFailed)));
        assert!(!h.db.lock().message_exists(msg.id).unwrap());
    }
}
