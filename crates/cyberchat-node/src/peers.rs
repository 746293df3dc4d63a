//! The authoritative active-peer set.
//!
//! Consumes the discovery observation stream (single consumer, so the
//! change callback fires in observation order), persists every merge,
//! and answers the queries the pipeline and the client API need.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use cyberchat_shared::constants::ACTIVE_PEER_TIMEOUT;
use cyberchat_shared::Peer;
use cyberchat_store::PeerRecord;

use crate::state::SharedDb;

/// Single-method change callback registered at construction.
/// Implementations route updates onto the event bus and must not
/// block; the next observation waits for the callback to return.
pub trait PeerUpdateListener: Send + Sync {
    fn on_peer_update(&self, peer: &Peer);
}

pub struct PeerManager {
    peers: RwLock<HashMap<Uuid, Peer>>,
    db: SharedDb,
    listener: Arc<dyn PeerUpdateListener>,
}

impl PeerManager {
    /// Build the manager and repopulate the active set from rows still
    /// inside the activity window.
    pub fn new(db: SharedDb, listener: Arc<dyn PeerUpdateListener>) -> Self {
        let manager = Self {
            peers: RwLock::new(HashMap::new()),
            db,
            listener,
        };
        manager.load_active();
        manager
    }

    fn load_active(&self) {
        let cutoff = Utc::now() - ACTIVE_PEER_TIMEOUT;
        let records = match self.db.lock().get_peers_seen_after(cutoff) {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to load active peers from store");
                return;
            }
        };

        let mut peers = self.peers.write();
        for record in records {
            match record_to_peer(&record) {
                Some(peer) => {
                    info!(peer = %peer.guid, name = %peer.name, "loaded active peer from store");
                    peers.insert(peer.guid, peer);
                }
                None => error!(peer = %record.guid, ip = %record.ip_address, "stored peer has invalid address"),
            }
        }
    }

    /// Merge one observation: refresh `last_seen`, keep a cached public
    /// key the observation lacks, persist, then fire the callback.
    pub fn handle_observation(&self, mut peer: Peer) {
        peer.last_seen = Utc::now();

        {
            let mut peers = self.peers.write();
            if peer.public_key_pem.is_none() {
                if let Some(existing) = peers.get(&peer.guid) {
                    peer.public_key_pem = existing.public_key_pem.clone();
                }
            }
            peers.insert(peer.guid, peer.clone());
        }

        if let Err(e) = self.db.lock().upsert_peer(&peer_to_record(&peer)) {
            error!(peer = %peer.guid, error = %e, "failed to persist peer");
        }

        self.listener.on_peer_update(&peer);
    }

    /// Snapshot of entries within the activity window.
    pub fn active_peers(&self) -> Vec<Peer> {
        let now = Utc::now();
        self.peers
            .read()
            .values()
            .filter(|p| p.is_active(now))
            .cloned()
            .collect()
    }

    /// Lookup by GUID. Memory first; on a miss the store is probed and
    /// the row is honored only while still inside the activity window,
    /// otherwise it is deleted.
    pub fn get_peer(&self, guid: Uuid) -> Option<Peer> {
        if let Some(peer) = self.peers.read().get(&guid) {
            return Some(peer.clone());
        }

        let record = match self.db.lock().get_peer(guid) {
            Ok(record) => record?,
            Err(e) => {
                error!(peer = %guid, error = %e, "peer lookup failed");
                return None;
            }
        };

        let now = Utc::now();
        let peer = record_to_peer(&record)?;
        if !peer.is_active(now) {
            debug!(peer = %guid, "stored peer is stale, deleting");
            if let Err(e) = self.db.lock().delete_peer(guid) {
                error!(peer = %guid, error = %e, "failed to delete stale peer");
            }
            return None;
        }

        self.peers.write().insert(guid, peer.clone());
        Some(peer)
    }

    pub fn peers_seen_after(&self, cutoff: DateTime<Utc>) -> Vec<Peer> {
        self.peers
            .read()
            .values()
            .filter(|p| p.last_seen > cutoff)
            .cloned()
            .collect()
    }

    /// In-memory eviction only; the persisted row stays so re-discovery
    /// can restore the peer.
    pub fn remove_inactive(&self, guid: Uuid) {
        if self.peers.write().remove(&guid).is_some() {
            info!(peer = %guid, "removed peer from active set");
        }
    }
}

fn peer_to_record(peer: &Peer) -> PeerRecord {
    PeerRecord {
        guid: peer.guid,
        name: peer.name.clone(),
        public_key: peer.public_key_pem.clone(),
        ip_address: peer.ip.to_string(),
        port: peer.port,
        last_seen: peer.last_seen,
    }
}

fn record_to_peer(record: &PeerRecord) -> Option<Peer> {
    Some(Peer {
        guid: record.guid,
        name: record.name.clone(),
        ip: record.ip_address.parse().ok()?,
        port: record.port,
        public_key_pem: record.public_key.clone(),
        last_seen: record.last_seen,
    })
}
