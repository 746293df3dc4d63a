//! The discovery engine: owns the mDNS daemon, the in-memory peer map,
//! the scan loop, the interface monitor, and the periodic eviction.
//!
//! Observations flow out through a bounded channel consumed by the
//! peer manager. Overflow drops the observation; the scan loop repeats
//! them and merges are idempotent.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cyberchat_shared::constants::{
    ACTIVE_PEER_TIMEOUT, INTERFACE_CHECK_INTERVAL, KEY_FETCH_TIMEOUT, SCAN_DEADLINE, SERVICE_TYPE,
};
use cyberchat_shared::{Peer, WhoamiResponse};

use crate::advertiser::Advertiser;
use crate::backoff::ScanBackoff;
use crate::error::{DiscoveryError, Result};
use crate::interface;

/// Capacity of the peer-observation channel.
const OBSERVATION_CAPACITY: usize = 100;

struct Inner {
    peers: HashMap<Uuid, Peer>,
    advertiser: Advertiser,
    name: String,
    current_ip: Option<std::net::Ipv4Addr>,
}

pub struct DiscoveryService {
    guid: Uuid,
    port: u16,
    daemon: ServiceDaemon,
    inner: Mutex<Inner>,
    observations: mpsc::Sender<Peer>,
    http: reqwest::Client,
    shutdown: watch::Receiver<bool>,
}

impl DiscoveryService {
    /// Build the service and hand back the observation stream.
    ///
    /// Nothing is advertised until [`start`](Self::start).
    pub fn new(
        guid: Uuid,
        port: u16,
        name: String,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Peer>)> {
        let daemon = ServiceDaemon::new()?;
        let advertiser = Advertiser::new(daemon.clone(), guid, port);
        let (tx, rx) = mpsc::channel(OBSERVATION_CAPACITY);

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(KEY_FETCH_TIMEOUT)
            .timeout(KEY_FETCH_TIMEOUT)
            .build()
            .map_err(|e| DiscoveryError::KeyFetch(e.to_string()))?;

        let service = Arc::new(Self {
            guid,
            port,
            daemon,
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                advertiser,
                name,
                current_ip: None,
            }),
            observations: tx,
            http,
            shutdown,
        });
        Ok((service, rx))
    }

    /// Bind the advertiser and spawn the long-running loops.
    ///
    /// Advertisement failure is fatal; everything after start degrades
    /// gracefully.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let ip = interface::select_local_ipv4()?;
        {
            let mut inner = self.inner.lock();
            inner.current_ip = Some(ip);
            let name = inner.name.clone();
            inner.advertiser.rebind(ip, &name)?;
        }

        tokio::spawn(scan_loop(Arc::clone(self)));
        tokio::spawn(interface_monitor(Arc::clone(self)));
        tokio::spawn(cleanup_loop(Arc::clone(self)));

        info!(node = %self.guid, port = self.port, "discovery service started");
        Ok(())
    }

    /// Withdraw the advertisement and stop the mDNS daemon. Called
    /// first in the shutdown sequence.
    pub fn stop(&self) {
        self.inner.lock().advertiser.unregister();
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mdns daemon shutdown");
        }
    }

    /// Change the advertised display name and re-announce.
    pub fn update_name(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.name = name.to_string();
        if let Some(ip) = inner.current_ip {
            let name = inner.name.clone();
            inner.advertiser.rebind(ip, &name)?;
        }
        Ok(())
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.lock().peers.values().cloned().collect()
    }

    pub fn active_peers(&self) -> Vec<Peer> {
        let now = Utc::now();
        self.inner
            .lock()
            .peers
            .values()
            .filter(|p| p.is_active(now))
            .cloned()
            .collect()
    }

    pub fn get_peer(&self, guid: Uuid) -> Option<Peer> {
        self.inner.lock().peers.get(&guid).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// In-memory removal, used by failure-driven eviction. The
    /// persisted record is untouched; re-discovery restores the entry.
    pub fn remove_peer(&self, guid: Uuid) {
        if self.inner.lock().peers.remove(&guid).is_some() {
            info!(peer = %guid, "removed peer from discovery map");
        }
    }

    /// On-demand identity fetch for a specific peer.
    ///
    /// Verifies the reported GUID before accepting the key; a mismatch
    /// leaves all state untouched. A successful fetch re-emits the
    /// enriched observation so downstream copies pick the key up.
    pub async fn fetch_public_key(&self, peer: &Peer) -> Result<String> {
        let url = format!("https://{}:{}/api/v1/whoami", peer.ip, peer.port);
        debug!(url = %url, "fetching peer identity");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::KeyFetch(e.to_string()))?;
        let who: WhoamiResponse = response
            .json()
            .await
            .map_err(|e| DiscoveryError::KeyFetch(e.to_string()))?;

        if who.guid != peer.guid {
            return Err(DiscoveryError::GuidMismatch {
                expected: peer.guid,
                actual: who.guid,
            });
        }

        let updated = {
            let mut inner = self.inner.lock();
            inner.peers.get_mut(&peer.guid).map(|p| {
                p.name = who.name.clone();
                p.public_key_pem = Some(who.public_key.clone());
                p.clone()
            })
        };
        if let Some(peer) = updated {
            offer_observation(&self.observations, peer);
        }

        Ok(who.public_key)
    }

    /// One scan cycle: browse until the deadline, fold every resolved
    /// entry into the map. Partial results are kept on timeout.
    /// Returns the number of newly observed peers.
    async fn scan_once(self: &Arc<Self>) -> Result<usize> {
        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        let deadline = Instant::now() + SCAN_DEADLINE;
        let mut new_peers = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(entry))) => {
                    if self.process_resolved(&entry) {
                        new_peers += 1;
                    }
                }
                Ok(Ok(_)) => continue,
                // Deadline hit or the daemon dropped the channel.
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!(error = %e, "stop_browse failed");
        }
        Ok(new_peers)
    }

    /// Fold one resolved entry into the peer map. Returns true when
    /// the entry was previously unknown.
    fn process_resolved(self: &Arc<Self>, entry: &ServiceInfo) -> bool {
        if !entry.get_fullname().contains("_cyberchat._tcp") {
            return false;
        }

        let mut txt = HashMap::new();
        for key in ["id", "port", "name", "ip"] {
            if let Some(value) = entry.get_property_val_str(key) {
                txt.insert(key.to_string(), value.to_string());
            }
        }
        let fallback_ip = entry
            .get_addresses_v4()
            .into_iter()
            .next()
            .map(|v4| IpAddr::V4(*v4));

        let Some(parsed) = parse_peer_txt(&txt, entry.get_port(), fallback_ip) else {
            debug!(service = %entry.get_fullname(), "ignoring unparsable entry");
            return false;
        };
        if parsed.guid == self.guid {
            return false;
        }

        let now = Utc::now();
        let (peer, is_new) = {
            let mut inner = self.inner.lock();
            let carried_key =
                reconcile_stale(&mut inner.peers, &parsed.name, parsed.port, parsed.guid);

            match inner.peers.get_mut(&parsed.guid) {
                Some(existing) => {
                    if existing.ip != parsed.ip
                        || existing.port != parsed.port
                        || existing.name != parsed.name
                    {
                        debug!(
                            peer = %parsed.guid,
                            name = %parsed.name,
                            ip = %parsed.ip,
                            port = parsed.port,
                            "peer record updated"
                        );
                    }
                    existing.ip = parsed.ip;
                    existing.port = parsed.port;
                    existing.name = parsed.name;
                    existing.last_seen = now;
                    (existing.clone(), false)
                }
                None => {
                    let peer = Peer {
                        guid: parsed.guid,
                        name: parsed.name,
                        ip: parsed.ip,
                        port: parsed.port,
                        public_key_pem: carried_key,
                        last_seen: now,
                    };
                    info!(
                        peer = %peer.guid,
                        name = %peer.name,
                        ip = %peer.ip,
                        port = peer.port,
                        "new peer discovered"
                    );
                    inner.peers.insert(peer.guid, peer.clone());
                    (peer, true)
                }
            }
        };

        let needs_key = peer.public_key_pem.is_none();
        offer_observation(&self.observations, peer.clone());

        if is_new && needs_key {
            let service = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = service.fetch_public_key(&peer).await {
                    warn!(peer = %peer.guid, error = %e, "public key fetch failed");
                }
            });
        }

        is_new
    }

    fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let before = inner.peers.len();
        inner.peers.retain(|_, p| p.is_active(now));
        let removed = before - inner.peers.len();
        if removed > 0 {
            info!(removed, remaining = inner.peers.len(), "evicted inactive peers");
        }
        removed
    }

    fn check_interface(&self) {
        let new_ip = match interface::select_local_ipv4() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "interface selection failed");
                return;
            }
        };

        let mut inner = self.inner.lock();
        if inner.current_ip != Some(new_ip) {
            info!(old = ?inner.current_ip, new = %new_ip, "network change detected");
            inner.current_ip = Some(new_ip);
            let name = inner.name.clone();
            if let Err(e) = inner.advertiser.rebind(new_ip, &name) {
                warn!(error = %e, "advertiser rebind failed, retrying on next check");
            }
        }
    }
}

/// Non-blocking push into the observation channel; full channels drop
/// the observation. Returns whether the observation was accepted.
fn offer_observation(tx: &mpsc::Sender<Peer>, peer: Peer) -> bool {
    match tx.try_send(peer) {
        Ok(()) => true,
        Err(TrySendError::Full(peer)) => {
            debug!(peer = %peer.guid, "observation channel full, dropping");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ParsedPeer {
    guid: Uuid,
    port: u16,
    name: String,
    ip: IpAddr,
}

/// Extract a peer from advertisement TXT fields. `id` is required; the
/// advertised port and address serve as fallbacks for missing fields.
/// A present-but-invalid `port` rejects the entry.
fn parse_peer_txt(
    txt: &HashMap<String, String>,
    fallback_port: u16,
    fallback_ip: Option<IpAddr>,
) -> Option<ParsedPeer> {
    let guid = Uuid::parse_str(txt.get("id")?).ok()?;
    let port = match txt.get("port") {
        Some(raw) => raw.parse().ok()?,
        None => fallback_port,
    };
    let name = txt.get("name").cloned().unwrap_or_default();
    let ip = txt
        .get("ip")
        .and_then(|raw| raw.parse().ok())
        .or(fallback_ip)?;

    Some(ParsedPeer {
        guid,
        port,
        name,
        ip,
    })
}

/// Drop entries that share `(name, port)` with a fresh observation but
/// carry a different GUID (a reinstalled node keeps its name and port
/// but mints a new identity). The newest cached public key is carried
/// forward to the replacement entry.
fn reconcile_stale(
    peers: &mut HashMap<Uuid, Peer>,
    name: &str,
    port: u16,
    guid: Uuid,
) -> Option<String> {
    let stale: Vec<Uuid> = peers
        .values()
        .filter(|p| p.guid != guid && p.name == name && p.port == port)
        .map(|p| p.guid)
        .collect();

    let mut carried = None;
    for old in stale {
        if let Some(removed) = peers.remove(&old) {
            info!(stale = %old, name = %removed.name, "removing stale peer entry");
            if removed.public_key_pem.is_some() {
                carried = removed.public_key_pem;
            }
        }
    }
    carried
}

/// Sleep for `duration` unless shutdown fires first. Returns true when
/// the loop should exit.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn scan_loop(service: Arc<DiscoveryService>) {
    let mut shutdown = service.shutdown.clone();
    let mut backoff = ScanBackoff::new();
    debug!("scan loop running");

    loop {
        if sleep_or_shutdown(&mut shutdown, backoff.current()).await {
            break;
        }
        let new_peers = match service.scan_once().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "scan cycle failed");
                0
            }
        };
        backoff.on_scan_complete(new_peers, service.peer_count());
    }
    debug!("scan loop exited");
}

async fn cleanup_loop(service: Arc<DiscoveryService>) {
    let mut shutdown = service.shutdown.clone();
    loop {
        if sleep_or_shutdown(&mut shutdown, ACTIVE_PEER_TIMEOUT / 2).await {
            break;
        }
        service.evict_expired();
    }
}

async fn interface_monitor(service: Arc<DiscoveryService>) {
    let mut shutdown = service.shutdown.clone();
    loop {
        if sleep_or_shutdown(&mut shutdown, INTERFACE_CHECK_INTERVAL).await {
            break;
        }
        service.check_interface();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txt(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn peer(guid: Uuid, name: &str, port: u16, key: Option<&str>) -> Peer {
        Peer {
            guid,
            name: name.into(),
            ip: "192.168.1.7".parse().unwrap(),
            port,
            public_key_pem: key.map(String::from),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_parse_full_txt() {
        let guid = Uuid::new_v4();
        let parsed = parse_peer_txt(
            &txt(&[
                ("id", &guid.to_string()),
                ("port", "7332"),
                ("name", "Alice"),
                ("ip", "192.168.1.9"),
            ]),
            7331,
            None,
        )
        .unwrap();

        assert_eq!(parsed.guid, guid);
        assert_eq!(parsed.port, 7332);
        assert_eq!(parsed.name, "Alice");
        assert_eq!(parsed.ip, "192.168.1.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_requires_id() {
        assert!(parse_peer_txt(&txt(&[("name", "x"), ("ip", "10.0.0.1")]), 7331, None).is_none());
    }

    #[test]
    fn test_parse_port_and_ip_fallbacks() {
        let guid = Uuid::new_v4();
        let fallback: IpAddr = "10.0.0.2".parse().unwrap();
        let parsed = parse_peer_txt(
            &txt(&[("id", &guid.to_string())]),
            7334,
            Some(fallback),
        )
        .unwrap();
        assert_eq!(parsed.port, 7334);
        assert_eq!(parsed.ip, fallback);

        // A malformed advertised port rejects the entry.
        assert!(parse_peer_txt(
            &txt(&[("id", &guid.to_string()), ("port", "eleven")]),
            7331,
            Some(fallback),
        )
        .is_none());

        // No address at all rejects the entry.
        assert!(parse_peer_txt(&txt(&[("id", &guid.to_string())]), 7331, None).is_none());
    }

    #[test]
    fn test_reconcile_carries_key_forward() {
        let mut peers = HashMap::new();
        let old = Uuid::new_v4();
        let unrelated = Uuid::new_v4();
        peers.insert(old, peer(old, "Alice", 7331, Some("PEM")));
        peers.insert(unrelated, peer(unrelated, "Bob", 7331, None));

        let fresh = Uuid::new_v4();
        let carried = reconcile_stale(&mut peers, "Alice", 7331, fresh);

        assert_eq!(carried.as_deref(), Some("PEM"));
        assert!(!peers.contains_key(&old));
        assert!(peers.contains_key(&unrelated));
    }

    #[test]
    fn test_reconcile_ignores_same_guid() {
        let mut peers = HashMap::new();
        let guid = Uuid::new_v4();
        peers.insert(guid, peer(guid, "Alice", 7331, None));

        assert!(reconcile_stale(&mut peers, "Alice", 7331, guid).is_none());
        assert!(peers.contains_key(&guid));
    }

    #[tokio::test]
    async fn test_observation_overflow_drops_new() {
        let (tx, mut rx) = mpsc::channel(2);
        let a = peer(Uuid::new_v4(), "a", 1, None);
        let b = peer(Uuid::new_v4(), "b", 2, None);
        let c = peer(Uuid::new_v4(), "c", 3, None);

        assert!(offer_observation(&tx, a.clone()));
        assert!(offer_observation(&tx, b.clone()));
        assert!(!offer_observation(&tx, c));

        assert_eq!(rx.recv().await.unwrap().guid, a.guid);
        assert_eq!(rx.recv().await.unwrap().guid, b.guid);
    }
}
