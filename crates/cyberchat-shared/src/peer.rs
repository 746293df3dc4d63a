use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::ACTIVE_PEER_TIMEOUT;

/// A peer as tracked in memory by the discovery engine and the peer
/// manager. The public key is populated lazily after first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub guid: Uuid,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub public_key_pem: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_seen);
        age.to_std()
            .map(|age| age <= ACTIVE_PEER_TIMEOUT)
            // A future last_seen (clock skew) still counts as active.
            .unwrap_or(true)
    }

    /// Peer-facing discovery listing entry (`GET /api/v1/discovery`).
    pub fn listing(&self) -> PeerListing {
        PeerListing {
            guid: self.guid,
            port: self.port,
            name: self.name.clone(),
            ip_address: self.ip.to_string(),
            last_seen: self.last_seen,
        }
    }

    /// Event-bus view of a peer.
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            guid: self.guid,
            name: self.name.clone(),
            ip_address: self.ip.to_string(),
            port: self.port,
            last_seen: self.last_seen,
        }
    }
}

/// Wire shape of the LAN-facing discovery listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListing {
    #[serde(rename = "GUID")]
    pub guid: Uuid,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "LastSeen")]
    pub last_seen: DateTime<Utc>,
}

/// Peer view published on the event bus and the client peers endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub guid: Uuid,
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

/// Body of `GET /api/v1/whoami`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoamiResponse {
    pub guid: Uuid,
    /// PKCS#1 `RSA PUBLIC KEY` PEM.
    pub public_key: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn peer(last_seen: DateTime<Utc>) -> Peer {
        Peer {
            guid: Uuid::new_v4(),
            name: "test".into(),
            ip: "192.168.1.5".parse().unwrap(),
            port: 7331,
            public_key_pem: None,
            last_seen,
        }
    }

    #[test]
    fn test_activity_window() {
        let now = Utc::now();
        assert!(peer(now).is_active(now));
        assert!(peer(now - Duration::minutes(9)).is_active(now));
        assert!(!peer(now - Duration::minutes(11)).is_active(now));
    }

    #[test]
    fn test_listing_field_names() {
        let json = serde_json::to_value(peer(Utc::now()).listing()).unwrap();
        assert!(json.get("GUID").is_some());
        assert!(json.get("IPAddress").is_some());
        assert!(json.get("LastSeen").is_some());
    }
}
