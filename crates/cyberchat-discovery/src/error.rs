use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("No suitable local IPv4 address found")]
    NoInterface,

    #[error("Failed to rebind advertiser: {0}")]
    Rebind(String),

    #[error("Identity fetch failed: {0}")]
    KeyFetch(String),

    #[error("GUID mismatch: expected {expected}, peer reported {actual}")]
    GuidMismatch { expected: Uuid, actual: Uuid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
