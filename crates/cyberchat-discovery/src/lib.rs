// Link-local discovery engine: DNS-SD advertisement, adaptive
// scanning, peer-observation stream, and on-demand identity fetch.

pub mod advertiser;
pub mod backoff;
pub mod interface;
pub mod service;

mod error;

pub use advertiser::Advertiser;
pub use backoff::ScanBackoff;
pub use error::DiscoveryError;
pub use interface::select_local_ipv4;
pub use service::DiscoveryService;
