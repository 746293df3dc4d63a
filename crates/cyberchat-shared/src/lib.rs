// Types shared by every CyberChat crate: node identity, the message
// envelope and its RSA-OAEP wire form, delivery reports, and the
// error kinds the core distinguishes.

pub mod constants;
pub mod identity;
pub mod message;
pub mod peer;

mod error;

pub use error::{CryptoError, DeliveryError, IdentityError};
pub use identity::{parse_public_key_pem, Identity};
pub use message::{
    DeliveryReport, DeliveryStatus, Message, MessageScope, MessageType, NewMessageRequest,
    WebMessage, WireMessage,
};
pub use peer::{Peer, PeerListing, PeerSummary, WhoamiResponse};
