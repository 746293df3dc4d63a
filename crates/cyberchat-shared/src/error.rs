use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Failed to encrypt message: {0}")]
    EncryptionFailed(String),

    #[error("Failed to decrypt message: invalid ciphertext, wrong key, or label mismatch")]
    DecryptionFailed,

    #[error("Failed to decode message content: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid public key PEM: {0}")]
    InvalidPublicKey(String),

    #[error("Message content cannot be empty")]
    EmptyContent,

    #[error("Message content exceeds maximum size of {max} bytes")]
    ContentTooLarge { max: usize },
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Failed to generate RSA keypair: {0}")]
    GenerationFailed(String),

    #[error("Invalid private key PEM: {0}")]
    InvalidPrivateKey(String),

    #[error("Failed to encode public key PEM: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid node GUID: {0}")]
    InvalidGuid(#[from] uuid::Error),
}

/// Per-recipient delivery failures. These are absorbed into the
/// delivery report as human-readable reasons and never abort a send.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Peer not found in active peers list")]
    UnknownPeer,

    #[error("Failed to get public key: {0}")]
    KeyFetch(String),

    #[error("Failed to encrypt message: {0}")]
    Encryption(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(String),

    #[error("Failed to send message: {0}")]
    Unreachable(String),

    #[error("Peer returned error (HTTP {status})")]
    PeerHttp { status: u16 },

    #[error("Delivery timed out after {0} ms")]
    Timeout(u64),
}
