use rand::rngs::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::{RsaPrivateKey, RsaPublicKey};
use uuid::Uuid;

use crate::error::IdentityError;

/// Node identity: a stable GUID plus the long-lived RSA-2048 keypair
/// used to open inbound message envelopes.
///
/// The GUID and the private key PEM are persisted in the settings
/// table on first start; this type never touches storage itself.
#[derive(Clone)]
pub struct Identity {
    guid: Uuid,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl Identity {
    /// Generate a fresh identity (first start).
    pub fn generate() -> Result<Self, IdentityError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
            .map_err(|e| IdentityError::GenerationFailed(e.to_string()))?;
        let public_key = private_key.to_public_key();
        Ok(Self {
            guid: Uuid::new_v4(),
            private_key,
            public_key,
        })
    }

    /// Restore an identity from the persisted GUID and PKCS#1 PEM.
    pub fn from_pem(guid: Uuid, private_key_pem: &str) -> Result<Self, IdentityError> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(private_key_pem)
            .map_err(|e| IdentityError::InvalidPrivateKey(e.to_string()))?;
        let public_key = private_key.to_public_key();
        Ok(Self {
            guid,
            private_key,
            public_key,
        })
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// PKCS#1 `RSA PRIVATE KEY` PEM, for persistence.
    pub fn private_key_pem(&self) -> Result<String, IdentityError> {
        self.private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| IdentityError::InvalidPrivateKey(e.to_string()))
    }

    /// PKCS#1 `RSA PUBLIC KEY` PEM, as served by the whoami endpoint.
    ///
    /// This is the same key material peers use to encrypt envelopes
    /// addressed to this node.
    pub fn public_key_pem(&self) -> Result<String, IdentityError> {
        self.public_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
    }
}

/// Parse a peer's PKCS#1 public key PEM as fetched from whoami.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, crate::CryptoError> {
    RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| crate::CryptoError::InvalidPublicKey(e.to_string()))
}
