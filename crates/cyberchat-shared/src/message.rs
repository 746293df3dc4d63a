use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::CryptoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
    /// Synthesized locally (peer-offline notices); never sent on the wire.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageScope {
    Private,
    Broadcast,
}

/// Canonical plaintext message, as stored and as processed by the
/// pipeline. For broadcasts the receiver is absent in this form and
/// rewritten per recipient during fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_guid: Uuid,
    #[serde(default)]
    pub receiver_guid: Option<Uuid>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub scope: MessageScope,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Stamp a locally submitted message: fresh UUID, current time.
    ///
    /// Scope defaults to private when a receiver is named and to
    /// broadcast otherwise; an explicit scope always wins.
    pub fn new(
        sender_guid: Uuid,
        receiver_guid: Option<Uuid>,
        message_type: MessageType,
        content: Vec<u8>,
        scope: Option<MessageScope>,
    ) -> Self {
        let scope = scope.unwrap_or(if receiver_guid.is_some() {
            MessageScope::Private
        } else {
            MessageScope::Broadcast
        });
        Self {
            id: Uuid::new_v4(),
            sender_guid,
            receiver_guid,
            message_type,
            scope,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn validate_content(&self) -> Result<(), CryptoError> {
        if self.content.is_empty() {
            return Err(CryptoError::EmptyContent);
        }
        if self.content.len() > MAX_MESSAGE_SIZE {
            return Err(CryptoError::ContentTooLarge {
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Encrypt for one recipient. The message id doubles as the OAEP
    /// label, binding the ciphertext to this envelope.
    pub fn encrypt(&self, receiver_key: &RsaPublicKey) -> Result<WireMessage, CryptoError> {
        let receiver_guid = self.receiver_guid.ok_or_else(|| {
            CryptoError::EncryptionFailed("wire form requires a receiver".into())
        })?;

        let padding = Oaep::new_with_label::<Sha256, _>(self.id.to_string());
        let ciphertext = receiver_key
            .encrypt(&mut OsRng, padding, &self.content)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(WireMessage {
            id: self.id,
            sender_guid: self.sender_guid,
            receiver_guid,
            message_type: self.message_type,
            scope: self.scope,
            content: BASE64.encode(ciphertext),
            timestamp: self.timestamp,
        })
    }

    pub fn content_string(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// View form consumed by attached UI sessions (string content).
    pub fn to_web(&self) -> WebMessage {
        WebMessage {
            id: self.id.to_string(),
            sender_guid: self.sender_guid.to_string(),
            receiver_guid: self
                .receiver_guid
                .map(|g| g.to_string())
                .unwrap_or_default(),
            message_type: self.message_type,
            scope: self.scope,
            content: self.content_string(),
            timestamp: self.timestamp,
        }
    }
}

/// Encrypted wire form POSTed to a peer's `/api/v1/message`. Only the
/// named receiver can open `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: Uuid,
    pub sender_guid: Uuid,
    pub receiver_guid: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub scope: MessageScope,
    /// base64(RSA-OAEP-SHA256(content, label = id))
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    pub fn decrypt(&self, private_key: &RsaPrivateKey) -> Result<Message, CryptoError> {
        let ciphertext = BASE64.decode(&self.content)?;
        let padding = Oaep::new_with_label::<Sha256, _>(self.id.to_string());
        let content = private_key
            .decrypt(padding, &ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(Message {
            id: self.id,
            sender_guid: self.sender_guid,
            receiver_guid: Some(self.receiver_guid),
            message_type: self.message_type,
            scope: self.scope,
            content,
            timestamp: self.timestamp,
        })
    }
}

/// UI-facing message view. Sender may be the literal `"system"` for
/// locally synthesized notices, so the GUIDs are plain strings here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebMessage {
    pub id: String,
    pub sender_guid: String,
    pub receiver_guid: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub scope: MessageScope,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl WebMessage {
    /// Synthesized system notice shown in the chat stream.
    pub fn system(content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_guid: "system".into(),
            receiver_guid: String::new(),
            message_type: MessageType::System,
            scope: MessageScope::Broadcast,
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Local submission shape, accepted from UI sessions and from the
/// intra-host bridge on the peer message endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMessageRequest {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default, deserialize_with = "empty_guid_as_none")]
    pub receiver_guid: Option<Uuid>,
    #[serde(default)]
    pub scope: Option<MessageScope>,
}

impl NewMessageRequest {
    pub fn into_message(self, sender_guid: Uuid) -> Message {
        Message::new(
            sender_guid,
            self.receiver_guid,
            self.message_type,
            self.content.into_bytes(),
            self.scope,
        )
    }
}

/// Accepts a UUID, `null`, a missing field, or `""` (clients send the
/// empty string to mean "broadcast").
fn empty_guid_as_none<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => Uuid::parse_str(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Outcome of one recipient within a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub peer_guid: Uuid,
    pub peer_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub time: DateTime<Utc>,
}

impl DeliveryStatus {
    pub fn success(peer_guid: Uuid, peer_name: String) -> Self {
        Self {
            peer_guid,
            peer_name,
            success: true,
            error: None,
            time: Utc::now(),
        }
    }

    pub fn failure(peer_guid: Uuid, peer_name: String, reason: String) -> Self {
        Self {
            peer_guid,
            peer_name,
            success: false,
            error: Some(reason),
            time: Utc::now(),
        }
    }
}

/// Per-send aggregation of recipient outcomes. Built transiently; the
/// `summary` string is the canonical user-visible result of a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub message_id: Uuid,
    pub total_peers: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub delivery_time: DateTime<Utc>,
    pub peer_statuses: Vec<DeliveryStatus>,
    pub summary: String,
}

impl DeliveryReport {
    pub fn new(message_id: Uuid) -> Self {
        Self {
            message_id,
            total_peers: 0,
            succeeded: 0,
            failed: 0,
            delivery_time: Utc::now(),
            peer_statuses: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn record(&mut self, status: DeliveryStatus) {
        if status.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.peer_statuses.push(status);
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_peers == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total_peers as f64 * 100.0
    }

    pub fn finalize(&mut self, scope: MessageScope) {
        self.summary = if self.total_peers > 0 {
            format!(
                "Delivered to {}/{} peers ({:.1}% success)",
                self.succeeded,
                self.total_peers,
                self.success_rate()
            )
        } else if scope == MessageScope::Broadcast {
            "No peers available for broadcast".to_string()
        } else {
            String::new()
        };
    }
}
