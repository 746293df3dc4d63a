use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cyberchat_shared::{MessageScope, MessageType};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRecord {
    pub guid: Uuid,
    pub name: String,
    pub public_key: Option<String>,
    pub ip_address: String,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub sender_guid: Uuid,
    /// Empty string for canonical broadcast rows.
    pub receiver_guid: String,
    pub message_type: MessageType,
    pub scope: MessageScope,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: Uuid,
    pub sender_guid: Uuid,
    pub receiver_guid: Option<Uuid>,
    pub filename: String,
    pub path: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}
