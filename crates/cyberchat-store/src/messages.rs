use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use cyberchat_shared::{Message, MessageScope, MessageType};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::StoredMessage;

impl Database {
    /// Store the canonical plaintext form of a message.
    ///
    /// Idempotent on the message id: a second insert with the same id
    /// is ignored and reported as `false` (at-most-once per node).
    pub fn insert_message(&self, message: &Message, source_ip: Option<&str>) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                 (id, sender_guid, receiver_guid, type, scope, content, timestamp, source_ip)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.sender_guid.to_string(),
                message
                    .receiver_guid
                    .map(|g| g.to_string())
                    .unwrap_or_default(),
                type_to_str(message.message_type),
                scope_to_str(message.scope),
                message.content,
                message.timestamp.to_rfc3339(),
                source_ip,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// The authoritative duplicate check for the pipeline.
    pub fn message_exists(&self, id: Uuid) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Messages newer than `since`, most recent first, capped at `limit`.
    pub fn get_messages(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, sender_guid, receiver_guid, type, scope, content, timestamp, source_ip
             FROM messages
             WHERE timestamp > ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since.to_rfc3339(), limit], row_to_message)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Daily retention sweep. Returns the number of rows removed.
    pub fn delete_messages_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }

    /// Delete every stored message and reclaim the space.
    pub fn truncate_messages(&self) -> Result<()> {
        self.conn().execute("DELETE FROM messages", [])?;
        self.conn().execute_batch("VACUUM")?;
        Ok(())
    }
}

fn type_to_str(t: MessageType) -> &'static str {
    match t {
        MessageType::Text => "text",
        MessageType::Image => "image",
        MessageType::File => "file",
        MessageType::System => "system",
    }
}

fn str_to_type(s: &str) -> Option<MessageType> {
    match s {
        "text" => Some(MessageType::Text),
        "image" => Some(MessageType::Image),
        "file" => Some(MessageType::File),
        "system" => Some(MessageType::System),
        _ => None,
    }
}

fn scope_to_str(s: MessageScope) -> &'static str {
    match s {
        MessageScope::Private => "private",
        MessageScope::Broadcast => "broadcast",
    }
}

fn str_to_scope(s: &str) -> Option<MessageScope> {
    match s {
        "private" => Some(MessageScope::Private),
        "broadcast" => Some(MessageScope::Broadcast),
        _ => None,
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id_str: String = row.get(0)?;
    let sender_str: String = row.get(1)?;
    let type_str: String = row.get(3)?;
    let scope_str: String = row.get(4)?;
    let ts_str: String = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender_guid = Uuid::parse_str(&sender_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let message_type = str_to_type(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown message type: {type_str}").into(),
        )
    })?;
    let scope = str_to_scope(&scope_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown message scope: {scope_str}").into(),
        )
    })?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(StoredMessage {
        id,
        sender_guid,
        receiver_guid: row.get(2)?,
        message_type,
        scope,
        content: row.get(5)?,
        timestamp,
        source_ip: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(content: &[u8]) -> Message {
        Message::new(
            Uuid::new_v4(),
            None,
            MessageType::Text,
            content.to_vec(),
            None,
        )
    }

    #[test]
    fn test_insert_and_query() {
        let db = Database::open_in_memory().unwrap();
        let msg = message(b"hello");

        assert!(db.insert_message(&msg, Some("192.168.1.2")).unwrap());
        assert!(db.message_exists(msg.id).unwrap());

        let loaded = db.get_messages(Utc::now() - Duration::hours(1), 100).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, msg.id);
        assert_eq!(loaded[0].content, b"hello");
        assert_eq!(loaded[0].source_ip.as_deref(), Some("192.168.1.2"));
    }

    #[test]
    fn test_duplicate_insert_ignored() {
        let db = Database::open_in_memory().unwrap();
        let msg = message(b"once");

        assert!(db.insert_message(&msg, None).unwrap());
        assert!(!db.insert_message(&msg, None).unwrap());

        let loaded = db.get_messages(Utc::now() - Duration::hours(1), 100).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_retention_sweep() {
        let db = Database::open_in_memory().unwrap();

        let mut old = message(b"old");
        old.timestamp = Utc::now() - Duration::days(40);
        let fresh = message(b"fresh");

        db.insert_message(&old, None).unwrap();
        db.insert_message(&fresh, None).unwrap();

        let removed = db
            .delete_messages_older_than(Utc::now() - Duration::days(30))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!db.message_exists(old.id).unwrap());
        assert!(db.message_exists(fresh.id).unwrap());
    }

    #[test]
    fn test_truncate() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&message(b"a"), None).unwrap();
        db.insert_message(&message(b"b"), None).unwrap();

        db.truncate_messages().unwrap();
        let loaded = db.get_messages(Utc::now() - Duration::hours(1), 100).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_query_limit() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5i64 {
            let mut msg = message(format!("m{i}").as_bytes());
            msg.timestamp = Utc::now() - Duration::seconds(10 - i);
            db.insert_message(&msg, None).unwrap();
        }

        let loaded = db.get_messages(Utc::now() - Duration::hours(1), 3).unwrap();
        assert_eq!(loaded.len(), 3);
        // Most recent first.
        assert!(loaded[0].timestamp >= loaded[1].timestamp);
    }
}
