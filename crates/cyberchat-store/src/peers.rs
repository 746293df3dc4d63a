use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::PeerRecord;

impl Database {
    /// Insert or refresh a peer row.
    ///
    /// An empty incoming name or absent public key never clobbers a
    /// previously stored value; discovery often observes a peer before
    /// its key has been fetched.
    pub fn upsert_peer(&self, peer: &PeerRecord) -> Result<()> {
        let name = if peer.name.is_empty() {
            format!("Peer-{}", &peer.guid.to_string()[..8])
        } else {
            peer.name.clone()
        };

        self.conn().execute(
            "INSERT INTO peers (guid, name, public_key, ip_address, port, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(guid) DO UPDATE SET
                 ip_address = excluded.ip_address,
                 port = excluded.port,
                 name = CASE
                     WHEN excluded.name != '' THEN excluded.name
                     ELSE name
                 END,
                 public_key = CASE
                     WHEN excluded.public_key IS NOT NULL THEN excluded.public_key
                     ELSE public_key
                 END,
                 last_seen = excluded.last_seen",
            params![
                peer.guid.to_string(),
                name,
                peer.public_key,
                peer.ip_address,
                peer.port,
                peer.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_peer(&self, guid: Uuid) -> Result<Option<PeerRecord>> {
        let peer = self
            .conn()
            .query_row(
                "SELECT guid, name, public_key, ip_address, port, last_seen
                 FROM peers WHERE guid = ?1",
                params![guid.to_string()],
                row_to_peer,
            )
            .optional()?;
        Ok(peer)
    }

    /// Peers whose `last_seen` is after the cutoff, most recent first.
    /// Used to repopulate the active set on start.
    pub fn get_peers_seen_after(&self, cutoff: DateTime<Utc>) -> Result<Vec<PeerRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT guid, name, public_key, ip_address, port, last_seen
             FROM peers
             WHERE last_seen > ?1
             ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], row_to_peer)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn delete_peer(&self, guid: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM peers WHERE guid = ?1",
            params![guid.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerRecord> {
    let guid_str: String = row.get(0)?;
    let ts_str: String = row.get(5)?;

    let guid = Uuid::parse_str(&guid_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_seen: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(PeerRecord {
        guid,
        name: row.get(1)?,
        public_key: row.get(2)?,
        ip_address: row.get(3)?,
        port: row.get(4)?,
        last_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(guid: Uuid, last_seen: DateTime<Utc>) -> PeerRecord {
        PeerRecord {
            guid,
            name: "alice".into(),
            public_key: None,
            ip_address: "192.168.1.10".into(),
            port: 7331,
            last_seen,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let guid = Uuid::new_v4();

        db.upsert_peer(&record(guid, Utc::now())).unwrap();
        let loaded = db.get_peer(guid).unwrap().unwrap();
        assert_eq!(loaded.name, "alice");
        assert_eq!(loaded.port, 7331);

        assert!(db.get_peer(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_upsert_preserves_key_and_name() {
        let db = Database::open_in_memory().unwrap();
        let guid = Uuid::new_v4();

        let mut peer = record(guid, Utc::now());
        peer.public_key = Some("PEM".into());
        db.upsert_peer(&peer).unwrap();

        // Later observation without key or name must not wipe them.
        let mut bare = record(guid, Utc::now());
        bare.name = String::new();
        bare.public_key = None;
        bare.ip_address = "10.0.0.5".into();
        db.upsert_peer(&bare).unwrap();

        let loaded = db.get_peer(guid).unwrap().unwrap();
        assert_eq!(loaded.public_key.as_deref(), Some("PEM"));
        assert_eq!(loaded.name, "alice");
        assert_eq!(loaded.ip_address, "10.0.0.5");
    }

    #[test]
    fn test_default_name_from_guid() {
        let db = Database::open_in_memory().unwrap();
        let guid = Uuid::new_v4();

        let mut peer = record(guid, Utc::now());
        peer.name = String::new();
        db.upsert_peer(&peer).unwrap();

        let loaded = db.get_peer(guid).unwrap().unwrap();
        assert_eq!(loaded.name, format!("Peer-{}", &guid.to_string()[..8]));
    }

    #[test]
    fn test_seen_after_filter() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        db.upsert_peer(&record(fresh, now)).unwrap();
        db.upsert_peer(&record(stale, now - Duration::minutes(30)))
            .unwrap();

        let active = db.get_peers_seen_after(now - Duration::minutes(10)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].guid, fresh);
    }

    #[test]
    fn test_delete() {
        let db = Database::open_in_memory().unwrap();
        let guid = Uuid::new_v4();
        db.upsert_peer(&record(guid, Utc::now())).unwrap();

        assert!(db.delete_peer(guid).unwrap());
        assert!(!db.delete_peer(guid).unwrap());
    }
}
