use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::FileRecord;

impl Database {
    /// Register a shared file path. The content is never copied; the
    /// record just points at the sender's filesystem.
    pub fn insert_file(&self, file: &FileRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO files
                 (file_id, sender_guid, receiver_guid, filename, path, size, mime_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                file.file_id.to_string(),
                file.sender_guid.to_string(),
                file.receiver_guid.map(|g| g.to_string()),
                file.filename,
                file.path,
                file.size,
                file.mime_type,
                file.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, file_id: Uuid) -> Result<Option<FileRecord>> {
        let file = self
            .conn()
            .query_row(
                "SELECT file_id, sender_guid, receiver_guid, filename, path, size, mime_type, created_at
                 FROM files WHERE file_id = ?1",
                params![file_id.to_string()],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT file_id, sender_guid, receiver_guid, filename, path, size, mime_type, created_at
             FROM files
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_file)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn truncate_files(&self) -> Result<()> {
        self.conn().execute("DELETE FROM files", [])?;
        Ok(())
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let id_str: String = row.get(0)?;
    let sender_str: String = row.get(1)?;
    let receiver_str: Option<String> = row.get(2)?;
    let ts_str: String = row.get(7)?;

    let file_id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender_guid = Uuid::parse_str(&sender_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let receiver_guid = receiver_str
        .filter(|s| !s.is_empty())
        .map(|s| {
            Uuid::parse_str(&s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(FileRecord {
        file_id,
        sender_guid,
        receiver_guid,
        filename: row.get(3)?,
        path: row.get(4)?,
        size: row.get(5)?,
        mime_type: row.get(6)?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FileRecord {
        FileRecord {
            file_id: Uuid::new_v4(),
            sender_guid: Uuid::new_v4(),
            receiver_guid: None,
            filename: "report.pdf".into(),
            path: "/home/alice/report.pdf".into(),
            size: 4096,
            mime_type: "application/pdf".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let file = record();

        db.insert_file(&file).unwrap();
        let loaded = db.get_file(file.file_id).unwrap().unwrap();
        assert_eq!(loaded.filename, "report.pdf");
        assert_eq!(loaded.size, 4096);
        assert!(loaded.receiver_guid.is_none());

        assert!(db.get_file(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_file_id_rejected() {
        let db = Database::open_in_memory().unwrap();
        let file = record();

        db.insert_file(&file).unwrap();
        assert!(db.insert_file(&file).is_err());
    }

    #[test]
    fn test_list_and_truncate() {
        let db = Database::open_in_memory().unwrap();
        db.insert_file(&record()).unwrap();
        db.insert_file(&record()).unwrap();

        assert_eq!(db.list_files().unwrap().len(), 2);

        db.truncate_files().unwrap();
        assert!(db.list_files().unwrap().is_empty());
    }
}
