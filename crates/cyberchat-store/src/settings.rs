//! Key/value settings: node GUID, display name, keypair PEM, and the
//! client API key all live here.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

pub const SETTING_GUID: &str = "guid";
pub const SETTING_NAME: &str = "name";
pub const SETTING_PRIVATE_KEY: &str = "private_key";
pub const SETTING_PUBLIC_KEY: &str = "public_key";
pub const SETTING_CLIENT_API_KEY: &str = "client_api_key";

impl Database {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Display name, defaulting like a fresh install.
    pub fn display_name(&self) -> Result<String> {
        Ok(self
            .get_setting(SETTING_NAME)?
            .unwrap_or_else(|| "Anonymous".to_string()))
    }
}
