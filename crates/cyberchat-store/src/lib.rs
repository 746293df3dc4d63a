pub mod database;
pub mod files;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod peers;
pub mod settings;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
