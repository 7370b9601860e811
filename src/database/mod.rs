// Database module
// SQLite persistence for the model catalog and manager settings

pub mod manager;
pub mod migrations;
pub mod models;
pub mod settings_repo;
pub mod models_repo;

pub use manager::DatabaseManager;
pub use models::*;
