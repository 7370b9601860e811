// Settings repository
// Key-value access to the settings table plus the typed manager settings

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::models::ManagerSettings;
use super::DatabaseManager;

pub const KEY_USE_AUTO_RELEASE: &str = "use_auto_release";
pub const KEY_USE_ACCELERATION: &str = "use_acceleration";
pub const KEY_N_CONTEXT: &str = "n_context";
pub const KEY_N_GPU_LAYERS: &str = "n_gpu_layers";

impl DatabaseManager {
    /// Get a single setting by key
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            get_setting_impl(conn, key)
        })
    }

    /// Set a single setting
    pub fn set_setting(&self, key: &str, value: &str, value_type: &str) -> Result<()> {
        self.with_connection(|conn| {
            set_setting_impl(conn, key, value, value_type)
        })
    }

    pub fn set_bool_setting(&self, key: &str, value: bool) -> Result<()> {
        self.set_setting(key, if value { "true" } else { "false" }, "boolean")
    }

    pub fn get_bool_setting(&self, key: &str, default: bool) -> Result<bool> {
        match self.get_setting(key)? {
            Some(v) => Ok(v == "true"),
            None => Ok(default),
        }
    }

    pub fn set_u32_setting(&self, key: &str, value: u32) -> Result<()> {
        self.set_setting(key, &value.to_string(), "integer")
    }

    /// Unparseable values fall back to `default`
    pub fn get_u32_setting(&self, key: &str, default: u32) -> Result<u32> {
        match self.get_setting(key)? {
            Some(v) => Ok(v.parse().unwrap_or_else(|_| {
                log::warn!("Ignoring invalid integer setting {}={}", key, v);
                default
            })),
            None => Ok(default),
        }
    }

    /// Load manager settings, using defaults for anything not stored yet
    pub fn load_manager_settings(&self) -> Result<ManagerSettings> {
        let defaults = ManagerSettings::default();
        Ok(ManagerSettings {
            use_auto_release: self.get_bool_setting(KEY_USE_AUTO_RELEASE, defaults.use_auto_release)?,
            use_acceleration: self.get_bool_setting(KEY_USE_ACCELERATION, defaults.use_acceleration)?,
            n_context: self.get_u32_setting(KEY_N_CONTEXT, defaults.n_context)?,
            n_gpu_layers: self.get_u32_setting(KEY_N_GPU_LAYERS, defaults.n_gpu_layers)?,
        })
    }

    pub fn save_manager_settings(&self, settings: &ManagerSettings) -> Result<()> {
        self.set_bool_setting(KEY_USE_AUTO_RELEASE, settings.use_auto_release)?;
        self.set_bool_setting(KEY_USE_ACCELERATION, settings.use_acceleration)?;
        self.set_u32_setting(KEY_N_CONTEXT, settings.n_context)?;
        self.set_u32_setting(KEY_N_GPU_LAYERS, settings.n_gpu_layers)
    }
}

fn get_setting_impl(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT value FROM settings WHERE key = ?"
    ).context("Failed to prepare get_setting query")?;

    let result = stmt.query_row(params![key], |row| row.get(0));

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to get setting"),
    }
}

fn set_setting_impl(conn: &Connection, key: &str, value: &str, value_type: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO settings (key, value, value_type, updated_at)
        VALUES (?1, ?2, ?3, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            value_type = excluded.value_type,
            updated_at = datetime('now')
        "#,
        params![key, value, value_type],
    ).context("Failed to set setting")?;

    Ok(())
}
