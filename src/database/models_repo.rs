// Model catalog repository
// Persists catalog entries as JSON rows, keeping insertion order

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::catalog::ModelEntry;
use super::DatabaseManager;

impl DatabaseManager {
    /// All stored entries in insertion order
    pub fn load_model_entries(&self) -> Result<Vec<ModelEntry>> {
        self.with_connection(|conn| {
            load_model_entries_impl(conn)
        })
    }

    /// Insert or replace an entry; new entries go to the end of the list
    pub fn upsert_model_entry(&self, entry: &ModelEntry) -> Result<()> {
        self.with_connection(|conn| {
            upsert_model_entry_impl(conn, entry)
        })
    }

    pub fn delete_model_entry(&self, model_id: &str) -> Result<()> {
        self.with_connection(|conn| {
            delete_model_entry_impl(conn, model_id)
        })
    }
}

fn load_model_entries_impl(conn: &Connection) -> Result<Vec<ModelEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, data FROM models ORDER BY position"
    ).context("Failed to prepare load_model_entries query")?;

    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    }).context("Failed to query models")?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, data) = row.context("Failed to read model row")?;
        match serde_json::from_str::<ModelEntry>(&data) {
            Ok(entry) => entries.push(entry),
            Err(e) => log::warn!("Skipping unreadable model entry '{}': {}", id, e),
        }
    }

    Ok(entries)
}

fn upsert_model_entry_impl(conn: &Connection, entry: &ModelEntry) -> Result<()> {
    let data = serde_json::to_string(entry)
        .context("Failed to serialize model entry")?;

    conn.execute(
        r#"
        INSERT INTO models (id, origin, position, data, updated_at)
        VALUES (
            ?1, ?2,
            (SELECT COALESCE(MAX(position), -1) + 1 FROM models),
            ?3, datetime('now')
        )
        ON CONFLICT(id) DO UPDATE SET
            origin = excluded.origin,
            data = excluded.data,
            updated_at = datetime('now')
        "#,
        params![entry.id, entry.origin.as_str(), data],
    ).context("Failed to upsert model entry")?;

    Ok(())
}

fn delete_model_entry_impl(conn: &Connection, model_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM models WHERE id = ?",
        params![model_id],
    ).context("Failed to delete model entry")?;

    Ok(())
}
