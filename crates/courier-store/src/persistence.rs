//! SQLite persistence for tasks and settings
//!
//! Each task is one row holding its full JSON record. Settings are a small
//! key/value table; the active forwarding identity lives there.

use anyhow::{Context, Result};
use chrono::Utc;
use courier_core::Task;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

/// Settings key for the active forwarding identity
pub const FORWARD_MODE_KEY: &str = "forward_mode";

/// Create tables if they don't exist. Safe to call multiple times.
pub fn init_tables(conn: &Connection) -> Result<()> {
    debug!("Initializing relay tables");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS relay_tasks (
            name TEXT PRIMARY KEY,
            data_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create relay_tasks table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS relay_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create relay_settings table")?;

    info!("Relay tables initialized");
    Ok(())
}

/// Insert or replace a task row
pub fn save_task(conn: &Connection, task: &Task) -> Result<()> {
    let data_json = serde_json::to_string(task)
        .with_context(|| format!("Failed to serialize task {}", task.name))?;

    conn.execute(
        "INSERT INTO relay_tasks (name, data_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET
            data_json = excluded.data_json,
            updated_at = excluded.updated_at",
        params![&task.name, &data_json, Utc::now().to_rfc3339()],
    )
    .context("Failed to save task")?;

    debug!("Saved task: {} ({} bytes)", task.name, data_json.len());
    Ok(())
}

fn decode_task(name: String, data_json: &str) -> Result<Task> {
    let mut task: Task = serde_json::from_str(data_json)
        .with_context(|| format!("Failed to deserialize task {}", name))?;
    // The row key is authoritative
    if task.name != name {
        warn!("Task record {} carries name {}, using row key", name, task.name);
        task.name = name;
    }
    Ok(task)
}

/// Load every task. Rows that fail to decode are skipped with a warning.
pub fn load_tasks(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn
        .prepare("SELECT name, data_json FROM relay_tasks ORDER BY name")
        .context("Failed to prepare task query")?;

    let tasks: Vec<Task> = stmt
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let data_json: String = row.get(1)?;
            Ok((name, data_json))
        })
        .context("Failed to query tasks")?
        .filter_map(|result| match result {
            Ok((name, data_json)) => match decode_task(name, &data_json) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("{:#}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read task row: {}", e);
                None
            }
        })
        .collect();

    debug!("Loaded {} tasks", tasks.len());
    Ok(tasks)
}

/// Load one task row; `None` if no row exists
pub fn load_task(conn: &Connection, name: &str) -> Result<Option<Task>> {
    let data_json: Option<String> = conn
        .query_row(
            "SELECT data_json FROM relay_tasks WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query task")?;

    data_json
        .map(|json| decode_task(name.to_string(), &json))
        .transpose()
}

pub fn task_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM relay_tasks WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query task")?;
    Ok(found.is_some())
}

/// Delete a task row. Returns whether a row was removed.
pub fn delete_task(conn: &Connection, name: &str) -> Result<bool> {
    let rows = conn
        .execute("DELETE FROM relay_tasks WHERE name = ?1", params![name])
        .context("Failed to delete task")?;
    Ok(rows > 0)
}

/// Replace the row for `old_name` with `task` in one transaction
pub fn rename_task(conn: &mut Connection, old_name: &str, task: &Task) -> Result<()> {
    let tx = conn.transaction().context("Failed to begin rename")?;
    tx.execute("DELETE FROM relay_tasks WHERE name = ?1", params![old_name])
        .context("Failed to remove old task row")?;
    save_task(&tx, task)?;
    tx.commit().context("Failed to commit rename")?;

    info!("Renamed task {} -> {}", old_name, task.name);
    Ok(())
}

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM relay_settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .context("Failed to query setting")
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO relay_settings (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, value, Utc::now().to_rfc3339()],
    )
    .context("Failed to save setting")?;

    debug!("Saved setting {} = {}", key, value);
    Ok(())
}
