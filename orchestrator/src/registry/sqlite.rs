//! SQLite registry.
//!
//! Calls are synchronous and a writer may wait up to [`BUSY_TIMEOUT`] for
//! another instance's lock; async callers run them on the blocking pool.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};

use super::{InstanceHeartbeat, ProcessRecord, ProcessRegistry};
use crate::error::{Error, Result};

/// How long a writer waits for another instance's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed registry. Several orchestrator processes may open the same
/// database file.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (and create if needed) the registry at `database_url`.
    pub fn open(database_url: &str) -> Result<Self> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::Registry(format!("create {}: {}", parent.display(), e)))?;
                }
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::create_schema(&conn)?;

        tracing::info!("Registry initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory registry, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS processes (
                model_key TEXT PRIMARY KEY,
                port INTEGER NOT NULL,
                last_active_at INTEGER NOT NULL,
                owner_id TEXT NOT NULL,
                pid INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS managers (
                instance_id TEXT PRIMARY KEY,
                last_heartbeat INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Registry(format!("connection lock poisoned: {}", e)))
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessRecord> {
        let port: i64 = row.get(1)?;
        let pid: Option<i64> = row.get(4)?;
        Ok(ProcessRecord {
            model_key: row.get(0)?,
            port: u16::try_from(port).unwrap_or_default(),
            last_active_at: from_millis(row.get(2)?),
            owner_id: row.get(3)?,
            pid: pid.and_then(|p| u32::try_from(p).ok()),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl ProcessRegistry for SqliteRegistry {
    fn load_all(&self) -> Result<Vec<ProcessRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT model_key, port, last_active_at, owner_id, pid FROM processes ORDER BY model_key",
        )?;
        let records = stmt
            .query_map([], Self::record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn upsert(&self, record: &ProcessRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO processes (model_key, port, last_active_at, owner_id, pid)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (model_key) DO UPDATE SET
                port = excluded.port,
                last_active_at = excluded.last_active_at,
                owner_id = excluded.owner_id,
                pid = excluded.pid",
            params![
                record.model_key,
                record.port as i64,
                record.last_active_at.timestamp_millis(),
                record.owner_id,
                record.pid.map(|p| p as i64),
            ],
        )?;
        tracing::debug!("Upserted record for {} (port {})", record.model_key, record.port);
        Ok(())
    }

    fn delete(&self, model_key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM processes WHERE model_key = ?1", params![model_key])?;
        Ok(())
    }

    fn delete_if_unchanged(&self, record: &ProcessRecord) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM processes
             WHERE model_key = ?1 AND owner_id = ?2 AND last_active_at = ?3",
            params![
                record.model_key,
                record.owner_id,
                record.last_active_at.timestamp_millis(),
            ],
        )?;
        Ok(removed > 0)
    }

    fn delete_all(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM processes", [])?;
        Ok(())
    }

    fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO managers (instance_id, last_heartbeat) VALUES (?1, ?2)",
            params![instance_id, at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn remove_heartbeat(&self, instance_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM managers WHERE instance_id = ?1", params![instance_id])?;
        Ok(())
    }

    fn instances(&self) -> Result<Vec<InstanceHeartbeat>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT instance_id, last_heartbeat FROM managers ORDER BY instance_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(InstanceHeartbeat {
                    instance_id: row.get(0)?,
                    last_seen: from_millis(row.get(1)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
