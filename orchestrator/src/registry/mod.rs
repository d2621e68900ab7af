//! Durable bookkeeping shared by every orchestrator instance.
//!
//! The registry holds one row per live (or recently live) worker and one
//! heartbeat row per orchestrator instance. Each call is atomic on its own;
//! there are no multi-record transactions and no cross-instance locks, so
//! concurrent upserts to the same key are last-write-wins.

mod sqlite;

pub use sqlite::SqliteRegistry;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

/// A worker process as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    /// Sanitized model key, primary key of the record.
    pub model_key: String,
    /// Port the worker listens on.
    pub port: u16,
    /// Last time the worker was resolved or touched.
    pub last_active_at: DateTime<Utc>,
    /// Instance holding the process handle.
    pub owner_id: String,
    /// OS process id, for termination by instances without the handle.
    pub pid: Option<u32>,
}

impl ProcessRecord {
    /// Idle time at `now`, zero if the record is stamped in the future.
    pub fn idle_for(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.last_active_at).to_std().unwrap_or_default()
    }

    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.owner_id == instance_id
    }
}

/// Liveness row of an orchestrator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceHeartbeat {
    pub instance_id: String,
    pub last_seen: DateTime<Utc>,
}

/// Storage for process records and instance heartbeats.
pub trait ProcessRegistry: Send + Sync {
    /// Every process record.
    fn load_all(&self) -> Result<Vec<ProcessRecord>>;

    /// Insert or replace the record for `record.model_key`.
    fn upsert(&self, record: &ProcessRecord) -> Result<()>;

    /// Remove the record for a key. Removing an absent key is not an error.
    fn delete(&self, model_key: &str) -> Result<()>;

    /// Remove the record only if its owner and activity stamp still match
    /// `record`. Returns whether a row was removed.
    fn delete_if_unchanged(&self, record: &ProcessRecord) -> Result<bool>;

    /// Remove every process record.
    fn delete_all(&self) -> Result<()>;

    /// Record that `instance_id` was alive at `at`.
    fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Remove the heartbeat row of an instance.
    fn remove_heartbeat(&self, instance_id: &str) -> Result<()>;

    /// Every heartbeat row.
    fn instances(&self) -> Result<Vec<InstanceHeartbeat>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_idle_for() {
        let now = Utc::now();
        let record = ProcessRecord {
            model_key: "a.bin".to_string(),
            port: 4000,
            last_active_at: now - Duration::seconds(61),
            owner_id: "me".to_string(),
            pid: Some(42),
        };
        assert_eq!(record.idle_for(now).as_secs(), 61);
        assert!(record.is_owned_by("me"));
        assert!(!record.is_owned_by("you"));
    }

    #[test]
    fn test_idle_for_future_stamp_is_zero() {
        let now = Utc::now();
        let record = ProcessRecord {
            model_key: "a.bin".to_string(),
            port: 4000,
            last_active_at: now + Duration::seconds(5),
            owner_id: "me".to_string(),
            pid: None,
        };
        assert_eq!(record.idle_for(now), std::time::Duration::ZERO);
    }
}
