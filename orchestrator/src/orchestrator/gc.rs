//! Periodic reclamation of idle, orphaned and dead workers.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use super::{LocalWorker, Orchestrator};
use crate::error::Result;
use crate::registry::ProcessRecord;

/// What one garbage collection cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    /// Expired workers claimed and killed.
    pub evicted: Vec<String>,
    /// Local workers whose record vanished or was taken over.
    pub orphaned: Vec<String>,
    /// Local workers that had already exited.
    pub exited: Vec<String>,
    /// Expired records claimed first by another instance, or not ours yet.
    pub skipped: Vec<String>,
    /// Workers whose termination failed; they are forgotten anyway.
    pub failed: Vec<String>,
}

impl GcSummary {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
            && self.orphaned.is_empty()
            && self.exited.is_empty()
            && self.failed.is_empty()
    }
}

impl Orchestrator {
    /// Run one garbage collection cycle.
    ///
    /// A record is expired once idle longer than the TTL. Expired records
    /// owned by this instance are reclaimed right away; those owned by other
    /// instances only once idle past the stale threshold, which covers owners
    /// that died without cleaning up. Each expired record is claimed with a
    /// conditional delete before the worker is killed, so a worker touched
    /// concurrently by another instance is left alone.
    pub async fn collect_garbage(&self) -> Result<GcSummary> {
        let mut summary = GcSummary::default();
        let mut workers = self.workers.lock().await;

        let records = self.load_records().await?;
        let now = self.clock.now();

        // Local workers that died on their own
        let dead: Vec<String> = workers
            .iter_mut()
            .filter_map(|(key, w)| w.handle.has_exited().then(|| key.clone()))
            .collect();
        for model_key in dead {
            let Some(local) = workers.remove(&model_key) else {
                continue;
            };
            tracing::warn!(model_key = %model_key, port = local.port, "Worker exited unexpectedly");
            if let Some(record) = records.get(&model_key) {
                if self.owns_record(record, &local) {
                    if let Err(e) = self.delete_record(&model_key).await {
                        tracing::warn!(model_key = %model_key, "Failed to delete record: {}", e);
                    }
                }
            }
            summary.exited.push(model_key);
        }

        // Local workers nobody can reach through the registry anymore
        let orphans: Vec<String> = workers
            .iter()
            .filter(|(key, local)| {
                records
                    .get(*key)
                    .map_or(true, |record| !self.owns_record(record, local))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for model_key in orphans {
            let local = workers.remove(&model_key);
            tracing::info!(model_key = %model_key, "Killing orphaned worker");
            let report = self.kill_worker(&model_key, local, None).await;
            if report.succeeded() {
                summary.orphaned.push(model_key);
            } else {
                summary.failed.push(model_key);
            }
        }

        let ttl = self.config.ttl();
        let stale_after = self.config.stale_after();
        for record in records.values() {
            let idle = record.idle_for(now);
            if idle <= ttl {
                continue;
            }
            let ours = record.is_owned_by(&self.instance_id);
            if !ours && idle <= stale_after {
                summary.skipped.push(record.model_key.clone());
                continue;
            }

            let claim = record.clone();
            let claimed = self
                .with_registry(move |registry| registry.delete_if_unchanged(&claim))
                .await;
            match claimed {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        model_key = %record.model_key,
                        "Record changed since it was read, not evicting"
                    );
                    summary.skipped.push(record.model_key.clone());
                    continue;
                }
                Err(e) => {
                    tracing::warn!(model_key = %record.model_key, "Failed to claim record: {}", e);
                    summary.failed.push(record.model_key.clone());
                    continue;
                }
            }

            let same_worker = workers
                .get(&record.model_key)
                .map_or(false, |local| local.port == record.port);
            let local = if same_worker {
                workers.remove(&record.model_key)
            } else {
                None
            };
            tracing::info!(
                model_key = %record.model_key,
                port = record.port,
                owner_id = %record.owner_id,
                idle_secs = idle.as_secs(),
                "Evicting idle worker"
            );
            let report = self.kill_worker(&record.model_key, local, record.pid).await;
            if report.succeeded() || report.nothing_attempted() {
                summary.evicted.push(record.model_key.clone());
            } else {
                summary.failed.push(record.model_key.clone());
            }
        }

        if !summary.is_empty() {
            tracing::info!(
                evicted = summary.evicted.len(),
                orphaned = summary.orphaned.len(),
                exited = summary.exited.len(),
                failed = summary.failed.len(),
                "Garbage collection finished"
            );
        }
        Ok(summary)
    }

    fn owns_record(&self, record: &ProcessRecord, local: &LocalWorker) -> bool {
        record.is_owned_by(&self.instance_id) && record.port == local.port
    }

    /// Run garbage collection every `gc_interval` until `stop_all`.
    pub fn spawn_gc_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run_gc_loop().await })
    }

    async fn run_gc_loop(&self) {
        let mut interval = tokio::time::interval(self.config.gc_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            if self.is_terminal() {
                tracing::debug!("Garbage collection loop stopped");
                break;
            }
            if let Err(e) = self.collect_garbage().await {
                tracing::warn!("Garbage collection failed: {}", e);
            }
        }
    }
}
