//! Worker process orchestration.
//!
//! An [`Orchestrator`] hands out the port of a running worker for a model,
//! spawning one on demand, reusing it while active and reclaiming it after
//! inactivity. Several orchestrator instances may share one registry; the
//! instance that spawned a worker owns its process handle, others only see
//! the persisted record.
//!
//! Every operation and every garbage collection cycle holds the instance's
//! worker table lock for its whole duration, so mutations never interleave
//! within one instance. Across instances the registry is the only shared
//! state and there is no lock: two instances racing on the same absent key
//! may both spawn, and the loser is reconciled by probe-based adoption and
//! the orphan sweep of the garbage collector.

mod gc;
mod kill;
mod models;

pub use gc::GcSummary;
pub use kill::KillReport;
pub use models::sanitize_model_key;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleet_common::ModelEntry;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::health::{HealthProbe, HttpProber};
use crate::ports;
use crate::process::{
    resident_memory_bytes, LaunchSpec, LlamaLauncher, ProcessLauncher, WorkerHandle,
};
use crate::registry::{InstanceHeartbeat, ProcessRecord, ProcessRegistry};

/// Lifecycle state of a model's worker as seen from this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No record in the registry.
    Absent,
    /// Recorded, but not answering its liveness endpoint yet.
    Starting,
    /// Recorded and answering.
    Running,
}

/// A worker spawned by this instance.
struct LocalWorker {
    port: u16,
    pid: Option<u32>,
    handle: Box<dyn WorkerHandle>,
}

/// Worker process orchestrator.
pub struct Orchestrator {
    instance_id: String,
    config: OrchestratorConfig,
    registry: Arc<dyn ProcessRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    prober: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    /// Map of model_key -> worker spawned by this instance
    workers: Mutex<HashMap<String, LocalWorker>>,
    /// Set by `stop_all`; no worker is spawned afterwards
    terminal: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        instance_id: String,
        config: OrchestratorConfig,
        registry: Arc<dyn ProcessRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
        prober: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        tracing::info!(
            instance_id = %instance_id,
            model_dir = %config.model_dir,
            ports = %format!("{}-{}", config.base_port, config.max_port),
            ttl_secs = config.ttl_secs,
            "Orchestrator initialized"
        );
        Self {
            instance_id,
            config,
            registry,
            launcher,
            prober,
            clock,
            workers: Mutex::new(HashMap::new()),
            terminal: AtomicBool::new(false),
        }
    }

    /// Orchestrator with the production launcher, HTTP prober and system clock.
    pub fn with_defaults(
        instance_id: String,
        config: OrchestratorConfig,
        registry: Arc<dyn ProcessRegistry>,
    ) -> Self {
        let launcher = Arc::new(LlamaLauncher::new(&config));
        let prober = Arc::new(HttpProber::new(&config.worker_host, config.probe_timeout()));
        Self::new(instance_id, config, registry, launcher, prober, Arc::new(SystemClock))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// True once `stop_all` has been called.
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_terminal() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn model_path(&self, model_key: &str) -> PathBuf {
        PathBuf::from(&self.config.model_dir).join(model_key)
    }

    /// Run a registry call on the blocking pool.
    ///
    /// Registry calls are synchronous and may wait out another instance's
    /// database lock, so they never run on the async executor.
    async fn with_registry<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&dyn ProcessRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || call(registry.as_ref()))
            .await
            .map_err(|e| Error::Internal(format!("registry task failed: {}", e)))?
    }

    async fn upsert_record(&self, record: ProcessRecord) -> Result<()> {
        self.with_registry(move |registry| registry.upsert(&record)).await
    }

    async fn delete_record(&self, model_key: &str) -> Result<()> {
        let model_key = model_key.to_string();
        self.with_registry(move |registry| registry.delete(&model_key)).await
    }

    /// Heartbeat, then load every record keyed by model key.
    async fn load_records(&self) -> Result<HashMap<String, ProcessRecord>> {
        let instance_id = self.instance_id.clone();
        let now = self.clock.now();
        let records = self
            .with_registry(move |registry| {
                if let Err(e) = registry.heartbeat(&instance_id, now) {
                    tracing::warn!("Failed to write heartbeat: {}", e);
                }
                registry.load_all()
            })
            .await
            .map_err(|e| {
                tracing::error!("Failed to load registry: {}", e);
                e
            })?;
        Ok(records
            .into_iter()
            .map(|r| (r.model_key.clone(), r))
            .collect())
    }

    /// Port of a worker serving `raw_model_key`, spawning one if needed.
    ///
    /// The port is returned as soon as the worker is spawned; it may not
    /// accept connections yet.
    pub async fn resolve(&self, raw_model_key: &str) -> Result<u16> {
        self.ensure_running()?;
        let model_key = sanitize_model_key(raw_model_key)?;

        let mut workers = self.workers.lock().await;
        // stop_all may have run while we waited for the lock
        self.ensure_running()?;

        let records = self.load_records().await?;
        let now = self.clock.now();

        let exited = workers
            .get_mut(&model_key)
            .map(|local| local.handle.has_exited());
        if exited == Some(true) {
            if let Some(local) = workers.remove(&model_key) {
                tracing::warn!(
                    model_key = %model_key,
                    port = local.port,
                    "Local worker exited, respawning"
                );
            }
        }

        if let Some(local) = workers.get(&model_key) {
            let record = ProcessRecord {
                model_key: model_key.clone(),
                port: local.port,
                last_active_at: now,
                owner_id: self.instance_id.clone(),
                pid: local.pid,
            };
            self.upsert_record(record).await?;
            tracing::debug!(model_key = %model_key, port = local.port, "Reusing local worker");
            return Ok(local.port);
        }

        if let Some(record) = records.get(&model_key) {
            if self.prober.probe(record.port).await {
                let mut adopted = record.clone();
                adopted.last_active_at = adopted.last_active_at.max(now);
                self.upsert_record(adopted).await?;
                tracing::debug!(
                    model_key = %model_key,
                    port = record.port,
                    owner_id = %record.owner_id,
                    "Adopted worker from registry"
                );
                return Ok(record.port);
            }
            tracing::info!(
                model_key = %model_key,
                port = record.port,
                owner_id = %record.owner_id,
                "Recorded worker is not answering, spawning a new one"
            );
        }

        let model_path = self.model_path(&model_key);
        if !model_path.is_file() {
            return Err(Error::ModelNotFound(model_key));
        }

        let mut used: HashSet<u16> = workers.values().map(|w| w.port).collect();
        used.extend(records.values().map(|r| r.port));
        let port = ports::allocate(&used, self.config.base_port, self.config.max_port)
            .map_err(|e| {
                tracing::error!(model_key = %model_key, "{}", e);
                e
            })?;

        let spec = LaunchSpec {
            model_key: model_key.clone(),
            model_path,
            context_size: self.config.context_size,
            port,
        };
        let handle = self.launcher.spawn(&spec).await.map_err(|e| {
            tracing::error!(model_key = %model_key, "{}", e);
            e
        })?;
        let pid = handle.pid();

        workers.insert(model_key.clone(), LocalWorker { port, pid, handle });

        let record = ProcessRecord {
            model_key: model_key.clone(),
            port,
            last_active_at: now,
            owner_id: self.instance_id.clone(),
            pid,
        };
        self.upsert_record(record).await.map_err(|e| {
            tracing::error!(model_key = %model_key, "Failed to persist new worker: {}", e);
            e
        })?;

        tracing::info!(model_key = %model_key, port, pid = ?pid, "Worker started");
        Ok(port)
    }

    /// Refresh the activity stamp of an existing record.
    pub async fn touch(&self, raw_model_key: &str) -> Result<()> {
        let model_key = sanitize_model_key(raw_model_key)?;
        let _workers = self.workers.lock().await;

        let mut records = self.load_records().await?;
        if let Some(mut record) = records.remove(&model_key) {
            record.last_active_at = self.clock.now();
            self.upsert_record(record).await?;
        }
        Ok(())
    }

    /// Stop the worker for a model owned by this instance.
    ///
    /// Stopping an unknown model succeeds. A record owned by another instance
    /// is left untouched and reported as [`Error::OwnershipConflict`].
    pub async fn stop(&self, raw_model_key: &str) -> Result<bool> {
        let model_key = sanitize_model_key(raw_model_key)?;
        let mut workers = self.workers.lock().await;

        let records = self.load_records().await?;
        let Some(record) = records.get(&model_key) else {
            if let Some(local) = workers.remove(&model_key) {
                self.kill_worker(&model_key, Some(local), None).await;
            }
            return Ok(true);
        };

        if !record.is_owned_by(&self.instance_id) {
            return Err(Error::OwnershipConflict {
                model_key,
                owner_id: record.owner_id.clone(),
            });
        }

        let local = workers.remove(&model_key);
        self.kill_worker(&model_key, local, record.pid).await;
        self.delete_record(&model_key).await?;
        Ok(true)
    }

    /// Stop the worker listening on `port`.
    pub async fn stop_by_port(&self, port: u16) -> Result<bool> {
        let model_key = {
            let workers = self.workers.lock().await;
            let records = self.load_records().await?;
            records
                .values()
                .find(|r| r.port == port)
                .map(|r| r.model_key.clone())
                .or_else(|| {
                    workers
                        .iter()
                        .find(|(_, w)| w.port == port)
                        .map(|(k, _)| k.clone())
                })
        };

        match model_key {
            Some(model_key) => self.stop(&model_key).await,
            None => Err(Error::ModelNotFound(format!("no worker on port {}", port))),
        }
    }

    /// Terminate every worker this instance owns and refuse further spawns.
    ///
    /// Never fails; errors are logged. Calling it again is a no-op.
    pub async fn stop_all(&self) -> bool {
        if self.terminal.swap(true, Ordering::SeqCst) {
            return true;
        }
        tracing::info!(instance_id = %self.instance_id, "Stopping all workers");

        let instance_id = self.instance_id.clone();
        let removed = self
            .with_registry(move |registry| registry.remove_heartbeat(&instance_id))
            .await;
        if let Err(e) = removed {
            tracing::warn!("Failed to remove heartbeat: {}", e);
        }

        let mut workers = self.workers.lock().await;
        let loaded = self.with_registry(|registry| registry.load_all()).await;
        let records: HashMap<String, ProcessRecord> = match loaded {
            Ok(records) => records
                .into_iter()
                .map(|r| (r.model_key.clone(), r))
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to load registry during shutdown: {}", e);
                HashMap::new()
            }
        };

        let drained: Vec<(String, LocalWorker)> = workers.drain().collect();
        for (model_key, local) in drained {
            let port = local.port;
            self.kill_worker(&model_key, Some(local), None).await;

            let still_ours = records
                .get(&model_key)
                .map_or(false, |r| r.is_owned_by(&self.instance_id) && r.port == port);
            if still_ours {
                if let Err(e) = self.delete_record(&model_key).await {
                    tracing::warn!(model_key = %model_key, "Failed to delete record: {}", e);
                }
            }
        }

        tracing::info!(instance_id = %self.instance_id, "All workers stopped");
        true
    }

    /// Kill policy: terminate through the local handle, fall back to the pid.
    ///
    /// The caller forgets the worker whatever the report says.
    async fn kill_worker(
        &self,
        model_key: &str,
        local: Option<LocalWorker>,
        recorded_pid: Option<u32>,
    ) -> KillReport {
        let mut report = KillReport::default();
        let mut pid = recorded_pid;

        if let Some(mut local) = local {
            pid = local.pid.or(pid);
            report.graceful = Some(local.handle.terminate().await.map_err(|e| e.to_string()));
        }

        if !report.graceful_succeeded() {
            if let Some(pid) = pid {
                report.by_pid = Some(self.launcher.kill_pid(pid).map_err(|e| e.to_string()));
            }
        }

        report.log(model_key, pid);
        report
    }

    /// Model files in the model directory, with the port of a live worker.
    pub async fn list_known_models(&self) -> Result<Vec<ModelEntry>> {
        let records = self.load_records().await?;
        let model_dir = PathBuf::from(&self.config.model_dir);
        let extensions = self.config.model_extensions.clone();
        let files = tokio::task::spawn_blocking(move || models::scan_model_dir(&model_dir, &extensions))
            .await
            .map_err(|e| Error::Internal(format!("model scan failed: {}", e)))?;

        let mut entries = Vec::with_capacity(files.len());
        for (model_key, size_bytes) in files {
            let port = match records.get(&model_key) {
                Some(record) if self.prober.probe(record.port).await => Some(record.port),
                _ => None,
            };
            entries.push(ModelEntry {
                model_key,
                size_bytes,
                port,
            });
        }
        Ok(entries)
    }

    /// Resident memory of the model's worker in bytes, 0 when unknown.
    pub async fn memory_usage(&self, raw_model_key: &str) -> u64 {
        let Ok(model_key) = sanitize_model_key(raw_model_key) else {
            return 0;
        };

        let local_pid = {
            let workers = self.workers.lock().await;
            workers.get(&model_key).and_then(|w| w.pid)
        };
        let pid = match local_pid {
            Some(pid) => Some(pid),
            None => self
                .with_registry(|registry| registry.load_all())
                .await
                .ok()
                .and_then(|records| records.into_iter().find(|r| r.model_key == model_key))
                .and_then(|r| r.pid),
        };

        match pid {
            Some(pid) => tokio::task::spawn_blocking(move || resident_memory_bytes(pid))
                .await
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Lifecycle state of a model's worker.
    pub async fn state(&self, raw_model_key: &str) -> Result<WorkerState> {
        let model_key = sanitize_model_key(raw_model_key)?;
        let records = self.load_records().await?;
        match records.get(&model_key) {
            None => Ok(WorkerState::Absent),
            Some(record) if self.prober.probe(record.port).await => Ok(WorkerState::Running),
            Some(_) => Ok(WorkerState::Starting),
        }
    }

    /// Heartbeat rows of every instance sharing the registry.
    pub async fn instances(&self) -> Result<Vec<InstanceHeartbeat>> {
        self.with_registry(|registry| registry.instances()).await
    }

    /// Ports of the workers this instance holds handles for.
    pub async fn local_ports(&self) -> HashMap<String, u16> {
        let workers = self.workers.lock().await;
        workers.iter().map(|(k, w)| (k.clone(), w.port)).collect()
    }
}
