//! Fakes for exercising the orchestrator without real worker processes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::health::HealthProbe;
use crate::orchestrator::Orchestrator;
use crate::process::{LaunchSpec, ProcessLauncher, WorkerHandle};
use crate::registry::ProcessRegistry;

pub fn test_config(model_dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        model_dir: model_dir.to_string_lossy().into_owned(),
        worker_binary: "llama-server".to_string(),
        worker_args: Vec::new(),
        extra_args: Vec::new(),
        context_size: 2048,
        base_port: 4000,
        max_port: 4999,
        ttl_secs: 60,
        stale_multiplier: 2,
        gc_interval_secs: 5,
        shutdown_timeout_secs: 1,
        worker_host: "127.0.0.1".to_string(),
        probe_timeout_ms: 200,
        model_extensions: vec!["bin".to_string(), "gguf".to_string()],
        log_worker_output: false,
    }
}

/// Create empty model files in `dir`.
pub fn write_models(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), b"GGUF").unwrap();
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Prober answering from a configurable set of live ports.
#[derive(Default)]
pub struct FakeProber {
    alive: Mutex<HashSet<u16>>,
    everything_alive: AtomicBool,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prober reporting every port as live.
    pub fn all_alive() -> Self {
        let prober = Self::default();
        prober.everything_alive.store(true, Ordering::SeqCst);
        prober
    }

    pub fn set_alive(&self, port: u16, alive: bool) {
        let mut ports = self.alive.lock().unwrap();
        if alive {
            ports.insert(port);
        } else {
            ports.remove(&port);
        }
    }
}

#[async_trait]
impl HealthProbe for FakeProber {
    async fn probe(&self, port: u16) -> bool {
        self.everything_alive.load(Ordering::SeqCst) || self.alive.lock().unwrap().contains(&port)
    }
}

/// Shared state of one fake worker.
#[derive(Default)]
struct FakeProcess {
    exited: AtomicBool,
    terminated: AtomicBool,
}

/// Handle to a fake worker.
pub struct FakeHandle {
    pid: u32,
    process: Arc<FakeProcess>,
    fail_terminate: bool,
}

#[async_trait]
impl WorkerHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        (!self.process.exited.load(Ordering::SeqCst)).then_some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.process.exited.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        if self.fail_terminate {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "terminate refused",
            ));
        }
        self.process.terminated.store(true, Ordering::SeqCst);
        self.process.exited.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher that records every spawn and kill instead of running processes.
pub struct FakeLauncher {
    next_pid: AtomicU32,
    spawned: Mutex<Vec<LaunchSpec>>,
    processes: Mutex<HashMap<u32, Arc<FakeProcess>>>,
    killed_pids: Mutex<Vec<u32>>,
    fail_spawn: AtomicBool,
    fail_terminate: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::starting_at_pid(10_000)
    }

    /// Launcher handing out pids from `first_pid`, so several fakes sharing
    /// a registry never collide.
    pub fn starting_at_pid(first_pid: u32) -> Self {
        Self {
            next_pid: AtomicU32::new(first_pid),
            spawned: Mutex::new(Vec::new()),
            processes: Mutex::new(HashMap::new()),
            killed_pids: Mutex::new(Vec::new()),
            fail_spawn: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
        }
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Make graceful termination of workers spawned from now on fail.
    pub fn fail_terminations(&self, fail: bool) {
        self.fail_terminate.store(fail, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<LaunchSpec> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn killed_pids(&self) -> Vec<u32> {
        self.killed_pids.lock().unwrap().clone()
    }

    /// Pids of workers stopped through their handle.
    pub fn terminated_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.terminated.load(Ordering::SeqCst))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Simulate a worker crashing.
    pub fn crash(&self, pid: u32) {
        if let Some(process) = self.processes.lock().unwrap().get(&pid) {
            process.exited.store(true, Ordering::SeqCst);
        }
    }

    /// Pids of workers that are neither terminated nor crashed nor killed.
    pub fn running_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| !p.exited.load(Ordering::SeqCst))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerHandle>> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(Error::SpawnFailed(format!("refused to spawn {}", spec.model_key)));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Arc::new(FakeProcess::default());
        self.processes.lock().unwrap().insert(pid, Arc::clone(&process));
        self.spawned.lock().unwrap().push(spec.clone());

        Ok(Box::new(FakeHandle {
            pid,
            process,
            fail_terminate: self.fail_terminate.load(Ordering::SeqCst),
        }))
    }

    fn kill_pid(&self, pid: u32) -> std::io::Result<()> {
        let processes = self.processes.lock().unwrap();
        match processes.get(&pid) {
            Some(process) if !process.exited.load(Ordering::SeqCst) => {
                process.exited.store(true, Ordering::SeqCst);
                self.killed_pids.lock().unwrap().push(pid);
                Ok(())
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such process {}", pid),
            )),
        }
    }
}

/// An orchestrator wired to fakes, with handles to drive them.
pub struct TestOrchestrator {
    pub orchestrator: Arc<Orchestrator>,
    pub launcher: Arc<FakeLauncher>,
    pub prober: Arc<FakeProber>,
    pub clock: Arc<ManualClock>,
}

impl TestOrchestrator {
    pub fn new(
        instance_id: &str,
        config: OrchestratorConfig,
        registry: Arc<dyn ProcessRegistry>,
    ) -> Self {
        Self::with_parts(
            instance_id,
            config,
            registry,
            Arc::new(FakeLauncher::new()),
            Arc::new(FakeProber::new()),
            Arc::new(ManualClock::new()),
        )
    }

    pub fn with_parts(
        instance_id: &str,
        config: OrchestratorConfig,
        registry: Arc<dyn ProcessRegistry>,
        launcher: Arc<FakeLauncher>,
        prober: Arc<FakeProber>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(
            instance_id.to_string(),
            config,
            registry,
            launcher.clone(),
            prober.clone(),
            clock.clone(),
        ));
        Self {
            orchestrator,
            launcher,
            prober,
            clock,
        }
    }
}
