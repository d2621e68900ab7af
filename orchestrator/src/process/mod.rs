//! Worker process lifecycle at the OS boundary.
//!
//! The orchestrator never touches `tokio::process` directly; it goes through
//! a [`ProcessLauncher`] so tests can substitute a fake.

mod llama;
mod memory;

pub use llama::{ChildWorker, LlamaLauncher};
pub use memory::resident_memory_bytes;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub model_key: String,
    pub model_path: PathBuf,
    pub context_size: u32,
    pub port: u16,
}

/// A process handle owned by the instance that spawned it.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// OS process id, if the process is still attached.
    fn pid(&self) -> Option<u32>;

    /// True once the process has exited.
    fn has_exited(&mut self) -> bool;

    /// Stop the process gracefully, forcing it if it does not comply in time.
    async fn terminate(&mut self) -> std::io::Result<()>;
}

/// Spawns workers and kills arbitrary worker pids.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a worker. Must not wait for the worker to become ready.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerHandle>>;

    /// Forcefully kill a process this instance holds no handle for.
    fn kill_pid(&self, pid: u32) -> std::io::Result<()>;
}
