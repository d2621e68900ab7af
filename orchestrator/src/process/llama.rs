//! llama server worker processes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{LaunchSpec, ProcessLauncher, WorkerHandle};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};

/// Launches the configured worker binary with
/// `<worker_args..> -m <model> --ctx_size <n> --port <port> <extra_args..>`.
pub struct LlamaLauncher {
    worker_binary: String,
    worker_args: Vec<String>,
    extra_args: Vec<String>,
    log_worker_output: bool,
    shutdown_timeout: Duration,
}

impl LlamaLauncher {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            worker_binary: config.worker_binary.clone(),
            worker_args: config.worker_args.clone(),
            extra_args: config.extra_args.clone(),
            log_worker_output: config.log_worker_output,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&self.worker_binary);

        // Wrapper arguments must come before the worker flags
        cmd.args(&self.worker_args);
        cmd.arg("-m")
            .arg(&spec.model_path)
            .arg("--ctx_size")
            .arg(spec.context_size.to_string())
            .arg("--port")
            .arg(spec.port.to_string());
        cmd.args(&self.extra_args);

        cmd.stdin(Stdio::null()).kill_on_drop(true);

        if self.log_worker_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd
    }
}

#[async_trait]
impl ProcessLauncher for LlamaLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerHandle>> {
        let child = self.command(spec).spawn().map_err(|e| {
            Error::SpawnFailed(format!(
                "{} for {}: {}",
                self.worker_binary, spec.model_key, e
            ))
        })?;

        let pid = child.id().ok_or_else(|| {
            Error::SpawnFailed(format!("worker for {} exited immediately", spec.model_key))
        })?;

        tracing::info!(
            model_key = %spec.model_key,
            port = spec.port,
            pid,
            "Spawned worker"
        );

        Ok(Box::new(ChildWorker::new(
            spec.model_key.clone(),
            child,
            self.shutdown_timeout,
        )))
    }

    fn kill_pid(&self, pid: u32) -> std::io::Result<()> {
        kill_pid(pid)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), signal).map_err(std::io::Error::from)
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> std::io::Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("killing pid {} is only supported on unix", pid),
    ))
}

/// A spawned worker child process.
pub struct ChildWorker {
    model_key: String,
    child: Option<Child>,
    shutdown_timeout: Duration,
}

impl ChildWorker {
    pub fn new(model_key: String, child: Child, shutdown_timeout: Duration) -> Self {
        Self {
            model_key,
            child: Some(child),
            shutdown_timeout,
        }
    }
}

#[async_trait]
impl WorkerHandle for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        // Try SIGTERM first on Unix; without it there is nothing to wait for
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                if let Err(e) = send_signal(pid, nix::sys::signal::Signal::SIGTERM) {
                    tracing::debug!(model_key = %self.model_key, pid, "SIGTERM failed, killing: {}", e);
                    return child.kill().await;
                }
            }
        }

        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("Worker for {} exited with {}", self.model_key, status);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for worker {}: {}", self.model_key, e);
                Err(e)
            }
            Err(_timeout) => {
                tracing::warn!("Worker {} didn't stop gracefully, killing", self.model_key);
                child.kill().await
            }
        }
    }
}
