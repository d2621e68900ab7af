//! Model fleet orchestrator.
//!
//! Spawns one llama worker process per model on demand, hands out its port,
//! reuses it while active and evicts it after inactivity. Several instances
//! can share one SQLite registry. A relay turns the workers' pull-based token
//! API into push-based streams.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod registry;
pub mod relay;
pub mod state;
pub mod test_util;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{GcSummary, KillReport, Orchestrator, WorkerState};
pub use registry::{ProcessRecord, ProcessRegistry, SqliteRegistry};
pub use relay::{Relay, TokenStream, WorkerClient};
pub use state::AppState;
