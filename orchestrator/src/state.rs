//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::relay::{Relay, WorkerClient};

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
    pub relay: Arc<Relay>,
    pub worker_client: WorkerClient,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        let worker_client = WorkerClient::new(
            &config.orchestrator.worker_host,
            config.relay.pull_timeout(),
        );
        let relay = Arc::new(Relay::new(
            orchestrator.clone(),
            worker_client.clone(),
            config.relay.clone(),
        ));
        Self {
            config,
            orchestrator,
            relay,
            worker_client,
        }
    }
}
