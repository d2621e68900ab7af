//! Token streaming from workers to subscribers.
//!
//! Each subscription is a consumer-driven pull loop against the model's
//! worker: polling the stream performs exactly one `/next-token` pull and
//! yields the accumulated fragments, so the relay never runs ahead of its
//! consumer. Cancellation is cooperative: once [`Relay::close_stream`] was
//! called the next poll sends `stop=true` and ends the stream, and dropping
//! an unfinished stream sends the same stop pull in the background.

mod worker;

pub use worker::WorkerClient;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fleet_common::{NextToken, StreamEvent};
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::config::RelayConfig;
use crate::error::Error;
use crate::orchestrator::{sanitize_model_key, Orchestrator, WorkerState};

/// How often a running stream refreshes its worker's activity stamp.
const TOUCH_INTERVAL: Duration = Duration::from_secs(5);

/// Stream of relay events for one subscription.
pub type TokenStream = BoxStream<'static, StreamEvent>;

struct Session {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

/// Relays worker token streams to subscribers.
pub struct Relay {
    orchestrator: Arc<Orchestrator>,
    client: WorkerClient,
    config: RelayConfig,
    /// Open sessions per model key
    sessions: Mutex<HashMap<String, Vec<Session>>>,
    next_session: AtomicU64,
}

impl Relay {
    pub fn new(orchestrator: Arc<Orchestrator>, client: WorkerClient, config: RelayConfig) -> Self {
        Self {
            orchestrator,
            client,
            config,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Subscribe to the token stream of a model's worker.
    ///
    /// Nothing happens until the stream is polled; the first poll resolves
    /// the worker. The stream ends after an event with `done` set, which
    /// carries `error` when the worker could not be resolved or a pull
    /// failed. Dropping the stream cancels the session.
    pub fn open_stream(self: &Arc<Self>, raw_model_key: &str) -> TokenStream {
        let model_key =
            sanitize_model_key(raw_model_key).unwrap_or_else(|_| raw_model_key.to_string());

        let cancelled = Arc::new(AtomicBool::new(false));
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.lock_sessions()
            .entry(model_key.clone())
            .or_default()
            .push(Session {
                id,
                cancelled: Arc::clone(&cancelled),
            });
        tracing::debug!(model_key = %model_key, session = id, "Stream opened");

        let session = SessionLoop {
            relay: Arc::clone(self),
            model_key,
            id,
            cancelled,
            port: None,
            resolved_at: Instant::now(),
            warming: true,
            tokens: Vec::new(),
            last_touch: Instant::now(),
            finished: false,
        };

        stream::unfold(session, |mut session| async move {
            let event = session.next_event().await?;
            Some((event, session))
        })
        .boxed()
    }

    /// Cancel every open session on a model. Returns how many were signalled.
    pub fn close_stream(&self, raw_model_key: &str) -> usize {
        let model_key =
            sanitize_model_key(raw_model_key).unwrap_or_else(|_| raw_model_key.to_string());
        let sessions = self.lock_sessions();
        let Some(open) = sessions.get(&model_key) else {
            return 0;
        };
        for session in open {
            session.cancelled.store(true, Ordering::SeqCst);
        }
        tracing::info!(model_key = %model_key, sessions = open.len(), "Closing streams");
        open.len()
    }

    /// Number of open sessions on a model.
    pub fn open_sessions(&self, raw_model_key: &str) -> usize {
        let model_key =
            sanitize_model_key(raw_model_key).unwrap_or_else(|_| raw_model_key.to_string());
        self.lock_sessions().get(&model_key).map_or(0, Vec::len)
    }

    // Never held across an await
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Vec<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_session(&self, model_key: &str, id: u64) {
        let mut sessions = self.lock_sessions();
        if let Some(open) = sessions.get_mut(model_key) {
            open.retain(|s| s.id != id);
            if open.is_empty() {
                sessions.remove(model_key);
            }
        }
    }
}

/// State of one subscription, advanced one pull per poll.
struct SessionLoop {
    relay: Arc<Relay>,
    model_key: String,
    id: u64,
    cancelled: Arc<AtomicBool>,
    port: Option<u16>,
    resolved_at: Instant,
    /// No fragment received yet; the worker may still be loading.
    warming: bool,
    tokens: Vec<String>,
    last_touch: Instant,
    finished: bool,
}

impl SessionLoop {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        let port = match self.port {
            Some(port) => port,
            None => match self.relay.orchestrator.resolve(&self.model_key).await {
                Ok(port) => {
                    self.port = Some(port);
                    self.resolved_at = Instant::now();
                    port
                }
                Err(e) => {
                    tracing::warn!(model_key = %self.model_key, "Cannot stream, resolve failed: {}", e);
                    return Some(self.fail(e));
                }
            },
        };

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                self.finished = true;
                tracing::debug!(model_key = %self.model_key, port, "Stream cancelled, worker told to stop");
                if let Err(e) = self.relay.client.next_token(port, true).await {
                    tracing::debug!(model_key = %self.model_key, port, "Stop pull failed: {}", e);
                }
                return None;
            }

            let error = match self.relay.client.next_token(port, false).await {
                Ok(next) => return Some(self.forward(next).await),
                Err(e) => e,
            };
            if !self.may_retry(&error).await {
                tracing::warn!(model_key = %self.model_key, port, "Token pull failed: {}", error);
                return Some(self.fail(error));
            }
            tracing::debug!(model_key = %self.model_key, port, "Worker not accepting connections yet: {}", error);
            tokio::time::sleep(self.relay.config.retry_interval()).await;
        }
    }

    /// A refused connection is retried while a freshly started worker is
    /// still loading, up to the startup grace period.
    async fn may_retry(&self, error: &Error) -> bool {
        if !self.warming || !matches!(error, Error::WorkerNotReady(_)) {
            return false;
        }
        if self.resolved_at.elapsed() >= self.relay.config.startup_grace() {
            return false;
        }
        matches!(
            self.relay.orchestrator.state(&self.model_key).await,
            Ok(WorkerState::Starting)
        )
    }

    async fn forward(&mut self, next: NextToken) -> StreamEvent {
        self.warming = false;
        if let Some(text) = next.text() {
            self.tokens.push(text.to_string());
        }
        if next.stop {
            self.finished = true;
        } else if self.last_touch.elapsed() >= TOUCH_INTERVAL {
            if let Err(e) = self.relay.orchestrator.touch(&self.model_key).await {
                tracing::debug!(model_key = %self.model_key, "Failed to refresh activity: {}", e);
            }
            self.last_touch = Instant::now();
        }
        StreamEvent::progress(self.tokens.clone(), next.stop)
    }

    fn fail(&mut self, error: Error) -> StreamEvent {
        self.finished = true;
        StreamEvent::failed(self.tokens.clone(), error.to_string())
    }
}

impl Drop for SessionLoop {
    fn drop(&mut self) {
        self.relay.remove_session(&self.model_key, self.id);
        tracing::debug!(model_key = %self.model_key, session = self.id, "Stream closed");

        // The consumer left mid-generation
        let Some(port) = self.port.filter(|_| !self.finished) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(model_key = %self.model_key, port, "No runtime to stop the worker's generation");
            return;
        };
        let client = self.relay.client.clone();
        let model_key = self.model_key.clone();
        runtime.spawn(async move {
            match client.next_token(port, true).await {
                Ok(_) => tracing::debug!(model_key = %model_key, port, "Consumer gone, worker told to stop"),
                Err(e) => tracing::debug!(model_key = %model_key, port, "Stop pull failed: {}", e),
            }
        });
    }
}
