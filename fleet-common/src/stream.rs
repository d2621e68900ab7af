//! Events pushed to stream subscribers.

use serde::{Deserialize, Serialize};

/// One event of a token stream.
///
/// Each event carries the full list of fragments generated so far, so a
/// consumer that drops an event loses nothing but latency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Every fragment emitted by the worker, in order.
    pub tokens: Vec<String>,
    /// No further events follow.
    pub done: bool,
    /// Upstream failure that ended the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    pub fn progress(tokens: Vec<String>, done: bool) -> Self {
        Self {
            tokens,
            done,
            error: None,
        }
    }

    /// Terminal event reporting an upstream failure.
    pub fn failed(tokens: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            tokens,
            done: true,
            error: Some(error.into()),
        }
    }

    /// Concatenated text of all fragments.
    pub fn text(&self) -> String {
        self.tokens.concat()
    }
}
