//! Wire types for the worker HTTP contract.
//!
//! Every worker process is a pre-built llama server that listens on its own
//! port and exposes a small HTTP API:
//!
//! | Method | Path                     | Purpose                                  |
//! |--------|--------------------------|------------------------------------------|
//! | GET    | `/`                      | Liveness                                 |
//! | POST   | `/completion`            | Start a generation job from a prompt     |
//! | GET    | `/next-token[?stop=true]`| Pull the next fragment, or halt the job  |
//! | POST   | `/tokenize`              | Tokenize text                            |
//!
//! Only `/next-token` is interpreted by the fleet; completion and tokenize
//! bodies are passed through untouched.

use serde::{Deserialize, Serialize};

/// Path of the liveness endpoint.
pub const LIVENESS_PATH: &str = "/";
/// Path of the completion endpoint.
pub const COMPLETION_PATH: &str = "/completion";
/// Path of the token pull endpoint.
pub const NEXT_TOKEN_PATH: &str = "/next-token";
/// Path of the tokenize endpoint.
pub const TOKENIZE_PATH: &str = "/tokenize";

/// Response of `GET /next-token`.
///
/// `stop` is true once the generation has finished, either naturally or
/// because the pull carried `stop=true`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextToken {
    /// Generated fragment, absent when the worker had nothing new.
    #[serde(default)]
    pub content: Option<String>,
    /// Generation finished.
    #[serde(default)]
    pub stop: bool,
}

impl NextToken {
    /// A fragment with more to come.
    pub fn fragment(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            stop: false,
        }
    }

    /// Completion marker without a fragment.
    pub fn finished() -> Self {
        Self {
            content: None,
            stop: true,
        }
    }

    /// The fragment, if it carries any text.
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.is_empty())
    }
}

/// Response of the resolve endpoint: where the model's worker listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortResponse {
    pub port: u16,
}
