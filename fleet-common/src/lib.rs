//! Model Fleet Common Types
//!
//! Shared types used by the orchestrator and its clients: the worker HTTP
//! contract, stream events and model listings.

pub mod model;
pub mod protocol;
pub mod stream;

pub use model::{format_size, ModelEntry};
pub use protocol::{NextToken, PortResponse};
pub use stream::StreamEvent;
