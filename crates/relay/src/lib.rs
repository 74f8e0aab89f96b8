//! Streaming chat relay for the suite API.
//!
//! One implementation of the newline-delimited JSON chat stream, shared by
//! every call site: the UI-side client, the privileged host proxy
//! ([`bridge`]) and protocol adapters ([`adapter`]).

pub mod adapter;
pub mod bridge;
pub mod callbacks;
pub mod client;
pub mod health;
pub mod ndjson;

pub use callbacks::{dispatch, StreamCallbacks};
pub use client::{read_events, BodyLease, EventSource, EventStream, RelayClient};
pub use ndjson::{LineParser, RecordFormat};
pub use shared::events::{StreamEvent, StreamState};
pub use tokio_util::sync::CancellationToken;
