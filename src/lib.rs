//! Raiden - data-acquisition server for multi-electrode array rigs
//!
//! Raiden manages a single data source (a live MEA device or a previously
//! recorded file) on behalf of a dynamic set of remote TCP clients. Clients
//! speak a length-prefixed binary protocol to:
//!
//! - create or delete the managed source
//! - query and mutate server-wide and source-specific parameters
//! - start and stop an on-disk recording
//! - subscribe to live data, or request historical chunks by time range
//!
//! # Architecture
//!
//! Everything funnels through one coordinator task, the sole mutator of the
//! source, the recording sink, and server state:
//!
//! 1. **Client sessions** - one read task per connection, translating frames
//!    into coordinator events; replies go back through a per-connection
//!    writer task so concurrent sends never interleave.
//! 2. **Source adapters** - cooperative actors answering init/get/set/stream
//!    requests and emitting sample batches. Thread-safe sources run on a
//!    worker task; file-replay sources are driven inline by the coordinator.
//! 3. **Coordinator** - serializes every request, enforces the source and
//!    recording lifecycle, appends samples to the sink, broadcasts to
//!    all-data subscribers, and services queued chunk requests as the
//!    recording grows.
//!
//! A read-only HTTP endpoint projects coordinator state as JSON.

// Wire protocol: framing, message parsing and encoding
pub mod protocol;

// Sample matrices and the data frame sent to clients
pub mod frame;

// Client sessions and per-connection tasks
pub mod client;

// Source adapter contract and drivers
pub mod source;

// On-disk recording sink
pub mod recording;

// The coordinator event loop
pub mod coordinator;

// Read-only HTTP status endpoint
pub mod http;

// Server configuration and config-file reader
pub mod config;

// Bootstrap: listeners, coordinator, shutdown wiring
pub mod server;

pub use config::ServerConfig;
pub use coordinator::{Coordinator, Event};
pub use frame::{DataFrame, Samples};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::Server;
pub use source::{DataSource, SourceEvent, StatusMap, StatusValue};
