//! pipebridge: relays TCP clients to a single long-lived worker process over
//! its stdin/stdout, using a sentinel marker in the worker's output to find
//! the end of each response.

pub mod access;
pub mod client;
pub mod framer;
pub mod relay;
pub mod server;
pub mod supervisor;
pub mod worker;

pub use access::{AccessError, WorkerAccess, WorkerLease};
pub use client::{ClientError, extract_rows, query};
pub use framer::{Anchor, FramerError, Marker, ResponseCodec, SentinelFramer};
pub use relay::{
    RelayError, RelayOptions, SessionEnd, SessionId, SessionSummary, run_session,
};
pub use server::{AcceptMode, DEFAULT_PORT, Server, ServerConfig, ServerError, shutdown_signal};
pub use supervisor::{
    CommandSpawner, SpawnError, SupervisorError, WorkerConfig, WorkerSpawner, start, wait_ready,
};
pub use worker::{Liveness, PipeWorker, ProcessWorker, Worker, WorkerError};

/// Marker printed by the SimpleDB parser prompt.
pub const DEFAULT_MARKER: &str = "SimpleDB";
