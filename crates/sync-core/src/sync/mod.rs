//! Synchronization with the collection service
//!
//! This module provides:
//! - Authenticated HTTP transport with single-flight session refresh
//! - Sign-in, sign-out and token refresh calls
//! - Durable offline queue with retry and backoff
//! - Sensor streaming in sealed chunks
//! - Sync orchestration across record types
//! - Server-initiated record writes and deletions

mod auth;
mod orchestrator;
mod queue;
mod remote;
mod streaming;
mod transport;


pub use auth::AuthClient;
pub use orchestrator::{
    OrchestratorError, ProgressCallback, SyncOptions, SyncOrchestrator,
};
pub use queue::{backoff_delay, AutoFlushHandle, FlushOutcome, OfflineQueue, QueueError, QueueStats};
pub use remote::{CommandError, CommandOutcome, RemoteCommand};
pub use streaming::{SensorStreamer, StreamHandle, StreamingStats};
pub use transport::{
    build_http_client, classify_status, parse_base_url, redact, ErrorKind, HttpTransport,
    ServiceHealth, Transport, TransportError,
};
