//! Credential session handling
//!
//! This module provides:
//! - The session store interface with in-memory and file-backed stores
//! - The single-flight refresh coordinator shared by all outbound requests

mod coordinator;
mod store;

pub use coordinator::{RefreshCoordinator, SessionExpiredCallback, TokenRefresher};
pub use store::{FileSessionStore, MemorySessionStore, SessionError, SessionStore};
