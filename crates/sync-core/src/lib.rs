//! Health data sync engine
//!
//! This crate provides the core functionality for:
//! - Reading health records from an on-device data source
//! - Authenticated transport with shared session refresh
//! - A durable offline queue with retry and backoff
//! - Sensor streaming in time-bounded chunks
//! - Health checks and observability

pub mod config;
pub mod health;
pub mod models;
pub mod observability;
pub mod sensor;
pub mod session;
pub mod source;
pub mod sync;

pub use config::{ConfigError, SyncEngineConfig};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, SyncMetrics};
