//! Health sync agent
//!
//! Long-running daemon that keeps device health records flowing to the
//! collection service: periodic syncs, offline queue draining and sensor
//! streaming, with health and metrics served over HTTP.

pub mod api;
pub mod config;
