//! CLI subcommand implementations

pub mod account;
pub mod queue;
pub mod sync;
