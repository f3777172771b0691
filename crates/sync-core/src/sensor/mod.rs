//! Sensor sample handling
//!
//! This module provides:
//! - The chunk builder that windows raw samples into sealed chunks
//! - Sample sources (device channel or synthetic generator)

mod chunk;
mod source;

pub use chunk::{max_samples_per_chunk, ChunkBuilder};
pub use source::{
    select_source, ChannelSampleSource, SampleSender, SampleSource, SyntheticSampleSource,
};
