//! Windowed batching of raw sensor samples

use crate::config::SensorConfig;
use crate::models::{Chunk, Sample};
use chrono::{DateTime, Utc};

/// Samples per chunk for a rate and window, never less than one
pub fn max_samples_per_chunk(sample_rate_hz: f64, chunk_duration_ms: u64) -> usize {
    let samples = (sample_rate_hz * chunk_duration_ms as f64 / 1000.0).floor();
    if samples.is_finite() && samples >= 1.0 {
        samples as usize
    } else {
        1
    }
}

/// Accumulates samples into chunks bounded by sample count and window length.
///
/// A chunk is sealed when it holds `max_samples` samples, when a sample falls
/// outside the current window, or on `force_flush`.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    device_id: String,
    device_model: Option<String>,
    platform: String,
    sample_rate_hz: f64,
    chunk_duration_ms: u64,
    max_samples: usize,
    started_at: Option<DateTime<Utc>>,
    samples: Vec<Sample>,
    last_offset_ms: u64,
    /// Explicit offset of the window's first sample
    offset_base_ms: u64,
}

impl ChunkBuilder {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            device_model: config.device_model.clone(),
            platform: config.platform.clone(),
            sample_rate_hz: config.sample_rate_hz,
            chunk_duration_ms: config.chunk_duration_ms,
            max_samples: max_samples_per_chunk(config.sample_rate_hz, config.chunk_duration_ms),
            started_at: None,
            samples: Vec::new(),
            last_offset_ms: 0,
            offset_base_ms: 0,
        }
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    pub fn buffered(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add one reading, returning a chunk when this sample completes one.
    ///
    /// The offset comes from `t_offset_ms` (relative to the window's first
    /// sample) when given, else from the delta between `ts` and the window
    /// start, else from the sample index at the nominal rate. Offsets never
    /// decrease within a chunk.
    pub fn add_sample(
        &mut self,
        x: f64,
        y: f64,
        z: f64,
        t_offset_ms: Option<u64>,
        ts: Option<DateTime<Utc>>,
    ) -> Option<Chunk> {
        let mut sealed = None;

        if let Some(started_at) = self.started_at {
            let offset = self.offset_for(started_at, t_offset_ms, ts);
            if offset >= self.chunk_duration_ms && !self.samples.is_empty() {
                sealed = self.seal();
            }
        }

        let started_at = match self.started_at {
            Some(started_at) => started_at,
            None => {
                let started_at = ts.unwrap_or_else(Utc::now);
                self.started_at = Some(started_at);
                self.offset_base_ms = t_offset_ms.unwrap_or(0);
                started_at
            }
        };
        let offset = self
            .offset_for(started_at, t_offset_ms, ts)
            .max(self.last_offset_ms);
        self.last_offset_ms = offset;

        self.samples.push(Sample {
            x,
            y,
            z,
            t_offset_ms: Some(offset),
            ts: None,
        });

        if self.samples.len() >= self.max_samples {
            // A time-sealed chunk leaves one sample behind, which only
            // reaches the limit when max_samples is one
            return sealed.or_else(|| self.seal());
        }
        sealed
    }

    /// Seal whatever is buffered; `None` when nothing is
    pub fn force_flush(&mut self) -> Option<Chunk> {
        self.seal()
    }

    /// The chunk the current buffer would seal into, without changing it
    pub fn build_chunk(&self) -> Option<Chunk> {
        let started_at = self.started_at?;
        if self.samples.is_empty() {
            return None;
        }
        Some(Chunk {
            device_id: self.device_id.clone(),
            device_model: self.device_model.clone(),
            platform: self.platform.clone(),
            sample_rate_hz: self.sample_rate_hz,
            started_at,
            samples: self.samples.clone(),
        })
    }

    fn seal(&mut self) -> Option<Chunk> {
        let chunk = self.build_chunk();
        self.reset();
        chunk
    }

    fn reset(&mut self) {
        self.started_at = None;
        self.samples.clear();
        self.last_offset_ms = 0;
        self.offset_base_ms = 0;
    }

    fn offset_for(
        &self,
        started_at: DateTime<Utc>,
        t_offset_ms: Option<u64>,
        ts: Option<DateTime<Utc>>,
    ) -> u64 {
        if let Some(offset) = t_offset_ms {
            return offset.saturating_sub(self.offset_base_ms);
        }
        if let Some(ts) = ts {
            return (ts - started_at).num_milliseconds().max(0) as u64;
        }
        let interval_ms = 1000.0 / self.sample_rate_hz;
        (self.samples.len() as f64 * interval_ms).round() as u64
    }
}
