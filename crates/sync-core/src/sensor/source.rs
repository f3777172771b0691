//! Sample sources feeding the chunk builder
//!
//! Native sensor callbacks push into a bounded channel through a
//! [`SampleSender`]; when no sensor is available a synthetic generator
//! produces readings at the configured rate instead.

use crate::config::SensorConfig;
use crate::models::Sample;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A stream of raw sensor readings
#[async_trait]
pub trait SampleSource: Send {
    /// Next reading; `None` once the source has ended
    async fn next_sample(&mut self) -> Option<Sample>;

    /// A reading that is already available, without waiting
    fn try_next_sample(&mut self) -> Option<Sample> {
        None
    }

    fn name(&self) -> &'static str;
}

/// Producer half handed to the sensor callback
#[derive(Clone)]
pub struct SampleSender {
    tx: mpsc::Sender<Sample>,
    dropped: Arc<AtomicU64>,
}

impl SampleSender {
    /// Push a reading without blocking the callback.
    ///
    /// Returns `false` and counts the reading as dropped when the channel is
    /// full or closed.
    pub fn push(&self, sample: Sample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Readings lost to a full channel so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Readings delivered by a device sensor through a bounded channel
pub struct ChannelSampleSource {
    rx: mpsc::Receiver<Sample>,
}

impl ChannelSampleSource {
    pub fn new(capacity: usize) -> (SampleSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            SampleSender {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            Self { rx },
        )
    }
}

#[async_trait]
impl SampleSource for ChannelSampleSource {
    async fn next_sample(&mut self) -> Option<Sample> {
        self.rx.recv().await
    }

    fn try_next_sample(&mut self) -> Option<Sample> {
        self.rx.try_recv().ok()
    }

    fn name(&self) -> &'static str {
        "sensor"
    }
}

/// Generated accelerometer-like readings at a fixed rate
pub struct SyntheticSampleSource {
    ticker: tokio::time::Interval,
    index: u64,
    limit: Option<u64>,
}

impl SyntheticSampleSource {
    pub fn new(sample_rate_hz: f64) -> Self {
        let period = Duration::from_secs_f64(1.0 / sample_rate_hz.max(0.001));
        Self {
            ticker: tokio::time::interval(period),
            index: 0,
            limit: None,
        }
    }

    /// End the stream after `limit` readings
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
impl SampleSource for SyntheticSampleSource {
    async fn next_sample(&mut self) -> Option<Sample> {
        if self.limit.is_some_and(|limit| self.index >= limit) {
            return None;
        }
        self.ticker.tick().await;

        let phase = self.index as f64 * 0.1;
        self.index += 1;
        Some(Sample {
            x: phase.sin(),
            y: phase.cos(),
            z: 9.81 + (phase * 0.5).sin() * 0.05,
            t_offset_ms: None,
            ts: Some(Utc::now()),
        })
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

/// Use the device sensor when one is attached, otherwise generate readings
pub fn select_source(
    sensor: Option<ChannelSampleSource>,
    config: &SensorConfig,
) -> Box<dyn SampleSource> {
    match sensor {
        Some(source) => {
            info!("Using device sensor samples");
            Box::new(source)
        }
        None => {
            debug!(rate_hz = config.sample_rate_hz, "No sensor attached, using synthetic samples");
            Box::new(SyntheticSampleSource::new(config.sample_rate_hz))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(x: f64) -> Sample {
        Sample {
            x,
            y: 0.0,
            z: 0.0,
            t_offset_ms: None,
            ts: None,
        }
    }

    #[tokio::test]
    async fn test_channel_source_drops_when_full() {
        let (sender, mut source) = ChannelSampleSource::new(2);
        assert!(sender.push(reading(1.0)));
        assert!(sender.push(reading(2.0)));
        assert!(!sender.push(reading(3.0)));
        assert_eq!(sender.dropped(), 1);

        assert_eq!(source.next_sample().await.unwrap().x, 1.0);
        assert_eq!(source.try_next_sample().unwrap().x, 2.0);
        assert!(source.try_next_sample().is_none());

        drop(sender);
        assert!(source.next_sample().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_source_respects_limit() {
        let mut source = SyntheticSampleSource::new(50.0).with_limit(3);
        let mut count = 0;
        while source.next_sample().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_select_source_prefers_sensor() {
        let (_sender, source) = ChannelSampleSource::new(4);
        let config = SensorConfig::default();
        assert_eq!(select_source(Some(source), &config).name(), "sensor");
        assert_eq!(select_source(None, &config).name(), "synthetic");
    }
}
