//! Engine statistics and A/V sync bookkeeping
//!
//! One aggregate shared between the engine thread (the only writer of the
//! sink-global fields) and producer threads querying their stream's timing.
//! Every operation takes the lock for an O(1) copy or update and nothing
//! else; no I/O or pipeline work ever runs under it.

use crate::stream::StreamId;
use crate::types::{AudioFormat, SinkDelay};
use serde::Serialize;
use std::sync::Mutex;

/// Engine-side cache ceiling per stream, in seconds. The water level is the
/// fraction of this capacity currently buffered.
pub const MAX_CACHE_SECS: f64 = 4.0;

/// Classification of a stream's timing against its external clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    /// No external clock attached
    Off,
    InSync,
    Drifting,
    Resyncing,
}

/// Per-stream timing record.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub id: StreamId,
    /// Seconds of audio buffered engine-side for this stream
    pub buffered_secs: f64,
    pub resample_ratio: f64,
    /// Signed sync error in seconds (positive = stream ahead of clock)
    pub sync_error_secs: f64,
    /// How long the current error magnitude has persisted, in milliseconds
    pub sync_error_ms: u64,
    pub sync_state: SyncState,
}

/// Point-in-time copy of the whole aggregate, returned for get-state queries.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub sink_format: Option<AudioFormat>,
    pub sink_cache_total_secs: f64,
    pub sink_latency_secs: f64,
    pub suspended: bool,
    pub has_dsp: bool,
    pub water_level: f64,
    pub streams: Vec<StreamStats>,
}

struct StatsInner {
    sink_format: Option<AudioFormat>,
    sink_cache_total: f64,
    sink_latency: f64,
    sink_delay: SinkDelay,
    sink_sample_rate: u32,
    buffered_samples: u64,
    suspended: bool,
    has_dsp: bool,
    streams: Vec<StreamStats>,
}

/// Thread-safe statistics aggregate.
pub struct EngineStats {
    inner: Mutex<StatsInner>,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                sink_format: None,
                sink_cache_total: 0.0,
                sink_latency: 0.0,
                sink_delay: SinkDelay::zero(),
                sink_sample_rate: 44100,
                buffered_samples: 0,
                suspended: false,
                has_dsp: false,
                streams: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        // A poisoned stats lock means the engine thread panicked mid-update;
        // the plain numbers inside are still the best information available.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start a new configuration epoch.
    pub fn reset(&self, sink_sample_rate: u32) {
        let mut inner = self.lock();
        inner.sink_sample_rate = sink_sample_rate.max(1);
        inner.buffered_samples = 0;
        inner.sink_delay = SinkDelay::zero();
    }

    pub fn set_current_sink_format(&self, format: Option<AudioFormat>) {
        self.lock().sink_format = format;
    }

    pub fn current_sink_format(&self) -> Option<AudioFormat> {
        self.lock().sink_format
    }

    pub fn set_sink_cache_total(&self, secs: f64) {
        self.lock().sink_cache_total = secs;
    }

    pub fn set_sink_latency(&self, secs: f64) {
        self.lock().sink_latency = secs;
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.lock().suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn set_dsp(&self, present: bool) {
        self.lock().has_dsp = present;
    }

    pub fn has_dsp(&self) -> bool {
        self.lock().has_dsp
    }

    /// Record the sink's own queue as measured after the last write.
    pub fn update_sink_delay(&self, delay: SinkDelay) {
        self.lock().sink_delay = delay;
    }

    /// Called once per pipeline tick with the engine-side buffered totals.
    pub fn add_samples(&self, buffered_samples: u64, streams: Vec<StreamStats>) {
        let mut inner = self.lock();
        inner.buffered_samples = buffered_samples;
        inner.streams = streams;
    }

    pub fn add_stream(&self, id: StreamId) {
        self.lock().streams.push(StreamStats {
            id,
            buffered_secs: 0.0,
            resample_ratio: 1.0,
            sync_error_secs: 0.0,
            sync_error_ms: 0,
            sync_state: SyncState::Off,
        });
    }

    pub fn remove_stream(&self, id: StreamId) {
        self.lock().streams.retain(|s| s.id != id);
    }

    /// Total output delay in seconds: sink queue plus engine-side buffers.
    pub fn get_delay(&self) -> f64 {
        let inner = self.lock();
        inner.sink_delay.current() + inner.buffered_samples as f64 / inner.sink_sample_rate as f64
    }

    /// Output delay for one stream: sink queue plus that stream's buffers.
    pub fn get_stream_delay(&self, id: StreamId) -> f64 {
        let inner = self.lock();
        let buffered = inner
            .streams
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.buffered_secs)
            .unwrap_or(0.0);
        inner.sink_delay.current() + buffered
    }

    /// Seconds currently buffered engine-side for one stream.
    pub fn get_cache_time(&self, id: StreamId) -> f64 {
        let inner = self.lock();
        inner
            .streams
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.buffered_secs)
            .unwrap_or(0.0)
    }

    /// Buffer capacity in seconds a stream may fill.
    pub fn get_cache_total(&self) -> f64 {
        MAX_CACHE_SECS
    }

    pub fn sync_info(&self, id: StreamId) -> Option<(SyncState, f64)> {
        let inner = self.lock();
        inner
            .streams
            .iter()
            .find(|s| s.id == id)
            .map(|s| (s.sync_state, s.sync_error_secs))
    }

    /// Fraction of buffer capacity occupied, the backpressure signal.
    pub fn water_level(&self) -> f64 {
        let inner = self.lock();
        let buffered = inner.buffered_samples as f64 / inner.sink_sample_rate as f64;
        (buffered / MAX_CACHE_SECS).min(1.0)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let inner = self.lock();
        let buffered = inner.buffered_samples as f64 / inner.sink_sample_rate as f64;
        EngineSnapshot {
            sink_format: inner.sink_format,
            sink_cache_total_secs: inner.sink_cache_total,
            sink_latency_secs: inner.sink_latency,
            suspended: inner.suspended,
            has_dsp: inner.has_dsp,
            water_level: (buffered / MAX_CACHE_SECS).min(1.0),
            streams: inner.streams.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_records_follow_add_remove() {
        let stats = EngineStats::new();
        let id = StreamId(7);
        stats.add_stream(id);
        assert_eq!(stats.get_cache_time(id), 0.0);
        assert!(stats.sync_info(id).is_some());
        stats.remove_stream(id);
        assert!(stats.sync_info(id).is_none());
    }

    #[test]
    fn add_samples_drives_water_level() {
        let stats = EngineStats::new();
        stats.reset(48000);
        // Half of the 4 second capacity
        stats.add_samples(48000 * 2, Vec::new());
        let level = stats.water_level();
        assert!((level - 0.5).abs() < 1e-9, "level {level}");
    }

    #[test]
    fn snapshot_copies_fields() {
        let stats = EngineStats::new();
        stats.set_suspended(true);
        stats.set_sink_latency(0.05);
        let snap = stats.snapshot();
        assert!(snap.suspended);
        assert_eq!(snap.sink_latency_secs, 0.05);
    }
}
