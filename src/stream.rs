//! Worker-owned stream and sound state
//!
//! `Stream` and `Sound` live entirely on the engine thread; producers only
//! hold opaque ids and talk to them through the message channels. Identifiers
//! are generated monotonically and never reused for the engine's lifetime.

use crate::buffer::ResamplePool;
use crate::msg::ReplySender;
use crate::stats::SyncState;
use crate::types::AudioFormat;
use serde::Serialize;
use std::time::Instant;

/// Opaque stream identifier, unique for the engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Opaque sound identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SoundId(pub u32);

impl std::fmt::Display for SoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sound#{}", self.0)
    }
}

/// External clock a stream synchronizes against (typically the video clock).
/// Returns the presentation time in seconds the producer expects the stream
/// to be at right now.
pub trait StreamClock: Send {
    fn current_pts(&self) -> f64;
}

/// Matrix encoding carried as opaque side-info for encoded streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatrixEncoding {
    None,
    Dolby,
    DolbyPlII,
}

/// Audio service type side-info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AudioServiceType {
    Main,
    Effects,
    VisuallyImpaired,
    HearingImpaired,
    Dialogue,
    Commentary,
}

/// Codec side-channel metadata for passthrough streams. The engine stores it
/// and forwards it with the stream; it never interprets the values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodecInfo {
    pub profile: i32,
    pub matrix_encoding: MatrixEncoding,
    pub service_type: AudioServiceType,
}

/// Options for stream creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Create the stream paused; no samples are mixed until resumed
    pub start_paused: bool,
}

/// Linear fade envelope, advanced by mixed output time.
#[derive(Debug, Clone, Copy)]
pub struct Fade {
    pub from: f32,
    pub target: f32,
    pub duration_secs: f64,
    pub elapsed_secs: f64,
}

impl Fade {
    pub fn new(from: f32, target: f32, millis: u32) -> Self {
        Self {
            from,
            target,
            duration_secs: millis as f64 / 1000.0,
            elapsed_secs: 0.0,
        }
    }

    pub fn gain_at(&self, offset_secs: f64) -> f32 {
        if self.duration_secs <= 0.0 {
            return self.target;
        }
        let t = ((self.elapsed_secs + offset_secs) / self.duration_secs).clamp(0.0, 1.0) as f32;
        self.from + (self.target - self.from) * t
    }
}

/// Error below this is in-sync; above it for longer than the grace period the
/// stream counts as drifting and the engine starts nudging the ratio.
const SYNC_ERROR_THRESHOLD_SECS: f64 = 0.02;
const SYNC_GRACE_MS: u64 = 500;
/// Strongest automatic ratio correction applied per tick.
const SYNC_MAX_ADJUST: f64 = 0.02;

/// Tracks a stream's timing error against its external clock and derives the
/// ratio nudge used to pull it back.
#[derive(Debug)]
pub struct SyncTracker {
    pub error_secs: f64,
    pub state: SyncState,
    error_since: Option<Instant>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self {
            error_secs: 0.0,
            state: SyncState::Off,
            error_since: None,
        }
    }

    /// How long the current out-of-bounds error has persisted.
    pub fn error_ms(&self) -> u64 {
        self.error_since
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Feed the latest measured error; returns the ratio adjustment to apply
    /// on top of the stream's base resample ratio.
    pub fn update(&mut self, error_secs: f64) -> f64 {
        self.error_secs = error_secs;
        if error_secs.abs() < SYNC_ERROR_THRESHOLD_SECS {
            self.state = SyncState::InSync;
            self.error_since = None;
            return 1.0;
        }
        let since = *self.error_since.get_or_insert_with(Instant::now);
        if (since.elapsed().as_millis() as u64) < SYNC_GRACE_MS {
            self.state = SyncState::Drifting;
            return 1.0;
        }
        self.state = SyncState::Resyncing;
        // Positive error = stream ahead of the clock, play it out slower.
        let adjust = (-error_secs * 0.1).clamp(-SYNC_MAX_ADJUST, SYNC_MAX_ADJUST);
        1.0 + adjust
    }
}

/// One active stream, owned by the engine thread.
pub(crate) struct Stream {
    pub id: StreamId,
    pub input_format: AudioFormat,
    pub pool: ResamplePool,
    pub volume: f32,
    pub replaygain: f32,
    pub amplify: f32,
    pub fade: Option<Fade>,
    pub resample_ratio: f64,
    /// 0 = fixed ratio, 1 = nudge automatically against the clock
    pub resample_mode: i32,
    pub codec_info: Option<CodecInfo>,
    pub paused: bool,
    pub draining: bool,
    /// Remove the stream once its drain completes (free with finish=true)
    pub free_after_drain: bool,
    pub drain_reply: Option<ReplySender>,
    pub drain_deadline: Option<Instant>,
    pub clock: Option<Box<dyn StreamClock>>,
    pub sync: SyncTracker,
    /// Frames of this stream mixed to the sink since creation
    pub frames_mixed: u64,
}

impl Stream {
    pub fn new(
        id: StreamId,
        input_format: AudioFormat,
        pool: ResamplePool,
        options: StreamOptions,
        clock: Option<Box<dyn StreamClock>>,
    ) -> Self {
        Self {
            id,
            input_format,
            pool,
            volume: 1.0,
            replaygain: 1.0,
            amplify: 1.0,
            fade: None,
            resample_ratio: 1.0,
            resample_mode: 0,
            codec_info: None,
            paused: options.start_paused,
            draining: false,
            free_after_drain: false,
            drain_reply: None,
            drain_deadline: None,
            clock,
            sync: SyncTracker::new(),
            frames_mixed: 0,
        }
    }

    /// Static gain outside the fade envelope.
    pub fn base_gain(&self) -> f32 {
        self.volume * self.replaygain * self.amplify
    }

    /// Gain ramp endpoints over `duration_secs` of output, advancing the fade.
    pub fn gain_ramp(&mut self, duration_secs: f64) -> (f32, f32) {
        let base = self.base_gain();
        match self.fade.as_mut() {
            Some(fade) => {
                let start = fade.gain_at(0.0);
                let end = fade.gain_at(duration_secs);
                // A finished envelope stays at its target until replaced.
                fade.elapsed_secs += duration_secs;
                (base * start, base * end)
            }
            None => (base, base),
        }
    }
}

/// A decoded effect sound, owned by the engine thread. Resampled lazily to
/// the sink format; the cache is invalidated on reconfiguration.
pub(crate) struct Sound {
    pub id: SoundId,
    pub format: AudioFormat,
    pub samples: Vec<f32>,
    /// (epoch format, samples in that format)
    pub resampled: Option<(AudioFormat, Vec<f32>)>,
}

/// A sound currently being mixed; removed when the cursor reaches the end.
pub(crate) struct PlayingSound {
    pub id: SoundId,
    pub cursor_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_ramps_linearly() {
        let fade = Fade::new(0.0, 1.0, 1000);
        assert_eq!(fade.gain_at(0.0), 0.0);
        assert!((fade.gain_at(0.5) - 0.5).abs() < 1e-6);
        assert_eq!(fade.gain_at(2.0), 1.0);
    }

    #[test]
    fn sync_tracker_states() {
        let mut sync = SyncTracker::new();
        assert_eq!(sync.update(0.001), 1.0);
        assert_eq!(sync.state, SyncState::InSync);

        // Large error enters the grace period first
        assert_eq!(sync.update(0.5), 1.0);
        assert_eq!(sync.state, SyncState::Drifting);
    }

    #[test]
    fn sync_adjust_is_bounded() {
        let mut sync = SyncTracker::new();
        sync.update(1.0);
        sync.error_since = Some(Instant::now() - std::time::Duration::from_secs(2));
        let adjust = sync.update(1.0);
        assert!((adjust - 0.98).abs() < 1e-9);
        assert_eq!(sync.state, SyncState::Resyncing);
    }
}
