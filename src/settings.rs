//! User-level audio settings snapshot
//!
//! The engine never owns a settings store; the application hands it a value
//! snapshot at init/reconfigure time and the engine reads it during
//! configuration only.

use crate::types::{Quality, RawCodec};
use serde::{Deserialize, Serialize};

/// When GUI effect sounds are allowed to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoundMode {
    Off,
    /// Only while no stream is playing
    IdleOnly,
    Always,
}

/// Value snapshot of the user's audio configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// PCM output device name, None = system default
    pub device: Option<String>,
    /// Passthrough output device name, None = same as `device`
    pub passthrough_device: Option<String>,
    /// Master passthrough switch
    pub passthrough: bool,
    /// Raw codecs the user allows to pass through
    pub passthrough_codecs: Vec<RawCodec>,
    /// Re-encode multichannel PCM to AC3 when the device accepts it
    pub transcode_to_ac3: bool,
    /// Upmix stereo sources to the output layout
    pub stereo_upmix: bool,
    /// Output channel count cap, 0 = follow the device
    pub channels: u16,
    /// Fixed output sample rate, 0 = follow the source
    pub sample_rate: u32,
    pub resample_quality: Quality,
    pub gui_sound_mode: SoundMode,
    /// Seconds of idle before the sink is released, 0 = never
    pub silence_timeout_secs: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            device: None,
            passthrough_device: None,
            passthrough: false,
            passthrough_codecs: Vec::new(),
            transcode_to_ac3: false,
            stereo_upmix: false,
            channels: 0,
            sample_rate: 0,
            resample_quality: Quality::Mid,
            gui_sound_mode: SoundMode::Always,
            silence_timeout_secs: 0,
        }
    }
}

impl AudioSettings {
    pub fn allows_passthrough(&self, codec: RawCodec) -> bool {
        self.passthrough && self.passthrough_codecs.contains(&codec)
    }
}
