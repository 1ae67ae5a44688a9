//! Core audio value types
//!
//! Formats are plain values. A negotiated format is immutable for the lifetime
//! of a configuration epoch; reconfiguration produces a new value, never an
//! in-place edit.

use serde::{Deserialize, Serialize};

/// Compressed bitstream codecs the sink may accept in raw passthrough mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawCodec {
    Ac3,
    Eac3,
    Dts,
    DtsHd,
    TrueHd,
}

/// Sample encoding of a stream or sink buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleEncoding {
    /// 32-bit float PCM, the engine's internal mixing format
    F32,
    /// 16-bit signed integer PCM
    S16,
    /// 32-bit signed integer PCM
    S32,
    /// Encoded bitstream forwarded without decoding
    Raw(RawCodec),
}

impl SampleEncoding {
    pub fn is_raw(&self) -> bool {
        matches!(self, SampleEncoding::Raw(_))
    }
}

/// Speaker layout. Only the counts the engine actually distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Surround51,
    Surround71,
}

impl ChannelLayout {
    pub fn count(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Surround51 => 6,
            ChannelLayout::Surround71 => 8,
        }
    }

    /// Closest layout for a raw channel count reported by a device.
    pub fn from_count(count: u16) -> ChannelLayout {
        match count {
            0 | 1 => ChannelLayout::Mono,
            2..=5 => ChannelLayout::Stereo,
            6 | 7 => ChannelLayout::Surround51,
            _ => ChannelLayout::Surround71,
        }
    }
}

/// Complete audio format of a stream, sound, or sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: ChannelLayout,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: ChannelLayout, encoding: SampleEncoding) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
        }
    }

    /// Default PCM format used when nothing else constrains negotiation.
    pub fn default_pcm() -> Self {
        Self::new(44100, ChannelLayout::Stereo, SampleEncoding::F32)
    }

    pub fn is_raw(&self) -> bool {
        self.encoding.is_raw()
    }

    /// Duration in seconds of `frames` frames at this format's rate.
    pub fn frames_to_secs(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}

/// How the sink consumes engine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkMode {
    /// Encoded bitstream forwarded untouched
    Raw,
    /// PCM re-encoded to a compressed format the device accepts
    Transcode,
    /// Mixed PCM
    Pcm,
}

/// Resample quality requested through settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    Low,
    Mid,
    High,
}

/// One enumerated output device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    /// Device accepts encoded bitstreams
    pub supports_passthrough: bool,
}

/// Capabilities reported by a sink backend for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkCapabilities {
    pub max_channels: u16,
    /// Raw codecs the device accepts in passthrough mode
    pub raw_codecs: Vec<RawCodec>,
    /// Sample rates the device can open
    pub sample_rates: Vec<u32>,
    pub supports_silence_timeout: bool,
}

impl SinkCapabilities {
    pub fn supports_raw(&self, codec: RawCodec) -> bool {
        self.raw_codecs.contains(&codec)
    }
}

/// Sink timing as reported by the output driver.
///
/// `delay_secs` is the audio queued in the device at `measured_at`; callers
/// subtract elapsed wall time to get the current value.
#[derive(Debug, Clone, Copy)]
pub struct SinkDelay {
    pub delay_secs: f64,
    pub measured_at: std::time::Instant,
}

impl SinkDelay {
    pub fn zero() -> Self {
        Self {
            delay_secs: 0.0,
            measured_at: std::time::Instant::now(),
        }
    }

    /// Remaining queued time, clamped at zero.
    pub fn current(&self) -> f64 {
        (self.delay_secs - self.measured_at.elapsed().as_secs_f64()).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_counts_round_trip() {
        for layout in [
            ChannelLayout::Mono,
            ChannelLayout::Stereo,
            ChannelLayout::Surround51,
            ChannelLayout::Surround71,
        ] {
            assert_eq!(ChannelLayout::from_count(layout.count()), layout);
        }
    }

    #[test]
    fn raw_detection() {
        let pcm = AudioFormat::default_pcm();
        assert!(!pcm.is_raw());

        let raw = AudioFormat::new(
            48000,
            ChannelLayout::Stereo,
            SampleEncoding::Raw(RawCodec::Ac3),
        );
        assert!(raw.is_raw());
    }

    #[test]
    fn sink_delay_decays() {
        let delay = SinkDelay {
            delay_secs: 0.0,
            measured_at: std::time::Instant::now(),
        };
        assert_eq!(delay.current(), 0.0);
    }
}
