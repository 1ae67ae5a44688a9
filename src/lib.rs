//! soundstage - real-time audio mixing and output engine
//!
//! A single worker thread owns the whole pipeline: per-stream buffer pools
//! and resamplers, an additive mixer for streams and effect sounds, and a
//! managed hardware sink. Producers talk to it over two bounded message
//! channels and get replies on one-shot channels; the only shared state is a
//! lock-protected statistics aggregate.
//!
//! ```no_run
//! use soundstage::{AudioEngine, AudioSettings, AudioFormat, StreamOptions};
//! use soundstage::sink::output::CpalBackend;
//! use std::sync::Arc;
//!
//! # fn main() -> soundstage::Result<()> {
//! let engine = AudioEngine::new(Arc::new(CpalBackend::new()), AudioSettings::default())?;
//! let stream = engine.make_stream(AudioFormat::default_pcm(), StreamOptions::default(), None)?;
//! stream.add_samples(vec![0.0; 4800 * 2])?;
//! stream.drain(std::time::Duration::from_secs(2))?;
//! engine.free_stream(stream, false)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod engine;
pub mod error;
pub mod mixer;
pub mod msg;
pub mod resample;
pub mod settings;
pub mod sink;
pub mod stats;
pub mod stream;
pub mod types;

pub use engine::{
    AudioCallback, AudioEngine, DisplayObserver, Lifecycle, SoundHandle, StreamHandle,
};
pub use error::{Error, Result};
pub use settings::{AudioSettings, SoundMode};
pub use stats::{EngineSnapshot, EngineStats, StreamStats, SyncState};
pub use stream::{
    AudioServiceType, CodecInfo, MatrixEncoding, SoundId, StreamClock, StreamId, StreamOptions,
};
pub use types::{
    AudioFormat, ChannelLayout, DeviceInfo, Quality, RawCodec, SampleEncoding, SinkCapabilities,
    SinkDelay, SinkMode,
};
