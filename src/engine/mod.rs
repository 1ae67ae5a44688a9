//! Public engine surface
//!
//! `AudioEngine` spawns the worker thread and exposes the producer-facing
//! API: stream and sound handles, volume and lifecycle control, device and
//! capability queries. Every call here turns into a message on one of the two
//! mailboxes; the handles are cheap clones of the same ports.

mod worker;

use crate::error::{Error, Result};
use crate::msg::{self, ControlMsg, DataMsg, Port, Reply};
use crate::settings::{AudioSettings, SoundMode};
use crate::sink::{SinkBackend, SinkManager};
use crate::stats::{EngineSnapshot, EngineStats, SyncState};
use crate::stream::{CodecInfo, SoundId, StreamClock, StreamId, StreamOptions};
use crate::types::{AudioFormat, DeviceInfo, RawCodec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Deadline for ordinary request/reply round trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra wait on top of a drain's own deadline for the reply to travel back.
const DRAIN_REPLY_MARGIN: Duration = Duration::from_millis(500);

/// Receives the mixed output of every tick, after gain, before the sink.
/// Called on the engine thread; implementations must return quickly.
pub trait AudioCallback: Send + Sync {
    fn on_audio(&self, samples: &[f32], format: AudioFormat);
}

/// Power-state collaborators release and reclaim the output device.
pub trait Lifecycle {
    fn suspend(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
}

/// Consumer of windowing-system events that affect audio routing.
pub trait DisplayObserver {
    fn on_lost_display(&self) -> Result<()>;
    fn on_reset_display(&self) -> Result<()>;
    fn on_app_focus(&self, focused: bool) -> Result<()>;
}

type VizList = Arc<Mutex<Vec<Arc<dyn AudioCallback>>>>;

/// Handle to the engine worker thread.
///
/// Clone-cheap handles (`StreamHandle`, `SoundHandle`) share the same
/// mailboxes; dropping the engine shuts the worker down.
pub struct AudioEngine {
    ctrl: Port<ControlMsg>,
    data: Port<DataMsg>,
    stats: Arc<EngineStats>,
    viz: VizList,
    backend: Arc<dyn SinkBackend>,
    // Last accepted values, so getters answer without a worker round trip.
    volume: Mutex<f32>,
    muted: AtomicBool,
    worker: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Spawn the worker and bring the sink up with `settings`.
    ///
    /// Construction succeeds even when no output device can be opened; the
    /// engine then runs its silence fallback and retries in the background.
    pub fn new(backend: Arc<dyn SinkBackend>, settings: AudioSettings) -> Result<Self> {
        let (ctrl, ctrl_rx) = msg::mailbox();
        let (data, data_rx) = msg::mailbox();
        let stats = Arc::new(EngineStats::new());
        let viz: VizList = Arc::new(Mutex::new(Vec::new()));

        let worker = worker::Worker::new(
            ctrl_rx,
            data_rx,
            SinkManager::new(Arc::clone(&backend)),
            Arc::clone(&stats),
            Arc::clone(&viz),
        );
        let handle = std::thread::Builder::new()
            .name("soundstage-engine".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::Internal(format!("failed to spawn engine thread: {e}")))?;

        let engine = Self {
            ctrl,
            data,
            stats,
            viz,
            backend,
            volume: Mutex::new(1.0),
            muted: AtomicBool::new(false),
            worker: Some(handle),
        };
        engine
            .ctrl
            .command(ControlMsg::Init(Box::new(settings)), REQUEST_TIMEOUT)?;
        Ok(engine)
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    // ---- streams and sounds ---------------------------------------------

    /// Create a stream for `format`. The engine configures (or reuses) the
    /// sink and the handle can start pushing samples immediately.
    pub fn make_stream(
        &self,
        format: AudioFormat,
        options: StreamOptions,
        clock: Option<Box<dyn StreamClock>>,
    ) -> Result<StreamHandle> {
        match self.data.request(
            DataMsg::NewStream {
                format,
                options,
                clock,
            },
            REQUEST_TIMEOUT,
        )? {
            Reply::StreamCreated { id, .. } => Ok(StreamHandle {
                id,
                ctrl: self.ctrl.clone(),
                data: self.data.clone(),
                stats: Arc::clone(&self.stats),
            }),
            Reply::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected reply {other:?}"))),
        }
    }

    /// Tear a stream down. With `finish` the engine first plays out whatever
    /// is still buffered; without it teardown is immediate.
    pub fn free_stream(&self, stream: StreamHandle, finish: bool) -> Result<()> {
        let timeout = if finish {
            REQUEST_TIMEOUT + DRAIN_REPLY_MARGIN
        } else {
            REQUEST_TIMEOUT
        };
        match self
            .data
            .request(DataMsg::FreeStream { id: stream.id, finish }, timeout)?
        {
            Reply::Accepted | Reply::StreamDrained => Ok(()),
            Reply::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected reply {other:?}"))),
        }
    }

    /// Register a decoded effect sound for later triggering.
    pub fn make_sound(&self, format: AudioFormat, samples: Vec<f32>) -> Result<SoundHandle> {
        match self
            .data
            .request(DataMsg::NewSound { format, samples }, REQUEST_TIMEOUT)?
        {
            Reply::SoundCreated { id } => Ok(SoundHandle {
                id,
                ctrl: self.ctrl.clone(),
                data: self.data.clone(),
            }),
            Reply::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn free_sound(&self, sound: SoundHandle) -> Result<()> {
        self.data
            .command(DataMsg::FreeSound(sound.id), REQUEST_TIMEOUT)
    }

    // ---- volume and mode ------------------------------------------------

    /// Set master volume in [0.0, 1.0]. The value is cached on acceptance, so
    /// a `get_volume` right after returns it even while mixing is in flight.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.ctrl
            .command(ControlMsg::Volume(volume), REQUEST_TIMEOUT)?;
        if let Ok(mut cached) = self.volume.lock() {
            *cached = volume;
        }
        Ok(())
    }

    pub fn get_volume(&self) -> f32 {
        self.volume.lock().map(|v| *v).unwrap_or(1.0)
    }

    /// Mute output without touching the stored volume.
    pub fn set_mute(&self, muted: bool) -> Result<()> {
        self.ctrl
            .command(ControlMsg::Mute(muted), REQUEST_TIMEOUT)?;
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_sound_mode(&self, mode: SoundMode) -> Result<()> {
        self.ctrl
            .command(ControlMsg::SoundMode(mode), REQUEST_TIMEOUT)
    }

    // ---- lifecycle ------------------------------------------------------

    /// Release the output device; streams stay alive but nothing plays.
    pub fn suspend(&self) -> Result<()> {
        self.ctrl.command(ControlMsg::Suspend, REQUEST_TIMEOUT)
    }

    /// Reclaim the device and continue where suspend left off.
    pub fn resume(&self) -> Result<()> {
        self.ctrl.command(ControlMsg::Resume, REQUEST_TIMEOUT)
    }

    pub fn is_suspended(&self) -> bool {
        self.stats.is_suspended()
    }

    /// Apply a new settings snapshot and reconfigure the sink.
    pub fn reconfigure(&self, settings: Option<AudioSettings>) -> Result<()> {
        self.ctrl.command(
            ControlMsg::Reconfigure(settings.map(Box::new)),
            REQUEST_TIMEOUT,
        )
    }

    /// Note that the set of output devices changed. Bursts are debounced into
    /// a single reconfiguration.
    pub fn device_change(&self) -> Result<()> {
        self.ctrl.send(ControlMsg::DeviceChange)
    }

    /// Hold the current sink configuration for `millis` even if every stream
    /// goes away, for gapless transitions.
    pub fn keep_configuration(&self, millis: u32) -> Result<()> {
        self.ctrl
            .command(ControlMsg::KeepConfig(millis), REQUEST_TIMEOUT)
    }

    pub fn on_lost_display(&self) -> Result<()> {
        self.ctrl.command(ControlMsg::DisplayLost, REQUEST_TIMEOUT)
    }

    pub fn on_reset_display(&self) -> Result<()> {
        self.ctrl.command(ControlMsg::DisplayReset, REQUEST_TIMEOUT)
    }

    pub fn on_app_focus(&self, focused: bool) -> Result<()> {
        self.ctrl
            .command(ControlMsg::AppFocus(focused), REQUEST_TIMEOUT)
    }

    /// Full state snapshot from the worker.
    pub fn get_state(&self) -> Result<EngineSnapshot> {
        match self.ctrl.request(ControlMsg::GetState, REQUEST_TIMEOUT)? {
            Reply::Stats(snapshot) => Ok(*snapshot),
            Reply::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected reply {other:?}"))),
        }
    }

    // ---- device and capability queries ----------------------------------

    pub fn enumerate_devices(&self, passthrough: bool) -> Vec<DeviceInfo> {
        self.backend.enumerate_devices(passthrough)
    }

    pub fn default_device(&self, passthrough: bool) -> Option<String> {
        self.backend.default_device(passthrough)
    }

    /// Whether `device` (None = default) can pass `codec` through undecoded.
    pub fn supports_raw_format(&self, codec: RawCodec, device: Option<&str>) -> bool {
        self.backend.capabilities(device).supports_raw(codec)
    }

    pub fn supports_silence_timeout(&self) -> bool {
        self.backend.capabilities(None).supports_silence_timeout
    }

    /// All resample quality levels are available in this engine.
    pub fn supports_quality_level(&self, _quality: crate::types::Quality) -> bool {
        true
    }

    pub fn has_stereo_audio_channel_count(&self, device: Option<&str>) -> bool {
        self.backend.capabilities(device).max_channels >= 2
    }

    pub fn has_hd_audio_channel_count(&self, device: Option<&str>) -> bool {
        self.backend.capabilities(device).max_channels >= 6
    }

    // ---- visualization --------------------------------------------------

    /// Register a tap on the mixed output. No-op in raw passthrough mode.
    pub fn register_audio_callback(&self, callback: Arc<dyn AudioCallback>) {
        if let Ok(mut list) = self.viz.lock() {
            list.push(callback);
        }
    }

    pub fn unregister_audio_callback(&self, callback: &Arc<dyn AudioCallback>) {
        if let Ok(mut list) = self.viz.lock() {
            list.retain(|c| !Arc::ptr_eq(c, callback));
        }
    }
}

impl Lifecycle for AudioEngine {
    fn suspend(&self) -> Result<()> {
        AudioEngine::suspend(self)
    }

    fn resume(&self) -> Result<()> {
        AudioEngine::resume(self)
    }
}

impl DisplayObserver for AudioEngine {
    fn on_lost_display(&self) -> Result<()> {
        AudioEngine::on_lost_display(self)
    }

    fn on_reset_display(&self) -> Result<()> {
        AudioEngine::on_reset_display(self)
    }

    fn on_app_focus(&self, focused: bool) -> Result<()> {
        AudioEngine::on_app_focus(self, focused)
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Err(e) = self.ctrl.command(ControlMsg::Shutdown, REQUEST_TIMEOUT) {
            warn!("engine shutdown request failed: {e}");
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("engine worker panicked during shutdown");
            } else {
                info!("engine worker joined");
            }
        }
    }
}

/// Producer-side handle to one stream.
#[derive(Clone)]
pub struct StreamHandle {
    id: StreamId,
    ctrl: Port<ControlMsg>,
    data: Port<DataMsg>,
    stats: Arc<EngineStats>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Hand a buffer of interleaved input-format samples to the engine.
    /// Blocks while the stream's cache is full (backpressure), and returns
    /// once the pipeline has taken the data.
    pub fn add_samples(&self, samples: Vec<f32>) -> Result<()> {
        match self.data.request(
            DataMsg::StreamSamples {
                id: self.id,
                samples,
            },
            REQUEST_TIMEOUT,
        )? {
            Reply::StreamBufferConsumed => Ok(()),
            Reply::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected reply {other:?}"))),
        }
    }

    /// Play out everything buffered for this stream. Resolves once the last
    /// sample reached the sink, or fails when `timeout` elapses first.
    pub fn drain(&self, timeout: Duration) -> Result<()> {
        match self.data.request(
            DataMsg::DrainStream {
                id: self.id,
                timeout,
            },
            timeout + DRAIN_REPLY_MARGIN,
        )? {
            Reply::StreamDrained => Ok(()),
            Reply::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected reply {other:?}"))),
        }
    }

    /// Discard everything buffered for this stream.
    pub fn flush(&self) -> Result<()> {
        self.ctrl
            .command(ControlMsg::FlushStream(self.id), REQUEST_TIMEOUT)
    }

    pub fn pause(&self) -> Result<()> {
        self.ctrl
            .command(ControlMsg::PauseStream(self.id), REQUEST_TIMEOUT)
    }

    pub fn resume(&self) -> Result<()> {
        self.ctrl
            .command(ControlMsg::ResumeStream(self.id), REQUEST_TIMEOUT)
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.ctrl
            .command(ControlMsg::StreamVolume(self.id, volume), REQUEST_TIMEOUT)
    }

    pub fn set_replaygain(&self, gain: f32) -> Result<()> {
        self.ctrl.command(
            ControlMsg::StreamReplaygain(self.id, gain),
            REQUEST_TIMEOUT,
        )
    }

    /// Amplification above unity for quiet sources; 1.0 to 1000.0.
    pub fn set_amplification(&self, amplify: f32) -> Result<()> {
        self.ctrl
            .command(ControlMsg::StreamAmplify(self.id, amplify), REQUEST_TIMEOUT)
    }

    pub fn set_resample_ratio(&self, ratio: f64) -> Result<()> {
        self.ctrl.command(
            ControlMsg::StreamResampleRatio(self.id, ratio),
            REQUEST_TIMEOUT,
        )
    }

    /// 0 = fixed ratio, 1 = nudge automatically against the stream clock.
    pub fn set_resample_mode(&self, mode: i32) -> Result<()> {
        self.ctrl.command(
            ControlMsg::StreamResampleMode(self.id, mode),
            REQUEST_TIMEOUT,
        )
    }

    /// Fade the stream's gain from `from` to `target` over `millis`.
    pub fn set_fade(&self, from: f32, target: f32, millis: u32) -> Result<()> {
        self.ctrl.command(
            ControlMsg::StreamFade {
                id: self.id,
                from,
                target,
                millis,
            },
            REQUEST_TIMEOUT,
        )
    }

    pub fn set_codec_info(&self, info: CodecInfo) -> Result<()> {
        self.ctrl
            .command(ControlMsg::StreamCodecInfo(self.id, info), REQUEST_TIMEOUT)
    }

    /// Total output delay for this stream in seconds.
    pub fn get_delay(&self) -> f64 {
        self.stats.get_stream_delay(self.id)
    }

    /// Seconds of audio buffered engine-side for this stream.
    pub fn get_cache_time(&self) -> f64 {
        self.stats.get_cache_time(self.id)
    }

    /// Buffer capacity in seconds this stream may fill.
    pub fn get_cache_total(&self) -> f64 {
        self.stats.get_cache_total()
    }

    pub fn sync_info(&self) -> Option<(SyncState, f64)> {
        self.stats.sync_info(self.id)
    }
}

/// Producer-side handle to one registered effect sound.
#[derive(Clone)]
pub struct SoundHandle {
    id: SoundId,
    ctrl: Port<ControlMsg>,
    data: Port<DataMsg>,
}

impl std::fmt::Debug for SoundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SoundHandle {
    pub fn id(&self) -> SoundId {
        self.id
    }

    /// Start (another) playback of this sound from the beginning.
    pub fn play(&self) -> Result<()> {
        self.data
            .command(DataMsg::PlaySound(self.id), REQUEST_TIMEOUT)
    }

    /// Stop every in-flight playback of this sound.
    pub fn stop(&self) -> Result<()> {
        self.ctrl
            .command(ControlMsg::StopSound(self.id), REQUEST_TIMEOUT)
    }
}
