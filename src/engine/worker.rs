//! Engine worker thread: state machine and pipeline
//!
//! Exactly one thread owns every piece of engine state. It drains the two
//! mailboxes, applies each message synchronously, and runs one pipeline tick
//! whenever output is due: pull stream buffers, resample, mix sounds, scale,
//! write the sink, update stats. Producers never touch any of this directly;
//! they only enqueue messages and read the stats aggregate through its lock.

use crate::buffer::{BufferPool, ResamplePool, SampleBuffer};
use crate::engine::AudioCallback;
use crate::error::{Error, Result};
use crate::mixer;
use crate::msg::{post_reply, ControlMsg, DataMsg, Envelope, Reply};
use crate::resample::StageResampler;
use crate::settings::{AudioSettings, SoundMode};
use crate::stats::{EngineStats, StreamStats, MAX_CACHE_SECS};
use crate::stream::{
    Fade, PlayingSound, Sound, SoundId, Stream, StreamId, SyncTracker,
};
use crate::sink::SinkManager;
use crate::types::{AudioFormat, Quality, SampleEncoding, SinkMode};
use crossbeam_channel::{select, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Target mix buffer duration; one pipeline tick produces one buffer.
const TICK: Duration = Duration::from_millis(20);

/// Stop producing while the sink already holds this much audio.
const TARGET_SINK_CACHE_SECS: f64 = 0.10;

/// Retry interval for configuration after a sink-open failure.
const ERROR_RETRY: Duration = Duration::from_millis(500);

/// Default deadline for a free-with-finish drain.
const FREE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Idle poll period when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
    Uninitialized,
    Configuring,
    Running,
    Suspended,
    Draining,
    Error,
    ShuttingDown,
}

pub(crate) struct Worker {
    ctrl_rx: Receiver<Envelope<ControlMsg>>,
    data_rx: Receiver<Envelope<DataMsg>>,
    state: EngineState,
    mode: SinkMode,
    settings: AudioSettings,
    sink: SinkManager,
    stats: Arc<EngineStats>,
    viz: Arc<Mutex<Vec<Arc<dyn AudioCallback>>>>,

    streams: Vec<Stream>,
    sounds: Vec<Sound>,
    playing: Vec<PlayingSound>,
    /// Pools from ended epochs, freed between ticks
    discarded_pools: Vec<ResamplePool>,
    stream_id_gen: u32,
    sound_id_gen: u32,

    volume: f32,
    muted: bool,

    internal_format: Option<AudioFormat>,
    mix_pool: Option<BufferPool>,
    /// Quality the stream pools were built with; drift rebuilds them without
    /// a sink reopen
    pool_quality: Quality,

    keep_config_until: Option<Instant>,
    idle_since: Option<Instant>,
    next_tick: Instant,
    retry_at: Option<Instant>,

    scratch: Vec<f32>,
}

impl Worker {
    pub(crate) fn new(
        ctrl_rx: Receiver<Envelope<ControlMsg>>,
        data_rx: Receiver<Envelope<DataMsg>>,
        sink: SinkManager,
        stats: Arc<EngineStats>,
        viz: Arc<Mutex<Vec<Arc<dyn AudioCallback>>>>,
    ) -> Self {
        Self {
            ctrl_rx,
            data_rx,
            state: EngineState::Uninitialized,
            mode: SinkMode::Pcm,
            settings: AudioSettings::default(),
            sink,
            stats,
            viz,
            streams: Vec::new(),
            sounds: Vec::new(),
            playing: Vec::new(),
            discarded_pools: Vec::new(),
            stream_id_gen: 0,
            sound_id_gen: 0,
            volume: 1.0,
            muted: false,
            internal_format: None,
            mix_pool: None,
            pool_quality: Quality::Mid,
            keep_config_until: None,
            idle_since: None,
            next_tick: Instant::now(),
            retry_at: None,
            scratch: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        info!("audio engine worker started");
        loop {
            if self.state == EngineState::ShuttingDown {
                break;
            }
            let timeout = self.wait_timeout();
            select! {
                recv(self.ctrl_rx) -> env => match env {
                    Ok(env) => self.handle_control(env),
                    Err(_) => break,
                },
                recv(self.data_rx) -> env => match env {
                    Ok(env) => self.handle_data(env),
                    Err(_) => break,
                },
                default(timeout) => {}
            }
            self.service();
        }
        self.dispose();
    }

    // ---- scheduling -----------------------------------------------------

    fn has_work(&self) -> bool {
        !self.playing.is_empty()
            || self
                .streams
                .iter()
                .any(|s| !s.paused && (!s.pool.is_empty() || s.draining))
    }

    fn wait_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut deadline = now + IDLE_WAIT;
        if self.has_work() {
            deadline = deadline.min(self.next_tick.max(now));
        }
        if let Some(retry) = self.retry_at {
            deadline = deadline.min(retry.max(now));
        }
        for stream in &self.streams {
            if let Some(drain_deadline) = stream.drain_deadline {
                deadline = deadline.min(drain_deadline.max(now));
            }
        }
        deadline.saturating_duration_since(now)
    }

    /// Work that runs every loop iteration regardless of how it woke up.
    fn service(&mut self) {
        let now = Instant::now();
        if self.state == EngineState::Error {
            if let Some(retry) = self.retry_at {
                if now >= retry {
                    debug!("retrying sink configuration after error");
                    let _ = self.configure(None);
                }
            }
        }
        if now >= self.next_tick && self.has_work() {
            self.tick();
        }
        self.finish_drains();
        self.update_stats();
        if !self.discarded_pools.is_empty() {
            self.discarded_pools.clear();
        }
        self.check_idle(now);
    }

    // ---- pipeline -------------------------------------------------------

    fn tick(&mut self) {
        self.next_tick = Instant::now() + TICK;
        match self.state {
            EngineState::Running | EngineState::Draining => {
                // Top the sink cache up to its target, bounded per wake.
                for _ in 0..8 {
                    if self.sink.delay().current() >= TARGET_SINK_CACHE_SECS {
                        break;
                    }
                    match self.run_stages() {
                        Ok(true) => {}
                        // Nothing contributed; leave the sink queue to decay
                        // so drains can complete.
                        Ok(false) => break,
                        Err(e) => {
                            warn!("pipeline tick failed: {e}");
                            self.enter_error();
                            break;
                        }
                    }
                }
            }
            EngineState::Error => self.advance_silently(),
            _ => {}
        }
    }

    /// One pass of the buffer-pool/resample/mix pipeline. Returns whether any
    /// output reached the sink; an all-idle pass writes nothing, so a draining
    /// sink queue keeps shrinking.
    fn run_stages(&mut self) -> Result<bool> {
        let internal = match self.internal_format {
            Some(internal) => internal,
            None => return Ok(false),
        };
        let mix_pool = match self.mix_pool.as_mut() {
            Some(pool) => pool,
            None => return Ok(false),
        };
        let frames = mix_pool.buffer_frames();
        let channels = internal.channels.count() as usize;
        let mut mix = mix_pool.acquire();

        let mut sources = 0usize;
        let sink_delay = self.sink.delay().current();

        if self.mode == SinkMode::Raw {
            // Bitstream words must reach the sink untouched: no gain, no
            // summing. Only one raw stream can exist per epoch.
            let mut wrote = 0;
            if let Some(stream) = self.streams.iter_mut().find(|s| !s.paused) {
                wrote = stream.pool.read_frames(&mut mix.data);
                stream.frames_mixed += wrote as u64;
            }
            if wrote > 0 {
                self.sink.write(&mix.data[..wrote * channels])?;
                self.stats.update_sink_delay(self.sink.delay());
            }
            if let Some(pool) = self.mix_pool.as_mut() {
                pool.release(mix);
            }
            return Ok(wrote > 0);
        }

        self.scratch.resize(frames * channels, 0.0);
        let scratch = &mut self.scratch;
        for stream in &mut self.streams {
            if stream.paused {
                continue;
            }
            sync_stream(stream, internal, sink_delay);
            let got = stream.pool.read_frames(&mut scratch[..frames * channels]);
            if got == 0 {
                continue;
            }
            let (gain_start, gain_end) = stream.gain_ramp(internal.frames_to_secs(got));
            mixer::mix_into(
                &mut mix.data,
                &scratch[..got * channels],
                channels,
                gain_start,
                gain_end,
            );
            stream.frames_mixed += got as u64;
            sources += 1;
        }

        if self.sounds_allowed() {
            sources += mix_sounds(
                &mut mix.data,
                internal,
                &mut self.playing,
                &mut self.sounds,
                &self.settings,
            );
        }

        if sources == 0 {
            // No stream or sound had samples; writing a silence buffer here
            // would hold the sink queue at its target and stall drains.
            if let Some(pool) = self.mix_pool.as_mut() {
                pool.release(mix);
            }
            return Ok(false);
        }

        mixer::deamplify(&mut mix.data, sources);
        let gain = if self.muted { 0.0 } else { self.volume };
        mixer::apply_gain(&mut mix.data, gain);

        self.notify_viz(&mix, internal);

        self.sink.write(&mix.data)?;
        self.stats.update_sink_delay(self.sink.delay());
        if let Some(pool) = self.mix_pool.as_mut() {
            pool.release(mix);
        }
        Ok(true)
    }

    /// With no usable sink, keep sound cursors moving so effect sounds still
    /// complete logically.
    fn advance_silently(&mut self) {
        let internal = match self.internal_format {
            Some(internal) => internal,
            None => return,
        };
        let tick_frames = (internal.sample_rate as f64 * TICK.as_secs_f64()) as usize;
        let sounds = &self.sounds;
        self.playing.retain_mut(|entry| {
            entry.cursor_frames += tick_frames;
            match sounds.iter().find(|s| s.id == entry.id) {
                Some(sound) => {
                    let total = sound.samples.len() / sound.format.channels.count() as usize;
                    entry.cursor_frames < total
                }
                None => false,
            }
        });
        // Streams cannot reach hardware; drop their buffered output so drain
        // and free still converge.
        for stream in &mut self.streams {
            if stream.draining {
                stream.pool.clear();
            }
        }
    }

    fn sounds_allowed(&self) -> bool {
        match self.settings.gui_sound_mode {
            SoundMode::Off => false,
            SoundMode::Always => true,
            SoundMode::IdleOnly => self.streams.is_empty(),
        }
    }

    fn notify_viz(&self, mix: &SampleBuffer, format: AudioFormat) {
        if self.mode == SinkMode::Raw {
            return;
        }
        let callbacks: Vec<Arc<dyn AudioCallback>> = match self.viz.lock() {
            Ok(list) if list.is_empty() => return,
            Ok(list) => list.clone(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback.on_audio(&mix.data, format);
        }
    }

    fn finish_drains(&mut self) {
        let now = Instant::now();
        let sink_flushed = !self.sink.is_open() || self.sink.delay().current() < 0.01;
        let mut remove = Vec::new();
        for stream in &mut self.streams {
            if !stream.draining {
                continue;
            }
            if stream.pool.is_empty() && sink_flushed {
                debug!("{} drained", stream.id);
                post_reply(&mut stream.drain_reply, Reply::StreamDrained);
            } else if stream.drain_deadline.map(|d| now >= d).unwrap_or(false) {
                warn!("{} drain timed out", stream.id);
                post_reply(
                    &mut stream.drain_reply,
                    Reply::Rejected("drain timed out".into()),
                );
                stream.pool.clear();
            } else {
                continue;
            }
            stream.draining = false;
            stream.drain_deadline = None;
            if stream.free_after_drain {
                remove.push(stream.id);
            }
        }
        for id in remove {
            self.discard_stream(id);
        }
        let any_draining = self.streams.iter().any(|s| s.draining);
        match (self.state, any_draining) {
            (EngineState::Running, true) => self.state = EngineState::Draining,
            (EngineState::Draining, false) => self.state = EngineState::Running,
            _ => {}
        }
    }

    fn update_stats(&self) {
        let internal = match self.internal_format {
            Some(internal) => internal,
            None => return,
        };
        let mut total_frames = 0u64;
        let records: Vec<StreamStats> = self
            .streams
            .iter()
            .map(|stream| {
                let frames = stream.pool.ready_frames() as u64;
                total_frames += frames;
                StreamStats {
                    id: stream.id,
                    buffered_secs: internal.frames_to_secs(frames as usize),
                    resample_ratio: stream.resample_ratio,
                    sync_error_secs: stream.sync.error_secs,
                    sync_error_ms: stream.sync.error_ms(),
                    sync_state: stream.sync.state,
                }
            })
            .collect();
        self.stats.add_samples(total_frames, records);
        self.stats.set_sink_cache_total(TARGET_SINK_CACHE_SECS);
    }

    fn check_idle(&mut self, now: Instant) {
        if !self.streams.is_empty() || !self.playing.is_empty() {
            self.idle_since = None;
            return;
        }
        if let Some(until) = self.keep_config_until {
            if now < until {
                return;
            }
            self.keep_config_until = None;
        }
        if self.settings.silence_timeout_secs == 0 || !self.sink.is_open() {
            return;
        }
        let since = *self.idle_since.get_or_insert(now);
        if now.duration_since(since).as_secs() >= self.settings.silence_timeout_secs as u64 {
            info!("silence timeout reached, releasing sink");
            self.sink.unconfigure();
            self.stats.set_current_sink_format(None);
            self.internal_format = None;
            self.mix_pool = None;
            self.state = EngineState::Uninitialized;
            self.idle_since = None;
        }
    }

    // ---- configuration --------------------------------------------------

    fn configure(&mut self, desired: Option<AudioFormat>) -> Result<()> {
        self.state = EngineState::Configuring;
        let desired = desired
            .or_else(|| self.streams.first().map(|s| s.input_format))
            .unwrap_or_else(AudioFormat::default_pcm);

        match self.sink.configure(&desired, &self.settings) {
            Ok((negotiated, mode)) => {
                let internal = match mode {
                    SinkMode::Raw => negotiated,
                    _ => AudioFormat::new(
                        negotiated.sample_rate,
                        negotiated.channels,
                        SampleEncoding::F32,
                    ),
                };
                if self.internal_format != Some(internal) {
                    info!(?negotiated, ?mode, "sink configured, new epoch");
                    self.internal_format = Some(internal);
                    self.mode = mode;
                    self.mix_pool = Some(BufferPool::new(internal, tick_frames(&internal)));
                    self.change_resamplers(internal);
                    for sound in &mut self.sounds {
                        sound.resampled = None;
                    }
                    self.stats.reset(internal.sample_rate);
                } else {
                    self.mode = mode;
                    if self.pool_quality != self.settings.resample_quality {
                        // Pipeline drift (quality change) without a sink reopen.
                        self.change_resamplers(internal);
                    }
                }
                self.pool_quality = self.settings.resample_quality;
                self.stats.set_current_sink_format(Some(negotiated));
                self.stats.set_sink_latency(self.sink.latency_secs());
                self.retry_at = None;
                self.state = EngineState::Running;
                Ok(())
            }
            Err(e) => {
                warn!("sink configuration failed: {e}");
                self.enter_error();
                Err(e)
            }
        }
    }

    /// Fall back to a silence-only epoch and schedule a configuration retry.
    fn enter_error(&mut self) {
        self.sink.unconfigure();
        let internal = self.internal_format.unwrap_or_else(AudioFormat::default_pcm);
        self.internal_format = Some(internal);
        if self.mix_pool.is_none() {
            self.mix_pool = Some(BufferPool::new(internal, tick_frames(&internal)));
        }
        self.stats.set_current_sink_format(None);
        self.state = EngineState::Error;
        self.retry_at = Some(Instant::now() + ERROR_RETRY);
    }

    /// Replace every stream's pool for a new internal format. Old pools move
    /// to the discard list so nothing is freed mid-flight.
    fn change_resamplers(&mut self, internal: AudioFormat) {
        let frames = tick_frames(&internal);
        for stream in &mut self.streams {
            let fresh = ResamplePool::new(
                stream.input_format,
                internal,
                frames,
                self.settings.resample_quality,
            );
            let old = std::mem::replace(&mut stream.pool, fresh);
            self.discarded_pools.push(old);
            if (stream.resample_ratio - 1.0).abs() > f64::EPSILON {
                let ratio = stream.resample_ratio;
                if let Err(e) = stream.pool.set_ratio_adjust(ratio) {
                    warn!("{}: could not reapply ratio: {e}", stream.id);
                }
            }
        }
    }

    // ---- control handlers -----------------------------------------------

    fn handle_control(&mut self, mut env: Envelope<ControlMsg>) {
        match env.msg {
            ControlMsg::Init(settings) => {
                self.settings = *settings;
                if let Err(e) = self.configure(None) {
                    warn!("init configuration failed, engine in error state: {e}");
                }
                // Engine stays alive (silence fallback) even without a sink.
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::Reconfigure(settings) => {
                if let Some(settings) = settings {
                    self.settings = *settings;
                }
                match self.configure(None) {
                    Ok(()) => post_reply(&mut env.reply, Reply::Accepted),
                    Err(e) => post_reply(&mut env.reply, Reply::Rejected(e.to_string())),
                }
            }
            ControlMsg::Suspend | ControlMsg::DisplayLost => {
                self.do_suspend();
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::Resume | ControlMsg::DisplayReset => {
                self.do_resume();
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::AppFocus(focused) => {
                if focused {
                    self.do_resume();
                } else {
                    self.do_suspend();
                }
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::DeviceChange => {
                if self.state == EngineState::Suspended {
                    // The sink is already closed; resume renegotiates against
                    // whatever devices exist then.
                    debug!("device change while suspended, deferred to resume");
                } else if self.sink.note_device_change() {
                    info!("device change, reconfiguring");
                    // Close first so negotiation runs against the new device
                    // set instead of short-circuiting on the old handle.
                    self.sink.unconfigure();
                    let _ = self.configure(None);
                }
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::Mute(muted) => {
                self.muted = muted;
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::Volume(volume) => {
                if !(0.0..=1.0).contains(&volume) || !volume.is_finite() {
                    post_reply(
                        &mut env.reply,
                        Reply::Rejected(format!("volume {volume} out of range")),
                    );
                } else {
                    self.volume = volume;
                    post_reply(&mut env.reply, Reply::Accepted);
                }
            }
            ControlMsg::SoundMode(mode) => {
                self.settings.gui_sound_mode = mode;
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::PauseStream(id) => self.with_stream(id, env.reply, |stream| {
                stream.paused = true;
                Ok(())
            }),
            ControlMsg::ResumeStream(id) => self.with_stream(id, env.reply, |stream| {
                stream.paused = false;
                Ok(())
            }),
            ControlMsg::FlushStream(id) => self.with_stream(id, env.reply, |stream| {
                stream.pool.clear();
                Ok(())
            }),
            ControlMsg::StreamVolume(id, volume) => self.with_stream(id, env.reply, move |stream| {
                if !(0.0..=1.0).contains(&volume) || !volume.is_finite() {
                    return Err(format!("stream volume {volume} out of range"));
                }
                stream.volume = volume;
                Ok(())
            }),
            ControlMsg::StreamReplaygain(id, gain) => {
                self.with_stream(id, env.reply, move |stream| {
                    if !gain.is_finite() || gain < 0.0 {
                        return Err(format!("replaygain {gain} out of range"));
                    }
                    stream.replaygain = gain;
                    Ok(())
                })
            }
            ControlMsg::StreamAmplify(id, amplify) => {
                self.with_stream(id, env.reply, move |stream| {
                    if !amplify.is_finite() || !(1.0..=1000.0).contains(&amplify) {
                        return Err(format!("amplification {amplify} out of range"));
                    }
                    stream.amplify = amplify;
                    Ok(())
                })
            }
            ControlMsg::StreamResampleRatio(id, ratio) => {
                self.with_stream(id, env.reply, move |stream| {
                    if !ratio.is_finite() || !(0.5..=2.0).contains(&ratio) {
                        return Err(format!("resample ratio {ratio} out of range"));
                    }
                    stream.resample_ratio = ratio;
                    stream
                        .pool
                        .set_ratio_adjust(ratio)
                        .map_err(|e| e.to_string())
                })
            }
            ControlMsg::StreamResampleMode(id, mode) => {
                self.with_stream(id, env.reply, move |stream| {
                    if !(0..=1).contains(&mode) {
                        return Err(format!("resample mode {mode} unknown"));
                    }
                    stream.resample_mode = mode;
                    if mode == 0 {
                        stream.sync = SyncTracker::new();
                    }
                    Ok(())
                })
            }
            ControlMsg::StreamFade {
                id,
                from,
                target,
                millis,
            } => self.with_stream(id, env.reply, move |stream| {
                if !from.is_finite() || !target.is_finite() || from < 0.0 || target < 0.0 {
                    return Err("fade endpoints out of range".into());
                }
                stream.fade = Some(Fade::new(from, target, millis));
                Ok(())
            }),
            ControlMsg::StreamCodecInfo(id, info) => self.with_stream(id, env.reply, move |stream| {
                stream.codec_info = Some(info);
                Ok(())
            }),
            ControlMsg::StopSound(id) => {
                self.playing.retain(|p| p.id != id);
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::GetState => {
                post_reply(&mut env.reply, Reply::Stats(Box::new(self.stats.snapshot())));
            }
            ControlMsg::KeepConfig(millis) => {
                self.keep_config_until =
                    Some(Instant::now() + Duration::from_millis(millis as u64));
                post_reply(&mut env.reply, Reply::Accepted);
            }
            ControlMsg::Shutdown => {
                self.state = EngineState::ShuttingDown;
                post_reply(&mut env.reply, Reply::Accepted);
            }
        }
    }

    fn with_stream<F>(&mut self, id: StreamId, mut reply: Option<crate::msg::ReplySender>, f: F)
    where
        F: FnOnce(&mut Stream) -> std::result::Result<(), String>,
    {
        match self.streams.iter_mut().find(|s| s.id == id) {
            Some(stream) => match f(stream) {
                Ok(()) => post_reply(&mut reply, Reply::Accepted),
                Err(reason) => post_reply(&mut reply, Reply::Rejected(reason)),
            },
            None => post_reply(&mut reply, Reply::Rejected(format!("unknown {id}"))),
        }
    }

    fn do_suspend(&mut self) {
        if self.state == EngineState::Suspended {
            return;
        }
        info!("suspending, releasing sink");
        self.sink.unconfigure();
        self.stats.set_suspended(true);
        self.state = EngineState::Suspended;
    }

    fn do_resume(&mut self) {
        if self.state != EngineState::Suspended {
            return;
        }
        info!("resuming");
        self.stats.set_suspended(false);
        if !self.streams.is_empty() || !self.playing.is_empty() {
            // A device change while suspended is absorbed here: the sink is
            // closed, so configuration always reopens against current devices.
            let _ = self.configure(None);
        } else {
            self.internal_format = None;
            self.mix_pool = None;
            self.state = EngineState::Uninitialized;
        }
    }

    // ---- data handlers --------------------------------------------------

    fn handle_data(&mut self, mut env: Envelope<DataMsg>) {
        match env.msg {
            DataMsg::NewSound { format, samples } => {
                if format.is_raw() || format.sample_rate == 0 {
                    post_reply(
                        &mut env.reply,
                        Reply::Rejected(format!("unsupported sound format {format:?}")),
                    );
                    return;
                }
                if samples.len() % format.channels.count() as usize != 0 {
                    post_reply(
                        &mut env.reply,
                        Reply::Rejected("sample count not frame aligned".into()),
                    );
                    return;
                }
                self.sound_id_gen += 1;
                let id = SoundId(self.sound_id_gen);
                self.sounds.push(Sound {
                    id,
                    format,
                    samples,
                    resampled: None,
                });
                debug!("{id} registered");
                post_reply(&mut env.reply, Reply::SoundCreated { id });
            }
            DataMsg::PlaySound(id) => {
                if !self.sounds.iter().any(|s| s.id == id) {
                    post_reply(&mut env.reply, Reply::Rejected(format!("unknown {id}")));
                    return;
                }
                if self.settings.gui_sound_mode == SoundMode::Off
                    || self.state == EngineState::Suspended
                {
                    debug!("{id} gated off, not playing");
                    post_reply(&mut env.reply, Reply::Accepted);
                    return;
                }
                if self.state == EngineState::Uninitialized {
                    // Sounds alone are enough to bring the sink up.
                    let _ = self.configure(None);
                }
                self.playing.push(PlayingSound {
                    id,
                    cursor_frames: 0,
                });
                post_reply(&mut env.reply, Reply::Accepted);
            }
            DataMsg::FreeSound(id) => {
                self.playing.retain(|p| p.id != id);
                self.sounds.retain(|s| s.id != id);
                post_reply(&mut env.reply, Reply::Accepted);
            }
            DataMsg::NewStream {
                format,
                options,
                clock,
            } => {
                if self.state == EngineState::Suspended {
                    post_reply(&mut env.reply, Reply::Rejected("engine suspended".into()));
                    return;
                }
                if format.sample_rate == 0 {
                    post_reply(&mut env.reply, Reply::Rejected("zero sample rate".into()));
                    return;
                }
                // First stream decides the sink configuration; later streams
                // are resampled onto the running epoch.
                if self.streams.is_empty() {
                    if let Err(e) = self.configure(Some(format)) {
                        if matches!(e, Error::InvalidFormat(_)) {
                            post_reply(&mut env.reply, Reply::Rejected(e.to_string()));
                            return;
                        }
                        // Other failures leave a silence epoch; the stream is
                        // still created and configuration retries.
                    }
                }
                let internal = match self.internal_format {
                    Some(internal) => internal,
                    None => {
                        post_reply(&mut env.reply, Reply::Rejected("no sink epoch".into()));
                        return;
                    }
                };
                if format.is_raw() && self.mode != SinkMode::Raw {
                    post_reply(
                        &mut env.reply,
                        Reply::Rejected("raw stream without passthrough sink".into()),
                    );
                    return;
                }
                self.stream_id_gen += 1;
                let id = StreamId(self.stream_id_gen);
                let pool = ResamplePool::new(
                    format,
                    internal,
                    tick_frames(&internal),
                    self.settings.resample_quality,
                );
                self.streams.push(Stream::new(id, format, pool, options, clock));
                self.stats.add_stream(id);
                info!("{id} created for {format:?}");
                post_reply(&mut env.reply, Reply::StreamCreated { id, format });
            }
            DataMsg::FreeStream { id, finish } => {
                let has_buffered = match self.streams.iter().find(|s| s.id == id) {
                    Some(stream) => !stream.pool.is_empty(),
                    None => {
                        post_reply(&mut env.reply, Reply::Rejected(format!("unknown {id}")));
                        return;
                    }
                };
                if finish && has_buffered && self.sink.is_open() {
                    if let Some(stream) = self.streams.iter_mut().find(|s| s.id == id) {
                        if let Err(e) = stream.pool.drain_stage() {
                            warn!("{id}: drain flush failed: {e}");
                        }
                        stream.draining = true;
                        stream.free_after_drain = true;
                        stream.drain_deadline = Some(Instant::now() + FREE_DRAIN_TIMEOUT);
                        stream.drain_reply = env.reply.take();
                    }
                    self.state = EngineState::Draining;
                } else {
                    self.discard_stream(id);
                    post_reply(&mut env.reply, Reply::Accepted);
                }
            }
            DataMsg::StreamSamples { id, samples } => {
                let max_secs = MAX_CACHE_SECS;
                match self.streams.iter_mut().find(|s| s.id == id) {
                    None => post_reply(&mut env.reply, Reply::Rejected(format!("unknown {id}"))),
                    Some(stream) => {
                        if stream.draining {
                            post_reply(&mut env.reply, Reply::Rejected("stream draining".into()));
                        } else if samples.len()
                            % stream.input_format.channels.count() as usize
                            != 0
                        {
                            post_reply(
                                &mut env.reply,
                                Reply::Rejected("sample count not frame aligned".into()),
                            );
                        } else if stream.pool.buffered_secs() > max_secs {
                            // Water level full: push back instead of growing.
                            post_reply(&mut env.reply, Reply::Rejected("buffer full".into()));
                        } else {
                            match stream.pool.push_samples(&samples) {
                                Ok(()) => {
                                    post_reply(&mut env.reply, Reply::StreamBufferConsumed)
                                }
                                Err(e) => post_reply(
                                    &mut env.reply,
                                    Reply::Rejected(e.to_string()),
                                ),
                            }
                        }
                    }
                }
            }
            DataMsg::DrainStream { id, timeout } => {
                match self.streams.iter_mut().find(|s| s.id == id) {
                    None => post_reply(&mut env.reply, Reply::Rejected(format!("unknown {id}"))),
                    Some(stream) => {
                        if let Err(e) = stream.pool.drain_stage() {
                            warn!("{id}: drain flush failed: {e}");
                        }
                        stream.draining = true;
                        stream.drain_deadline = Some(Instant::now() + timeout);
                        stream.drain_reply = env.reply.take();
                        if self.state == EngineState::Running {
                            self.state = EngineState::Draining;
                        }
                    }
                }
            }
        }
    }

    fn discard_stream(&mut self, id: StreamId) {
        if let Some(index) = self.streams.iter().position(|s| s.id == id) {
            let mut stream = self.streams.remove(index);
            post_reply(
                &mut stream.drain_reply,
                Reply::Rejected("stream freed".into()),
            );
            self.discarded_pools.push(stream.pool);
            self.stats.remove_stream(id);
            info!("{id} discarded");
        }
    }

    // ---- shutdown -------------------------------------------------------

    fn dispose(&mut self) {
        info!("engine shutting down");
        let ids: Vec<StreamId> = self.streams.iter().map(|s| s.id).collect();
        for id in ids {
            self.discard_stream(id);
        }
        self.playing.clear();
        self.sounds.clear();
        let _ = self.sink.drain(Duration::from_millis(200));
        self.sink.unconfigure();
        self.stats.set_current_sink_format(None);

        // Remaining queued messages get an error reply instead of silence.
        while let Ok(mut env) = self.ctrl_rx.try_recv() {
            post_reply(&mut env.reply, Reply::Rejected("engine shut down".into()));
        }
        while let Ok(mut env) = self.data_rx.try_recv() {
            post_reply(&mut env.reply, Reply::Rejected("engine shut down".into()));
        }
    }
}

/// Frames per mix buffer for a format (one tick of output).
fn tick_frames(format: &AudioFormat) -> usize {
    ((format.sample_rate as f64 * TICK.as_secs_f64()) as usize).max(64)
}

/// Update one stream's sync tracking and push the resulting ratio nudge into
/// its pool.
fn sync_stream(stream: &mut Stream, internal: AudioFormat, sink_delay: f64) {
    let clock = match stream.clock.as_ref() {
        Some(clock) => clock,
        None => return,
    };
    let played = internal.frames_to_secs(stream.frames_mixed as usize) - sink_delay;
    let error = played - clock.current_pts();
    let adjust = stream.sync.update(error);
    if stream.resample_mode == 1 {
        let effective = stream.resample_ratio * adjust;
        if let Err(e) = stream.pool.set_ratio_adjust(effective) {
            warn!("{}: sync adjust failed: {e}", stream.id);
        }
    }
}

/// Mix every currently playing sound into `dst`. Returns how many contributed.
fn mix_sounds(
    dst: &mut [f32],
    internal: AudioFormat,
    playing: &mut Vec<PlayingSound>,
    sounds: &mut [Sound],
    settings: &AudioSettings,
) -> usize {
    let channels = internal.channels.count() as usize;
    let mut contributed = 0;
    playing.retain_mut(|entry| {
        let sound = match sounds.iter_mut().find(|s| s.id == entry.id) {
            Some(sound) => sound,
            None => return false,
        };
        if let Err(e) = ensure_resampled(sound, internal, settings) {
            warn!("{}: resample failed, dropping: {e}", sound.id);
            return false;
        }
        let samples: &[f32] = match &sound.resampled {
            Some((format, samples)) if *format == internal => samples,
            _ => &sound.samples,
        };
        let total_frames = samples.len() / channels;
        let consumed = mixer::mix_sound(dst, samples, entry.cursor_frames, channels, 1.0);
        if consumed > 0 {
            contributed += 1;
        }
        entry.cursor_frames += consumed;
        entry.cursor_frames < total_frames
    });
    contributed
}

/// Resample a sound's PCM to the current epoch format, caching the result.
fn ensure_resampled(
    sound: &mut Sound,
    internal: AudioFormat,
    settings: &AudioSettings,
) -> Result<()> {
    if let Some((format, _)) = &sound.resampled {
        if *format == internal {
            return Ok(());
        }
    }
    if sound.format.sample_rate == internal.sample_rate
        && sound.format.channels == internal.channels
    {
        sound.resampled = Some((internal, sound.samples.clone()));
        return Ok(());
    }
    let mut stage = StageResampler::new(sound.format, internal, settings.resample_quality);
    let mut out = stage.process(&sound.samples)?;
    out.extend(stage.flush()?);
    sound.resampled = Some((internal, out));
    Ok(())
}
