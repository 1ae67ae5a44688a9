//! Sink lifecycle: negotiation, reconfiguration, drain, device debounce
//!
//! The concrete output driver and the device-enumeration backend live behind
//! `AudioSink`/`SinkBackend`; the engine consumes those contracts and never
//! touches a hardware API directly. `SinkManager` owns the open sink and all
//! of the reconfiguration-need logic around it.

pub mod null;
pub mod output;

use crate::error::{Error, Result};
use crate::settings::AudioSettings;
use crate::types::{
    AudioFormat, DeviceInfo, RawCodec, SampleEncoding, SinkCapabilities, SinkDelay, SinkMode,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Device-change events inside this window coalesce into one reconfiguration.
const DEVICE_DEBOUNCE: Duration = Duration::from_millis(500);

/// An open hardware output endpoint.
pub trait AudioSink: Send {
    /// Negotiated format; may differ from the requested one.
    fn format(&self) -> AudioFormat;

    /// Queue interleaved samples, blocking until the device accepted them.
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Audio currently queued in the device.
    fn delay(&self) -> SinkDelay;

    /// Fixed output latency beyond the queue, in seconds.
    fn latency_secs(&self) -> f64 {
        0.0
    }

    /// Let queued samples play out, bounded by `timeout`.
    fn drain(&mut self, timeout: Duration) -> Result<()>;
}

/// Factory and enumeration surface for one driver family.
pub trait SinkBackend: Send + Sync {
    /// Open `device` (None = default) with the requested format. The returned
    /// sink reports the actually negotiated format.
    fn open(&self, device: Option<&str>, format: AudioFormat) -> Result<Box<dyn AudioSink>>;

    fn enumerate_devices(&self, passthrough: bool) -> Vec<DeviceInfo>;

    fn default_device(&self, passthrough: bool) -> Option<String>;

    fn capabilities(&self, device: Option<&str>) -> SinkCapabilities;
}

/// Owns the sink handle and drives configuration and reconfiguration.
pub struct SinkManager {
    backend: Arc<dyn SinkBackend>,
    sink: Option<Box<dyn AudioSink>>,
    requested_format: Option<AudioFormat>,
    negotiated_format: Option<AudioFormat>,
    current_device: Option<String>,
    mode: SinkMode,
    /// When the last debounce-accepted device event triggered a reconfigure
    last_reconfigure_event: Option<Instant>,
}

impl SinkManager {
    pub fn new(backend: Arc<dyn SinkBackend>) -> Self {
        Self {
            backend,
            sink: None,
            requested_format: None,
            negotiated_format: None,
            current_device: None,
            mode: SinkMode::Pcm,
            last_reconfigure_event: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Output mode for a desired format under the given settings and device
    /// capabilities.
    pub fn select_mode(
        desired: &AudioFormat,
        settings: &AudioSettings,
        caps: &SinkCapabilities,
    ) -> SinkMode {
        if let SampleEncoding::Raw(codec) = desired.encoding {
            if settings.allows_passthrough(codec) && caps.supports_raw(codec) {
                return SinkMode::Raw;
            }
        }
        if settings.transcode_to_ac3
            && desired.channels.count() > 2
            && caps.supports_raw(RawCodec::Ac3)
        {
            return SinkMode::Transcode;
        }
        SinkMode::Pcm
    }

    /// Derive the format to request from the device.
    fn build_request(
        desired: &AudioFormat,
        settings: &AudioSettings,
        caps: &SinkCapabilities,
        mode: SinkMode,
    ) -> AudioFormat {
        if mode == SinkMode::Raw {
            return *desired;
        }

        let mut rate = if settings.sample_rate > 0 {
            settings.sample_rate
        } else {
            desired.sample_rate
        };
        if !caps.sample_rates.is_empty() && !caps.sample_rates.contains(&rate) {
            // Snap to the closest rate the device can open.
            if let Some(best) = caps
                .sample_rates
                .iter()
                .min_by_key(|r| r.abs_diff(rate))
                .copied()
            {
                rate = best;
            }
        }

        let mut channels = desired.channels;
        if settings.stereo_upmix && channels.count() < caps.max_channels {
            channels = crate::types::ChannelLayout::from_count(caps.max_channels);
        }
        if settings.channels > 0 && channels.count() > settings.channels {
            channels = crate::types::ChannelLayout::from_count(settings.channels);
        }
        if channels.count() > caps.max_channels {
            channels = crate::types::ChannelLayout::from_count(caps.max_channels);
        }

        AudioFormat::new(rate, channels, SampleEncoding::F32)
    }

    /// True if accepting `candidate` would require reopening the sink.
    pub fn need_reconfigure(&self, candidate: &AudioFormat) -> bool {
        match (&self.requested_format, &self.sink) {
            (Some(current), Some(_)) => current != candidate,
            _ => true,
        }
    }

    /// Open (or keep) the sink for `desired` under `settings`.
    ///
    /// Requesting a configuration identical to the current one is a no-op:
    /// no pool churn, no device reopen.
    pub fn configure(
        &mut self,
        desired: &AudioFormat,
        settings: &AudioSettings,
    ) -> Result<(AudioFormat, SinkMode)> {
        let mode_device = match Self::pre_mode(desired, settings) {
            SinkMode::Raw => settings
                .passthrough_device
                .clone()
                .or_else(|| settings.device.clone()),
            _ => settings.device.clone(),
        };
        let caps = self.backend.capabilities(mode_device.as_deref());
        let mut mode = Self::select_mode(desired, settings, &caps);

        if desired.is_raw() && mode != SinkMode::Raw {
            return Err(Error::InvalidFormat(format!(
                "raw format {desired:?} not supported for passthrough"
            )));
        }
        if mode == SinkMode::Transcode {
            // No encoder collaborator is wired into this crate.
            warn!("transcode mode selected but no encoder available, using PCM");
            mode = SinkMode::Pcm;
        }

        let request = Self::build_request(desired, settings, &caps, mode);
        if !self.need_reconfigure(&request) && self.current_device == mode_device {
            debug!("sink already configured for {request:?}, keeping it");
            if let Some(negotiated) = self.negotiated_format {
                return Ok((negotiated, self.mode));
            }
        }

        self.unconfigure();
        info!(device = ?mode_device, ?request, ?mode, "opening sink");
        let sink = self.backend.open(mode_device.as_deref(), request)?;
        let negotiated = sink.format();
        self.sink = Some(sink);
        self.requested_format = Some(request);
        self.negotiated_format = Some(negotiated);
        self.current_device = mode_device;
        self.mode = mode;
        Ok((negotiated, mode))
    }

    fn pre_mode(desired: &AudioFormat, settings: &AudioSettings) -> SinkMode {
        match desired.encoding {
            SampleEncoding::Raw(codec) if settings.allows_passthrough(codec) => SinkMode::Raw,
            _ => SinkMode::Pcm,
        }
    }

    pub fn write(&mut self, samples: &[f32]) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.write(samples),
            None => Err(Error::InvalidState("sink not configured".into())),
        }
    }

    pub fn delay(&self) -> SinkDelay {
        self.sink
            .as_ref()
            .map(|s| s.delay())
            .unwrap_or_else(SinkDelay::zero)
    }

    pub fn latency_secs(&self) -> f64 {
        self.sink.as_ref().map(|s| s.latency_secs()).unwrap_or(0.0)
    }

    /// Let queued device samples play out before returning.
    pub fn drain(&mut self, timeout: Duration) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.drain(timeout)?;
        }
        Ok(())
    }

    /// Release the hardware handle (suspend, shutdown, reconfigure).
    pub fn unconfigure(&mut self) {
        if self.sink.take().is_some() {
            info!("sink released");
        }
        self.requested_format = None;
        self.negotiated_format = None;
    }

    /// Record a device-change event. Returns true when the engine should run
    /// a reconfiguration now; bursts inside the debounce window coalesce into
    /// the one reconfiguration triggered by the first event.
    pub fn note_device_change(&mut self) -> bool {
        let now = Instant::now();
        match self.last_reconfigure_event {
            Some(last) if now.duration_since(last) < DEVICE_DEBOUNCE => {
                debug!("device change within debounce window, coalescing");
                false
            }
            _ => {
                self.last_reconfigure_event = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::null::NullBackend;
    use crate::types::ChannelLayout;

    fn pcm(rate: u32) -> AudioFormat {
        AudioFormat::new(rate, ChannelLayout::Stereo, SampleEncoding::F32)
    }

    #[test]
    fn configure_is_idempotent() {
        let backend = NullBackend::new();
        let opens = backend.open_count_handle();
        let mut mgr = SinkManager::new(Arc::new(backend));
        let settings = AudioSettings::default();

        mgr.configure(&pcm(48000), &settings).unwrap();
        mgr.configure(&pcm(48000), &settings).unwrap();
        assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn format_change_reopens() {
        let backend = NullBackend::new();
        let opens = backend.open_count_handle();
        let mut mgr = SinkManager::new(Arc::new(backend));
        let settings = AudioSettings::default();

        mgr.configure(&pcm(44100), &settings).unwrap();
        mgr.configure(&pcm(48000), &settings).unwrap();
        assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn device_changes_debounce() {
        let mut mgr = SinkManager::new(Arc::new(NullBackend::new()));
        let mut reconfigures = 0;
        for _ in 0..5 {
            if mgr.note_device_change() {
                reconfigures += 1;
            }
        }
        assert_eq!(reconfigures, 1);
    }

    #[test]
    fn raw_without_passthrough_is_rejected() {
        let mut mgr = SinkManager::new(Arc::new(NullBackend::new()));
        let raw = AudioFormat::new(
            48000,
            ChannelLayout::Stereo,
            SampleEncoding::Raw(RawCodec::Ac3),
        );
        let err = mgr.configure(&raw, &AudioSettings::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[test]
    fn settings_rate_overrides_request() {
        let backend = NullBackend::new();
        let mut mgr = SinkManager::new(Arc::new(backend));
        let settings = AudioSettings {
            sample_rate: 48000,
            ..Default::default()
        };
        let (negotiated, mode) = mgr.configure(&pcm(44100), &settings).unwrap();
        assert_eq!(negotiated.sample_rate, 48000);
        assert_eq!(mode, SinkMode::Pcm);
    }
}
