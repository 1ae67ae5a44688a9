//! Null sink backend: silence output with optional capture
//!
//! Stands in for hardware in tests and headless runs. The sink models device
//! timing with wall-clock decay so delay/drain behave like a real endpoint,
//! and can copy every written sample into a shared capture buffer for
//! assertions.

use crate::error::{Error, Result};
use crate::sink::{AudioSink, SinkBackend};
use crate::types::{AudioFormat, DeviceInfo, RawCodec, SinkCapabilities, SinkDelay};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Backend producing `NullSink`s.
pub struct NullBackend {
    capabilities: SinkCapabilities,
    devices: Vec<DeviceInfo>,
    opens: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    capture: Option<Arc<Mutex<Vec<f32>>>>,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            capabilities: SinkCapabilities {
                max_channels: 8,
                raw_codecs: Vec::new(),
                sample_rates: vec![44100, 48000, 96000],
                supports_silence_timeout: true,
            },
            devices: vec![DeviceInfo {
                name: "null".into(),
                supports_passthrough: false,
            }],
            opens: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
            capture: None,
        }
    }

    /// Copy every written sample into `buffer`.
    pub fn with_capture(mut self, buffer: Arc<Mutex<Vec<f32>>>) -> Self {
        self.capture = Some(buffer);
        self
    }

    pub fn with_capabilities(mut self, capabilities: SinkCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Handle counting successful opens (reconfiguration assertions).
    pub fn open_count_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }

    /// Handle that makes every subsequent open fail while set (device-loss
    /// and error-state tests).
    pub fn failing_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failing)
    }
}

impl SinkBackend for NullBackend {
    fn open(&self, _device: Option<&str>, format: AudioFormat) -> Result<Box<dyn AudioSink>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Sink("null device unavailable".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NullSink {
            format,
            delay: SinkDelay::zero(),
            capture: self.capture.clone(),
        }))
    }

    fn enumerate_devices(&self, passthrough: bool) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .filter(|d| !passthrough || d.supports_passthrough)
            .cloned()
            .collect()
    }

    fn default_device(&self, passthrough: bool) -> Option<String> {
        self.enumerate_devices(passthrough)
            .first()
            .map(|d| d.name.clone())
    }

    fn capabilities(&self, _device: Option<&str>) -> SinkCapabilities {
        self.capabilities.clone()
    }
}

/// Discards samples while modelling queue decay in wall-clock time.
struct NullSink {
    format: AudioFormat,
    delay: SinkDelay,
    capture: Option<Arc<Mutex<Vec<f32>>>>,
}

impl AudioSink for NullSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        if let Some(capture) = &self.capture {
            if let Ok(mut buf) = capture.lock() {
                buf.extend_from_slice(samples);
            }
        }
        let frames = samples.len() / self.format.channels.count() as usize;
        self.delay = SinkDelay {
            delay_secs: self.delay.current() + self.format.frames_to_secs(frames),
            measured_at: Instant::now(),
        };
        Ok(())
    }

    fn delay(&self) -> SinkDelay {
        self.delay
    }

    fn drain(&mut self, timeout: Duration) -> Result<()> {
        let remaining = Duration::from_secs_f64(self.delay.current());
        std::thread::sleep(remaining.min(timeout));
        self.delay = SinkDelay::zero();
        Ok(())
    }
}

/// Capabilities advertising raw passthrough, for passthrough-path tests.
pub fn passthrough_capabilities() -> SinkCapabilities {
    SinkCapabilities {
        max_channels: 8,
        raw_codecs: vec![RawCodec::Ac3, RawCodec::Eac3, RawCodec::Dts],
        sample_rates: vec![44100, 48000, 96000, 192000],
        supports_silence_timeout: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelLayout, SampleEncoding};

    #[test]
    fn capture_records_written_samples() {
        let capture = Arc::new(Mutex::new(Vec::new()));
        let backend = NullBackend::new().with_capture(Arc::clone(&capture));
        let format = AudioFormat::new(48000, ChannelLayout::Stereo, SampleEncoding::F32);
        let mut sink = backend.open(None, format).unwrap();

        sink.write(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(*capture.lock().unwrap(), vec![0.1, 0.2, 0.3, 0.4]);
        assert!(sink.delay().current() > 0.0);
    }

    #[test]
    fn failing_backend_rejects_open() {
        let backend = NullBackend::new();
        backend.failing_handle().store(true, Ordering::SeqCst);
        let format = AudioFormat::default_pcm();
        assert!(backend.open(None, format).is_err());
    }
}
