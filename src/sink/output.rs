//! Hardware output backend using cpal
//!
//! The engine thread writes into a lock-free SPSC ring; the cpal callback
//! pops from it. cpal streams are not `Send`, so each open sink runs a small
//! dedicated thread that owns the stream for its whole life.

use crate::error::{Error, Result};
use crate::sink::{AudioSink, SinkBackend};
use crate::types::{AudioFormat, DeviceInfo, SinkCapabilities, SinkDelay};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use ringbuf::{traits::*, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Ring capacity in seconds of audio.
const RING_SECS: f64 = 0.25;

/// Estimated device-side latency beyond the ring.
const DEVICE_LATENCY_SECS: f64 = 0.05;

/// Rates probed when building device capabilities.
const PROBE_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// cpal-based sink backend. PCM only; raw passthrough is not available
/// through cpal and is reported as unsupported.
pub struct CpalBackend;

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn find_device(name: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(name) = name {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::Sink(format!("failed to enumerate devices: {e}")))?;
            if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                info!("found requested audio device: {name}");
                return Ok(device);
            }
            warn!("requested device '{name}' not found, falling back to default");
        }
        host.default_output_device()
            .ok_or_else(|| Error::Sink("no default output device available".into()))
    }
}

impl SinkBackend for CpalBackend {
    fn open(&self, device: Option<&str>, format: AudioFormat) -> Result<Box<dyn AudioSink>> {
        if format.is_raw() {
            return Err(Error::Sink("cpal backend cannot open raw streams".into()));
        }
        let device = Self::find_device(device)?;
        let default_config = device
            .default_output_config()
            .map_err(|e| Error::Sink(format!("no output config: {e}")))?;
        let sample_format = default_config.sample_format();

        let channels = format.channels.count();
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring_capacity =
            ((format.sample_rate as f64 * RING_SECS) as usize).max(1024) * channels as usize;
        let ring = HeapRb::<f32>::new(ring_capacity);
        let (producer, mut consumer) = ring.split();

        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicU64::new(0));

        let cb_underruns = Arc::clone(&underruns);
        let cb_failed = Arc::clone(&failed);
        let thread_stop = Arc::clone(&stop);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        // The cpal stream lives on this thread; it is parked until shutdown.
        let thread = std::thread::Builder::new()
            .name("soundstage-sink".into())
            .spawn(move || {
                let err_failed = Arc::clone(&cb_failed);
                let build = match sample_format {
                    SampleFormat::F32 => device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _| {
                            let popped = consumer.pop_slice(data);
                            if popped < data.len() {
                                data[popped..].fill(0.0);
                                cb_underruns.fetch_add(1, Ordering::Relaxed);
                            }
                        },
                        move |e| {
                            error!("audio stream error: {e}");
                            err_failed.store(true, Ordering::SeqCst);
                        },
                        None,
                    ),
                    SampleFormat::I16 => device.build_output_stream(
                        &config,
                        move |data: &mut [i16], _| {
                            for slot in data.iter_mut() {
                                let sample = match consumer.try_pop() {
                                    Some(s) => s,
                                    None => {
                                        cb_underruns.fetch_add(1, Ordering::Relaxed);
                                        0.0
                                    }
                                };
                                *slot = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            }
                        },
                        move |e| {
                            error!("audio stream error: {e}");
                            err_failed.store(true, Ordering::SeqCst);
                        },
                        None,
                    ),
                    other => {
                        let _ = ready_tx
                            .send(Err(Error::Sink(format!("unsupported sample format {other:?}"))));
                        return;
                    }
                };

                let stream = match build {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Sink(format!("stream build failed: {e}"))));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::Sink(format!("stream start failed: {e}"))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while !thread_stop.load(Ordering::SeqCst) {
                    std::thread::park_timeout(Duration::from_millis(200));
                }
                drop(stream);
                debug!("sink thread exiting");
            })
            .map_err(|e| Error::Sink(format!("failed to spawn sink thread: {e}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                thread.thread().unpark();
                return Err(Error::Sink("sink thread did not start in time".into()));
            }
        }

        info!(rate = format.sample_rate, channels, "cpal sink running");
        Ok(Box::new(CpalSink {
            format,
            producer,
            stop,
            failed,
            underruns,
            thread: Some(thread),
        }))
    }

    fn enumerate_devices(&self, passthrough: bool) -> Vec<DeviceInfo> {
        // cpal exposes PCM endpoints only.
        if passthrough {
            return Vec::new();
        }
        let host = cpal::default_host();
        match host.output_devices() {
            Ok(devices) => devices
                .filter_map(|d| d.name().ok())
                .map(|name| DeviceInfo {
                    name,
                    supports_passthrough: false,
                })
                .collect(),
            Err(e) => {
                warn!("device enumeration failed: {e}");
                Vec::new()
            }
        }
    }

    fn default_device(&self, passthrough: bool) -> Option<String> {
        if passthrough {
            return None;
        }
        cpal::default_host()
            .default_output_device()
            .and_then(|d| d.name().ok())
    }

    fn capabilities(&self, device: Option<&str>) -> SinkCapabilities {
        let fallback = SinkCapabilities {
            max_channels: 2,
            raw_codecs: Vec::new(),
            sample_rates: vec![44100, 48000],
            supports_silence_timeout: true,
        };
        let device = match Self::find_device(device) {
            Ok(device) => device,
            Err(_) => return fallback,
        };
        let configs: Vec<_> = match device.supported_output_configs() {
            Ok(configs) => configs.collect(),
            Err(_) => return fallback,
        };
        let max_channels = configs.iter().map(|c| c.channels()).max().unwrap_or(2);
        let sample_rates = PROBE_RATES
            .iter()
            .copied()
            .filter(|rate| {
                configs
                    .iter()
                    .any(|c| c.min_sample_rate().0 <= *rate && *rate <= c.max_sample_rate().0)
            })
            .collect();
        SinkCapabilities {
            max_channels,
            raw_codecs: Vec::new(),
            sample_rates,
            supports_silence_timeout: true,
        }
    }
}

/// Open cpal sink: ring producer on the engine side, stream on its thread.
struct CpalSink {
    format: AudioFormat,
    producer: HeapProd<f32>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    fn queued_secs(&self) -> f64 {
        let channels = self.format.channels.count() as usize;
        let frames = self.producer.occupied_len() / channels;
        self.format.frames_to_secs(frames)
    }
}

impl AudioSink for CpalSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        let mut written = 0;
        let started = Instant::now();
        while written < samples.len() {
            if self.failed.load(Ordering::SeqCst) {
                return Err(Error::Sink("output stream failed".into()));
            }
            written += self.producer.push_slice(&samples[written..]);
            if written < samples.len() {
                if started.elapsed() > Duration::from_secs(1) {
                    return Err(Error::Sink("sink write stalled".into()));
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        Ok(())
    }

    fn delay(&self) -> SinkDelay {
        SinkDelay {
            delay_secs: self.queued_secs() + DEVICE_LATENCY_SECS,
            measured_at: Instant::now(),
        }
    }

    fn latency_secs(&self) -> f64 {
        DEVICE_LATENCY_SECS
    }

    fn drain(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.producer.occupied_len() > 0 {
            if Instant::now() >= deadline {
                return Err(Error::Timeout("sink drain timed out".into()));
            }
            if self.failed.load(Ordering::SeqCst) {
                return Err(Error::Sink("output stream failed".into()));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_secs_f64(DEVICE_LATENCY_SECS).min(timeout));
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
        let underruns = self.underruns.load(Ordering::Relaxed);
        if underruns > 0 {
            debug!("sink closed with {underruns} underrun callbacks");
        }
    }
}
