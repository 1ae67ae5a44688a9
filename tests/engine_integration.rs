//! End-to-end engine tests over the null sink backend.

use soundstage::sink::null::NullBackend;
use soundstage::{
    AudioEngine, AudioFormat, AudioSettings, ChannelLayout, Error, RawCodec, SampleEncoding,
    SoundMode, StreamOptions,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

fn pcm() -> AudioFormat {
    AudioFormat::new(44100, ChannelLayout::Stereo, SampleEncoding::F32)
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn streams_get_unique_ids() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();
    let a = engine.make_stream(pcm(), StreamOptions::default(), None).unwrap();
    let b = engine.make_stream(pcm(), StreamOptions::default(), None).unwrap();
    assert_ne!(a.id(), b.id());
    assert!(format!("{a:?}").contains("StreamHandle"));
    engine.free_stream(a, false).unwrap();
    engine.free_stream(b, false).unwrap();
}

#[test]
fn volume_set_then_get_is_consistent() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();

    engine.set_volume(0.5).unwrap();
    assert_eq!(engine.get_volume(), 0.5);

    let err = engine.set_volume(1.5).unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));
    assert_eq!(engine.get_volume(), 0.5);

    // Mute is independent of the stored volume.
    engine.set_mute(true).unwrap();
    assert!(engine.is_muted());
    assert_eq!(engine.get_volume(), 0.5);
}

#[test]
fn single_stream_reaches_sink_unmodified() {
    init_logging();
    let capture = Arc::new(Mutex::new(Vec::new()));
    let backend = NullBackend::new().with_capture(Arc::clone(&capture));
    let engine = AudioEngine::new(Arc::new(backend), AudioSettings::default()).unwrap();

    let stream = engine.make_stream(pcm(), StreamOptions::default(), None).unwrap();
    // 0.1 s of a constant signal; with one source the mix must be identity.
    let input = vec![0.25f32; 4410 * 2];
    stream.add_samples(input.clone()).unwrap();
    stream.drain(Duration::from_secs(2)).unwrap();

    let written = capture.lock().unwrap();
    // Nothing but the stream reached the sink: no silence padding around it.
    assert_eq!(written.len(), input.len());
    assert!(written.iter().all(|s| (*s - 0.25).abs() < 1e-6));

    engine.free_stream(stream, false).unwrap();
}

#[test]
fn drain_converges_to_empty_cache() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();
    let stream = engine.make_stream(pcm(), StreamOptions::default(), None).unwrap();

    stream.add_samples(vec![0.1f32; 4410 * 2]).unwrap();
    stream.drain(Duration::from_secs(2)).unwrap();
    assert!(stream.get_cache_time() < 1e-9);
}

#[test]
fn drain_deadline_rejects_stuck_stream() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();
    let options = StreamOptions { start_paused: true };
    let stream = engine.make_stream(pcm(), options, None).unwrap();

    // A paused stream is never mixed, so its buffers cannot reach the sink.
    stream.add_samples(vec![0.1f32; 4410 * 2]).unwrap();
    let err = stream.drain(Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));
}

#[test]
fn full_stream_cache_pushes_back() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();
    let options = StreamOptions { start_paused: true };
    let stream = engine.make_stream(pcm(), options, None).unwrap();

    // One-second chunks against a four-second cache ceiling.
    let chunk = vec![0.0f32; 44100 * 2];
    let mut rejected = false;
    for _ in 0..10 {
        match stream.add_samples(chunk.clone()) {
            Ok(()) => {}
            Err(Error::Rejected(reason)) => {
                assert!(reason.contains("full"), "unexpected reason: {reason}");
                rejected = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(rejected, "cache never filled");
}

#[test]
fn device_change_burst_reconfigures_once() {
    init_logging();
    let backend = NullBackend::new();
    let opens = backend.open_count_handle();
    let engine = AudioEngine::new(Arc::new(backend), AudioSettings::default()).unwrap();
    assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 1);

    for _ in 0..5 {
        engine.device_change().unwrap();
    }
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn reconfigure_with_same_settings_keeps_sink() {
    init_logging();
    let backend = NullBackend::new();
    let opens = backend.open_count_handle();
    let engine = AudioEngine::new(Arc::new(backend), AudioSettings::default()).unwrap();

    engine.reconfigure(None).unwrap();
    engine.reconfigure(None).unwrap();
    assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn sound_plays_to_completion() {
    init_logging();
    let capture = Arc::new(Mutex::new(Vec::new()));
    let backend = NullBackend::new().with_capture(Arc::clone(&capture));
    let engine = AudioEngine::new(Arc::new(backend), AudioSettings::default()).unwrap();

    // 50 ms effect sound already in the sink format.
    let samples = vec![0.5f32; 2205 * 2];
    let sound = engine.make_sound(pcm(), samples.clone()).unwrap();
    assert!(format!("{sound:?}").contains("SoundHandle"));
    sound.play().unwrap();
    std::thread::sleep(Duration::from_millis(400));

    let written = capture.lock().unwrap();
    let nonzero: Vec<f32> = written.iter().copied().filter(|s| *s != 0.0).collect();
    assert_eq!(nonzero.len(), samples.len());
    assert!(nonzero.iter().all(|s| (*s - 0.5).abs() < 1e-6));
}

#[test]
fn sound_mode_off_gates_playback() {
    init_logging();
    let capture = Arc::new(Mutex::new(Vec::new()));
    let backend = NullBackend::new().with_capture(Arc::clone(&capture));
    let settings = AudioSettings {
        gui_sound_mode: SoundMode::Off,
        ..Default::default()
    };
    let engine = AudioEngine::new(Arc::new(backend), settings).unwrap();

    let sound = engine.make_sound(pcm(), vec![0.5f32; 2205 * 2]).unwrap();
    // Gated play is accepted but produces no output.
    sound.play().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(capture.lock().unwrap().is_empty());
}

#[test]
fn raw_sound_is_rejected() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();
    let raw = AudioFormat::new(
        48000,
        ChannelLayout::Stereo,
        SampleEncoding::Raw(RawCodec::Ac3),
    );
    let err = engine.make_sound(raw, vec![0.0; 128]).unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));
}

#[test]
fn suspended_engine_rejects_new_streams() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();

    engine.suspend().unwrap();
    assert!(engine.is_suspended());
    let err = engine
        .make_stream(pcm(), StreamOptions::default(), None)
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(_)));

    engine.resume().unwrap();
    assert!(!engine.is_suspended());
    let stream = engine.make_stream(pcm(), StreamOptions::default(), None).unwrap();
    engine.free_stream(stream, false).unwrap();
}

#[test]
fn silence_timeout_releases_and_reclaims_sink() {
    init_logging();
    let backend = NullBackend::new();
    let opens = backend.open_count_handle();
    let settings = AudioSettings {
        silence_timeout_secs: 1,
        ..Default::default()
    };
    let engine = AudioEngine::new(Arc::new(backend), settings).unwrap();
    assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 1);

    std::thread::sleep(Duration::from_millis(1600));
    // The sink was released while idle; the next stream reopens it.
    let stream = engine.make_stream(pcm(), StreamOptions::default(), None).unwrap();
    assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 2);
    engine.free_stream(stream, false).unwrap();
}

#[test]
fn keep_configuration_suppresses_silence_release() {
    init_logging();
    let backend = NullBackend::new();
    let opens = backend.open_count_handle();
    let settings = AudioSettings {
        silence_timeout_secs: 1,
        ..Default::default()
    };
    let engine = AudioEngine::new(Arc::new(backend), settings).unwrap();
    assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Hold the device past the silence timeout.
    engine.keep_configuration(3000).unwrap();
    std::thread::sleep(Duration::from_millis(1600));

    // The sink was never released, so a new stream needs no reopen.
    let stream = engine.make_stream(pcm(), StreamOptions::default(), None).unwrap();
    assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 1);
    engine.free_stream(stream, false).unwrap();
}

#[test]
fn flush_discards_buffered_samples() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();
    let options = StreamOptions { start_paused: true };
    let stream = engine.make_stream(pcm(), options, None).unwrap();

    stream.add_samples(vec![0.1f32; 4410 * 2]).unwrap();
    assert!(wait_until(
        || stream.get_cache_time() > 0.0,
        Duration::from_secs(1),
    ));

    stream.flush().unwrap();
    assert!(wait_until(
        || stream.get_cache_time() == 0.0,
        Duration::from_secs(1),
    ));
}

#[test]
fn paused_stream_holds_audio_until_resumed() {
    init_logging();
    let capture = Arc::new(Mutex::new(Vec::new()));
    let backend = NullBackend::new().with_capture(Arc::clone(&capture));
    let engine = AudioEngine::new(Arc::new(backend), AudioSettings::default()).unwrap();

    let options = StreamOptions { start_paused: true };
    let stream = engine.make_stream(pcm(), options, None).unwrap();
    let input = vec![0.3f32; 2205 * 2];
    stream.add_samples(input.clone()).unwrap();

    std::thread::sleep(Duration::from_millis(200));
    assert!(capture.lock().unwrap().is_empty());

    stream.resume().unwrap();
    stream.drain(Duration::from_secs(2)).unwrap();

    let written = capture.lock().unwrap();
    let nonzero = written.iter().filter(|s| **s != 0.0).count();
    assert_eq!(nonzero, input.len());
    drop(written);
    engine.free_stream(stream, false).unwrap();
}

#[test]
fn state_snapshot_reports_sink_format() {
    init_logging();
    let engine = AudioEngine::new(Arc::new(NullBackend::new()), AudioSettings::default()).unwrap();
    let snapshot = engine.get_state().unwrap();
    assert!(snapshot.sink_format.is_some());
    assert!(!snapshot.suspended);
    assert_eq!(snapshot.water_level, 0.0);
}

#[test]
fn free_with_finish_plays_out_buffered_audio() {
    init_logging();
    let capture = Arc::new(Mutex::new(Vec::new()));
    let backend = NullBackend::new().with_capture(Arc::clone(&capture));
    let engine = AudioEngine::new(Arc::new(backend), AudioSettings::default()).unwrap();

    let stream = engine.make_stream(pcm(), StreamOptions::default(), None).unwrap();
    let input = vec![0.2f32; 2205 * 2];
    stream.add_samples(input.clone()).unwrap();
    engine.free_stream(stream, true).unwrap();

    let written = capture.lock().unwrap();
    let nonzero = written.iter().filter(|s| **s != 0.0).count();
    assert_eq!(nonzero, input.len());
}
