//! Message channels between producer threads and the engine thread
//!
//! Two independent mailboxes carry everything: a control channel for
//! lifecycle and configuration, and a data channel for payload-bearing
//! stream/sound traffic. Each channel delivers in send order; nothing is
//! guaranteed across the two, so the engine handles any interleaving.
//!
//! A sender that needs an answer attaches a one-shot reply channel to its
//! envelope and blocks on it with a deadline. Both channels are bounded, so
//! a flooded engine pushes back on producers instead of growing memory.

use crate::error::{Error, Result};
use crate::settings::{AudioSettings, SoundMode};
use crate::stats::EngineSnapshot;
use crate::stream::{CodecInfo, SoundId, StreamClock, StreamId, StreamOptions};
use crate::types::AudioFormat;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Capacity of each mailbox. Senders block when it is full (backpressure).
const CHANNEL_CAPACITY: usize = 64;

/// Replies the engine posts back on a request's reply channel.
#[derive(Debug)]
pub enum Reply {
    /// Command applied
    Accepted,
    /// Engine busy, invalid state, or unsupported parameter
    Rejected(String),
    /// Answer to a get-state request
    Stats(Box<EngineSnapshot>),
    /// Stream created; `format` is the accepted input format
    StreamCreated { id: StreamId, format: AudioFormat },
    /// Sound created and registered
    SoundCreated { id: SoundId },
    /// The producer's sample buffer has been taken into the pipeline
    StreamBufferConsumed,
    /// All buffered samples for the stream reached the sink
    StreamDrained,
}

pub type ReplySender = Sender<Reply>;

/// Lifecycle and configuration signals.
pub enum ControlMsg {
    Init(Box<AudioSettings>),
    /// Reconfigure, optionally with a fresh settings snapshot
    Reconfigure(Option<Box<AudioSettings>>),
    Suspend,
    Resume,
    DeviceChange,
    Mute(bool),
    Volume(f32),
    SoundMode(SoundMode),
    PauseStream(StreamId),
    ResumeStream(StreamId),
    FlushStream(StreamId),
    StreamVolume(StreamId, f32),
    StreamReplaygain(StreamId, f32),
    StreamAmplify(StreamId, f32),
    StreamResampleRatio(StreamId, f64),
    StreamResampleMode(StreamId, i32),
    StreamFade {
        id: StreamId,
        from: f32,
        target: f32,
        millis: u32,
    },
    StreamCodecInfo(StreamId, CodecInfo),
    StopSound(SoundId),
    GetState,
    DisplayLost,
    DisplayReset,
    AppFocus(bool),
    /// Hold the current configuration for this many milliseconds even if all
    /// streams go away (gapless transitions)
    KeepConfig(u32),
    Shutdown,
}

/// Payload-bearing stream and sound signals.
pub enum DataMsg {
    NewSound {
        format: AudioFormat,
        samples: Vec<f32>,
    },
    PlaySound(SoundId),
    FreeSound(SoundId),
    NewStream {
        format: AudioFormat,
        options: StreamOptions,
        clock: Option<Box<dyn StreamClock>>,
    },
    FreeStream {
        id: StreamId,
        /// Drain remaining samples before teardown
        finish: bool,
    },
    StreamSamples {
        id: StreamId,
        samples: Vec<f32>,
    },
    DrainStream {
        id: StreamId,
        timeout: Duration,
    },
}

/// One queued message plus its optional reply channel.
pub struct Envelope<T> {
    pub msg: T,
    pub reply: Option<ReplySender>,
}

/// Producer-side end of one mailbox.
pub struct Port<T> {
    tx: Sender<Envelope<T>>,
}

impl<T> Clone for Port<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Port<T> {
    /// Enqueue without waiting for an answer. Blocks only under backpressure.
    pub fn send(&self, msg: T) -> Result<()> {
        self.tx
            .send(Envelope { msg, reply: None })
            .map_err(|_| Error::ChannelClosed)
    }

    /// Enqueue and block until the engine answers or `timeout` elapses.
    pub fn request(&self, msg: T, timeout: Duration) -> Result<Reply> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Envelope {
                msg,
                reply: Some(reply_tx),
            })
            .map_err(|_| Error::ChannelClosed)?;
        match reply_rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::Timeout(format!("no reply within {timeout:?}")))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
        }
    }

    /// Like `request`, but maps `Accepted` to `()` and `Rejected` to an error.
    pub fn command(&self, msg: T, timeout: Duration) -> Result<()> {
        match self.request(msg, timeout)? {
            Reply::Accepted => Ok(()),
            Reply::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected reply {other:?}"))),
        }
    }
}

/// Create one mailbox: the producer-facing port and the engine-side receiver.
pub fn mailbox<T>() -> (Port<T>, Receiver<Envelope<T>>) {
    let (tx, rx) = bounded(CHANNEL_CAPACITY);
    (Port { tx }, rx)
}

/// Post a reply if the sender asked for one.
pub fn post_reply(reply: &mut Option<ReplySender>, value: Reply) {
    if let Some(tx) = reply.take() {
        // The requester may have timed out and gone away; that is fine.
        let _ = tx.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reply_round_trip() {
        let (port, rx) = mailbox::<ControlMsg>();
        let worker = std::thread::spawn(move || {
            let mut env = rx.recv().unwrap();
            post_reply(&mut env.reply, Reply::Accepted);
        });
        port.command(ControlMsg::GetState, Duration::from_secs(1))
            .unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn request_times_out_without_reply() {
        let (port, _rx) = mailbox::<ControlMsg>();
        let err = port
            .request(ControlMsg::GetState, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (port, rx) = mailbox::<ControlMsg>();
        for v in [0.1f32, 0.2, 0.3] {
            port.send(ControlMsg::Volume(v)).unwrap();
        }
        let mut seen = Vec::new();
        while let Ok(env) = rx.try_recv() {
            if let ControlMsg::Volume(v) = env.msg {
                seen.push(v);
            }
        }
        assert_eq!(seen, vec![0.1, 0.2, 0.3]);
    }
}
