//! Reusable sample buffers and per-stream resample pools
//!
//! A `BufferPool` hands out fixed-size sample buffers tagged with one format
//! and takes them back for reuse. A `ResamplePool` wraps a pool together with
//! a resample stage; its identity is the (source format, destination format)
//! pair and that pair never changes after creation. When a configuration epoch
//! ends, whole pools are moved to a discard list and replaced, never edited.

use crate::error::Result;
use crate::resample::StageResampler;
use crate::types::{AudioFormat, Quality};
use std::collections::VecDeque;

/// Number of reusable buffers a pool keeps on its free list.
const POOL_TARGET_DEPTH: usize = 8;

/// One interleaved f32 sample buffer tagged with its format.
///
/// Raw bitstream payloads travel through the same container: the encoded words
/// occupy the f32 slots untouched and are never interpreted as PCM.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pub data: Vec<f32>,
    pub format: AudioFormat,
}

impl SampleBuffer {
    pub fn new(format: AudioFormat, frames: usize) -> Self {
        Self {
            data: vec![0.0; frames * format.channels.count() as usize],
            format,
        }
    }

    pub fn frames(&self) -> usize {
        self.data.len() / self.format.channels.count() as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.format.frames_to_secs(self.frames())
    }
}

/// Format-tagged free list of reusable sample buffers.
pub struct BufferPool {
    format: AudioFormat,
    buffer_frames: usize,
    free: Vec<SampleBuffer>,
}

impl BufferPool {
    pub fn new(format: AudioFormat, buffer_frames: usize) -> Self {
        Self {
            format,
            buffer_frames,
            free: Vec::new(),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    /// Take a zeroed buffer, allocating only when the free list is empty.
    pub fn acquire(&mut self) -> SampleBuffer {
        match self.free.pop() {
            Some(mut buf) => {
                buf.data.fill(0.0);
                buf
            }
            None => SampleBuffer::new(self.format, self.buffer_frames),
        }
    }

    /// Return a buffer for reuse. Buffers beyond the target depth are dropped.
    pub fn release(&mut self, buf: SampleBuffer) {
        if self.free.len() < POOL_TARGET_DEPTH && buf.format == self.format {
            self.free.push(buf);
        }
    }
}

/// A buffer pool with a resample stage in front of it.
///
/// Producers push source-format samples in; the pool converts them to the
/// destination format and queues them as ready buffers the mixer consumes.
/// The format pair is fixed at construction.
pub struct ResamplePool {
    src_format: AudioFormat,
    dst_format: AudioFormat,
    pool: BufferPool,
    /// None for raw passthrough or sample-exact format matches
    stage: Option<StageResampler>,
    quality: Quality,
    ready: VecDeque<SampleBuffer>,
    /// Read offset in frames into the front ready buffer
    front_offset: usize,
    /// Partially filled buffer awaiting more output
    filling: Option<(SampleBuffer, usize)>,
}

impl ResamplePool {
    pub fn new(
        src_format: AudioFormat,
        dst_format: AudioFormat,
        buffer_frames: usize,
        quality: Quality,
    ) -> Self {
        let stage = if src_format.is_raw() || src_format == dst_format {
            None
        } else {
            Some(StageResampler::new(src_format, dst_format, quality))
        };
        Self {
            src_format,
            dst_format,
            pool: BufferPool::new(dst_format, buffer_frames),
            stage,
            quality,
            ready: VecDeque::new(),
            front_offset: 0,
            filling: None,
        }
    }

    pub fn src_format(&self) -> AudioFormat {
        self.src_format
    }

    pub fn dst_format(&self) -> AudioFormat {
        self.dst_format
    }

    /// Nudge the effective resample ratio for A/V sync. No-op for passthrough.
    pub fn set_ratio_adjust(&mut self, adjust: f64) -> Result<()> {
        if self.src_format.is_raw() {
            return Ok(());
        }
        if self.stage.is_none() && (adjust - 1.0).abs() > f64::EPSILON {
            // Equal formats ran without a stage; sync nudging needs one.
            self.stage = Some(StageResampler::new(
                self.src_format,
                self.dst_format,
                self.quality,
            ));
        }
        if let Some(stage) = self.stage.as_mut() {
            stage.set_ratio_adjust(adjust)?;
        }
        Ok(())
    }

    /// Push interleaved source-format samples through the stage into the
    /// ready queue.
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<()> {
        match self.stage.as_mut() {
            Some(stage) => {
                let out = stage.process(samples)?;
                self.queue_output(&out);
            }
            None => self.queue_output(samples),
        }
        Ok(())
    }

    /// Flush the stage's internal tail into the ready queue (used on drain).
    pub fn drain_stage(&mut self) -> Result<()> {
        if let Some(stage) = self.stage.as_mut() {
            let out = stage.flush()?;
            self.queue_output(&out);
        }
        if let Some((buf, filled)) = self.filling.take() {
            if filled > 0 {
                let mut buf = buf;
                let ch = self.dst_format.channels.count() as usize;
                buf.data.truncate(filled * ch);
                self.ready.push_back(buf);
            } else {
                self.pool.release(buf);
            }
        }
        Ok(())
    }

    fn queue_output(&mut self, samples: &[f32]) {
        let ch = self.dst_format.channels.count() as usize;
        let mut pos = 0;
        while pos < samples.len() {
            let (mut buf, mut filled) = match self.filling.take() {
                Some(pair) => pair,
                None => (self.pool.acquire(), 0),
            };
            let capacity = self.pool.buffer_frames() * ch;
            if buf.data.len() < capacity {
                buf.data.resize(capacity, 0.0);
            }
            let want = capacity - filled * ch;
            let take = want.min(samples.len() - pos);
            buf.data[filled * ch..filled * ch + take].copy_from_slice(&samples[pos..pos + take]);
            pos += take;
            filled += take / ch;
            if filled >= self.pool.buffer_frames() {
                self.ready.push_back(buf);
            } else {
                self.filling = Some((buf, filled));
            }
        }
    }

    /// Frames queued and ready for the mixer.
    pub fn ready_frames(&self) -> usize {
        let ch = self.dst_format.channels.count() as usize;
        let queued: usize = self.ready.iter().map(|b| b.data.len() / ch).sum();
        let partial = self.filling.as_ref().map(|(_, f)| *f).unwrap_or(0);
        queued + partial - self.front_offset
    }

    /// Total buffered time in seconds, for water-level and drain checks.
    pub fn buffered_secs(&self) -> f64 {
        self.dst_format.frames_to_secs(self.ready_frames())
    }

    pub fn is_empty(&self) -> bool {
        self.ready_frames() == 0
    }

    /// Copy up to `dst` frames of ready output into `dst`, consuming them.
    /// Returns the number of frames copied.
    pub fn read_frames(&mut self, dst: &mut [f32]) -> usize {
        let ch = self.dst_format.channels.count() as usize;
        let want_frames = dst.len() / ch;
        let mut copied = 0;
        while copied < want_frames {
            // Promote the partial buffer once the queue is exhausted.
            if self.ready.is_empty() {
                match self.filling.take() {
                    Some((mut buf, filled)) if filled > 0 => {
                        buf.data.truncate(filled * ch);
                        self.ready.push_back(buf);
                    }
                    Some(pair) => {
                        self.filling = Some(pair);
                        break;
                    }
                    None => break,
                }
            }
            let front = match self.ready.front() {
                Some(front) => front,
                None => break,
            };
            let front_frames = front.data.len() / ch;
            let avail = front_frames - self.front_offset;
            let take = avail.min(want_frames - copied);
            let src = &front.data[self.front_offset * ch..(self.front_offset + take) * ch];
            dst[copied * ch..(copied + take) * ch].copy_from_slice(src);
            copied += take;
            self.front_offset += take;
            if self.front_offset >= front_frames {
                self.front_offset = 0;
                if let Some(buf) = self.ready.pop_front() {
                    self.pool.release(buf);
                }
            }
        }
        copied
    }

    /// Drop all buffered output (stream flush).
    pub fn clear(&mut self) {
        while let Some(buf) = self.ready.pop_front() {
            self.pool.release(buf);
        }
        if let Some((buf, _)) = self.filling.take() {
            self.pool.release(buf);
        }
        self.front_offset = 0;
        if let Some(stage) = self.stage.as_mut() {
            stage.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelLayout, SampleEncoding};

    fn fmt(rate: u32) -> AudioFormat {
        AudioFormat::new(rate, ChannelLayout::Stereo, SampleEncoding::F32)
    }

    #[test]
    fn pool_reuses_buffers() {
        let mut pool = BufferPool::new(fmt(48000), 256);
        let a = pool.acquire();
        assert_eq!(a.frames(), 256);
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(b.frames(), 256);
        assert!(b.data.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn passthrough_pool_round_trips_samples() {
        let mut pool = ResamplePool::new(fmt(48000), fmt(48000), 128, Quality::Mid);
        let input: Vec<f32> = (0..512).map(|i| i as f32 / 512.0).collect();
        pool.push_samples(&input).unwrap();
        assert_eq!(pool.ready_frames(), 256);

        let mut out = vec![0.0f32; 512];
        let copied = pool.read_frames(&mut out);
        assert_eq!(copied, 256);
        assert_eq!(out, input);
        assert!(pool.is_empty());
    }

    #[test]
    fn partial_reads_preserve_order() {
        let mut pool = ResamplePool::new(fmt(48000), fmt(48000), 64, Quality::Mid);
        let input: Vec<f32> = (0..256).map(|i| i as f32).collect();
        pool.push_samples(&input).unwrap();

        let mut first = vec![0.0f32; 100];
        let mut second = vec![0.0f32; 156];
        assert_eq!(pool.read_frames(&mut first), 50);
        assert_eq!(pool.read_frames(&mut second), 78);
        let mut all = first;
        all.extend_from_slice(&second);
        assert_eq!(all, input);
    }

    #[test]
    fn resampling_pool_changes_rate() {
        let mut pool = ResamplePool::new(fmt(22050), fmt(44100), 128, Quality::Mid);
        let input = vec![0.25f32; 22050 * 2];
        pool.push_samples(&input).unwrap();
        pool.drain_stage().unwrap();
        // One second in should come out near one second at the new rate.
        let secs = pool.buffered_secs();
        assert!((secs - 1.0).abs() < 0.05, "buffered {secs}s");
    }

    #[test]
    fn clear_empties_pool() {
        let mut pool = ResamplePool::new(fmt(48000), fmt(48000), 64, Quality::Mid);
        pool.push_samples(&vec![0.5; 1000]).unwrap();
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.buffered_secs(), 0.0);
    }
}
