//! Streaming sample-rate conversion using rubato
//!
//! Wraps a `FastFixedIn` resampler behind a push interface: callers feed
//! interleaved source-format samples of any length, the stage buffers them
//! into fixed chunks, and hands back interleaved destination-format output.
//! Channel-layout changes are folded in before the rate conversion.

use crate::error::{Error, Result};
use crate::types::{AudioFormat, Quality};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};

/// Frames fed to rubato per processing call.
const CHUNK_FRAMES: usize = 1024;

/// Headroom for runtime ratio adjustment (sync nudging plus user ratios).
const MAX_RELATIVE_RATIO: f64 = 4.0;

/// Streaming resampler between two fixed formats.
pub struct StageResampler {
    src_format: AudioFormat,
    dst_format: AudioFormat,
    inner: Option<FastFixedIn<f32>>,
    quality: Quality,
    /// Planar pending input, already remixed to the destination layout
    pending: Vec<Vec<f32>>,
    ratio_adjust: f64,
}

impl StageResampler {
    pub fn new(src_format: AudioFormat, dst_format: AudioFormat, quality: Quality) -> Self {
        let channels = dst_format.channels.count() as usize;
        Self {
            src_format,
            dst_format,
            inner: None,
            quality,
            pending: vec![Vec::new(); channels],
            ratio_adjust: 1.0,
        }
    }

    fn degree(quality: Quality) -> PolynomialDegree {
        match quality {
            Quality::Low => PolynomialDegree::Linear,
            Quality::Mid => PolynomialDegree::Cubic,
            Quality::High => PolynomialDegree::Septic,
        }
    }

    fn ensure_inner(&mut self) -> Result<&mut FastFixedIn<f32>> {
        if self.inner.is_none() {
            let ratio = self.dst_format.sample_rate as f64 / self.src_format.sample_rate as f64;
            let resampler = FastFixedIn::<f32>::new(
                ratio,
                MAX_RELATIVE_RATIO,
                Self::degree(self.quality),
                CHUNK_FRAMES,
                self.dst_format.channels.count() as usize,
            )
            .map_err(|e| Error::Resample(format!("failed to create resampler: {e}")))?;
            self.inner = Some(resampler);
            if (self.ratio_adjust - 1.0).abs() > f64::EPSILON {
                let adjust = self.ratio_adjust;
                self.apply_ratio(adjust)?;
            }
        }
        self.inner
            .as_mut()
            .ok_or_else(|| Error::Internal("resampler not initialized".into()))
    }

    fn apply_ratio(&mut self, adjust: f64) -> Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            inner
                .set_resample_ratio_relative(adjust, true)
                .map_err(|e| Error::Resample(format!("ratio {adjust} rejected: {e}")))?;
        }
        Ok(())
    }

    /// Multiply the base rate ratio by `adjust` (1.0 = nominal).
    pub fn set_ratio_adjust(&mut self, adjust: f64) -> Result<()> {
        if !(adjust.is_finite()) || adjust <= 0.0 {
            return Err(Error::Resample(format!("non-positive ratio {adjust}")));
        }
        self.ratio_adjust = adjust;
        self.apply_ratio(adjust)
    }

    /// Feed interleaved source samples; returns interleaved destination output.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let src_ch = self.src_format.channels.count() as usize;
        let dst_ch = self.dst_format.channels.count() as usize;
        let remixed;
        let input = if src_ch == dst_ch {
            input
        } else {
            remixed = remix_channels(input, src_ch, dst_ch);
            &remixed
        };

        for (c, plane) in self.pending.iter_mut().enumerate() {
            plane.extend(input.iter().skip(c).step_by(dst_ch));
        }

        let mut out = Vec::new();
        while self.pending[0].len() >= CHUNK_FRAMES {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|plane| plane.drain(..CHUNK_FRAMES).collect())
                .collect();
            let inner = self.ensure_inner()?;
            let planes = inner
                .process(&chunk, None)
                .map_err(|e| Error::Resample(format!("resampling failed: {e}")))?;
            interleave_into(&planes, &mut out);
        }
        Ok(out)
    }

    /// Push the remaining tail through the resampler (end of stream / drain).
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        if !self.pending[0].is_empty() {
            let tail: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|plane| plane.drain(..).collect())
                .collect();
            let inner = self.ensure_inner()?;
            let planes = inner
                .process_partial(Some(&tail), None)
                .map_err(|e| Error::Resample(format!("flush failed: {e}")))?;
            interleave_into(&planes, &mut out);
        }
        if let Some(inner) = self.inner.as_mut() {
            let planes = inner
                .process_partial::<Vec<f32>>(None, None)
                .map_err(|e| Error::Resample(format!("flush failed: {e}")))?;
            interleave_into(&planes, &mut out);
        }
        Ok(out)
    }

    /// Drop pending input and internal filter state.
    pub fn reset(&mut self) {
        for plane in &mut self.pending {
            plane.clear();
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

/// Fold an interleaved signal from `src_ch` to `dst_ch` channels.
///
/// Downmix averages the source channels that map onto each destination slot;
/// upmix repeats source channels round-robin.
pub fn remix_channels(input: &[f32], src_ch: usize, dst_ch: usize) -> Vec<f32> {
    if src_ch == dst_ch {
        return input.to_vec();
    }
    let frames = input.len() / src_ch;
    let mut out = vec![0.0f32; frames * dst_ch];
    for frame in 0..frames {
        let src = &input[frame * src_ch..(frame + 1) * src_ch];
        let dst = &mut out[frame * dst_ch..(frame + 1) * dst_ch];
        if dst_ch < src_ch {
            let mut counts = vec![0u32; dst_ch];
            for (c, sample) in src.iter().enumerate() {
                dst[c % dst_ch] += sample;
                counts[c % dst_ch] += 1;
            }
            for (sample, count) in dst.iter_mut().zip(counts) {
                *sample /= count as f32;
            }
        } else {
            for (c, slot) in dst.iter_mut().enumerate() {
                *slot = src[c % src_ch];
            }
        }
    }
    out
}

fn interleave_into(planes: &[Vec<f32>], out: &mut Vec<f32>) {
    if planes.is_empty() {
        return;
    }
    let frames = planes[0].len();
    out.reserve(frames * planes.len());
    for frame in 0..frames {
        for plane in planes {
            out.push(plane[frame]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelLayout, SampleEncoding};

    fn fmt(rate: u32, channels: ChannelLayout) -> AudioFormat {
        AudioFormat::new(rate, channels, SampleEncoding::F32)
    }

    #[test]
    fn doubles_frame_count_on_2x_upsample() {
        let mut stage = StageResampler::new(
            fmt(24000, ChannelLayout::Stereo),
            fmt(48000, ChannelLayout::Stereo),
            Quality::Mid,
        );
        let input = vec![0.1f32; 24000 * 2];
        let mut out = stage.process(&input).unwrap();
        out.extend(stage.flush().unwrap());
        let frames = out.len() / 2;
        assert!(
            (frames as i64 - 48000).unsigned_abs() < 2048,
            "got {frames} frames"
        );
    }

    #[test]
    fn downmix_averages_channels() {
        let out = remix_channels(&[1.0, 0.0, 1.0, 0.0], 2, 1);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn upmix_replicates_channels() {
        let out = remix_channels(&[0.25, 0.75], 1, 2);
        assert_eq!(out, vec![0.25, 0.25, 0.75, 0.75]);
    }

    #[test]
    fn rejects_bad_ratio() {
        let mut stage = StageResampler::new(
            fmt(44100, ChannelLayout::Stereo),
            fmt(48000, ChannelLayout::Stereo),
            Quality::Mid,
        );
        assert!(stage.set_ratio_adjust(0.0).is_err());
        assert!(stage.set_ratio_adjust(1.01).is_ok());
    }
}
