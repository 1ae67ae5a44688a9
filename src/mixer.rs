//! Additive mixing primitives
//!
//! The worker thread owns one sink-format mix buffer per tick. Streams and
//! effect sounds are summed into it here, then the anti-clipping scale and the
//! global volume multiplier are applied in that order.

/// Sum `src` into `dst` with a per-frame linear gain ramp from `gain_start`
/// to `gain_end` (fade envelopes). `src` and `dst` are interleaved with the
/// same channel count; `src` may be shorter.
pub fn mix_into(dst: &mut [f32], src: &[f32], channels: usize, gain_start: f32, gain_end: f32) {
    let frames = (src.len() / channels).min(dst.len() / channels);
    if frames == 0 {
        return;
    }
    let step = (gain_end - gain_start) / frames as f32;
    let mut gain = gain_start;
    for frame in 0..frames {
        for c in 0..channels {
            dst[frame * channels + c] += src[frame * channels + c] * gain;
        }
        gain += step;
    }
}

/// Sum one sound's samples into `dst` starting at the sound's cursor.
/// Returns the number of frames consumed.
pub fn mix_sound(dst: &mut [f32], sound: &[f32], cursor_frames: usize, channels: usize, gain: f32) -> usize {
    let start = cursor_frames * channels;
    if start >= sound.len() {
        return 0;
    }
    let src = &sound[start..];
    let frames = (src.len() / channels).min(dst.len() / channels);
    for i in 0..frames * channels {
        dst[i] += src[i] * gain;
    }
    frames
}

/// Anti-clipping scale after summation: 1/n over the number of concurrently
/// summed sources. A single source passes through untouched.
pub fn deamplify(dst: &mut [f32], sources: usize) {
    if sources > 1 {
        let scale = 1.0 / sources as f32;
        for sample in dst.iter_mut() {
            *sample *= scale;
        }
    }
}

/// Final volume multiplier (0.0 while muted).
pub fn apply_gain(dst: &mut [f32], gain: f32) {
    if (gain - 1.0).abs() > f32::EPSILON {
        for sample in dst.iter_mut() {
            *sample *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_into_sums_with_constant_gain() {
        let mut dst = vec![0.1f32; 4];
        mix_into(&mut dst, &[0.2, 0.2, 0.2, 0.2], 2, 0.5, 0.5);
        for sample in dst {
            assert!((sample - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn mix_into_ramps_gain_per_frame() {
        let mut dst = vec![0.0f32; 8];
        mix_into(&mut dst, &[1.0; 8], 2, 0.0, 1.0);
        // 4 frames: gains 0.0, 0.25, 0.5, 0.75
        assert_eq!(dst[0], 0.0);
        assert!((dst[2] - 0.25).abs() < 1e-6);
        assert!((dst[6] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn mix_sound_respects_cursor_and_end() {
        let sound = vec![0.5f32; 6]; // 3 stereo frames
        let mut dst = vec![0.0f32; 8];
        let consumed = mix_sound(&mut dst, &sound, 2, 2, 1.0);
        assert_eq!(consumed, 1);
        assert_eq!(&dst[..2], &[0.5, 0.5]);
        assert_eq!(&dst[2..], &[0.0; 6]);
    }

    #[test]
    fn deamplify_single_source_is_identity() {
        let mut dst = vec![0.9f32, -0.9];
        deamplify(&mut dst, 1);
        assert_eq!(dst, vec![0.9, -0.9]);
    }

    #[test]
    fn deamplify_scales_by_source_count() {
        let mut dst = vec![1.0f32; 4];
        deamplify(&mut dst, 4);
        for sample in dst {
            assert!((sample - 0.25).abs() < 1e-6);
        }
    }
}
