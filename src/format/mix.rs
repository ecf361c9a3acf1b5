//! Additive sample mixing.
//!
//! Mixing accumulates interleaved PCM from several streams into one device
//! buffer. Overflow saturates instead of wrapping, so two loud streams clip
//! rather than fold over.

use crate::format::SampleFormat;

/// Volumes this close to unity skip the per-sample scale.
const UNITY_VOLUME_EPSILON: f32 = 0.000_01;

/// Mixes `samples` interleaved samples of `src` into `dst`.
///
/// `first` marks the first stream writing to this span: its samples are
/// copied (after scaling) instead of added, every later stream is
/// saturating-added. A muted or zero-volume source writes silence when
/// `first` and contributes nothing otherwise; the caller still advances its
/// read offsets, keeping muted streams in sync.
pub fn mix_add(
    dst: &mut [u8],
    src: &[u8],
    samples: usize,
    format: SampleFormat,
    first: bool,
    mute: bool,
    volume: f32,
) {
    let silent = mute || volume < UNITY_VOLUME_EPSILON;
    if silent {
        if first {
            let bytes = samples * format.sample_bytes();
            dst[..bytes].fill(0);
        }
        return;
    }

    let scale = if (volume - 1.0).abs() < UNITY_VOLUME_EPSILON {
        None
    } else {
        Some(volume)
    };

    match format {
        SampleFormat::S16LE => mix_add_i16(dst, src, samples, first, scale),
        SampleFormat::S32LE => mix_add_i32(dst, src, samples, first, scale),
    }
}

fn mix_add_i16(dst: &mut [u8], src: &[u8], samples: usize, first: bool, scale: Option<f32>) {
    for i in 0..samples {
        let o = i * 2;
        let mut s = i16::from_le_bytes([src[o], src[o + 1]]) as i32;
        if let Some(v) = scale {
            s = (s as f32 * v) as i32;
        }
        let mixed = if first {
            s
        } else {
            i16::from_le_bytes([dst[o], dst[o + 1]]) as i32 + s
        };
        let clamped = mixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        dst[o..o + 2].copy_from_slice(&clamped.to_le_bytes());
    }
}

fn mix_add_i32(dst: &mut [u8], src: &[u8], samples: usize, first: bool, scale: Option<f32>) {
    for i in 0..samples {
        let o = i * 4;
        let mut s = i32::from_le_bytes([src[o], src[o + 1], src[o + 2], src[o + 3]]) as i64;
        if let Some(v) = scale {
            s = (s as f64 * v as f64) as i64;
        }
        let mixed = if first {
            s
        } else {
            i32::from_le_bytes([dst[o], dst[o + 1], dst[o + 2], dst[o + 3]]) as i64 + s
        };
        let clamped = mixed.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        dst[o..o + 4].copy_from_slice(&clamped.to_le_bytes());
    }
}
