//! Sample rate conversion.
//!
//! This module provides a stateful linear-interpolation resampler operating
//! on raw interleaved PCM bytes. Linear interpolation is cheap and fully
//! deterministic, which is what the scheduler needs to chase small rate
//! deviations (device clock drift, stream/device mismatch) frame-accurately;
//! it is not meant for large musical pitch shifts.

use crate::error::ConfigError;

/// A linear resampler.
///
/// The accumulated source/destination offsets persist across calls, so
/// interpolation stays continuous at buffer boundaries and the resampler can
/// be fed arbitrarily split input. Rates are held as integer numerators and
/// denominators scaled by 100 so the "is resampling needed" test never
/// depends on float equality.
///
/// Only 16-bit and 32-bit integer samples are supported; construction fails
/// for any other width.
pub struct LinearResampler {
    /// Interleaved channels per frame.
    num_channels: usize,
    /// Size of one frame in bytes.
    frame_bytes: usize,
    /// Size of one sample in bytes (2 or 4).
    sample_bytes: usize,
    /// Accumulated offset of consumed source frames.
    src_offset: u64,
    /// Accumulated offset of produced destination frames.
    dst_offset: u64,
    /// Destination rate times 100.
    to_times_100: u64,
    /// Source rate times 100.
    from_times_100: u64,
    /// The rate factor `to / from`.
    f: f64,
}

impl LinearResampler {
    /// Creates a resampler for `num_channels` interleaved channels of
    /// `sample_bytes`-wide samples, converting `from` Hz to `to` Hz.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnsupportedSampleWidth`] unless `sample_bytes` is 2 or
    /// 4; [`ConfigError::ZeroFrameRate`] when either rate is not positive.
    pub fn new(
        num_channels: usize,
        sample_bytes: usize,
        from: f64,
        to: f64,
    ) -> Result<Self, ConfigError> {
        if sample_bytes != 2 && sample_bytes != 4 {
            return Err(ConfigError::UnsupportedSampleWidth {
                width: sample_bytes,
            });
        }
        if from <= 0.0 || to <= 0.0 {
            return Err(ConfigError::ZeroFrameRate);
        }
        let mut lr = Self {
            num_channels,
            frame_bytes: num_channels * sample_bytes,
            sample_bytes,
            src_offset: 0,
            dst_offset: 0,
            to_times_100: 0,
            from_times_100: 0,
            f: 0.0,
        };
        lr.set_rates(from, to);
        Ok(lr)
    }

    /// Sets new source and destination rates and resets the accumulated
    /// offsets.
    ///
    /// Used when a device's estimated real rate changes mid-stream.
    pub fn set_rates(&mut self, from: f64, to: f64) {
        self.f = to / from;
        self.to_times_100 = (to * 100.0) as u64;
        self.from_times_100 = (from * 100.0) as u64;
        self.src_offset = 0;
        self.dst_offset = 0;
    }

    /// Returns `true` if the configured rates actually differ.
    #[must_use]
    pub fn is_needed(&self) -> bool {
        self.from_times_100 != self.to_times_100
    }

    /// Converts a count of output frames to the source frames needed to
    /// produce them, given the current offsets.
    ///
    /// When the resampled frame count is not enough to consume even one
    /// buffer at the current offset, one frame is still counted so the
    /// offsets can always advance.
    #[must_use]
    pub fn out_frames_to_in(&self, frames: usize) -> usize {
        if frames == 0 {
            return 0;
        }
        let in_frames = (self.dst_offset as f64 + frames as f64) / self.f;
        if in_frames > self.src_offset as f64 {
            1 + (in_frames - self.src_offset as f64) as usize
        } else {
            1
        }
    }

    /// Converts a count of input frames to the output frames they produce,
    /// given the current offsets.
    #[must_use]
    pub fn in_frames_to_out(&self, frames: usize) -> usize {
        if frames == 0 {
            return 0;
        }
        let out_frames = self.f * (self.src_offset as f64 + frames as f64 - 1.0);
        if out_frames > self.dst_offset as f64 {
            1 + (out_frames - self.dst_offset as f64) as usize
        } else {
            1
        }
    }

    /// Resamples interleaved frames from `src` into `dst`.
    ///
    /// `src_frames` holds the available source frame count on entry and the
    /// number of source frames actually consumed on return, so the caller
    /// can advance its own read cursor exactly. Returns the number of frames
    /// written to `dst`, at most `dst_frames`.
    ///
    /// Both slices must hold at least the stated frame counts at this
    /// resampler's frame width.
    pub fn resample(
        &mut self,
        src: &[u8],
        src_frames: &mut usize,
        dst: &mut [u8],
        dst_frames: usize,
    ) -> usize {
        // Corner cases, so the loop below can assume both indices start
        // valid at 0.
        if dst_frames == 0 || *src_frames == 0 {
            *src_frames = 0;
            return 0;
        }

        let mut src_idx = 0usize;
        let mut dst_idx = 0usize;

        while dst_idx <= dst_frames {
            let mut src_pos = (self.dst_offset + dst_idx as u64) as f64 / self.f;
            if src_pos > self.src_offset as f64 {
                src_pos -= self.src_offset as f64;
            } else {
                src_pos = 0.0;
            }
            src_idx = src_pos as usize;

            if src_pos > (*src_frames - 1) as f64 || dst_idx >= dst_frames {
                if src_pos > (*src_frames - 1) as f64 {
                    src_idx = *src_frames - 1;
                }
                // When this loop stops, dst_idx is always at the last used
                // index incremented by one.
                break;
            }

            let frac = src_pos - src_idx as f64;
            let last = src_idx == *src_frames - 1;
            if self.sample_bytes == 2 {
                self.interpolate_frame_i16(src, src_idx, dst, dst_idx, frac, last);
            } else {
                self.interpolate_frame_i32(src, src_idx, dst, dst_idx, frac, last);
            }

            dst_idx += 1;
        }

        *src_frames = src_idx + 1;

        self.src_offset += *src_frames as u64;
        self.dst_offset += dst_idx as u64;
        while self.src_offset > self.from_times_100 && self.dst_offset > self.to_times_100 {
            self.src_offset -= self.from_times_100;
            self.dst_offset -= self.to_times_100;
        }

        dst_idx
    }

    /// Interpolates one 16-bit frame. On the last source frame the samples
    /// are copied without interpolation; there is no data to extrapolate
    /// into.
    fn interpolate_frame_i16(
        &self,
        src: &[u8],
        src_idx: usize,
        dst: &mut [u8],
        dst_idx: usize,
        frac: f64,
        last: bool,
    ) {
        let in_base = src_idx * self.frame_bytes;
        let out_base = dst_idx * self.frame_bytes;
        for ch in 0..self.num_channels {
            let o = in_base + ch * 2;
            let s0 = i16::from_le_bytes([src[o], src[o + 1]]);
            let value = if last {
                s0
            } else {
                let n = o + self.frame_bytes;
                let s1 = i16::from_le_bytes([src[n], src[n + 1]]);
                (s0 as f64 + frac * (s1 as i32 - s0 as i32) as f64) as i16
            };
            let d = out_base + ch * 2;
            dst[d..d + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Interpolates one 32-bit frame.
    fn interpolate_frame_i32(
        &self,
        src: &[u8],
        src_idx: usize,
        dst: &mut [u8],
        dst_idx: usize,
        frac: f64,
        last: bool,
    ) {
        let in_base = src_idx * self.frame_bytes;
        let out_base = dst_idx * self.frame_bytes;
        for ch in 0..self.num_channels {
            let o = in_base + ch * 4;
            let s0 = i32::from_le_bytes([src[o], src[o + 1], src[o + 2], src[o + 3]]);
            let value = if last {
                s0
            } else {
                let n = o + self.frame_bytes;
                let s1 = i32::from_le_bytes([src[n], src[n + 1], src[n + 2], src[n + 3]]);
                (s0 as f64 + frac * (s1 as i64 - s0 as i64) as f64) as i32
            };
            let d = out_base + ch * 4;
            dst[d..d + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}
