//! Format conversion between stream and device formats.
//!
//! A converter bridges one fixed format pair: channel layout first, then
//! sample rate. Sample widths must match on both sides; rate conversion is
//! delegated to the [`LinearResampler`] so conversion state survives across
//! arbitrarily split buffers.

use crate::error::ConfigError;
use crate::format::resample::LinearResampler;
use crate::format::AudioFormat;

/// Converts interleaved PCM between two formats.
///
/// Supported pairings: equal sample widths; channel counts equal, mono to
/// stereo, or stereo to mono; any rate pair. Construction fails for
/// anything else, and the stream must then not be attached to the device.
pub struct FormatConverter {
    from: AudioFormat,
    to: AudioFormat,
    resampler: Option<LinearResampler>,
    /// Scratch for the channel stage when a rate stage follows it.
    scratch: Vec<u8>,
}

/// Returns `true` if `a` and `b` differ in any way that requires a
/// converter between them.
#[must_use]
pub fn conversion_needed(a: &AudioFormat, b: &AudioFormat) -> bool {
    a != b
}

impl FormatConverter {
    /// Creates a converter from `from` to `to`, able to process up to
    /// `max_frames` input frames per call.
    pub fn new(from: AudioFormat, to: AudioFormat, max_frames: usize) -> Result<Self, ConfigError> {
        if from.sample_format != to.sample_format {
            return Err(ConfigError::IncompatibleFormats {
                stream: from.to_string(),
                device: to.to_string(),
                reason: "sample widths differ".to_string(),
            });
        }
        let ch_ok = from.channels == to.channels
            || (from.channels == 1 && to.channels == 2)
            || (from.channels == 2 && to.channels == 1);
        if !ch_ok {
            return Err(ConfigError::IncompatibleFormats {
                stream: from.to_string(),
                device: to.to_string(),
                reason: format!(
                    "no channel mapping from {} to {} channels",
                    from.channels, to.channels
                ),
            });
        }

        let resampler = if from.frame_rate != to.frame_rate {
            Some(LinearResampler::new(
                to.channels as usize,
                to.sample_format.sample_bytes(),
                from.frame_rate as f64,
                to.frame_rate as f64,
            )?)
        } else {
            None
        };

        // The channel stage needs somewhere to put its output when a rate
        // stage follows it.
        let scratch = if resampler.is_some() && from.channels != to.channels {
            vec![0u8; max_frames * to.frame_bytes()]
        } else {
            Vec::new()
        };

        Ok(Self {
            from,
            to,
            resampler,
            scratch,
        })
    }

    /// The input format.
    #[must_use]
    pub fn from_format(&self) -> &AudioFormat {
        &self.from
    }

    /// The output format.
    #[must_use]
    pub fn to_format(&self) -> &AudioFormat {
        &self.to
    }

    /// Updates the rate pair, typically with a device's estimated real rate.
    ///
    /// No-op when the converter has no rate stage.
    pub fn set_rates(&mut self, from: f64, to: f64) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.set_rates(from, to);
        }
    }

    /// Projects an input frame count to the output frames it produces.
    #[must_use]
    pub fn in_frames_to_out(&self, frames: usize) -> usize {
        match &self.resampler {
            Some(r) => r.in_frames_to_out(frames),
            None => frames,
        }
    }

    /// Projects an output frame count to the input frames needed for it.
    #[must_use]
    pub fn out_frames_to_in(&self, frames: usize) -> usize {
        match &self.resampler {
            Some(r) => r.out_frames_to_in(frames),
            None => frames,
        }
    }

    /// Converts up to `*src_frames` input frames into at most `dst_frames`
    /// output frames in `dst`.
    ///
    /// On return `*src_frames` holds the input frames actually consumed.
    /// Returns the output frames written.
    pub fn convert(
        &mut self,
        src: &[u8],
        src_frames: &mut usize,
        dst: &mut [u8],
        dst_frames: usize,
    ) -> usize {
        match (&mut self.resampler, self.from.channels != self.to.channels) {
            (None, false) => {
                // Pure copy.
                let n = (*src_frames).min(dst_frames);
                let bytes = n * self.to.frame_bytes();
                dst[..bytes].copy_from_slice(&src[..bytes]);
                *src_frames = n;
                n
            }
            (None, true) => {
                let n = (*src_frames).min(dst_frames);
                convert_channels(&self.from, &self.to, src, dst, n);
                *src_frames = n;
                n
            }
            (Some(resampler), false) => resampler.resample(src, src_frames, dst, dst_frames),
            (Some(resampler), true) => {
                let scratch_cap = self.scratch.len() / self.to.frame_bytes();
                let mut n = (*src_frames).min(scratch_cap);
                convert_channels(&self.from, &self.to, src, &mut self.scratch, n);
                let written = resampler.resample(&self.scratch, &mut n, dst, dst_frames);
                *src_frames = n;
                written
            }
        }
    }
}

/// Converts `frames` frames between channel layouts. Rates and widths of
/// `from` and `to` are assumed equal except for the channel count.
fn convert_channels(from: &AudioFormat, to: &AudioFormat, src: &[u8], dst: &mut [u8], frames: usize) {
    let width = from.sample_format.sample_bytes();
    match (from.channels, to.channels) {
        (1, 2) => {
            for i in 0..frames {
                let s = i * width;
                let d = i * 2 * width;
                dst[d..d + width].copy_from_slice(&src[s..s + width]);
                dst[d + width..d + 2 * width].copy_from_slice(&src[s..s + width]);
            }
        }
        (2, 1) => {
            for i in 0..frames {
                let s = i * 2 * width;
                let d = i * width;
                if width == 2 {
                    let l = i16::from_le_bytes([src[s], src[s + 1]]) as i32;
                    let r = i16::from_le_bytes([src[s + 2], src[s + 3]]) as i32;
                    let m = ((l + r) / 2) as i16;
                    dst[d..d + 2].copy_from_slice(&m.to_le_bytes());
                } else {
                    let l = i32::from_le_bytes([src[s], src[s + 1], src[s + 2], src[s + 3]]) as i64;
                    let r = i32::from_le_bytes([
                        src[s + 4],
                        src[s + 5],
                        src[s + 6],
                        src[s + 7],
                    ]) as i64;
                    let m = ((l + r) / 2) as i32;
                    dst[d..d + 4].copy_from_slice(&m.to_le_bytes());
                }
            }
        }
        _ => {
            let bytes = frames * from.frame_bytes();
            dst[..bytes].copy_from_slice(&src[..bytes]);
        }
    }
}
