//! Audio formats, frame math, conversion, and mixing.

pub mod convert;
pub mod mix;
pub mod resample;

pub use convert::FormatConverter;
pub use resample::LinearResampler;

use std::fmt;
use std::time::Duration;

/// Integer PCM sample encodings supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian.
    #[default]
    S16LE,
    /// Signed 32-bit little-endian.
    S32LE,
}

impl SampleFormat {
    /// Returns the size of one sample in bytes.
    #[must_use]
    pub fn sample_bytes(self) -> usize {
        match self {
            Self::S16LE => 2,
            Self::S32LE => 4,
        }
    }
}

/// The format of an audio stream or device: rate, channel count, encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Frame rate in Hz (e.g. 16000, 44100, 48000).
    pub frame_rate: u32,
    /// Number of interleaved channels (1 = mono, 2 = stereo).
    pub channels: u16,
    /// Sample encoding.
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    /// Creates a new format.
    #[must_use]
    pub fn new(frame_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            frame_rate,
            channels,
            sample_format,
        }
    }

    /// Returns the size of one interleaved frame in bytes.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.sample_bytes() * self.channels as usize
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{:?}",
            self.frame_rate, self.channels, self.sample_format
        )
    }
}

/// Converts a frame count at `from_rate` to the equivalent count at
/// `to_rate`, rounding to nearest.
#[must_use]
pub fn frames_at_rate(from_rate: u32, frames: usize, to_rate: u32) -> usize {
    if from_rate == 0 {
        return 0;
    }
    (frames as u64 * to_rate as u64 + from_rate as u64 / 2) as usize / from_rate as usize
}

/// Returns the play/capture time of `frames` frames at `rate` Hz.
#[must_use]
pub fn frames_to_duration(frames: usize, rate: f64) -> Duration {
    if rate <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / rate)
}

/// Returns how many frames at `rate` Hz fit in `duration`.
#[must_use]
pub fn duration_to_frames(duration: Duration, rate: f64) -> usize {
    if rate <= 0.0 {
        return 0;
    }
    (duration.as_secs_f64() * rate) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        assert_eq!(fmt.frame_bytes(), 4);

        let fmt = AudioFormat::new(48000, 2, SampleFormat::S32LE);
        assert_eq!(fmt.frame_bytes(), 8);
    }

    #[test]
    fn test_frames_at_rate() {
        // 480 frames at 48kHz is 10ms, which is 441 frames at 44.1kHz.
        assert_eq!(frames_at_rate(48000, 480, 44100), 441);
        assert_eq!(frames_at_rate(44100, 441, 48000), 480);
        // Identity.
        assert_eq!(frames_at_rate(48000, 480, 48000), 480);
        // Degenerate rate.
        assert_eq!(frames_at_rate(0, 480, 48000), 0);
    }

    #[test]
    fn test_frames_duration_round_trip() {
        let dur = frames_to_duration(480, 48000.0);
        assert_eq!(dur, Duration::from_millis(10));
        assert_eq!(duration_to_frames(dur, 48000.0), 480);
    }

    #[test]
    fn test_duration_zero_rate() {
        assert_eq!(frames_to_duration(480, 0.0), Duration::ZERO);
        assert_eq!(duration_to_frames(Duration::from_millis(10), 0.0), 0);
    }

    #[test]
    fn test_format_display() {
        let fmt = AudioFormat::new(44100, 1, SampleFormat::S16LE);
        assert_eq!(fmt.to_string(), "44100Hz/1ch/S16LE");
    }
}
