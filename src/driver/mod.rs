//! Device driver abstraction and bundled endpoints.
//!
//! A [`DeviceDriver`] is one hardware or virtual audio endpoint as the
//! scheduler sees it: a non-blocking buffer-level/buffer-transfer capability
//! set. Every operation returns immediately; hardware failure surfaces as a
//! [`DriverError`](crate::DriverError), which removes the device from the
//! engine.

mod virtual_dev;

#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;

pub use virtual_dev::{VirtualDevice, VirtualDeviceHandle};

use std::time::{Duration, Instant};

use crate::error::DriverError;
use crate::format::AudioFormat;
use crate::stream::Direction;

/// Run state of an open device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Opened but not yet running.
    Open,
    /// Running with at least one stream actively attached.
    NormalRun,
    /// Running but keeping itself alive without streams (filling silence or
    /// discarding input).
    NoStreamRun,
}

/// One audio endpoint, physical or virtual.
///
/// All operations are non-blocking. The scheduler calls these from its
/// dedicated thread only; implementations never need internal locking for
/// scheduler-side state, but callback-fed endpoints may share SPSC buffers
/// with an audio callback thread.
pub trait DeviceDriver: Send {
    /// The device's configured format.
    fn format(&self) -> AudioFormat;

    /// Whether this endpoint plays or captures.
    fn direction(&self) -> Direction;

    /// Current run state.
    fn state(&self) -> DeviceState;

    /// Total hardware buffer size in frames.
    fn buffer_size(&self) -> usize;

    /// Starts the device (transition out of [`DeviceState::Open`]).
    fn start(&mut self) -> Result<(), DriverError>;

    /// Stops the device and returns it to [`DeviceState::Open`].
    fn stop(&mut self) -> Result<(), DriverError>;

    /// Switches between running-with-streams and running-without-streams.
    ///
    /// Endpoints that do not distinguish the two may ignore this.
    fn set_no_stream(&mut self, _enable: bool) -> Result<(), DriverError> {
        Ok(())
    }

    /// Frames currently queued in the hardware buffer, with the timestamp of
    /// the level reading when the endpoint can provide one.
    ///
    /// A `None` timestamp means the level cannot be correlated with a clock;
    /// rate estimation is skipped for that reading.
    fn frames_queued(&mut self) -> Result<(usize, Option<Instant>), DriverError>;

    /// Frames of latency between the buffer and the ADC/DAC.
    fn delay_frames(&mut self) -> Result<usize, DriverError>;

    /// Acquires up to `frames` frames of writable output buffer.
    ///
    /// Returns the area and the frames actually granted; the grant may be
    /// smaller when the hardware ring wraps. Must be committed with
    /// [`put_output_buffer`](Self::put_output_buffer).
    fn get_output_buffer(&mut self, frames: usize) -> Result<(&mut [u8], usize), DriverError>;

    /// Commits `frames` frames written into the acquired output area.
    ///
    /// When `non_empty` is given, the endpoint reports whether the committed
    /// span contained any non-zero sample.
    fn put_output_buffer(
        &mut self,
        frames: usize,
        non_empty: Option<&mut bool>,
    ) -> Result<(), DriverError>;

    /// Acquires up to `frames` frames of captured input.
    fn get_input_buffer(&mut self, frames: usize) -> Result<(&[u8], usize), DriverError>;

    /// Releases `frames` frames of the acquired input area back to the
    /// hardware.
    fn put_input_buffer(&mut self, frames: usize) -> Result<(), DriverError>;

    /// Discards roughly `duration` of queued capture audio. Returns the
    /// frames dropped.
    fn drop_frames_by_time(&mut self, duration: Duration) -> Result<usize, DriverError>;

    /// Discards everything queued. Returns the frames flushed.
    fn flush_buffer(&mut self) -> Result<usize, DriverError>;

    /// Whether the scheduler should compute a wake time for this device.
    ///
    /// Output devices that are running return `true`; stopped or
    /// free-running endpoints return `false`.
    fn should_wake(&self) -> bool;

    /// Device-specific underrun recovery, called when the hardware level
    /// after a write is at or below the frames just written.
    fn output_underrun(&mut self, hw_level: usize, written: usize) -> Result<(), DriverError>;
}
