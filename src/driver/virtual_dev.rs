//! Virtual audio endpoint for tests, CI, and loopback setups.
//!
//! A [`VirtualDevice`] implements the full [`DeviceDriver`] contract over an
//! in-memory SPSC ring, with a [`VirtualDeviceHandle`] on the other side
//! standing in for the hardware clock: tests feed capture data and consume
//! playback data explicitly, so every buffer level is deterministic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::driver::{DeviceDriver, DeviceState};
use crate::error::DriverError;
use crate::format::{duration_to_frames, AudioFormat};
use crate::stream::Direction;

/// An in-memory audio endpoint.
///
/// Playback: the scheduler writes frames into the device queue; the handle
/// consumes them like a DAC would. Capture: the handle feeds frames like an
/// ADC would; the scheduler reads them out.
pub struct VirtualDevice {
    format: AudioFormat,
    direction: Direction,
    state: DeviceState,
    buffer_frames: usize,
    out_prod: Option<HeapProd<u8>>,
    in_cons: Option<HeapCons<u8>>,
    /// Area handed out by `get_output_buffer`/`get_input_buffer`.
    staging: Vec<u8>,
    injected: Arc<Mutex<VecDeque<DriverError>>>,
    underruns: Arc<AtomicU64>,
    delay_frames: usize,
}

/// The hardware-clock side of a [`VirtualDevice`].
pub struct VirtualDeviceHandle {
    frame_bytes: usize,
    out_cons: Option<HeapCons<u8>>,
    in_prod: Option<HeapProd<u8>>,
    injected: Arc<Mutex<VecDeque<DriverError>>>,
    underruns: Arc<AtomicU64>,
}

impl VirtualDevice {
    /// Creates a playback endpoint holding up to `buffer_frames` frames.
    #[must_use]
    pub fn output(format: AudioFormat, buffer_frames: usize) -> (Self, VirtualDeviceHandle) {
        Self::build(format, buffer_frames, Direction::Playback)
    }

    /// Creates a capture endpoint holding up to `buffer_frames` frames.
    #[must_use]
    pub fn input(format: AudioFormat, buffer_frames: usize) -> (Self, VirtualDeviceHandle) {
        Self::build(format, buffer_frames, Direction::Capture)
    }

    fn build(
        format: AudioFormat,
        buffer_frames: usize,
        direction: Direction,
    ) -> (Self, VirtualDeviceHandle) {
        let frame_bytes = format.frame_bytes();
        let ring = HeapRb::<u8>::new(buffer_frames * frame_bytes);
        let (prod, cons) = ring.split();
        let injected = Arc::new(Mutex::new(VecDeque::new()));
        let underruns = Arc::new(AtomicU64::new(0));

        let (out_prod, in_cons, out_cons, in_prod) = match direction {
            Direction::Playback => (Some(prod), None, Some(cons), None),
            Direction::Capture => (None, Some(cons), None, Some(prod)),
        };

        let dev = Self {
            format,
            direction,
            state: DeviceState::Open,
            buffer_frames,
            out_prod,
            in_cons,
            staging: vec![0u8; buffer_frames * frame_bytes],
            injected: injected.clone(),
            underruns: underruns.clone(),
            delay_frames: 0,
        };
        let handle = VirtualDeviceHandle {
            frame_bytes,
            out_cons,
            in_prod,
            injected,
            underruns,
        };
        (dev, handle)
    }

    fn take_injected(&self) -> Result<(), DriverError> {
        match self.injected.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn queued(&self) -> usize {
        let bytes = match self.direction {
            Direction::Playback => self.out_prod.as_ref().map_or(0, |p| p.occupied_len()),
            Direction::Capture => self.in_cons.as_ref().map_or(0, |c| c.occupied_len()),
        };
        bytes / self.format.frame_bytes()
    }

    fn discard_input(&mut self, frames: usize) -> usize {
        let frame_bytes = self.format.frame_bytes();
        let Some(cons) = self.in_cons.as_mut() else {
            return 0;
        };
        let bytes = (frames * frame_bytes).min(cons.occupied_len());
        let mut sink = vec![0u8; bytes];
        let popped = cons.pop_slice(&mut sink);
        popped / frame_bytes
    }
}

impl DeviceDriver for VirtualDevice {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn buffer_size(&self) -> usize {
        self.buffer_frames
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.take_injected()?;
        self.state = DeviceState::NormalRun;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.take_injected()?;
        self.state = DeviceState::Open;
        Ok(())
    }

    fn set_no_stream(&mut self, enable: bool) -> Result<(), DriverError> {
        match (enable, self.state) {
            (true, DeviceState::NormalRun) => self.state = DeviceState::NoStreamRun,
            (false, DeviceState::NoStreamRun) => self.state = DeviceState::NormalRun,
            _ => {}
        }
        Ok(())
    }

    fn frames_queued(&mut self) -> Result<(usize, Option<Instant>), DriverError> {
        self.take_injected()?;
        Ok((self.queued(), Some(Instant::now())))
    }

    fn delay_frames(&mut self) -> Result<usize, DriverError> {
        self.take_injected()?;
        Ok(self.delay_frames + self.queued())
    }

    fn get_output_buffer(&mut self, frames: usize) -> Result<(&mut [u8], usize), DriverError> {
        self.take_injected()?;
        let frame_bytes = self.format.frame_bytes();
        let vacant = self.out_prod.as_ref().map_or(0, |p| p.vacant_len()) / frame_bytes;
        let granted = frames.min(vacant).min(self.buffer_frames);
        Ok((&mut self.staging[..granted * frame_bytes], granted))
    }

    fn put_output_buffer(
        &mut self,
        frames: usize,
        non_empty: Option<&mut bool>,
    ) -> Result<(), DriverError> {
        self.take_injected()?;
        let frame_bytes = self.format.frame_bytes();
        let bytes = frames * frame_bytes;
        if let Some(flag) = non_empty {
            *flag = self.staging[..bytes].iter().any(|&b| b != 0);
        }
        if let Some(prod) = self.out_prod.as_mut() {
            prod.push_slice(&self.staging[..bytes]);
        }
        // Keep data mixed beyond the commit addressable at the next grant's
        // origin, the way an mmap'd hardware ring would.
        self.staging.copy_within(bytes.., 0);
        Ok(())
    }

    fn get_input_buffer(&mut self, frames: usize) -> Result<(&[u8], usize), DriverError> {
        self.take_injected()?;
        let frame_bytes = self.format.frame_bytes();
        let granted = frames.min(self.queued());
        let bytes = granted * frame_bytes;
        if let Some(cons) = self.in_cons.as_mut() {
            cons.pop_slice(&mut self.staging[..bytes]);
        }
        Ok((&self.staging[..bytes], granted))
    }

    fn put_input_buffer(&mut self, _frames: usize) -> Result<(), DriverError> {
        self.take_injected()?;
        Ok(())
    }

    fn drop_frames_by_time(&mut self, duration: Duration) -> Result<usize, DriverError> {
        self.take_injected()?;
        let frames = duration_to_frames(duration, self.format.frame_rate as f64);
        Ok(self.discard_input(frames))
    }

    fn flush_buffer(&mut self) -> Result<usize, DriverError> {
        self.take_injected()?;
        let queued = self.queued();
        Ok(self.discard_input(queued))
    }

    fn should_wake(&self) -> bool {
        self.direction == Direction::Playback && self.state != DeviceState::Open
    }

    fn output_underrun(&mut self, _hw_level: usize, _written: usize) -> Result<(), DriverError> {
        self.take_injected()?;
        self.underruns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl VirtualDeviceHandle {
    /// Pops up to `frames` played frames, like a DAC consuming the buffer.
    pub fn consume_output(&mut self, frames: usize) -> Vec<u8> {
        let Some(cons) = self.out_cons.as_mut() else {
            return Vec::new();
        };
        let bytes = (frames * self.frame_bytes).min(cons.occupied_len());
        let mut out = vec![0u8; bytes];
        let popped = cons.pop_slice(&mut out);
        out.truncate(popped);
        out
    }

    /// Frames currently queued for playback.
    #[must_use]
    pub fn output_level(&self) -> usize {
        self.out_cons.as_ref().map_or(0, |c| c.occupied_len()) / self.frame_bytes
    }

    /// Feeds raw capture bytes, like an ADC filling the buffer. Returns the
    /// frames accepted.
    pub fn feed_input(&mut self, bytes: &[u8]) -> usize {
        let Some(prod) = self.in_prod.as_mut() else {
            return 0;
        };
        prod.push_slice(bytes) / self.frame_bytes
    }

    /// Feeds `frames` frames with every 16-bit sample slot set to `value`.
    pub fn feed_input_value(&mut self, value: i16, frames: usize) -> usize {
        let bytes: Vec<u8> = value
            .to_le_bytes()
            .into_iter()
            .cycle()
            .take(frames * self.frame_bytes)
            .collect();
        self.feed_input(&bytes)
    }

    /// Queues a [`DriverError`] to be returned from the next driver call.
    pub fn inject_error(&self, err: DriverError) {
        self.injected.lock().push_back(err);
    }

    /// Underrun recoveries the device has performed.
    #[must_use]
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn fmt() -> AudioFormat {
        AudioFormat::new(48000, 2, SampleFormat::S16LE)
    }

    #[test]
    fn test_output_write_and_consume() {
        let (mut dev, mut handle) = VirtualDevice::output(fmt(), 1024);
        dev.start().unwrap();

        let (area, granted) = dev.get_output_buffer(480).unwrap();
        assert_eq!(granted, 480);
        area.fill(0x11);
        dev.put_output_buffer(480, None).unwrap();

        assert_eq!(dev.frames_queued().unwrap().0, 480);
        assert_eq!(handle.output_level(), 480);

        let played = handle.consume_output(480);
        assert_eq!(played.len(), 480 * 4);
        assert!(played.iter().all(|&b| b == 0x11));
        assert_eq!(dev.frames_queued().unwrap().0, 0);
    }

    #[test]
    fn test_output_grant_bounded_by_space() {
        let (mut dev, _handle) = VirtualDevice::output(fmt(), 100);
        let (_, granted) = dev.get_output_buffer(64).unwrap();
        assert_eq!(granted, 64);
        dev.put_output_buffer(64, None).unwrap();
        // Only 36 frames of space left.
        let (_, granted) = dev.get_output_buffer(64).unwrap();
        assert_eq!(granted, 36);
    }

    #[test]
    fn test_non_empty_probe() {
        let (mut dev, _handle) = VirtualDevice::output(fmt(), 1024);
        let (area, _) = dev.get_output_buffer(16).unwrap();
        area.fill(0);
        let mut non_empty = true;
        dev.put_output_buffer(16, Some(&mut non_empty)).unwrap();
        assert!(!non_empty);

        let (area, _) = dev.get_output_buffer(16).unwrap();
        area[5] = 1;
        dev.put_output_buffer(16, Some(&mut non_empty)).unwrap();
        assert!(non_empty);
    }

    #[test]
    fn test_input_feed_and_read() {
        let (mut dev, mut handle) = VirtualDevice::input(fmt(), 1024);
        dev.start().unwrap();

        assert_eq!(handle.feed_input_value(1000, 300), 300);
        assert_eq!(dev.frames_queued().unwrap().0, 300);

        let (area, granted) = dev.get_input_buffer(200).unwrap();
        assert_eq!(granted, 200);
        let first = i16::from_le_bytes([area[0], area[1]]);
        assert_eq!(first, 1000);
        dev.put_input_buffer(granted).unwrap();

        assert_eq!(dev.frames_queued().unwrap().0, 100);
    }

    #[test]
    fn test_drop_frames_by_time() {
        let (mut dev, mut handle) = VirtualDevice::input(fmt(), 8192);
        handle.feed_input_value(7, 4800);

        // 50ms at 48kHz is 2400 frames.
        let dropped = dev.drop_frames_by_time(Duration::from_millis(50)).unwrap();
        assert_eq!(dropped, 2400);
        assert_eq!(dev.frames_queued().unwrap().0, 2400);
    }

    #[test]
    fn test_flush_buffer() {
        let (mut dev, mut handle) = VirtualDevice::input(fmt(), 1024);
        handle.feed_input_value(7, 500);
        assert_eq!(dev.flush_buffer().unwrap(), 500);
        assert_eq!(dev.frames_queued().unwrap().0, 0);
    }

    #[test]
    fn test_injected_error_surfaces_once() {
        let (mut dev, handle) = VirtualDevice::output(fmt(), 1024);
        handle.inject_error(DriverError::Io);
        assert!(matches!(dev.frames_queued(), Err(DriverError::Io)));
        assert!(dev.frames_queued().is_ok());
    }

    #[test]
    fn test_state_transitions() {
        let (mut dev, _handle) = VirtualDevice::output(fmt(), 1024);
        assert_eq!(dev.state(), DeviceState::Open);
        assert!(!dev.should_wake());

        dev.start().unwrap();
        assert_eq!(dev.state(), DeviceState::NormalRun);
        assert!(dev.should_wake());

        dev.set_no_stream(true).unwrap();
        assert_eq!(dev.state(), DeviceState::NoStreamRun);
        dev.set_no_stream(false).unwrap();
        assert_eq!(dev.state(), DeviceState::NormalRun);

        dev.stop().unwrap();
        assert_eq!(dev.state(), DeviceState::Open);
    }

    #[test]
    fn test_capture_device_never_wakes_as_output() {
        let (mut dev, _handle) = VirtualDevice::input(fmt(), 1024);
        dev.start().unwrap();
        assert!(!dev.should_wake());
    }
}
