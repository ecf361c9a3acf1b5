//! CPAL-backed hardware endpoints (feature `cpal-backend`).
//!
//! CPAL streams are callback-driven and not `Send`, so an endpoint is split
//! in two: an RAII [`CpalStream`] that owns the CPAL stream and must stay on
//! the thread that opened it, and a driver half that talks to the callback
//! through a lock-free SPSC ring and can move to the scheduler thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::driver::{DeviceDriver, DeviceState};
use crate::error::DriverError;
use crate::format::{duration_to_frames, AudioFormat, SampleFormat};
use crate::stream::Direction;

/// Keeps a CPAL stream alive. Audio flows while this exists; dropping it
/// stops the hardware.
pub struct CpalStream {
    _stream: cpal::Stream,
}

/// Driver half of a CPAL playback endpoint.
pub struct CpalOutputDriver {
    format: AudioFormat,
    buffer_frames: usize,
    prod: HeapProd<i16>,
    staging: Vec<u8>,
    running: Arc<AtomicBool>,
    state: DeviceState,
}

/// Driver half of a CPAL capture endpoint.
pub struct CpalInputDriver {
    format: AudioFormat,
    buffer_frames: usize,
    cons: HeapCons<i16>,
    staging: Vec<u8>,
    running: Arc<AtomicBool>,
    state: DeviceState,
}

fn open_device(name: Option<&str>, input: bool) -> Result<cpal::Device, DriverError> {
    let host = cpal::default_host();
    match name {
        Some(name) => {
            let devices = if input {
                host.input_devices()
            } else {
                host.output_devices()
            }
            .map_err(|e| DriverError::failed(e.to_string()))?;
            for device in devices {
                if device.name().is_ok_and(|n| n == name) {
                    return Ok(device);
                }
            }
            Err(DriverError::failed(format!("device not found: {name}")))
        }
        None => {
            let device = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            device.ok_or_else(|| DriverError::failed("no default device"))
        }
    }
}

fn cpal_config(format: AudioFormat) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.frame_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Opens a playback endpoint on the named (or default) output device.
///
/// Only `S16LE` is bridged; wider formats would need a converting callback.
pub fn open_output(
    name: Option<&str>,
    format: AudioFormat,
    buffer_frames: usize,
) -> Result<(CpalStream, CpalOutputDriver), DriverError> {
    if format.sample_format != SampleFormat::S16LE {
        return Err(DriverError::failed("cpal backend bridges S16LE only"));
    }
    let device = open_device(name, false)?;
    let ring = HeapRb::<i16>::new(buffer_frames * format.channels as usize);
    let (prod, mut cons) = ring.split();
    let running = Arc::new(AtomicBool::new(false));
    let running_cb = running.clone();

    let stream = device
        .build_output_stream(
            &cpal_config(format),
            move |data: &mut [i16], _| {
                let popped = if running_cb.load(Ordering::Relaxed) {
                    cons.pop_slice(data)
                } else {
                    0
                };
                // Underfill is silence, never stale samples.
                for sample in &mut data[popped..] {
                    *sample = 0;
                }
            },
            |err| tracing::warn!(%err, "cpal output stream error"),
            None,
        )
        .map_err(|e| DriverError::failed(e.to_string()))?;
    stream
        .play()
        .map_err(|e| DriverError::failed(e.to_string()))?;

    let driver = CpalOutputDriver {
        format,
        buffer_frames,
        prod,
        staging: vec![0u8; buffer_frames * format.frame_bytes()],
        running,
        state: DeviceState::Open,
    };
    Ok((CpalStream { _stream: stream }, driver))
}

/// Opens a capture endpoint on the named (or default) input device.
pub fn open_input(
    name: Option<&str>,
    format: AudioFormat,
    buffer_frames: usize,
) -> Result<(CpalStream, CpalInputDriver), DriverError> {
    if format.sample_format != SampleFormat::S16LE {
        return Err(DriverError::failed("cpal backend bridges S16LE only"));
    }
    let device = open_device(name, true)?;
    let ring = HeapRb::<i16>::new(buffer_frames * format.channels as usize);
    let (mut prod, cons) = ring.split();
    let running = Arc::new(AtomicBool::new(false));
    let running_cb = running.clone();

    let stream = device
        .build_input_stream(
            &cpal_config(format),
            move |data: &[i16], _| {
                if running_cb.load(Ordering::Relaxed) {
                    // Overflow drops the newest samples; the scheduler's
                    // backlog policy deals with sustained pressure.
                    let _ = prod.push_slice(data);
                }
            },
            |err| tracing::warn!(%err, "cpal input stream error"),
            None,
        )
        .map_err(|e| DriverError::failed(e.to_string()))?;
    stream
        .play()
        .map_err(|e| DriverError::failed(e.to_string()))?;

    let driver = CpalInputDriver {
        format,
        buffer_frames,
        cons,
        staging: vec![0u8; buffer_frames * format.frame_bytes()],
        running,
        state: DeviceState::Open,
    };
    Ok((CpalStream { _stream: stream }, driver))
}

impl DeviceDriver for CpalOutputDriver {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn direction(&self) -> Direction {
        Direction::Playback
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn buffer_size(&self) -> usize {
        self.buffer_frames
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.running.store(true, Ordering::Relaxed);
        self.state = DeviceState::NormalRun;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.running.store(false, Ordering::Relaxed);
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
        let frames = self.prod.occupied_len() / self.format.channels as usize;
        Ok((frames, Some(Instant::now())))
    }

    fn delay_frames(&mut self) -> Result<usize, DriverError> {
        // The SPSC ring is the only buffer we can see; device-internal
        // latency is not reported by every CPAL host.
        Ok(self.prod.occupied_len() / self.format.channels as usize)
    }

    fn get_output_buffer(&mut self, frames: usize) -> Result<(&mut [u8], usize), DriverError> {
        let frame_bytes = self.format.frame_bytes();
        let vacant = self.prod.vacant_len() / self.format.channels as usize;
        let granted = frames.min(vacant).min(self.buffer_frames);
        Ok((&mut self.staging[..granted * frame_bytes], granted))
    }

    fn put_output_buffer(
        &mut self,
        frames: usize,
        non_empty: Option<&mut bool>,
    ) -> Result<(), DriverError> {
        let bytes = frames * self.format.frame_bytes();
        if let Some(flag) = non_empty {
            *flag = self.staging[..bytes].iter().any(|&b| b != 0);
        }
        let samples: Vec<i16> = self.staging[..bytes]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        self.prod.push_slice(&samples);
        // Preserve frames mixed beyond the commit at the next grant's
        // origin.
        self.staging.copy_within(bytes.., 0);
        Ok(())
    }

    fn get_input_buffer(&mut self, _frames: usize) -> Result<(&[u8], usize), DriverError> {
        Err(DriverError::failed("output endpoint cannot capture"))
    }

    fn put_input_buffer(&mut self, _frames: usize) -> Result<(), DriverError> {
        Err(DriverError::failed("output endpoint cannot capture"))
    }

    fn drop_frames_by_time(&mut self, _duration: Duration) -> Result<usize, DriverError> {
        Ok(0)
    }

    fn flush_buffer(&mut self) -> Result<usize, DriverError> {
        Ok(0)
    }

    fn should_wake(&self) -> bool {
        self.state != DeviceState::Open
    }

    fn output_underrun(&mut self, _hw_level: usize, _written: usize) -> Result<(), DriverError> {
        // The callback already substitutes silence on underfill.
        Ok(())
    }
}

impl DeviceDriver for CpalInputDriver {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn direction(&self) -> Direction {
        Direction::Capture
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn buffer_size(&self) -> usize {
        self.buffer_frames
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.running.store(true, Ordering::Relaxed);
        self.state = DeviceState::NormalRun;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.running.store(false, Ordering::Relaxed);
        self.state = DeviceState::Open;
        Ok(())
    }

    fn frames_queued(&mut self) -> Result<(usize, Option<Instant>), DriverError> {
        let frames = self.cons.occupied_len() / self.format.channels as usize;
        Ok((frames, Some(Instant::now())))
    }

    fn delay_frames(&mut self) -> Result<usize, DriverError> {
        Ok(self.cons.occupied_len() / self.format.channels as usize)
    }

    fn get_output_buffer(&mut self, _frames: usize) -> Result<(&mut [u8], usize), DriverError> {
        Err(DriverError::failed("input endpoint cannot play"))
    }

    fn put_output_buffer(
        &mut self,
        _frames: usize,
        _non_empty: Option<&mut bool>,
    ) -> Result<(), DriverError> {
        Err(DriverError::failed("input endpoint cannot play"))
    }

    fn get_input_buffer(&mut self, frames: usize) -> Result<(&[u8], usize), DriverError> {
        let channels = self.format.channels as usize;
        let queued = self.cons.occupied_len() / channels;
        let granted = frames.min(queued);
        let mut samples = vec![0i16; granted * channels];
        let popped = self.cons.pop_slice(&mut samples);
        let bytes = popped * 2;
        for (i, sample) in samples[..popped].iter().enumerate() {
            self.staging[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
        }
        Ok((&self.staging[..bytes], popped / channels))
    }

    fn put_input_buffer(&mut self, _frames: usize) -> Result<(), DriverError> {
        Ok(())
    }

    fn drop_frames_by_time(&mut self, duration: Duration) -> Result<usize, DriverError> {
        let channels = self.format.channels as usize;
        let frames = duration_to_frames(duration, self.format.frame_rate as f64);
        let want = frames * channels;
        let mut sink = vec![0i16; want.min(self.cons.occupied_len())];
        let popped = self.cons.pop_slice(&mut sink);
        Ok(popped / channels)
    }

    fn flush_buffer(&mut self) -> Result<usize, DriverError> {
        let channels = self.format.channels as usize;
        let mut sink = vec![0i16; self.cons.occupied_len()];
        let popped = self.cons.pop_slice(&mut sink);
        Ok(popped / channels)
    }

    fn should_wake(&self) -> bool {
        false
    }

    fn output_underrun(&mut self, _hw_level: usize, _written: usize) -> Result<(), DriverError> {
        Ok(())
    }
}
