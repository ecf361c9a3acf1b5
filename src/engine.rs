//! Engine control plane and the dedicated scheduler thread.
//!
//! The engine spawns one thread that owns a [`SchedulerState`] and runs the
//! tick loop. Control operations (stream and device add/remove, volume,
//! mute) are published to it as typed messages over a bounded channel;
//! sends never block, and the scheduler drains everything pending at the top
//! of each wake. Nothing scheduler-owned is ever touched from the control
//! side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::device::DeviceId;
use crate::driver::DeviceDriver;
use crate::error::EngineError;
use crate::event::EventCallback;
use crate::scheduler::SchedulerState;
use crate::stream::{ClientStream, StreamId};

/// Depth of the control channel. Senders get backpressure instead of
/// blocking when the scheduler falls this far behind.
const CONTROL_QUEUE_DEPTH: usize = 64;

/// Outer wait when no device demands a wake time.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Control-plane requests handled by the scheduler thread between ticks.
pub enum ControlMessage {
    /// Register an output device.
    AddOutputDevice {
        /// Device id, unique per engine.
        id: DeviceId,
        /// The endpoint driver.
        driver: Box<dyn DeviceDriver>,
    },
    /// Register (and start) an input device.
    AddInputDevice {
        /// Device id, unique per engine.
        id: DeviceId,
        /// The endpoint driver.
        driver: Box<dyn DeviceDriver>,
    },
    /// Close a device, detaching all of its streams.
    RemoveDevice {
        /// Device to close.
        id: DeviceId,
    },
    /// Register a stream and attach it to the listed devices.
    AddStream {
        /// The stream, fully constructed by the control side.
        stream: ClientStream,
        /// Devices to attach to.
        devices: Vec<DeviceId>,
    },
    /// Detach a stream everywhere and destroy it.
    RemoveStream {
        /// Stream to remove.
        id: StreamId,
    },
    /// Set a stream's volume scaler.
    SetStreamVolume {
        /// Target stream.
        id: StreamId,
        /// Volume in `[0.0, 1.0]`.
        volume: f32,
    },
    /// Mute or unmute a stream.
    SetStreamMute {
        /// Target stream.
        id: StreamId,
        /// New mute state.
        mute: bool,
    },
    /// Stop the scheduler thread.
    Shutdown,
}

/// Scheduler-side counters shared with the control plane.
#[derive(Default)]
pub(crate) struct EngineStatsInner {
    ticks: AtomicU64,
    frames_written: AtomicU64,
    frames_captured: AtomicU64,
    drops: AtomicU64,
    devices_removed: AtomicU64,
}

impl EngineStatsInner {
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_written(&self, frames: u64) {
        self.frames_written.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_captured(&self, frames: u64) {
        self.frames_captured.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_device_removed(&self) {
        self.devices_removed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A snapshot of engine activity.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Scheduler ticks executed.
    pub ticks: u64,
    /// Frames committed to output devices.
    pub frames_written: u64,
    /// Frames read from input devices.
    pub frames_captured: u64,
    /// Deliberate backlog drops performed.
    pub drops: u64,
    /// Devices removed after errors or close requests.
    pub devices_removed: u64,
}

/// Entry point for running the scheduler on its own thread.
pub struct Engine;

impl Engine {
    /// Spawns the scheduler thread and returns the control handle.
    pub fn start(
        config: SchedulerConfig,
        event_cb: Option<EventCallback>,
    ) -> Result<EngineHandle, EngineError> {
        let (tx, rx) = mpsc::sync_channel::<ControlMessage>(CONTROL_QUEUE_DEPTH);
        let scheduler = SchedulerState::with_events(config, event_cb);
        let stats = scheduler.stats_handle();

        let thread = std::thread::Builder::new()
            .name("sonomux-io".to_string())
            .spawn(move || run_loop(scheduler, &rx))
            .map_err(|_| EngineError::NotRunning)?;

        Ok(EngineHandle {
            tx,
            stats,
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// The scheduler thread: block until the earliest device wake or a control
/// message, drain the control queue, run one tick.
fn run_loop(mut scheduler: SchedulerState, rx: &mpsc::Receiver<ControlMessage>) {
    info!("scheduler thread running");
    loop {
        let now = Instant::now();
        let timeout = scheduler
            .next_wake(now)
            .map_or(IDLE_WAIT, |ts| ts.saturating_duration_since(now));

        let first = match rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut shutdown = false;
        if let Some(msg) = first {
            shutdown |= handle_message(&mut scheduler, msg);
            // Drain whatever else arrived; messages are fire-and-forget.
            while let Ok(msg) = rx.try_recv() {
                shutdown |= handle_message(&mut scheduler, msg);
            }
        }
        if shutdown {
            break;
        }

        scheduler.run(Instant::now());
    }
    info!("scheduler thread exiting");
}

/// Applies one control message. Returns `true` on shutdown.
fn handle_message(scheduler: &mut SchedulerState, msg: ControlMessage) -> bool {
    let now = Instant::now();
    match msg {
        ControlMessage::AddOutputDevice { id, driver } => {
            scheduler.add_output_device(id, driver);
        }
        ControlMessage::AddInputDevice { id, driver } => {
            scheduler.add_input_device(id, driver);
        }
        ControlMessage::RemoveDevice { id } => {
            scheduler.remove_device(id, now);
        }
        ControlMessage::AddStream { stream, devices } => {
            let id = stream.id();
            if let Err(err) = scheduler.append_stream(stream, &devices, now) {
                warn!(stream = %id, %err, "stream rejected");
            }
        }
        ControlMessage::RemoveStream { id } => {
            scheduler.remove_stream(id);
        }
        ControlMessage::SetStreamVolume { id, volume } => {
            scheduler.set_stream_volume(id, volume);
        }
        ControlMessage::SetStreamMute { id, mute } => {
            scheduler.set_stream_mute(id, mute);
        }
        ControlMessage::Shutdown => return true,
    }
    false
}

/// Handle to a running engine.
///
/// All methods are non-blocking; requests are queued for the scheduler
/// thread and applied between ticks. Dropping the handle shuts the engine
/// down (best effort); prefer an explicit [`shutdown`](Self::shutdown).
pub struct EngineHandle {
    tx: SyncSender<ControlMessage>,
    stats: Arc<EngineStatsInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EngineHandle {
    fn send(&self, msg: ControlMessage) -> Result<(), EngineError> {
        self.tx.try_send(msg).map_err(|err| match err {
            TrySendError::Full(_) => EngineError::ChannelClosed,
            TrySendError::Disconnected(_) => EngineError::NotRunning,
        })
    }

    /// Registers an output device.
    pub fn add_output_device(
        &self,
        id: DeviceId,
        driver: Box<dyn DeviceDriver>,
    ) -> Result<(), EngineError> {
        self.send(ControlMessage::AddOutputDevice { id, driver })
    }

    /// Registers an input device.
    pub fn add_input_device(
        &self,
        id: DeviceId,
        driver: Box<dyn DeviceDriver>,
    ) -> Result<(), EngineError> {
        self.send(ControlMessage::AddInputDevice { id, driver })
    }

    /// Closes a device, detaching all of its streams.
    pub fn remove_device(&self, id: DeviceId) -> Result<(), EngineError> {
        self.send(ControlMessage::RemoveDevice { id })
    }

    /// Registers a stream and attaches it to the listed devices.
    pub fn add_stream(
        &self,
        stream: ClientStream,
        devices: Vec<DeviceId>,
    ) -> Result<(), EngineError> {
        self.send(ControlMessage::AddStream { stream, devices })
    }

    /// Detaches a stream everywhere and destroys it.
    pub fn remove_stream(&self, id: StreamId) -> Result<(), EngineError> {
        self.send(ControlMessage::RemoveStream { id })
    }

    /// Sets a stream's volume scaler.
    pub fn set_stream_volume(&self, id: StreamId, volume: f32) -> Result<(), EngineError> {
        self.send(ControlMessage::SetStreamVolume { id, volume })
    }

    /// Mutes or unmutes a stream.
    pub fn set_stream_mute(&self, id: StreamId, mute: bool) -> Result<(), EngineError> {
        self.send(ControlMessage::SetStreamMute { id, mute })
    }

    /// Returns a snapshot of engine activity.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_captured: self.stats.frames_captured.load(Ordering::Relaxed),
            drops: self.stats.drops.load(Ordering::Relaxed),
            devices_removed: self.stats.devices_removed.load(Ordering::Relaxed),
        }
    }

    /// Stops the scheduler thread and waits for it to exit.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        // A full queue still shuts down: dropping the sender is detected by
        // the outer wait, but the explicit message is faster.
        let _ = self.tx.try_send(ControlMessage::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            thread.join().map_err(|_| EngineError::NotRunning)?;
        }
        Ok(())
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.tx.try_send(ControlMessage::Shutdown);
    }
}
