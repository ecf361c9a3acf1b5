//! # sonomux
//!
//! Real-time audio multiplexing core.
//!
//! `sonomux` multiplexes many client audio streams onto a small number of
//! playback and capture devices. One dedicated scheduler thread repeatedly
//! fetches, mixes, converts, and transports fixed-size blocks of samples,
//! budgeting its own wake times from stream deadlines and device buffer
//! levels.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sonomux::{Engine, SchedulerConfig};
//! use sonomux::driver::VirtualDevice;
//!
//! let handle = Engine::start(SchedulerConfig::default(), None)?;
//!
//! handle.add_output_device(device_id, Box::new(VirtualDevice::output(format, 4096)))?;
//! handle.add_stream(stream, vec![device_id])?;
//!
//! // Audio runs on the scheduler thread until shutdown.
//! handle.shutdown()?;
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **Scheduler thread**: owns every device, stream, and buffer; runs the
//!   tick loop (fetch, capture, publish, write) and never blocks inside a
//!   tick.
//! - **Control thread(s)**: create and remove streams/devices by sending
//!   typed messages over a channel; nothing scheduler-owned is ever touched
//!   directly.
//! - **Ring regions**: each stream exchanges samples with its client through
//!   a double-buffered region with an acquire/commit contract; overruns and
//!   underruns are counted, never fatal.
//!
//! Device I/O errors detach the failing device and its attachments; other
//! devices in the same tick are unaffected.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod attach;
mod config;
mod device;
pub mod driver;
mod engine;
mod error;
mod event;
pub mod format;
mod ring;
mod scheduler;
mod stream;

pub use config::SchedulerConfig;
pub use device::{DeviceId, OpenDevice};
pub use engine::{ControlMessage, Engine, EngineHandle, EngineStats};
pub use error::{ClientError, ConfigError, DriverError, EngineError};
pub use event::{event_callback, EngineEvent, EventCallback};
pub use format::{AudioFormat, SampleFormat};
pub use ring::RingRegion;
pub use scheduler::SchedulerState;
pub use stream::{ClientStream, Direction, ScriptedClient, StreamClient, StreamId};
