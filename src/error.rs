//! Error types for sonomux.
//!
//! Errors are split into three categories:
//! - **Configuration-fatal** ([`ConfigError`]): reject a stream/device pairing
//!   up front; nothing is registered.
//! - **Device-fatal** ([`DriverError`]): a device capability call failed; the
//!   device and all its attachments are removed.
//! - **Control-plane** ([`EngineError`]): the engine handle could not deliver
//!   a request.
//!
//! Recoverable conditions (ring overrun/underrun, clock drift, deliberate
//! frame dropping) are never errors. They surface as counters on the affected
//! buffers and as [`EngineEvent`](crate::EngineEvent)s.

/// Fatal configuration errors raised while pairing a stream with a device.
///
/// These are returned synchronously from attachment construction. A stream
/// that fails here is never registered with the device.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The sample width is not supported by the linear resampler.
    ///
    /// Only 16-bit and 32-bit integer PCM can be rate-converted.
    #[error("sample width of {width} bytes is not supported (expected 2 or 4)")]
    UnsupportedSampleWidth {
        /// Bytes per sample that were requested.
        width: usize,
    },

    /// The stream and device formats cannot be bridged by a converter.
    #[error("incompatible formats: stream {stream} vs device {device}: {reason}")]
    IncompatibleFormats {
        /// Stream-side format description.
        stream: String,
        /// Device-side format description.
        device: String,
        /// Why the pairing was rejected.
        reason: String,
    },

    /// A zero rate was supplied where a positive frame rate is required.
    #[error("frame rate must be positive")]
    ZeroFrameRate,
}

/// Device-fatal errors reported by a [`DeviceDriver`](crate::driver::DeviceDriver).
///
/// Any of these causes the scheduler to detach every stream from the device
/// and drop it from the open-device registry. Other devices in the same tick
/// are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Severe underrun: the hardware ran completely dry mid-playback.
    ///
    /// Always triggers a device reset request.
    #[error("severe underrun")]
    Underrun,

    /// Hardware I/O failure.
    ///
    /// Reset requests for this error are rate limited to avoid reset storms.
    #[error("hardware i/o failure")]
    Io,

    /// Any other driver fault.
    #[error("driver fault: {0}")]
    Failed(String),
}

impl DriverError {
    /// Creates a driver fault with the given message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Errors returned by a [`StreamClient`](crate::StreamClient) callback.
///
/// A failing client marks only its own stream as draining; the scheduler and
/// every other stream keep running.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client has gone away (closed its side of the transport).
    #[error("client disconnected")]
    Disconnected,

    /// Custom error for user-implemented clients.
    #[error("{0}")]
    Custom(String),
}

impl ClientError {
    /// Creates a custom client error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

/// Errors from the control-plane side of the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The scheduler thread is no longer running.
    #[error("engine not running")]
    NotRunning,

    /// The control channel was closed before the message could be delivered.
    #[error("control channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::UnsupportedSampleWidth { width: 3 };
        assert_eq!(
            err.to_string(),
            "sample width of 3 bytes is not supported (expected 2 or 4)"
        );
    }

    #[test]
    fn test_driver_error_failed() {
        let err = DriverError::failed("mmap lost");
        assert_eq!(err.to_string(), "driver fault: mmap lost");
    }

    #[test]
    fn test_client_error_custom() {
        let err = ClientError::custom("socket backpressure");
        assert_eq!(err.to_string(), "socket backpressure");
    }
}
