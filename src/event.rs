//! Runtime events for monitoring scheduler health.
//!
//! Events are non-fatal notifications emitted from the scheduler thread. The
//! engine continues running after every event - they exist for logging and
//! metrics, not error handling.

use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceId;

/// Runtime events emitted by the scheduler.
///
/// These are informational, not errors. Register an [`EventCallback`] to log
/// them or feed metrics. The callback runs on the scheduler thread, so it
/// must not block.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A playback device reported a severe underrun and a reset was requested.
    SevereUnderrun {
        /// Device that ran dry.
        device: DeviceId,
    },

    /// A device hit a hardware I/O failure.
    ///
    /// `reset_requested` is false when a previous failure was too recent and
    /// the reset was suppressed; the device is closed instead.
    DeviceIoError {
        /// Device that failed.
        device: DeviceId,
        /// Whether a hardware reset was requested for it.
        reset_requested: bool,
    },

    /// A device was removed from the open-device registry.
    ///
    /// All of its stream attachments were detached first; the streams
    /// themselves keep living.
    DeviceRemoved {
        /// Device that was removed.
        device: DeviceId,
        /// Why it was removed.
        reason: String,
    },

    /// Output underrun: the hardware level after a write was at or below the
    /// frames just written.
    Underrun {
        /// Device that underran.
        device: DeviceId,
        /// Hardware level observed after the write.
        hw_level: usize,
        /// Frames written in that pass.
        written: usize,
    },

    /// Captured frames were deliberately dropped to recover real-time
    /// behavior after a sustained backlog.
    ///
    /// This is lossy recovery policy, not an error. The dropped duration is
    /// also recorded on every stream attached to the affected devices.
    SamplesDropped {
        /// Duration of audio removed from each affected device.
        dropped: Duration,
    },

    /// The set of devices playing or capturing non-empty audio became
    /// non-empty, or became empty.
    NonEmptyStateChanged {
        /// True when at least one device now carries non-empty audio.
        active: bool,
    },

    /// A device reported fewer writable frames than the not-yet-committed
    /// region from the previous wake, which a sane driver never does.
    UnreasonableAvailableFrames {
        /// Device that misreported.
        device: DeviceId,
        /// Frames acquired in the previous wake.
        last_get: usize,
        /// Frames committed in the previous wake.
        last_put: usize,
        /// Writable frames reported now.
        writable: usize,
    },
}

/// Callback type for receiving runtime events.
///
/// The callback is invoked from the scheduler thread between buffer
/// operations; keep it cheap and non-blocking.
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use sonomux::{event_callback, EngineEvent};
///
/// let callback = event_callback(|event| {
///     tracing::warn!(?event, "engine event");
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_debug() {
        let event = EngineEvent::SamplesDropped {
            dropped: Duration::from_millis(42),
        };
        let debug = format!("{event:?}");
        assert!(debug.contains("SamplesDropped"));
        assert!(debug.contains("42"));
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(EngineEvent::NonEmptyStateChanged { active: true });
        assert!(called.load(Ordering::SeqCst));
    }
}
