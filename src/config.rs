//! Configuration for the scheduler.

use std::time::Duration;

/// Tunables for the scheduler tick loop and its recovery policies.
///
/// Use [`SchedulerConfig::default()`] for the defaults the engine was tuned
/// with, or customize as needed.
///
/// # Example
///
/// ```
/// use sonomux::SchedulerConfig;
/// use std::time::Duration;
///
/// let config = SchedulerConfig {
///     drop_threshold: Duration::from_millis(100),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How much earlier than a stream's deadline a fetch may fire.
    ///
    /// Waking slightly early lets one device wake serve several streams with
    /// near-identical deadlines.
    pub playback_wake_fuzz: Duration,

    /// Minimum age of a capture backlog before frames are dropped.
    ///
    /// A backlog must both exceed one of the relative bounds below and
    /// represent at least this much audio before the drop policy fires.
    pub drop_threshold: Duration,

    /// Relative drop bound: backlog as a multiple of the largest callback
    /// level among attached streams.
    pub drop_cb_level_multiple: f64,

    /// Relative drop bound: backlog as a fraction of the device buffer size.
    pub drop_buffer_fraction: f64,

    /// How often an output device is probed for playing only empty audio.
    pub non_empty_check_interval: Duration,

    /// How long a device must play empty audio before it counts as empty.
    pub min_empty_period: Duration,

    /// Cooldown between hardware reset requests after I/O errors.
    ///
    /// A second I/O error inside the window closes the device instead of
    /// requesting another reset.
    pub io_error_reset_cooldown: Duration,

    /// Upper bound on any computed sleep.
    pub max_sleep: Duration,

    /// Lower bound on an input device's sleep, preventing busy loops on
    /// devices that report tiny buffer targets.
    pub min_input_wake: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            playback_wake_fuzz: Duration::from_micros(500),
            drop_threshold: Duration::from_millis(50),
            drop_cb_level_multiple: 1.5,
            drop_buffer_fraction: 0.5,
            non_empty_check_interval: Duration::from_secs(5),
            min_empty_period: Duration::from_secs(30),
            io_error_reset_cooldown: Duration::from_secs(10),
            max_sleep: Duration::from_secs(20),
            min_input_wake: Duration::from_millis(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.playback_wake_fuzz, Duration::from_micros(500));
        assert_eq!(config.drop_threshold, Duration::from_millis(50));
        assert!((config.drop_cb_level_multiple - 1.5).abs() < f64::EPSILON);
        assert!((config.drop_buffer_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.io_error_reset_cooldown, Duration::from_secs(10));
    }
}
