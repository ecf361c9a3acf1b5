//! Open-device bookkeeping: attachments, offsets, wake state, rate tracking.

use std::time::{Duration, Instant};

use crate::attach::StreamAttachment;
use crate::driver::DeviceDriver;
use crate::format::{duration_to_frames, frames_at_rate};
use crate::stream::{ClientStream, Direction, StreamId};

/// Identifier of an open device, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev-{}", self.0)
    }
}

/// While running with streams, wake early enough to refill before this much
/// audio remains.
const NORMAL_RUN_WAKE: Duration = Duration::from_millis(2);
/// While running without streams, wake when this much audio remains so the
/// device can be topped up with silence.
const NO_STREAM_WAKE: Duration = Duration::from_millis(5);

/// A deadline that is polled rather than slept on.
#[derive(Debug, Clone)]
pub(crate) struct PolledInterval {
    deadline: Instant,
    period: Duration,
}

impl PolledInterval {
    pub fn new(now: Instant, period: Duration) -> Self {
        Self {
            deadline: now + period,
            period,
        }
    }

    pub fn elapsed(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn reset(&mut self, now: Instant) {
        self.deadline = now + self.period;
    }
}

/// Tracks how far each attached stream has written into the shared device
/// buffer, so the device commits only what every running stream has filled.
///
/// Offsets are relative to the uncommitted region: committing subtracts the
/// committed frames from every entry.
#[derive(Debug, Default)]
pub(crate) struct OffsetLedger {
    entries: Vec<(StreamId, usize)>,
}

impl OffsetLedger {
    pub fn add(&mut self, id: StreamId) {
        if !self.entries.iter().any(|(sid, _)| *sid == id) {
            self.entries.push((id, 0));
        }
    }

    pub fn remove(&mut self, id: StreamId) {
        self.entries.retain(|(sid, _)| *sid != id);
    }

    pub fn offset(&self, id: StreamId) -> usize {
        self.entries
            .iter()
            .find(|(sid, _)| *sid == id)
            .map_or(0, |(_, off)| *off)
    }

    pub fn update(&mut self, id: StreamId, frames: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|(sid, _)| *sid == id) {
            entry.1 += frames;
        }
    }

    /// Smallest offset across all entries: frames every stream has written.
    pub fn min_offset(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, off)| *off)
            .min()
            .unwrap_or(0)
    }

    /// Commits `min(min_offset, limit)` frames and rebases every entry on
    /// the new uncommitted region. Returns the committed frames.
    pub fn commit(&mut self, limit: usize) -> usize {
        let written = self.min_offset().min(limit);
        for entry in &mut self.entries {
            entry.1 -= written.min(entry.1);
        }
        written
    }
}

/// Estimates a device's true frame rate from buffer-level observations.
///
/// Frames transferred between level readings are accumulated into a
/// least-squares fit of frames over time; each full window folds the fitted
/// slope into the smoothed estimate. Clock drift shows up as the estimate
/// walking away from the nominal rate.
#[derive(Debug)]
pub(crate) struct RateEstimator {
    nominal: f64,
    estimate: f64,
    window: Duration,
    smoothing: f64,
    direction: Direction,
    window_start: Option<Instant>,
    points: Vec<(f64, f64)>,
    cumulative: f64,
    pending_transferred: usize,
    last_level: usize,
}

impl RateEstimator {
    const WINDOW: Duration = Duration::from_secs(1);
    const SMOOTHING: f64 = 0.9;

    pub fn new(nominal: f64, direction: Direction) -> Self {
        Self {
            nominal,
            estimate: nominal,
            window: Self::WINDOW,
            smoothing: Self::SMOOTHING,
            direction,
            window_start: None,
            points: Vec::new(),
            cumulative: 0.0,
            pending_transferred: 0,
            last_level: 0,
        }
    }

    /// Records frames moved between the engine and the device buffer since
    /// the last level reading (written for playback, read for capture).
    pub fn add_frames(&mut self, frames: usize) {
        self.pending_transferred += frames;
    }

    /// Feeds a level reading. Returns `true` when a window completed and the
    /// estimate changed.
    pub fn update(&mut self, level: usize, ts: Instant) -> bool {
        let Some(start) = self.window_start else {
            self.window_start = Some(ts);
            self.last_level = level;
            self.pending_transferred = 0;
            self.cumulative = 0.0;
            self.points.clear();
            self.points.push((0.0, 0.0));
            return false;
        };

        // Frames the device clock moved: what we transferred, corrected by
        // the level change.
        let moved = match self.direction {
            Direction::Playback => {
                self.pending_transferred as f64 + self.last_level as f64 - level as f64
            }
            Direction::Capture => {
                self.pending_transferred as f64 + level as f64 - self.last_level as f64
            }
        };
        self.pending_transferred = 0;
        self.last_level = level;
        if moved < 0.0 {
            // Inconsistent reading (e.g. after an underrun recovery); start
            // the window over.
            self.window_start = None;
            return false;
        }
        self.cumulative += moved;
        let t = ts.duration_since(start).as_secs_f64();
        self.points.push((t, self.cumulative));

        if ts.duration_since(start) < self.window || self.points.len() < 2 {
            return false;
        }

        let slope = least_squares_slope(&self.points);
        self.window_start = None;
        // Reject nonsense fits; the clock cannot be that far off.
        if slope < self.nominal * 0.5 || slope > self.nominal * 2.0 {
            return false;
        }
        self.estimate = self.smoothing * self.estimate + (1.0 - self.smoothing) * slope;
        true
    }

    pub fn rate(&self) -> f64 {
        self.estimate
    }
}

fn least_squares_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}

/// One active endpoint: the driver, its attachments, and the scheduling
/// state the tick loop keeps per device.
pub struct OpenDevice {
    pub(crate) id: DeviceId,
    pub(crate) driver: Box<dyn DeviceDriver>,
    /// Insertion order is preserved; it breaks wake-time ties and decides
    /// who mixes first.
    pub(crate) attachments: Vec<StreamAttachment>,
    pub(crate) wake_ts: Option<Instant>,
    /// Discrete rate correction: +1 when the buffer runs persistently low,
    /// -1 when persistently high, 0 otherwise.
    pub(crate) coarse_rate_adjust: i8,
    pub(crate) last_get_frames: usize,
    pub(crate) last_put_frames: usize,
    pub(crate) rate_estimator: RateEstimator,
    pub(crate) offsets: OffsetLedger,
    pub(crate) non_empty_check: Option<PolledInterval>,
    /// Present while the device has been playing only empty audio.
    pub(crate) empty: Option<PolledInterval>,
    /// Smallest callback level among attached streams, in device frames.
    pub(crate) min_cb_level: usize,
    pub(crate) max_cb_level: usize,
    /// Largest callback level ever seen on this device.
    pub(crate) largest_cb_level: usize,
    pub(crate) highest_hw_level: usize,
}

impl OpenDevice {
    /// Wraps a started-or-startable driver as an open device.
    #[must_use]
    pub fn new(id: DeviceId, driver: Box<dyn DeviceDriver>) -> Self {
        let nominal = driver.format().frame_rate as f64;
        let direction = driver.direction();
        let buffer_size = driver.buffer_size();
        Self {
            id,
            driver,
            attachments: Vec::new(),
            wake_ts: None,
            coarse_rate_adjust: 0,
            last_get_frames: 0,
            last_put_frames: 0,
            rate_estimator: RateEstimator::new(nominal, direction),
            offsets: OffsetLedger::default(),
            non_empty_check: None,
            empty: None,
            min_cb_level: buffer_size / 2,
            max_cb_level: 0,
            largest_cb_level: 0,
            highest_hw_level: 0,
        }
    }

    /// The device id.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Read access to the driver.
    #[must_use]
    pub fn driver(&self) -> &dyn DeviceDriver {
        self.driver.as_ref()
    }

    /// Number of attached streams.
    #[must_use]
    pub fn attached_streams(&self) -> usize {
        self.attachments.len()
    }

    pub(crate) fn has_attachment(&self, id: StreamId) -> bool {
        self.attachments.iter().any(|a| a.stream_id == id)
    }

    pub(crate) fn remove_attachment(&mut self, id: StreamId) -> Option<StreamAttachment> {
        let pos = self.attachments.iter().position(|a| a.stream_id == id)?;
        self.offsets.remove(id);
        Some(self.attachments.remove(pos))
    }

    /// Recomputes the callback-level bounds from the attached streams,
    /// converted to device frames.
    pub(crate) fn recompute_cb_levels<'a, I>(&mut self, streams: I)
    where
        I: Iterator<Item = &'a ClientStream>,
    {
        let dev_rate = self.driver.format().frame_rate;
        let mut min = usize::MAX;
        let mut max = 0usize;
        for stream in streams {
            let level = frames_at_rate(stream.format().frame_rate, stream.cb_threshold(), dev_rate);
            min = min.min(level);
            max = max.max(level);
        }
        if min == usize::MAX {
            self.min_cb_level = self.driver.buffer_size() / 2;
            self.max_cb_level = 0;
        } else {
            self.min_cb_level = min;
            self.max_cb_level = max;
            self.largest_cb_level = self.largest_cb_level.max(max);
        }
    }

    /// How many frames the device can play before the scheduler must be
    /// awake again, given the current level and whether streams still hold
    /// playable audio.
    pub(crate) fn frames_to_play_in_sleep(&self, hw_level: usize, playable: bool) -> usize {
        let rate = self.driver.format().frame_rate as f64;
        if !self.attachments.is_empty() {
            if hw_level > self.min_cb_level && playable {
                return hw_level - self.min_cb_level;
            }
            let wakeup = duration_to_frames(NORMAL_RUN_WAKE, rate);
            if hw_level > wakeup {
                return hw_level - wakeup;
            }
            return hw_level;
        }

        let wakeup = duration_to_frames(NO_STREAM_WAKE, rate).min(self.min_cb_level);
        hw_level.saturating_sub(wakeup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::VirtualDevice;
    use crate::format::{AudioFormat, SampleFormat};

    fn fmt() -> AudioFormat {
        AudioFormat::new(48000, 2, SampleFormat::S16LE)
    }

    #[test]
    fn test_polled_interval() {
        let now = Instant::now();
        let mut pi = PolledInterval::new(now, Duration::from_secs(5));
        assert!(!pi.elapsed(now));
        assert!(pi.elapsed(now + Duration::from_secs(5)));
        pi.reset(now + Duration::from_secs(5));
        assert!(!pi.elapsed(now + Duration::from_secs(6)));
    }

    #[test]
    fn test_offset_ledger_commit_rebases() {
        let mut ledger = OffsetLedger::default();
        ledger.add(StreamId(1));
        ledger.add(StreamId(2));

        ledger.update(StreamId(1), 480);
        ledger.update(StreamId(2), 300);
        assert_eq!(ledger.min_offset(), 300);

        // Commit is bounded by the slowest stream.
        assert_eq!(ledger.commit(480), 300);
        assert_eq!(ledger.offset(StreamId(1)), 180);
        assert_eq!(ledger.offset(StreamId(2)), 0);
    }

    #[test]
    fn test_offset_ledger_commit_bounded_by_limit() {
        let mut ledger = OffsetLedger::default();
        ledger.add(StreamId(1));
        ledger.update(StreamId(1), 500);
        assert_eq!(ledger.commit(200), 200);
        assert_eq!(ledger.offset(StreamId(1)), 300);
    }

    #[test]
    fn test_rate_estimator_tracks_slow_clock() {
        // A device consuming 47,520 frames/s while claiming 48kHz.
        let mut est = RateEstimator::new(48000.0, Direction::Playback);
        let t0 = Instant::now();
        let mut level = 960usize;

        est.update(level, t0);
        let mut updated = false;
        for i in 1..=11 {
            let ts = t0 + Duration::from_millis(100 * i);
            // We top up 4800 each reading, hardware consumed 4752.
            est.add_frames(4800);
            level = level + 4800 - 4752;
            updated |= est.update(level, ts);
        }

        assert!(updated);
        let rate = est.rate();
        assert!(rate < 48000.0, "rate = {rate}");
        assert!(rate > 47500.0, "rate = {rate}");
    }

    #[test]
    fn test_rate_estimator_rejects_wild_fits() {
        let mut est = RateEstimator::new(48000.0, Direction::Playback);
        let t0 = Instant::now();

        est.update(1000, t0);
        est.add_frames(100);
        // Transferred 100 frames in a full second: slope of ~100 frames/s,
        // far outside the plausible band.
        assert!(!est.update(1000, t0 + Duration::from_secs(2)));
        assert!((est.rate() - 48000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_frames_to_play_in_sleep_with_streams() {
        let (dev, _handle) = VirtualDevice::output(fmt(), 4096);
        let mut odev = OpenDevice::new(DeviceId(0), Box::new(dev));
        // Fake one attachment by setting the levels directly.
        odev.min_cb_level = 480;

        // Pretend a stream list exists.
        let stream = ClientStream::new(
            StreamId(9),
            Direction::Playback,
            fmt(),
            480,
            960,
            Box::new(crate::stream::ScriptedClient::new(0, 480)),
        );
        let att = StreamAttachment::new(&stream, DeviceId(0), fmt()).unwrap();
        odev.attachments.push(att);

        // Plenty queued and more playable: sleep until min_cb_level remains.
        assert_eq!(odev.frames_to_play_in_sleep(2000, true), 1520);
        // Nothing playable: run down to the wake floor (2ms = 96 frames).
        assert_eq!(odev.frames_to_play_in_sleep(2000, false), 1904);
        // Hardly anything queued: whatever is left.
        assert_eq!(odev.frames_to_play_in_sleep(50, false), 50);
    }

    #[test]
    fn test_frames_to_play_in_sleep_without_streams() {
        let (dev, _handle) = VirtualDevice::output(fmt(), 4096);
        let odev = OpenDevice::new(DeviceId(0), Box::new(dev));
        // 5ms at 48kHz = 240 frames; min_cb_level default is half the
        // buffer, so the 240-frame floor wins.
        assert_eq!(odev.frames_to_play_in_sleep(1000, false), 760);
    }

    #[test]
    fn test_recompute_cb_levels() {
        let (dev, _handle) = VirtualDevice::output(fmt(), 4096);
        let mut odev = OpenDevice::new(DeviceId(0), Box::new(dev));

        let mk = |id: u32, rate: u32, cb: usize| {
            ClientStream::new(
                StreamId(id),
                Direction::Playback,
                AudioFormat::new(rate, 2, SampleFormat::S16LE),
                cb,
                cb * 2,
                Box::new(crate::stream::ScriptedClient::new(0, cb)),
            )
        };
        let a = mk(1, 48000, 480);
        let b = mk(2, 44100, 441);

        odev.recompute_cb_levels([&a, &b].into_iter());
        assert_eq!(odev.min_cb_level, 480);
        assert_eq!(odev.max_cb_level, 480);

        odev.recompute_cb_levels(std::iter::empty());
        assert_eq!(odev.min_cb_level, 2048);
        assert_eq!(odev.max_cb_level, 0);
    }
}
