//! Client streams and the client-side transport boundary.
//!
//! A [`ClientStream`] is the scheduler's view of one client audio stream:
//! its format, callback cadence, and the [`RingRegion`] used to exchange
//! samples. The client itself lives behind the [`StreamClient`] trait; the
//! scheduler fires callbacks into it and otherwise never waits for it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::device::DeviceId;
use crate::error::ClientError;
use crate::format::{frames_to_duration, AudioFormat};
use crate::ring::RingRegion;

/// Identifier of a client stream, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Direction of a stream relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The client produces audio; the engine mixes it into output devices.
    Playback,
    /// The engine captures audio from input devices into the stream.
    Capture,
}

/// The transport boundary to a client.
///
/// Both callbacks run on the scheduler thread and receive a mutable borrow
/// of the stream's ring region for the duration of the call. They are fire
/// and forget: a slow client simply leaves the region un-replenished (or
/// un-drained) and its callback-pending flag set; the scheduler does not
/// wait.
///
/// Returning an error marks the stream as draining. Only that stream is
/// affected.
pub trait StreamClient: Send {
    /// Asks the client to produce the next block of playback audio.
    fn request_audio(&mut self, ring: &mut RingRegion, now: Instant) -> Result<(), ClientError>;

    /// Notifies the client that `frames` captured frames are ready to read.
    fn audio_ready(&mut self, ring: &mut RingRegion, frames: usize) -> Result<(), ClientError>;
}

/// One client audio stream as owned by the scheduler thread.
pub struct ClientStream {
    pub(crate) id: StreamId,
    pub(crate) direction: Direction,
    pub(crate) format: AudioFormat,
    /// Frames the stream must have ready before the client is called back.
    pub(crate) cb_threshold: usize,
    /// Frames in each ring sub-buffer.
    pub(crate) buffer_frames: usize,
    pub(crate) ring: RingRegion,
    pub(crate) client: Box<dyn StreamClient>,
    /// Deadline of the next client callback; `None` until first scheduled.
    pub(crate) next_cb_ts: Option<Instant>,
    /// Fixed callback interval: `cb_threshold` frames at the stream rate.
    pub(crate) sleep_interval: Duration,
    pub(crate) draining: bool,
    /// Cumulative frames consumed per device, for multi-device alignment.
    pub(crate) dev_offsets: BTreeMap<DeviceId, u64>,
    /// Playback fan-out: frames each device has read ahead of the ring's
    /// read pointer. The pointer advances by the minimum across devices.
    pub(crate) pending_reads: BTreeMap<DeviceId, usize>,
    /// Capture fan-in: frames each device has written ahead of the ring's
    /// write pointer. The pointer advances by the minimum across devices.
    pub(crate) pending_captures: BTreeMap<DeviceId, usize>,
    pub(crate) missed_callbacks: u64,
}

impl ClientStream {
    /// Creates a stream. The ring region is allocated here and lives until
    /// the stream is destroyed.
    #[must_use]
    pub fn new(
        id: StreamId,
        direction: Direction,
        format: AudioFormat,
        cb_threshold: usize,
        buffer_frames: usize,
        client: Box<dyn StreamClient>,
    ) -> Self {
        let sleep_interval = frames_to_duration(cb_threshold, format.frame_rate as f64);
        Self {
            id,
            direction,
            format,
            cb_threshold,
            buffer_frames,
            ring: RingRegion::new(format.frame_bytes(), buffer_frames),
            client,
            next_cb_ts: None,
            sleep_interval,
            draining: false,
            dev_offsets: BTreeMap::new(),
            pending_reads: BTreeMap::new(),
            pending_captures: BTreeMap::new(),
            missed_callbacks: 0,
        }
    }

    /// The stream id.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The stream direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The stream's nominal format.
    #[must_use]
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// The callback threshold in frames.
    #[must_use]
    pub fn cb_threshold(&self) -> usize {
        self.cb_threshold
    }

    /// The stream's ring region.
    #[must_use]
    pub fn ring(&self) -> &RingRegion {
        &self.ring
    }

    /// Mutable access to the ring region (volume, mute, client-side pushes).
    pub fn ring_mut(&mut self) -> &mut RingRegion {
        &mut self.ring
    }

    /// Whether the stream is draining: the client is gone or has signaled
    /// end of audio, and the engine plays out what is queued.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Whether a client callback is outstanding.
    #[must_use]
    pub fn is_pending_reply(&self) -> bool {
        self.ring.callback_pending()
    }

    /// Number of devices this stream is attached to.
    #[must_use]
    pub fn attached_devs(&self) -> usize {
        self.dev_offsets.len()
    }

    /// Callbacks skipped because the client had not drained its buffer yet.
    #[must_use]
    pub fn missed_callbacks(&self) -> u64 {
        self.missed_callbacks
    }

    /// Cumulative frames this stream has fed to (or taken from) `dev`.
    #[must_use]
    pub fn dev_offset(&self, dev: DeviceId) -> u64 {
        self.dev_offsets.get(&dev).copied().unwrap_or(0)
    }

    /// Advances the per-device offset by `frames`.
    pub fn dev_offset_update(&mut self, dev: DeviceId, frames: u64) {
        *self.dev_offsets.entry(dev).or_insert(0) += frames;
    }

    /// Frames `dev` has read ahead of the ring's read pointer.
    #[must_use]
    pub fn pending_read(&self, dev: DeviceId) -> usize {
        self.pending_reads.get(&dev).copied().unwrap_or(0)
    }

    /// Records `frames` read by `dev` and advances the ring's read pointer
    /// by whatever every attached device has read by now.
    pub(crate) fn commit_device_read(&mut self, dev: DeviceId, frames: usize) {
        *self.pending_reads.entry(dev).or_insert(0) += frames;
        self.commit_min_read();
    }

    fn commit_min_read(&mut self) {
        let Some(&min) = self.pending_reads.values().min() else {
            return;
        };
        if min > 0 {
            self.ring.commit_read(min);
            for pending in self.pending_reads.values_mut() {
                *pending -= min;
            }
        }
    }

    /// Frames `dev` has captured ahead of the ring's write pointer.
    #[must_use]
    pub fn pending_capture(&self, dev: DeviceId) -> usize {
        self.pending_captures.get(&dev).copied().unwrap_or(0)
    }

    /// Records `frames` captured from `dev` and advances the ring's write
    /// pointer by whatever every attached device has written by now.
    pub(crate) fn note_device_capture(&mut self, dev: DeviceId, frames: usize) {
        *self.pending_captures.entry(dev).or_insert(0) += frames;
        self.advance_min_capture();
    }

    fn advance_min_capture(&mut self) {
        let Some(&min) = self.pending_captures.values().min() else {
            return;
        };
        if min > 0 {
            self.ring.buffer_written(min);
            for pending in self.pending_captures.values_mut() {
                *pending -= min;
            }
        }
    }

    /// Drops every per-device cursor for `dev` after a detach.
    ///
    /// The remaining devices' minimum may advance as a result; a slow device
    /// leaving must not keep holding the ring back.
    pub(crate) fn forget_device(&mut self, dev: DeviceId) {
        self.dev_offsets.remove(&dev);
        if self.pending_reads.remove(&dev).is_some() {
            self.commit_min_read();
        }
        if self.pending_captures.remove(&dev).is_some() {
            self.advance_min_capture();
        }
    }

    /// Advances the callback deadline by one interval.
    ///
    /// Self-correcting: when `now` has already passed the advanced deadline,
    /// the deadline restarts at `now + interval` instead of compounding a
    /// backlog of overdue callbacks.
    pub fn schedule_next_callback(&mut self, now: Instant) {
        let next = match self.next_cb_ts {
            Some(ts) => ts + self.sleep_interval,
            None => now + self.sleep_interval,
        };
        self.next_cb_ts = Some(if next <= now {
            now + self.sleep_interval
        } else {
            next
        });
    }

    /// Asks the client for more playback audio and flags the reply pending.
    pub fn request_audio(&mut self, now: Instant) -> Result<(), ClientError> {
        self.ring.set_callback_pending(true);
        self.client.request_audio(&mut self.ring, now)
    }

    /// Notifies the client that captured samples are ready.
    pub fn audio_ready(&mut self, frames: usize) -> Result<(), ClientError> {
        self.client.audio_ready(&mut self.ring, frames)
    }
}

/// A scripted in-process client for tests and examples.
///
/// Lets the full scheduler run without a transport: playback requests are
/// answered synchronously with a constant fill value, capture notifications
/// are recorded (and optionally consumed). Failure modes are scriptable so
/// error paths can be exercised.
pub struct ScriptedClient {
    fill_value: i16,
    fill_frames: usize,
    /// Leave requests unanswered, keeping the callback-pending flag set.
    defer_replies: bool,
    /// Fail every callback, as a disconnected client would.
    fail: bool,
    /// Drain notified frames from the ring inside `audio_ready`.
    consume_on_ready: bool,
    requests: u64,
    ready_frames: Vec<usize>,
}

impl ScriptedClient {
    /// A client that answers every request with `fill_frames` frames of
    /// `fill_value` in every sample slot.
    #[must_use]
    pub fn new(fill_value: i16, fill_frames: usize) -> Self {
        Self {
            fill_value,
            fill_frames,
            defer_replies: false,
            fail: false,
            consume_on_ready: true,
            requests: 0,
            ready_frames: Vec::new(),
        }
    }

    /// A client that never answers, leaving replies pending forever.
    #[must_use]
    pub fn unresponsive() -> Self {
        let mut c = Self::new(0, 0);
        c.defer_replies = true;
        c
    }

    /// A client that fails every callback.
    #[must_use]
    pub fn failing() -> Self {
        let mut c = Self::new(0, 0);
        c.fail = true;
        c
    }

    /// Keep captured frames queued instead of consuming them on notify.
    #[must_use]
    pub fn keep_captured(mut self) -> Self {
        self.consume_on_ready = false;
        self
    }

    /// Number of playback requests received.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Frame counts of the capture notifications received.
    #[must_use]
    pub fn ready_frames(&self) -> &[usize] {
        &self.ready_frames
    }
}

impl StreamClient for ScriptedClient {
    fn request_audio(&mut self, ring: &mut RingRegion, _now: Instant) -> Result<(), ClientError> {
        if self.fail {
            return Err(ClientError::Disconnected);
        }
        self.requests += 1;
        if self.defer_replies {
            return Ok(());
        }

        let frame_bytes = ring.frame_bytes();
        let span = ring.acquire_write();
        let want = self.fill_frames * frame_bytes;
        let bytes = want.min(span.len());
        for chunk in span[..bytes].chunks_exact_mut(2) {
            chunk.copy_from_slice(&self.fill_value.to_le_bytes());
        }
        ring.commit_write(bytes);
        ring.set_callback_pending(false);
        Ok(())
    }

    fn audio_ready(&mut self, ring: &mut RingRegion, frames: usize) -> Result<(), ClientError> {
        if self.fail {
            return Err(ClientError::Disconnected);
        }
        self.ready_frames.push(frames);
        if self.consume_on_ready {
            ring.commit_read(frames);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn stream(cb_threshold: usize) -> ClientStream {
        ClientStream::new(
            StreamId(1),
            Direction::Playback,
            AudioFormat::new(48000, 2, SampleFormat::S16LE),
            cb_threshold,
            cb_threshold * 2,
            Box::new(ScriptedClient::new(1000, cb_threshold)),
        )
    }

    #[test]
    fn test_sleep_interval_from_threshold() {
        let s = stream(480);
        assert_eq!(s.sleep_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_schedule_next_callback_advances() {
        let mut s = stream(480);
        let t0 = Instant::now();

        s.next_cb_ts = Some(t0);
        s.schedule_next_callback(t0);
        assert_eq!(s.next_cb_ts, Some(t0 + Duration::from_millis(10)));
    }

    #[test]
    fn test_schedule_next_callback_self_corrects() {
        let mut s = stream(480);
        let t0 = Instant::now();

        // Deadline long overdue: restart from now instead of compounding.
        s.next_cb_ts = Some(t0);
        let late = t0 + Duration::from_millis(100);
        s.schedule_next_callback(late);
        assert_eq!(s.next_cb_ts, Some(late + Duration::from_millis(10)));
    }

    #[test]
    fn test_request_audio_fills_ring() {
        let mut s = stream(480);
        s.request_audio(Instant::now()).unwrap();

        assert_eq!(s.ring.queued_frames(), 480);
        assert!(!s.is_pending_reply());
    }

    #[test]
    fn test_unresponsive_client_leaves_reply_pending() {
        let mut s = ClientStream::new(
            StreamId(2),
            Direction::Playback,
            AudioFormat::new(48000, 2, SampleFormat::S16LE),
            480,
            960,
            Box::new(ScriptedClient::unresponsive()),
        );
        s.request_audio(Instant::now()).unwrap();
        assert!(s.is_pending_reply());
        assert_eq!(s.ring.queued_frames(), 0);
    }

    #[test]
    fn test_failing_client_errors() {
        let mut s = ClientStream::new(
            StreamId(3),
            Direction::Playback,
            AudioFormat::new(48000, 2, SampleFormat::S16LE),
            480,
            960,
            Box::new(ScriptedClient::failing()),
        );
        assert!(s.request_audio(Instant::now()).is_err());
    }

    #[test]
    fn test_dev_offsets() {
        let mut s = stream(480);
        let dev = DeviceId(7);
        assert_eq!(s.dev_offset(dev), 0);
        s.dev_offset_update(dev, 441);
        s.dev_offset_update(dev, 441);
        assert_eq!(s.dev_offset(dev), 882);
        assert_eq!(s.attached_devs(), 1);
    }

    #[test]
    fn test_read_pointer_advances_by_slowest_device() {
        let mut s = stream(480);
        s.pending_reads.insert(DeviceId(0), 0);
        s.pending_reads.insert(DeviceId(1), 0);
        s.request_audio(Instant::now()).unwrap();

        // The fast device reads the whole block; nothing commits until the
        // slow one catches up.
        s.commit_device_read(DeviceId(0), 480);
        assert_eq!(s.ring.queued_frames(), 480);
        assert_eq!(s.pending_read(DeviceId(0)), 480);

        s.commit_device_read(DeviceId(1), 300);
        assert_eq!(s.ring.queued_frames(), 180);
        assert_eq!(s.pending_read(DeviceId(0)), 180);
        assert_eq!(s.pending_read(DeviceId(1)), 0);
    }

    #[test]
    fn test_forget_device_releases_held_back_frames() {
        let mut s = stream(480);
        s.pending_reads.insert(DeviceId(0), 0);
        s.pending_reads.insert(DeviceId(1), 0);
        s.request_audio(Instant::now()).unwrap();

        s.commit_device_read(DeviceId(0), 480);
        assert_eq!(s.ring.queued_frames(), 480);

        // The laggard detaches; the survivor's progress commits.
        s.forget_device(DeviceId(1));
        assert_eq!(s.ring.queued_frames(), 0);
        assert_eq!(s.pending_read(DeviceId(0)), 0);
    }

    #[test]
    fn test_capture_pointer_advances_by_slowest_device() {
        let mut s = ClientStream::new(
            StreamId(4),
            Direction::Capture,
            AudioFormat::new(48000, 2, SampleFormat::S16LE),
            480,
            960,
            Box::new(ScriptedClient::new(0, 0).keep_captured()),
        );
        s.pending_captures.insert(DeviceId(0), 0);
        s.pending_captures.insert(DeviceId(1), 0);

        s.note_device_capture(DeviceId(0), 480);
        assert_eq!(s.ring.pending_write_frames(), 0);

        s.note_device_capture(DeviceId(1), 200);
        assert_eq!(s.ring.pending_write_frames(), 200);
        assert_eq!(s.pending_capture(DeviceId(0)), 280);
        assert_eq!(s.pending_capture(DeviceId(1)), 0);
    }
}
