//! Double-buffered sample exchange region.
//!
//! A [`RingRegion`] moves interleaved sample bytes between a producer and a
//! consumer through two alternating sub-buffers with an acquire/commit
//! contract. Nothing here blocks or errors: a full region yields a zero
//! capacity, a write landing on an undrained sub-buffer bumps the overrun
//! counter, and upstream policy decides what to do about either.
//!
//! The original exchange runs across a process boundary with a
//! single-writer/single-reader discipline instead of locks. In this crate
//! that discipline is carried by ownership: the region belongs to its
//! stream, only the scheduler thread touches it, and the client side runs
//! inside a [`StreamClient`](crate::StreamClient) callback holding a mutable
//! borrow.

use std::time::{Duration, Instant};

/// Identifies one of the two alternating sub-buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubBuf {
    A,
    B,
}

impl SubBuf {
    fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    fn next(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// A fixed-capacity, double-buffered region exchanging interleaved sample
/// bytes between one producer and one consumer.
///
/// Each sub-buffer holds `used_size` bytes. Exactly one sub-buffer is
/// current for writing and one for reading at any instant; for each
/// sub-buffer, `read_offset <= write_offset <= used_size` holds after every
/// operation.
pub struct RingRegion {
    /// Size in bytes of each sub-buffer's actively used sample area.
    used_size: usize,
    /// Size of one interleaved frame in bytes.
    frame_bytes: usize,
    bufs: [Vec<u8>; 2],
    read_offset: [usize; 2],
    write_offset: [usize; 2],
    read_buf: SubBuf,
    write_buf: SubBuf,
    volume: f32,
    mute: bool,
    overruns: u64,
    callback_pending: bool,
    /// Cumulative duration of deliberately dropped capture audio.
    dropped: Duration,
    last_transfer: Option<Instant>,
}

impl RingRegion {
    /// Creates a region whose sub-buffers each hold `frames` frames of
    /// `frame_bytes` bytes.
    #[must_use]
    pub fn new(frame_bytes: usize, frames: usize) -> Self {
        let used_size = frame_bytes * frames;
        Self {
            used_size,
            frame_bytes,
            bufs: [vec![0u8; used_size], vec![0u8; used_size]],
            read_offset: [0; 2],
            write_offset: [0; 2],
            read_buf: SubBuf::A,
            write_buf: SubBuf::A,
            volume: 1.0,
            mute: false,
            overruns: 0,
            callback_pending: false,
            dropped: Duration::ZERO,
            last_transfer: None,
        }
    }

    /// Size of one frame in bytes.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Capacity of one sub-buffer in frames.
    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.used_size / self.frame_bytes
    }

    /// Returns `true` when the active write sub-buffer is clean, i.e. a new
    /// block can be written without overrunning.
    #[must_use]
    pub fn write_available(&self) -> bool {
        self.write_offset[self.write_buf.index()] == 0
    }

    /// Frames a producer may write right now: a full sub-buffer when the
    /// active one is clean, zero otherwise. Writing the same sub-buffer
    /// twice is an overrun, not an option.
    #[must_use]
    pub fn writable_frames(&self) -> usize {
        if self.write_available() {
            self.used_frames()
        } else {
            0
        }
    }

    /// Returns the tail of the active write sub-buffer.
    ///
    /// The slice may span zero bytes when the sub-buffer is already full.
    /// The caller may fill any prefix of it and must then report the amount
    /// via [`commit_write`](Self::commit_write) or
    /// [`buffer_written`](Self::buffer_written).
    pub fn acquire_write(&mut self) -> &mut [u8] {
        let idx = self.write_buf.index();
        let start = self.write_offset[idx];
        &mut self.bufs[idx][start..]
    }

    /// Closes the active write sub-buffer after writing `bytes` bytes.
    ///
    /// If the sub-buffer already held a non-zero write offset, the overrun
    /// counter is incremented (a write started before the previous region
    /// was drained; data-loss signal, not fatal). The active write
    /// sub-buffer then advances.
    pub fn commit_write(&mut self, bytes: usize) {
        let idx = self.write_buf.index();
        if self.write_offset[idx] != 0 {
            self.overruns += 1;
        }
        self.buffer_written_bytes(bytes);
        self.buffer_write_complete();
    }

    /// Reclaims a dirty write sub-buffer before a forced write.
    ///
    /// The capture path calls this when it must keep writing although the
    /// consumer has not drained the previous block: the stale block is
    /// discarded, the overrun counter incremented, and `true` returned.
    pub fn check_write_overrun(&mut self) -> bool {
        let idx = self.write_buf.index();
        if self.write_offset[idx] != 0 {
            self.overruns += 1;
            self.write_offset[idx] = 0;
            true
        } else {
            false
        }
    }

    /// Advances the active write sub-buffer by `frames` frames without
    /// closing it.
    ///
    /// Used by the capture path, which fills a sub-buffer incrementally
    /// across device reads before publishing it with
    /// [`buffer_write_complete`](Self::buffer_write_complete).
    pub fn buffer_written(&mut self, frames: usize) {
        self.buffer_written_bytes(frames * self.frame_bytes);
    }

    fn buffer_written_bytes(&mut self, bytes: usize) {
        let idx = self.write_buf.index();
        self.write_offset[idx] = (self.write_offset[idx] + bytes).min(self.used_size);
        self.read_offset[idx] = 0;
    }

    /// Publishes the active write sub-buffer and advances to the other one.
    pub fn buffer_write_complete(&mut self) {
        self.write_buf = self.write_buf.next();
        self.last_transfer = Some(Instant::now());
        debug_assert!(self.check_invariant());
    }

    /// Frames accumulated in the active write sub-buffer but not yet
    /// published.
    #[must_use]
    pub fn pending_write_frames(&self) -> usize {
        self.write_offset[self.write_buf.index()] / self.frame_bytes
    }

    /// Returns writable space in the active write sub-buffer, bounded so
    /// the sub-buffer never holds more than `limit_frames` frames in total.
    pub fn acquire_capture_write(&mut self, limit_frames: usize) -> &mut [u8] {
        let idx = self.write_buf.index();
        let start = self.write_offset[idx];
        let end = (limit_frames * self.frame_bytes).min(self.used_size);
        if start >= end {
            return &mut [];
        }
        &mut self.bufs[idx][start..end]
    }

    /// Resolves `frame_offset` frames past the current read position,
    /// transparently crossing into the other sub-buffer when the offset
    /// exceeds the remaining bytes in the current one.
    ///
    /// Returns the readable span starting there; empty when the offset runs
    /// past both sub-buffers' filled regions.
    #[must_use]
    pub fn acquire_read(&self, frame_offset: usize) -> &[u8] {
        let mut idx = self.read_buf.index();
        let mut final_offset = self.read_offset[idx] + frame_offset * self.frame_bytes;
        if final_offset >= self.write_offset[idx] {
            final_offset -= self.write_offset[idx];
            idx = self.read_buf.next().index();
        }
        if final_offset >= self.write_offset[idx] {
            return &[];
        }
        &self.bufs[idx][final_offset..self.write_offset[idx]]
    }

    /// Advances the read position by `frames` frames.
    ///
    /// Draining a sub-buffer resets both of its offsets and moves reading to
    /// the other sub-buffer, carrying any remainder into it.
    pub fn commit_read(&mut self, frames: usize) {
        let idx = self.read_buf.index();
        self.read_offset[idx] += frames * self.frame_bytes;
        if self.read_offset[idx] >= self.write_offset[idx] {
            let remainder = self.read_offset[idx] - self.write_offset[idx];
            self.read_offset[idx] = 0;
            self.write_offset[idx] = 0;
            let next = self.read_buf.next();
            let nidx = next.index();
            if remainder < self.write_offset[nidx] {
                self.read_offset[nidx] = remainder;
            } else {
                self.read_offset[nidx] = 0;
                self.write_offset[nidx] = 0;
            }
            self.read_buf = next;
        }
        self.last_transfer = Some(Instant::now());
        debug_assert!(self.check_invariant());
    }

    /// Bytes queued across both sub-buffers.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        (0..2)
            .map(|i| self.write_offset[i].saturating_sub(self.read_offset[i]))
            .sum()
    }

    /// Frames queued across both sub-buffers.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.queued_bytes() / self.frame_bytes
    }

    /// The stream volume scaler, applied at mix time.
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the volume scaler, clamped to `[0.0, 1.0]`.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    /// Whether the stream is muted.
    #[must_use]
    pub fn mute(&self) -> bool {
        self.mute
    }

    /// Mutes or unmutes the stream.
    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    /// Number of writes that landed on an undrained sub-buffer.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Whether a client callback is outstanding for this region.
    #[must_use]
    pub fn callback_pending(&self) -> bool {
        self.callback_pending
    }

    /// Marks a client callback as outstanding (or served).
    pub fn set_callback_pending(&mut self, pending: bool) {
        self.callback_pending = pending;
    }

    /// Cumulative duration of capture audio deliberately dropped upstream.
    #[must_use]
    pub fn dropped_duration(&self) -> Duration {
        self.dropped
    }

    /// Records `duration` of dropped capture audio.
    pub fn add_dropped_duration(&mut self, duration: Duration) {
        self.dropped += duration;
    }

    /// Timestamp of the last completed transfer in either direction.
    #[must_use]
    pub fn last_transfer(&self) -> Option<Instant> {
        self.last_transfer
    }

    fn check_invariant(&self) -> bool {
        (0..2).all(|i| {
            self.read_offset[i] <= self.write_offset[i] && self.write_offset[i] <= self.used_size
        })
    }
}
