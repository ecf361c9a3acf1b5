//! The scheduler: per-tick device/stream I/O orchestration.
//!
//! One [`SchedulerState`] owns every open device, every stream, and every
//! buffer. A tick runs four strictly ordered phases: playback fetch, input
//! capture, captured-sample delivery (with lossy backlog recovery), and
//! playback write. Between ticks the caller sleeps until
//! [`next_wake`](SchedulerState::next_wake) or a control message.
//!
//! Errors from one device never abort the others: a failing device is
//! detached (with all its attachments) inside the same tick and processing
//! continues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::attach::StreamAttachment;
use crate::config::SchedulerConfig;
use crate::device::{DeviceId, OpenDevice, PolledInterval};
use crate::driver::{DeviceDriver, DeviceState};
use crate::engine::EngineStatsInner;
use crate::error::{ConfigError, DriverError};
use crate::event::{EngineEvent, EventCallback};
use crate::format::{frames_at_rate, frames_to_duration};
use crate::stream::{ClientStream, Direction, StreamId};

/// Scheduler-owned state: the open-device registry, the stream map, and the
/// tick bookkeeping. Owned by exactly one thread; control planes talk to it
/// through messages, never directly.
pub struct SchedulerState {
    config: SchedulerConfig,
    odevs: Vec<OpenDevice>,
    idevs: Vec<OpenDevice>,
    streams: BTreeMap<StreamId, ClientStream>,
    event_cb: Option<EventCallback>,
    stats: Arc<EngineStatsInner>,
    last_io_err: Option<Instant>,
    non_empty_dev_count: usize,
}

impl SchedulerState {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_events(config, None)
    }

    /// Creates an empty scheduler with an event callback.
    #[must_use]
    pub fn with_events(config: SchedulerConfig, event_cb: Option<EventCallback>) -> Self {
        Self {
            config,
            odevs: Vec::new(),
            idevs: Vec::new(),
            streams: BTreeMap::new(),
            event_cb,
            stats: Arc::new(EngineStatsInner::default()),
            last_io_err: None,
            non_empty_dev_count: 0,
        }
    }

    pub(crate) fn stats_handle(&self) -> Arc<EngineStatsInner> {
        self.stats.clone()
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(cb) = &self.event_cb {
            cb(event);
        }
    }

    /// Registers an output device.
    pub fn add_output_device(&mut self, id: DeviceId, driver: Box<dyn DeviceDriver>) {
        info!(device = %id, format = %driver.format(), "output device added");
        self.odevs.push(OpenDevice::new(id, driver));
    }

    /// Registers an input device and starts it; capture hardware runs from
    /// the moment it is open.
    pub fn add_input_device(&mut self, id: DeviceId, mut driver: Box<dyn DeviceDriver>) {
        info!(device = %id, format = %driver.format(), "input device added");
        if let Err(err) = driver.start() {
            warn!(device = %id, %err, "input device failed to start");
            return;
        }
        self.idevs.push(OpenDevice::new(id, driver));
    }

    /// Looks up an open device by id.
    #[must_use]
    pub fn find_open_dev(&self, id: DeviceId) -> Option<&OpenDevice> {
        self.odevs
            .iter()
            .chain(self.idevs.iter())
            .find(|d| d.id == id)
    }

    /// Number of open devices (both directions).
    #[must_use]
    pub fn open_devices(&self) -> usize {
        self.odevs.len() + self.idevs.len()
    }

    /// Read access to a stream.
    #[must_use]
    pub fn stream(&self, id: StreamId) -> Option<&ClientStream> {
        self.streams.get(&id)
    }

    /// Sets a stream's volume scaler.
    pub fn set_stream_volume(&mut self, id: StreamId, volume: f32) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.ring_mut().set_volume(volume);
        }
    }

    /// Mutes or unmutes a stream.
    pub fn set_stream_mute(&mut self, id: StreamId, mute: bool) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.ring_mut().set_mute(mute);
        }
    }

    /// Attaches `stream` to every listed device and registers it.
    ///
    /// Devices not present in the registry are skipped. If any attachment
    /// cannot be configured (incompatible formats), everything created here
    /// is rolled back and the stream is not registered.
    pub fn append_stream(
        &mut self,
        mut stream: ClientStream,
        devices: &[DeviceId],
        now: Instant,
    ) -> Result<(), ConfigError> {
        let id = stream.id();
        let direction = stream.direction();
        let mut attached = Vec::new();
        let mut failure = None;

        for &dev_id in devices {
            let list = match direction {
                Direction::Playback => &mut self.odevs,
                Direction::Capture => &mut self.idevs,
            };
            let Some(dev) = list.iter_mut().find(|d| d.id == dev_id) else {
                warn!(device = %dev_id, stream = %id, "attach skipped: device not open");
                continue;
            };
            if dev.has_attachment(id) {
                continue;
            }

            // The first capture stream flushes stale hardware frames so
            // every input device starts from the same buffer level.
            if direction == Direction::Capture && dev.attachments.is_empty() {
                if let Err(err) = dev.driver.flush_buffer() {
                    warn!(device = %dev_id, %err, "flush before first capture stream failed");
                    continue;
                }
            }

            let mut att = match StreamAttachment::new(&stream, dev_id, dev.driver.format()) {
                Ok(att) => att,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };

            match direction {
                Direction::Playback => {
                    if stream.next_cb_ts.is_none() {
                        stream.next_cb_ts =
                            Some(self.initial_playback_cb_ts(dev_id, &stream, now));
                    }
                }
                Direction::Capture => {
                    att.running = true;
                }
            }

            let list = match direction {
                Direction::Playback => &mut self.odevs,
                Direction::Capture => &mut self.idevs,
            };
            let dev = list
                .iter_mut()
                .find(|d| d.id == dev_id)
                .expect("device present above");

            // Later capture attachments copy the first attachment's offset
            // (clamped to one callback period) so multi-device reads stay
            // within one period of each other.
            if direction == Direction::Capture && !dev.attachments.is_empty() {
                let first = &dev.attachments[0];
                if let Some(first_stream) = self.streams.get(&first.stream_id) {
                    let stream_offset = first_stream
                        .dev_offset(dev_id)
                        .min(stream.cb_threshold() as u64);
                    stream.dev_offsets.insert(dev_id, stream_offset);
                }
            }
            stream.dev_offsets.entry(dev_id).or_insert(0);
            match direction {
                Direction::Playback => {
                    stream.pending_reads.entry(dev_id).or_insert(0);
                }
                Direction::Capture => {
                    stream.pending_captures.entry(dev_id).or_insert(0);
                }
            }
            dev.attachments.push(att);
            attached.push(dev_id);
            debug!(stream = %id, device = %dev_id, "stream attached");
        }

        if let Some(err) = failure {
            for dev_id in attached {
                for dev in self.odevs.iter_mut().chain(self.idevs.iter_mut()) {
                    if dev.id == dev_id {
                        dev.remove_attachment(id);
                    }
                }
            }
            return Err(err);
        }

        self.streams.insert(id, stream);
        self.recompute_all_cb_levels();
        Ok(())
    }

    /// Initial deadline for a playback stream joining `dev_id`: align with
    /// the earliest existing deadline on the device, or derive from the
    /// device's queued level so the first fetch lands when the hardware
    /// is close to one callback period of audio.
    fn initial_playback_cb_ts(&mut self, dev_id: DeviceId, stream: &ClientStream, now: Instant) -> Instant {
        // A capture stream with the same cadence makes the best anchor:
        // matching rates and thresholds keep the wake pattern shared.
        for idev in &self.idevs {
            for att in &idev.attachments {
                if let Some(in_stream) = self.streams.get(&att.stream_id) {
                    if in_stream.format().frame_rate == stream.format().frame_rate
                        && in_stream.cb_threshold() == stream.cb_threshold()
                    {
                        if let Some(ts) = in_stream.next_cb_ts {
                            return ts;
                        }
                    }
                }
            }
        }

        let Some(dev) = self.odevs.iter_mut().find(|d| d.id == dev_id) else {
            return now;
        };

        let mut earliest: Option<Instant> = None;
        for att in &dev.attachments {
            if let Some(existing) = self.streams.get(&att.stream_id) {
                if let Some(ts) = existing.next_cb_ts {
                    earliest = Some(match earliest {
                        Some(cur) if cur <= ts => cur,
                        _ => ts,
                    });
                }
            }
        }
        if let Some(ts) = earliest {
            return ts;
        }

        // No sibling to align with: sleep off whatever the device already
        // holds beyond one callback period, so the buffer neither stacks up
        // nor drains dry before the first fetch.
        let dev_rate = dev.driver.format().frame_rate;
        let level = match dev.driver.frames_queued() {
            Ok((level, _)) => level,
            Err(err) => {
                warn!(device = %dev_id, %err, "could not derive initial deadline");
                0
            }
        };
        let threshold_dev =
            frames_at_rate(stream.format().frame_rate, stream.cb_threshold(), dev_rate);
        let extra = level.saturating_sub(threshold_dev);
        now + frames_to_duration(extra, dev_rate as f64)
    }

    /// Detaches `id` from every device and destroys the stream.
    ///
    /// Synchronous from the scheduler's perspective: after this returns the
    /// stream is gone from every attachment list.
    pub fn remove_stream(&mut self, id: StreamId) {
        for dev in self.odevs.iter_mut().chain(self.idevs.iter_mut()) {
            dev.remove_attachment(id);
        }
        if self.streams.remove(&id).is_some() {
            info!(stream = %id, "stream removed");
        }
        self.recompute_all_cb_levels();
    }

    /// Closes a device on request: stop the hardware, detach every
    /// attachment, drop it from the registry. Streams stay registered.
    pub fn remove_device(&mut self, id: DeviceId, now: Instant) {
        if let Some(idx) = self.odevs.iter().position(|d| d.id == id) {
            if let Err(err) = self.odevs[idx].driver.stop() {
                warn!(device = %id, %err, "device stop failed");
            }
            self.rm_open_dev(Direction::Playback, idx, "closed by request", now);
            return;
        }
        if let Some(idx) = self.idevs.iter().position(|d| d.id == id) {
            if let Err(err) = self.idevs[idx].driver.stop() {
                warn!(device = %id, %err, "device stop failed");
            }
            self.rm_open_dev(Direction::Capture, idx, "closed by request", now);
        }
    }

    /// Detaches `id` from one device only; the stream stays registered.
    pub fn detach_stream(&mut self, id: StreamId, dev_id: DeviceId) {
        for dev in self.odevs.iter_mut().chain(self.idevs.iter_mut()) {
            if dev.id == dev_id {
                dev.remove_attachment(id);
            }
        }
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.forget_device(dev_id);
        }
        self.recompute_all_cb_levels();
    }

    fn recompute_all_cb_levels(&mut self) {
        let streams = &self.streams;
        for dev in self.odevs.iter_mut().chain(self.idevs.iter_mut()) {
            let attached: Vec<&ClientStream> = dev
                .attachments
                .iter()
                .filter_map(|a| streams.get(&a.stream_id))
                .collect();
            dev.recompute_cb_levels(attached.into_iter());
        }
    }

    /// Runs one scheduler tick at `now`, strictly ordered: fetch, capture,
    /// deliver, write.
    pub fn run(&mut self, now: Instant) {
        self.stats.tick();
        self.playback_fetch(now);
        self.capture(now);
        self.send_captured_samples(now);
        self.playback_write(now);
    }

    /// The earliest time any device or stream needs the scheduler awake.
    #[must_use]
    pub fn next_wake(&self, now: Instant) -> Option<Instant> {
        let mut min_ts: Option<Instant> = None;
        let mut fold = |ts: Instant| {
            min_ts = Some(match min_ts {
                Some(cur) if cur <= ts => cur,
                _ => ts,
            });
        };

        for dev in &self.idevs {
            if let Some(ts) = dev.wake_ts {
                fold(ts);
            }
        }
        for dev in &self.odevs {
            for att in &dev.attachments {
                let Some(stream) = self.streams.get(&att.stream_id) else {
                    continue;
                };
                if stream.is_draining() || stream.is_pending_reply() {
                    continue;
                }
                if let Some(ts) = stream.next_cb_ts {
                    fold(ts);
                }
            }
            if dev.driver.should_wake() {
                if let Some(ts) = dev.wake_ts {
                    fold(ts);
                }
            }
        }
        // Never park forever while devices are open.
        if min_ts.is_none() && self.open_devices() > 0 {
            return Some(now + self.config.max_sleep);
        }
        min_ts
    }

    fn is_time_to_fetch(&self, stream: &ClientStream, now: Instant) -> bool {
        match stream.next_cb_ts {
            // Allow waking up a little early.
            Some(ts) => now + self.config.playback_wake_fuzz >= ts,
            None => false,
        }
    }

    // ----- Phase 1: playback fetch -----

    fn playback_fetch(&mut self, now: Instant) {
        // Start attachments whose first deadline has arrived, starting the
        // device itself with the first of them. Starting a stream also
        // registers it in the device's offset ledger; a stream that never
        // started must not pin the commit minimum at zero.
        let mut dev_idx = 0;
        while dev_idx < self.odevs.len() {
            let Self {
                odevs,
                streams,
                config,
                ..
            } = self;
            let dev = &mut odevs[dev_idx];
            let mut start_dev = false;
            for att in dev.attachments.iter_mut() {
                if att.running {
                    continue;
                }
                let Some(stream) = streams.get(&att.stream_id) else {
                    continue;
                };
                let due = match stream.next_cb_ts {
                    Some(ts) => now + config.playback_wake_fuzz >= ts,
                    None => false,
                };
                if due {
                    att.running = true;
                    dev.offsets.add(att.stream_id);
                    start_dev = true;
                    debug!(stream = %att.stream_id, device = %dev.id, "stream started");
                }
            }
            if start_dev && dev.driver.state() == DeviceState::Open {
                if let Err(err) = dev.driver.start() {
                    self.handle_device_error(Direction::Playback, dev_idx, err, now);
                    continue;
                }
            }
            dev_idx += 1;
        }

        let mut dev_idx = 0;
        while dev_idx < self.odevs.len() {
            match self.fetch_streams(dev_idx, now) {
                Ok(()) => dev_idx += 1,
                Err(err) => self.handle_device_error(Direction::Playback, dev_idx, err, now),
            }
        }
    }

    /// Asks every due stream on one output device for more audio.
    fn fetch_streams(&mut self, dev_idx: usize, now: Instant) -> Result<(), DriverError> {
        let Self { odevs, streams, config, .. } = self;
        let dev = &mut odevs[dev_idx];
        // A failing latency query is a device fault like any other.
        let _delay = dev.driver.delay_frames()?;

        for att in dev.attachments.iter() {
            let Some(stream) = streams.get_mut(&att.stream_id) else {
                continue;
            };
            if !att.running || stream.is_draining() {
                continue;
            }
            let due = match stream.next_cb_ts {
                Some(ts) => now + config.playback_wake_fuzz >= ts,
                None => false,
            };
            if !due {
                continue;
            }
            // Client still owes a reply; asking again would only pile up.
            if stream.is_pending_reply() {
                continue;
            }
            // Enough frames queued already: skip this callback entirely.
            if !stream.ring().write_available() {
                stream.missed_callbacks += 1;
                stream.schedule_next_callback(now);
                debug!(stream = %stream.id(), "fetch skipped: buffer not drained");
                continue;
            }

            stream.schedule_next_callback(now);
            if let Err(err) = stream.request_audio(now) {
                warn!(stream = %stream.id(), %err, "fetch failed; draining stream");
                stream.draining = true;
            }
        }
        Ok(())
    }

    // ----- Phase 2: capture -----

    fn capture(&mut self, now: Instant) {
        let mut dev_idx = 0;
        while dev_idx < self.idevs.len() {
            match self.capture_to_streams(dev_idx, now) {
                Ok(()) => dev_idx += 1,
                Err(err) => self.handle_device_error(Direction::Capture, dev_idx, err, now),
            }
        }
    }

    /// Reads queued hardware frames from one input device into every
    /// attached stream.
    fn capture_to_streams(&mut self, dev_idx: usize, _now: Instant) -> Result<(), DriverError> {
        let Self { idevs, streams, stats, .. } = self;
        let dev = &mut idevs[dev_idx];
        if dev.driver.state() == DeviceState::Open {
            return Ok(());
        }

        let (hw_level, tstamp) = dev.driver.frames_queued()?;
        dev.highest_hw_level = dev.highest_hw_level.max(hw_level);

        if let Some(ts) = tstamp {
            update_coarse_rate_adjust(dev, hw_level);
            if dev.rate_estimator.update(hw_level, ts) {
                propagate_est_rate(dev, streams);
            }
        }

        let cap_limit = stream_capture_limit(dev, streams);
        let mut remainder = hw_level.min(cap_limit);

        if dev.driver.state() != DeviceState::NormalRun {
            return Ok(());
        }

        while remainder > 0 {
            let OpenDevice {
                driver,
                attachments,
                rate_estimator,
                ..
            } = dev;
            let gain = 1.0f32;
            let (area, nread) = driver.get_input_buffer(remainder)?;
            if nread == 0 {
                break;
            }
            for att in attachments.iter_mut() {
                let Some(stream) = streams.get_mut(&att.stream_id) else {
                    continue;
                };
                att.capture(stream, area, gain);
            }
            driver.put_input_buffer(nread)?;
            rate_estimator.add_frames(nread);
            stats.add_captured(nread as u64);
            remainder -= nread;
        }

        Ok(())
    }

    // ----- Phase 3: deliver captured samples, drop policy, input wake -----

    fn send_captured_samples(&mut self, now: Instant) {
        let mut need_to_drop = false;

        let mut dev_idx = 0;
        while dev_idx < self.idevs.len() {
            let Self { idevs, streams, config, .. } = self;
            let dev = &mut idevs[dev_idx];

            // Post full periods to clients.
            for att in dev.attachments.iter_mut() {
                let Some(stream) = streams.get_mut(&att.stream_id) else {
                    continue;
                };
                if let Err(err) = att.capture_publish(stream, now) {
                    warn!(stream = %stream.id(), %err, "capture notify failed; draining stream");
                    stream.draining = true;
                }
            }

            match input_dev_wake_ts(dev, streams, config, now, &mut need_to_drop) {
                Ok(()) => dev_idx += 1,
                Err(err) => self.handle_device_error(Direction::Capture, dev_idx, err, now),
            }
        }

        if need_to_drop {
            self.drop_samples(now);
        }
    }

    /// Deliberately discards backlog from every droppable input device,
    /// bringing each back to its minimum callback level. Lossy recovery
    /// policy, not an error.
    fn drop_samples(&mut self, now: Instant) {
        let mut drop_time: Option<Duration> = None;

        for dev in &mut self.idevs {
            if dev.attachments.is_empty() {
                continue;
            }
            let level = match dev.driver.frames_queued() {
                Ok((level, _)) => level,
                Err(err) => {
                    warn!(device = %dev.id, %err, "level query failed during drop");
                    continue;
                }
            };
            if level <= dev.min_cb_level {
                // One device is already at target; dropping more from the
                // others would desynchronize them.
                return;
            }
            let est = dev.rate_estimator.rate();
            let t = frames_to_duration(level - dev.min_cb_level, est);
            drop_time = Some(match drop_time {
                Some(cur) if cur <= t => cur,
                _ => t,
            });
        }

        let Some(drop_time) = drop_time else {
            return;
        };
        if drop_time.is_zero() {
            return;
        }

        for dev in &mut self.idevs {
            if dev.attachments.is_empty() {
                continue;
            }
            match dev.driver.drop_frames_by_time(drop_time) {
                Ok(dropped) => {
                    debug!(device = %dev.id, dropped, ?drop_time, "dropped capture backlog");
                }
                Err(err) => {
                    warn!(device = %dev.id, %err, "failed to drop frames");
                    continue;
                }
            }
            for att in &dev.attachments {
                if let Some(stream) = self.streams.get_mut(&att.stream_id) {
                    stream.ring_mut().add_dropped_duration(drop_time);
                }
            }
        }

        self.stats.add_drop();
        self.emit(EngineEvent::SamplesDropped { dropped: drop_time });
    }

    // ----- Phase 4: playback write -----

    fn playback_write(&mut self, now: Instant) {
        let mut finished: Vec<StreamId> = Vec::new();

        let mut dev_idx = 0;
        while dev_idx < self.odevs.len() {
            match self.write_output_samples(dev_idx, now, &mut finished) {
                Ok(total_written) => {
                    if self.odevs[dev_idx].driver.should_wake() {
                        match self.update_dev_wakeup_time(dev_idx, now) {
                            Ok(hw_level) => {
                                if hw_level <= total_written && total_written > 0 {
                                    self.handle_output_underrun(
                                        dev_idx,
                                        hw_level,
                                        total_written,
                                        now,
                                    );
                                }
                                dev_idx += 1;
                            }
                            Err(err) => {
                                self.handle_device_error(Direction::Playback, dev_idx, err, now);
                            }
                        }
                    } else {
                        dev_idx += 1;
                    }
                }
                Err(err) => self.handle_device_error(Direction::Playback, dev_idx, err, now),
            }
        }

        for id in finished {
            info!(stream = %id, "draining stream finished");
            self.remove_stream(id);
        }

        self.check_non_empty_transition(now);
    }

    fn handle_output_underrun(
        &mut self,
        dev_idx: usize,
        hw_level: usize,
        written: usize,
        now: Instant,
    ) {
        let dev_id = self.odevs[dev_idx].id;
        warn!(device = %dev_id, hw_level, written, "output underrun");
        self.emit(EngineEvent::Underrun {
            device: dev_id,
            hw_level,
            written,
        });
        let dev = &mut self.odevs[dev_idx];
        match dev.driver.output_underrun(hw_level, written) {
            Ok(()) => {
                // Recovery manipulates the hardware pointers; the get/put
                // ledger no longer matches them.
                dev.last_get_frames = 0;
                dev.last_put_frames = 0;
                let _ = self.update_dev_wakeup_time(dev_idx, now);
            }
            Err(err) => self.handle_device_error(Direction::Playback, dev_idx, err, now),
        }
    }

    /// Mixes every running stream into one output device and commits the
    /// result to hardware. Returns frames written.
    fn write_output_samples(
        &mut self,
        dev_idx: usize,
        now: Instant,
        finished: &mut Vec<StreamId>,
    ) -> Result<usize, DriverError> {
        let Self {
            odevs,
            streams,
            config,
            stats,
            event_cb,
            ..
        } = self;
        let dev = &mut odevs[dev_idx];

        // Track no-stream state transitions.
        match (dev.attachments.is_empty(), dev.driver.state()) {
            (true, DeviceState::NormalRun) => dev.driver.set_no_stream(true)?,
            (false, DeviceState::NoStreamRun) => dev.driver.set_no_stream(false)?,
            _ => {}
        }

        if dev.driver.state() != DeviceState::NormalRun {
            // The buffer state will change again before the next normal run;
            // a stale ledger would only produce false alarms.
            dev.last_get_frames = 0;
            dev.last_put_frames = 0;
            return Ok(0);
        }

        let (hw_level, tstamp) = dev.driver.frames_queued()?;
        if let Some(ts) = tstamp {
            update_coarse_rate_adjust(dev, hw_level);
            if dev.rate_estimator.update(hw_level, ts) {
                propagate_est_rate(dev, streams);
            }
        }

        // Never request more than the hardware can hold.
        let fr_to_req = dev.driver.buffer_size().saturating_sub(hw_level);
        let frame_bytes = dev.driver.format().frame_bytes();
        let mut total_written = 0usize;

        // At most two passes: the hardware ring may hand back a partial
        // area at the wrap point.
        while total_written < fr_to_req {
            let OpenDevice {
                id,
                driver,
                attachments,
                offsets,
                last_get_frames,
                last_put_frames,
                rate_estimator,
                non_empty_check,
                empty,
                ..
            } = dev;

            let (limit, drained) =
                compute_write_limit(attachments, streams, fr_to_req - total_written);
            for sid in drained {
                if !finished.contains(&sid) {
                    finished.push(sid);
                }
            }

            let (area, frames_writable) = driver.get_output_buffer(fr_to_req - total_written)?;
            if frames_writable == 0 {
                break;
            }

            // The not-yet-committed span from the last wake was already
            // handed to streams; a driver reporting less than that is
            // broken.
            if last_get_frames.saturating_sub(*last_put_frames) > frames_writable {
                warn!(
                    device = %id,
                    last_get = *last_get_frames,
                    last_put = *last_put_frames,
                    frames_writable,
                    "unreasonable writable frames from driver"
                );
                if let Some(cb) = event_cb.as_ref() {
                    cb(EngineEvent::UnreasonableAvailableFrames {
                        device: *id,
                        last_get: *last_get_frames,
                        last_put: *last_put_frames,
                        writable: frames_writable,
                    });
                }
            }
            *last_get_frames = frames_writable;

            let span_limit = limit.min(frames_writable);

            // Zero anything past the furthest stream offset; the area below
            // it already carries mixed data from earlier passes.
            let max_offset = attachments
                .iter()
                .filter(|a| a.running)
                .map(|a| offsets.offset(a.stream_id))
                .max()
                .unwrap_or(0);
            if span_limit > max_offset {
                area[max_offset * frame_bytes..span_limit * frame_bytes].fill(0);
            }

            for (index, att) in attachments.iter_mut().enumerate() {
                if !att.running {
                    continue;
                }
                let Some(stream) = streams.get_mut(&att.stream_id) else {
                    continue;
                };
                let offset = offsets.offset(att.stream_id);
                if offset >= span_limit {
                    continue;
                }
                let mut nwritten = att.mix(
                    stream,
                    &mut area[offset * frame_bytes..],
                    span_limit - offset,
                    index == 0,
                );
                // A draining stream that ran dry must not hold the other
                // streams back; credit it with the full span.
                if stream.is_draining() && att.playback_frames(stream) == 0 {
                    nwritten = span_limit - offset;
                }
                offsets.update(att.stream_id, nwritten);
            }

            let written = offsets.commit(frames_writable);

            // Periodically probe whether the device is playing only empty
            // audio. Newly opened devices count as non-empty until probed.
            if non_empty_check.is_none() {
                *non_empty_check = Some(PolledInterval::new(now, config.non_empty_check_interval));
            }
            let mut non_empty = false;
            let probe = match non_empty_check {
                Some(pi) if empty.is_some() || pi.elapsed(now) => {
                    pi.reset(now);
                    Some(&mut non_empty)
                }
                _ => None,
            };
            let probed = probe.is_some();
            driver.put_output_buffer(written, probe)?;

            if probed {
                if non_empty {
                    *empty = None;
                } else if empty.is_none() {
                    *empty = Some(PolledInterval::new(now, config.min_empty_period));
                }
            }

            rate_estimator.add_frames(written);
            stats.add_written(written as u64);
            *last_put_frames = written;
            total_written += written;

            if written < frames_writable {
                // Got everything the streams could give; committing less
                // than the grant means there is nothing more this tick.
                break;
            }
        }

        Ok(total_written)
    }

    /// Updates the device wake time from its estimated playable frames
    /// remaining, and returns the fresh hardware level.
    fn update_dev_wakeup_time(&mut self, dev_idx: usize, now: Instant) -> Result<usize, DriverError> {
        let Self { odevs, streams, .. } = self;
        let dev = &mut odevs[dev_idx];

        let (hw_level, _) = dev.driver.frames_queued()?;
        if dev.driver.state() == DeviceState::NormalRun {
            dev.highest_hw_level = dev.highest_hw_level.max(hw_level);
        }

        let playable = dev.attachments.iter().any(|att| {
            att.running
                && streams
                    .get(&att.stream_id)
                    .is_some_and(|s| att.playback_frames(s) > 0)
        });
        let frames = dev.frames_to_play_in_sleep(hw_level, playable);
        let est_rate = dev.rate_estimator.rate();
        dev.wake_ts = Some(now + frames_to_duration(frames, est_rate));
        Ok(hw_level)
    }

    // ----- Error handling and registry maintenance -----

    /// Device-fatal error policy: request recovery per error class, then
    /// detach the device and every attachment. Streams keep living.
    fn handle_device_error(
        &mut self,
        direction: Direction,
        dev_idx: usize,
        err: DriverError,
        now: Instant,
    ) {
        let dev_id = match direction {
            Direction::Playback => self.odevs[dev_idx].id,
            Direction::Capture => self.idevs[dev_idx].id,
        };

        match &err {
            DriverError::Underrun => {
                warn!(device = %dev_id, "severe underrun; requesting device reset");
                self.emit(EngineEvent::SevereUnderrun { device: dev_id });
            }
            DriverError::Io => {
                // Rate limit reset requests: a broken device erroring in a
                // loop must not trigger a reset storm.
                let reset_requested = match self.last_io_err {
                    Some(prev) => now.duration_since(prev) > self.config.io_error_reset_cooldown,
                    None => true,
                };
                self.last_io_err = Some(now);
                warn!(device = %dev_id, reset_requested, "device i/o error");
                self.emit(EngineEvent::DeviceIoError {
                    device: dev_id,
                    reset_requested,
                });
            }
            DriverError::Failed(reason) => {
                warn!(device = %dev_id, reason, "device fault");
            }
        }

        self.rm_open_dev(direction, dev_idx, &err.to_string(), now);
    }

    /// Removes a device from the registry, force-detaching every attachment.
    fn rm_open_dev(&mut self, direction: Direction, dev_idx: usize, reason: &str, now: Instant) {
        let list = match direction {
            Direction::Playback => &mut self.odevs,
            Direction::Capture => &mut self.idevs,
        };
        let dev = list.remove(dev_idx);
        for att in &dev.attachments {
            if let Some(stream) = self.streams.get_mut(&att.stream_id) {
                stream.forget_device(dev.id);
            }
        }
        info!(device = %dev.id, reason, "device removed");
        self.stats.add_device_removed();
        self.emit(EngineEvent::DeviceRemoved {
            device: dev.id,
            reason: reason.to_string(),
        });
        self.check_non_empty_transition(now);
    }

    /// Emits a transition event whenever the count of devices carrying
    /// non-empty audio crosses zero.
    fn check_non_empty_transition(&mut self, now: Instant) {
        let count = self
            .odevs
            .iter()
            .filter(|dev| match &dev.empty {
                Some(pi) => !pi.elapsed(now),
                None => true,
            })
            .count();

        if (self.non_empty_dev_count == 0) != (count == 0) {
            self.emit(EngineEvent::NonEmptyStateChanged { active: count > 0 });
        }
        self.non_empty_dev_count = count;
    }
}

/// Coarse rate adjust: nudge the estimate up when the buffer runs
/// persistently low, down when persistently high.
fn update_coarse_rate_adjust(dev: &mut OpenDevice, hw_level: usize) {
    dev.coarse_rate_adjust = if hw_level < dev.min_cb_level / 2 {
        1
    } else if hw_level > dev.max_cb_level * 2 {
        -1
    } else {
        0
    };
}

/// Feeds the device's estimated rate into every attachment's converter so
/// multi-device synchronization stays consistent.
fn propagate_est_rate(dev: &mut OpenDevice, streams: &BTreeMap<StreamId, ClientStream>) {
    let est = dev.rate_estimator.rate();
    for att in dev.attachments.iter_mut() {
        if let Some(stream) = streams.get(&att.stream_id) {
            att.set_dev_rate(stream, est, dev.coarse_rate_adjust);
        }
    }
}

/// Minimum room across attached streams, bounding how much a device may
/// capture this pass. Reclaims rings whose consumer stopped draining.
fn stream_capture_limit(
    dev: &mut OpenDevice,
    streams: &mut BTreeMap<StreamId, ClientStream>,
) -> usize {
    let mut limit = usize::MAX;
    for att in &dev.attachments {
        let Some(stream) = streams.get_mut(&att.stream_id) else {
            continue;
        };
        if stream.ring_mut().check_write_overrun() {
            warn!(stream = %stream.id(), "capture overrun: client not consuming");
        }
        limit = limit.min(att.capture_avail(stream));
    }
    if limit == usize::MAX {
        0
    } else {
        limit
    }
}

/// Maximum frames renderable this pass: the minimum playable frames across
/// running, non-draining streams. When everything is draining, the drain
/// limit governs instead. Returns drained stream ids alongside.
fn compute_write_limit(
    attachments: &[StreamAttachment],
    streams: &BTreeMap<StreamId, ClientStream>,
    writeable: usize,
) -> (usize, Vec<StreamId>) {
    let mut limit = writeable;
    let mut drain_limit = writeable;
    let mut num_playing = 0usize;
    let mut drained = Vec::new();

    for att in attachments {
        if !att.running {
            continue;
        }
        let Some(stream) = streams.get(&att.stream_id) else {
            continue;
        };
        let dev_frames = att.playback_frames(stream);
        if stream.is_draining() {
            drain_limit = drain_limit.min(dev_frames);
            if dev_frames == 0 {
                drained.push(att.stream_id);
            }
        } else {
            limit = limit.min(dev_frames);
            num_playing += 1;
        }
    }

    if num_playing == 0 {
        (drain_limit, drained)
    } else {
        (limit, drained)
    }
}

/// Computes one input device's wake time: the earliest of its streams'
/// deadlines and the device's own half-buffer estimate, floored at the
/// minimum input wake. Also decides whether backlog must be dropped.
fn input_dev_wake_ts(
    dev: &mut OpenDevice,
    streams: &BTreeMap<StreamId, ClientStream>,
    config: &SchedulerConfig,
    now: Instant,
    need_to_drop: &mut bool,
) -> Result<(), DriverError> {
    // Bounded default so an idle device still wakes eventually.
    let mut min_ts = now + config.max_sleep;
    dev.wake_ts = Some(min_ts);

    let (hw_level, _) = dev.driver.frames_queued()?;

    // Backlog recovery trigger: a relative bound (callback level or buffer
    // size) and the sustained-duration bound must both hold.
    let est_rate = dev.rate_estimator.rate();
    let level_duration = frames_to_duration(hw_level, est_rate);
    let over_cb = dev.largest_cb_level > 0
        && hw_level as f64 >= dev.largest_cb_level as f64 * config.drop_cb_level_multiple;
    let over_buffer =
        hw_level as f64 >= dev.driver.buffer_size() as f64 * config.drop_buffer_fraction;
    if !dev.attachments.is_empty()
        && (over_cb || over_buffer)
        && level_duration >= config.drop_threshold
    {
        *need_to_drop = true;
    }

    let mut cap_limit = usize::MAX;
    for att in &dev.attachments {
        let Some(stream) = streams.get(&att.stream_id) else {
            continue;
        };
        cap_limit = cap_limit.min(att.capture_avail(stream));
        if stream.is_draining() || stream.is_pending_reply() {
            continue;
        }
        if let Some(ts) = stream.next_cb_ts {
            min_ts = min_ts.min(ts);
        }
    }

    // With room in the streams, also wake when the device approaches half a
    // buffer, floored to avoid busy loops.
    if cap_limit > 0 && cap_limit != usize::MAX {
        let half = dev.driver.buffer_size() / 2;
        let target = half.saturating_sub(hw_level);
        let sleep = frames_to_duration(target, est_rate).max(config.min_input_wake);
        min_ts = min_ts.min(now + sleep);
    }

    dev.wake_ts = Some(min_ts);
    Ok(())
}
