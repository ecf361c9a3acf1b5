//! Per-(stream, device) attachment: format bridging, mixing, capture.
//!
//! A [`StreamAttachment`] binds one client stream to one open device. It
//! owns the optional format converter for the pairing and the intra-period
//! bookkeeping; the stream itself is shared (a stream playing to two devices
//! has two attachments) and is passed in by the scheduler for every
//! operation.

use std::time::Instant;

use crate::device::DeviceId;
use crate::error::{ClientError, ConfigError};
use crate::format::convert::{conversion_needed, FormatConverter};
use crate::format::{frames_at_rate, mix::mix_add, AudioFormat};
use crate::stream::{ClientStream, Direction, StreamId};

/// Binds one client stream to one open device.
pub struct StreamAttachment {
    pub(crate) stream_id: StreamId,
    pub(crate) device_id: DeviceId,
    dev_format: AudioFormat,
    converter: Option<FormatConverter>,
    /// Conversion output staging.
    scratch: Vec<u8>,
    /// Set once the stream's first callback deadline has arrived and the
    /// attachment takes part in mixing/capturing.
    pub(crate) running: bool,
}

impl StreamAttachment {
    /// Creates the attachment, configuring a converter when the stream and
    /// device formats differ.
    ///
    /// The converter is sized to the larger of the stream's buffer and its
    /// device-rate equivalent, so a whole stream buffer can always be pushed
    /// through in one call.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the format pairing cannot be bridged; the caller
    /// must then not register the stream with the device.
    pub fn new(
        stream: &ClientStream,
        device_id: DeviceId,
        dev_format: AudioFormat,
    ) -> Result<Self, ConfigError> {
        let (from, to) = match stream.direction {
            Direction::Playback => (stream.format, dev_format),
            Direction::Capture => (dev_format, stream.format),
        };

        let max_frames = stream.buffer_frames.max(frames_at_rate(
            stream.format.frame_rate,
            stream.buffer_frames,
            dev_format.frame_rate,
        ));

        let (converter, scratch) = if conversion_needed(&from, &to) {
            let converter = FormatConverter::new(from, to, max_frames)?;
            let out_frames = converter.in_frames_to_out(stream.buffer_frames);
            let scratch_frames = 2 * out_frames.max(stream.buffer_frames);
            let scratch = vec![0u8; scratch_frames * to.frame_bytes()];
            (Some(converter), scratch)
        } else {
            (None, Vec::new())
        };

        Ok(Self {
            stream_id: stream.id,
            device_id,
            dev_format,
            converter,
            scratch,
            running: false,
        })
    }

    /// The attached stream.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Whether the attachment has started mixing/capturing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Feeds the device's estimated real rate into the converter, nudged by
    /// the coarse adjust step, so multi-device timing stays consistent.
    pub fn set_dev_rate(&mut self, stream: &ClientStream, est_rate: f64, coarse_adjust: i8) {
        let Some(conv) = self.converter.as_mut() else {
            return;
        };
        let rate = est_rate + coarse_adjust as f64;
        match stream.direction {
            Direction::Playback => conv.set_rates(stream.format.frame_rate as f64, rate),
            Direction::Capture => conv.set_rates(rate, stream.format.frame_rate as f64),
        }
    }

    /// Frames ready for this device to mix, in device frames, projected
    /// through the converter when one is active. Frames this device already
    /// read ahead of the slowest sibling device do not count again.
    #[must_use]
    pub fn playback_frames(&self, stream: &ClientStream) -> usize {
        let frames = stream
            .ring
            .queued_frames()
            .saturating_sub(stream.pending_read(self.device_id));
        match &self.converter {
            Some(conv) => conv.in_frames_to_out(frames),
            None => frames,
        }
    }

    /// Room left for this device to capture this period, in device frames.
    ///
    /// The period is bounded by the stream's callback threshold; frames this
    /// device already wrote (published or still ahead of a slower sibling
    /// device) count against it.
    #[must_use]
    pub fn capture_avail(&self, stream: &ClientStream) -> usize {
        let period = stream.cb_threshold.min(stream.ring.used_frames());
        let used = stream.ring.pending_write_frames() + stream.pending_capture(self.device_id);
        let room = period.saturating_sub(used);
        match &self.converter {
            Some(conv) => conv.out_frames_to_in(room),
            None => room,
        }
    }

    /// Pulls playable frames from the stream's ring, converts them if
    /// needed, and mixes them additively into `dst`.
    ///
    /// `first` marks the first stream mixed into this span (copy instead of
    /// add). Advances the stream's read cursor and per-device offset by the
    /// source frames actually consumed, which under conversion differs from
    /// the frames written. Returns device frames written.
    pub fn mix(
        &mut self,
        stream: &mut ClientStream,
        dst: &mut [u8],
        max_frames: usize,
        first: bool,
    ) -> usize {
        // Start past whatever this device already read ahead of the
        // slowest sibling; the ring's read pointer trails the minimum.
        let base = stream.pending_read(self.device_id);
        let queued = stream.ring.queued_frames().saturating_sub(base);
        if queued == 0 {
            return 0;
        }
        let num_to_write = max_frames.min(match &self.converter {
            Some(conv) => conv.in_frames_to_out(queued),
            None => queued,
        });

        let volume = stream.ring.volume();
        let mute = stream.ring.mute();
        let dev_fb = self.dev_format.frame_bytes();
        let samples_per_frame = self.dev_format.channels as usize;

        let mut fr_written = 0usize;
        let mut fr_read = 0usize;
        while fr_written < num_to_write {
            let span = stream.ring.acquire_read(base + fr_read);
            let span_frames = span.len() / stream.format.frame_bytes();
            if span_frames == 0 {
                break;
            }

            let (src, dev_frames, read_frames) = match self.converter.as_mut() {
                Some(conv) => {
                    let mut read = span_frames;
                    let wrote =
                        conv.convert(span, &mut read, &mut self.scratch, num_to_write - fr_written);
                    (&self.scratch[..], wrote, read)
                }
                None => {
                    let n = span_frames.min(num_to_write - fr_written);
                    (span, n, n)
                }
            };
            if dev_frames == 0 && read_frames == 0 {
                break;
            }

            mix_add(
                &mut dst[fr_written * dev_fb..],
                src,
                dev_frames * samples_per_frame,
                self.dev_format.sample_format,
                first,
                mute,
                volume,
            );
            fr_written += dev_frames;
            fr_read += read_frames;
        }

        stream.commit_device_read(self.device_id, fr_read);
        stream.dev_offset_update(self.device_id, fr_read as u64);
        fr_written
    }

    /// Copies captured device frames into the stream's ring, converting and
    /// applying `gain`. Returns the device frames consumed.
    ///
    /// Each device writes at its own cursor past the ring's write pointer;
    /// the pointer itself advances only as far as the slowest device, so a
    /// stream fed by several devices stays within one period of all of them.
    pub fn capture(&mut self, stream: &mut ClientStream, src: &[u8], gain: f32) -> usize {
        let dev_fb = self.dev_format.frame_bytes();
        let src_frames_avail = src.len() / dev_fb;
        if src_frames_avail == 0 {
            return 0;
        }

        let stream_fb = stream.format.frame_bytes();
        let period = stream.cb_threshold.min(stream.ring.used_frames());
        let base = stream.pending_capture(self.device_id);
        let consumed;
        let wrote_stream_frames;

        match self.converter.as_mut() {
            Some(conv) => {
                let mut n = src_frames_avail;
                let scratch_frames = self.scratch.len() / stream_fb;
                let wrote = conv.convert(src, &mut n, &mut self.scratch, scratch_frames);
                let span = stream.ring.acquire_capture_write(period);
                let dst = &mut span[(base * stream_fb).min(span.len())..];
                let frames = wrote.min(dst.len() / stream_fb);
                copy_with_gain(dst, &self.scratch, frames * stream.format.channels as usize,
                    stream.format, gain);
                consumed = n;
                wrote_stream_frames = frames;
            }
            None => {
                let span = stream.ring.acquire_capture_write(period);
                let dst = &mut span[(base * stream_fb).min(span.len())..];
                let frames = src_frames_avail.min(dst.len() / stream_fb);
                copy_with_gain(dst, src, frames * stream.format.channels as usize,
                    stream.format, gain);
                consumed = frames;
                wrote_stream_frames = frames;
            }
        }

        stream.note_device_capture(self.device_id, wrote_stream_frames);
        stream.dev_offset_update(self.device_id, consumed as u64);
        consumed
    }

    /// Closes the stream's capture buffer once it holds a full callback
    /// period: publishes it, advances the deadline, and notifies the client.
    ///
    /// Returns `true` when the client was notified. A stream attached to
    /// several devices is published by whichever attachment checks first;
    /// the others see an empty period and do nothing.
    pub fn capture_publish(
        &self,
        stream: &mut ClientStream,
        now: Instant,
    ) -> Result<bool, ClientError> {
        let str_frames = stream.ring.pending_write_frames();
        if str_frames < stream.cb_threshold {
            return Ok(false);
        }

        stream.ring.buffer_write_complete();
        stream.schedule_next_callback(now);
        let threshold = stream.cb_threshold;
        stream.audio_ready(threshold)?;
        Ok(true)
    }
}

/// Copies `samples` interleaved samples applying a linear gain, saturating
/// on overflow. A unity gain degenerates to a plain copy.
fn copy_with_gain(dst: &mut [u8], src: &[u8], samples: usize, format: AudioFormat, gain: f32) {
    let width = format.sample_format.sample_bytes();
    let bytes = samples * width;
    if (gain - 1.0).abs() < 0.000_01 {
        dst[..bytes].copy_from_slice(&src[..bytes]);
        return;
    }
    match width {
        2 => {
            for i in 0..samples {
                let o = i * 2;
                let s = i16::from_le_bytes([src[o], src[o + 1]]);
                let scaled = ((s as f32) * gain)
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                dst[o..o + 2].copy_from_slice(&scaled.to_le_bytes());
            }
        }
        _ => {
            for i in 0..samples {
                let o = i * 4;
                let s = i32::from_le_bytes([src[o], src[o + 1], src[o + 2], src[o + 3]]);
                let scaled = ((s as f64) * gain as f64)
                    .clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                dst[o..o + 4].copy_from_slice(&scaled.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::stream::ScriptedClient;

    fn fmt(rate: u32, channels: u16) -> AudioFormat {
        AudioFormat::new(rate, channels, SampleFormat::S16LE)
    }

    fn playback_stream(rate: u32, cb_threshold: usize) -> ClientStream {
        ClientStream::new(
            StreamId(1),
            Direction::Playback,
            fmt(rate, 2),
            cb_threshold,
            cb_threshold * 2,
            Box::new(ScriptedClient::new(1000, cb_threshold)),
        )
    }

    fn capture_stream(rate: u32, cb_threshold: usize) -> ClientStream {
        ClientStream::new(
            StreamId(2),
            Direction::Capture,
            fmt(rate, 2),
            cb_threshold,
            cb_threshold * 2,
            Box::new(ScriptedClient::new(0, 0).keep_captured()),
        )
    }

    fn from_bytes(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_no_converter_for_matching_formats() {
        let stream = playback_stream(48000, 480);
        let att = StreamAttachment::new(&stream, DeviceId(0), fmt(48000, 2)).unwrap();
        assert!(att.converter.is_none());
    }

    #[test]
    fn test_incompatible_pairing_fails() {
        let stream = playback_stream(48000, 480);
        let dev = AudioFormat::new(48000, 2, SampleFormat::S32LE);
        assert!(StreamAttachment::new(&stream, DeviceId(0), dev).is_err());
    }

    #[test]
    fn test_mix_without_conversion() {
        let mut stream = playback_stream(48000, 480);
        let mut att = StreamAttachment::new(&stream, DeviceId(0), fmt(48000, 2)).unwrap();

        stream.request_audio(Instant::now()).unwrap();
        assert_eq!(stream.ring.queued_frames(), 480);

        let mut dst = vec![0u8; 480 * 4];
        let written = att.mix(&mut stream, &mut dst, 480, true);

        assert_eq!(written, 480);
        assert_eq!(stream.ring.queued_frames(), 0);
        assert_eq!(stream.dev_offset(DeviceId(0)), 480);
        assert!(from_bytes(&dst).iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_mix_additive_second_stream() {
        let mut stream = playback_stream(48000, 480);
        let mut att = StreamAttachment::new(&stream, DeviceId(0), fmt(48000, 2)).unwrap();

        stream.request_audio(Instant::now()).unwrap();
        let mut dst: Vec<u8> = std::iter::repeat(500i16.to_le_bytes())
            .take(480 * 2)
            .flatten()
            .collect();
        att.mix(&mut stream, &mut dst, 480, false);
        assert!(from_bytes(&dst).iter().all(|&s| s == 1500));
    }

    #[test]
    fn test_mix_respects_volume() {
        let mut stream = playback_stream(48000, 480);
        let mut att = StreamAttachment::new(&stream, DeviceId(0), fmt(48000, 2)).unwrap();

        stream.request_audio(Instant::now()).unwrap();
        stream.ring_mut().set_volume(0.5);
        let mut dst = vec![0u8; 480 * 4];
        att.mix(&mut stream, &mut dst, 480, true);
        assert!(from_bytes(&dst).iter().all(|&s| s == 500));
    }

    #[test]
    fn test_mix_with_resampling_consumes_proportionally() {
        // 44.1kHz stream onto a 48kHz device.
        let mut stream = playback_stream(44100, 441);
        let mut att = StreamAttachment::new(&stream, DeviceId(0), fmt(48000, 2)).unwrap();

        stream.request_audio(Instant::now()).unwrap();
        assert_eq!(stream.ring.queued_frames(), 441);

        let mut dst = vec![0u8; 1024 * 4];
        let written = att.mix(&mut stream, &mut dst, 1024, true);

        // 441 source frames yield about 480 device frames.
        assert!((478..=481).contains(&written), "written = {written}");
        let consumed = stream.dev_offset(DeviceId(0)) as usize;
        assert_eq!(consumed, 441 - stream.ring.queued_frames());
        assert!(consumed >= 440);
        // Interpolating a constant signal yields the same constant.
        assert!(from_bytes(&dst[..written * 4]).iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_mix_empty_ring_writes_nothing() {
        let mut stream = playback_stream(48000, 480);
        let mut att = StreamAttachment::new(&stream, DeviceId(0), fmt(48000, 2)).unwrap();
        let mut dst = vec![0u8; 480 * 4];
        assert_eq!(att.mix(&mut stream, &mut dst, 480, true), 0);
    }

    #[test]
    fn test_playback_frames_projection() {
        let mut stream = playback_stream(44100, 441);
        let att = StreamAttachment::new(&stream, DeviceId(0), fmt(48000, 2)).unwrap();

        stream.request_audio(Instant::now()).unwrap();
        let frames = att.playback_frames(&stream);
        assert!((479..=481).contains(&frames), "frames = {frames}");
    }

    #[test]
    fn test_capture_and_publish_notifies_at_threshold() {
        let mut stream = capture_stream(48000, 480);
        let mut att = StreamAttachment::new(&stream, DeviceId(3), fmt(48000, 2)).unwrap();
        let now = Instant::now();

        // 300 frames of value 700: below threshold, no notify.
        let block: Vec<u8> = std::iter::repeat(700i16.to_le_bytes())
            .take(300 * 2)
            .flatten()
            .collect();
        assert_eq!(att.capture(&mut stream, &block, 1.0), 300);
        assert!(!att.capture_publish(&mut stream, now).unwrap());

        // 180 more frames crosses the threshold.
        let block: Vec<u8> = std::iter::repeat(700i16.to_le_bytes())
            .take(180 * 2)
            .flatten()
            .collect();
        assert_eq!(att.capture(&mut stream, &block, 1.0), 180);
        assert!(att.capture_publish(&mut stream, now).unwrap());
        assert_eq!(stream.dev_offset(DeviceId(3)), 480);
        assert!(stream.next_cb_ts.is_some());
    }

    #[test]
    fn test_capture_applies_gain() {
        let mut stream = capture_stream(48000, 480);
        let mut att = StreamAttachment::new(&stream, DeviceId(3), fmt(48000, 2)).unwrap();

        let block: Vec<u8> = std::iter::repeat(1000i16.to_le_bytes())
            .take(480 * 2)
            .flatten()
            .collect();
        att.capture(&mut stream, &block, 0.5);
        att.capture_publish(&mut stream, Instant::now()).unwrap();

        let span = stream.ring.acquire_read(0);
        assert!(from_bytes(span).iter().all(|&s| s == 500));
    }

    #[test]
    fn test_mix_fan_out_to_second_device_sees_same_data() {
        let mut stream = playback_stream(48000, 480);
        stream.pending_reads.insert(DeviceId(0), 0);
        stream.pending_reads.insert(DeviceId(1), 0);
        let mut att_a = StreamAttachment::new(&stream, DeviceId(0), fmt(48000, 2)).unwrap();
        let mut att_b = StreamAttachment::new(&stream, DeviceId(1), fmt(48000, 2)).unwrap();

        stream.request_audio(Instant::now()).unwrap();

        // The first device drains the block, but the ring holds it for the
        // second.
        let mut dst_a = vec![0u8; 480 * 4];
        assert_eq!(att_a.mix(&mut stream, &mut dst_a, 480, true), 480);
        assert_eq!(att_a.playback_frames(&stream), 0);
        assert_eq!(att_b.playback_frames(&stream), 480);

        let mut dst_b = vec![0u8; 480 * 4];
        assert_eq!(att_b.mix(&mut stream, &mut dst_b, 480, true), 480);
        assert_eq!(dst_a, dst_b);

        // Both devices done: the block is gone.
        assert_eq!(stream.ring.queued_frames(), 0);
        assert_eq!(stream.dev_offset(DeviceId(0)), 480);
        assert_eq!(stream.dev_offset(DeviceId(1)), 480);
    }

    #[test]
    fn test_capture_avail_shrinks_as_period_fills() {
        let mut stream = capture_stream(48000, 480);
        let mut att = StreamAttachment::new(&stream, DeviceId(3), fmt(48000, 2)).unwrap();

        assert_eq!(att.capture_avail(&stream), 480);
        let block: Vec<u8> = std::iter::repeat(1i16.to_le_bytes())
            .take(100 * 2)
            .flatten()
            .collect();
        att.capture(&mut stream, &block, 1.0);
        assert_eq!(att.capture_avail(&stream), 380);
    }
}
