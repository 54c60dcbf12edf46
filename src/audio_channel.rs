//! Per-endpoint timing-reconciliation unit (component C). Each distinct
//! audio stream seen by the capture reader owns one [`AudioChannel`]: it
//! resamples whatever the producer hands it to the mix engine's output
//! format, repairs timestamp jumps, and holds converted samples in a
//! per-plane [`CircularByteBuffer`] until the mix engine picks them up.
//!
//! Ported from the reference WASAPI process-capture plugin's
//! `audio-channel.c`; the timing arithmetic below preserves that file's
//! exact order of operations, including the quirk noted in DESIGN.md where
//! `next_audio_sys_ts_min` is derived from the pre-margin, pre-resampler-
//! offset timestamp rather than the final adjusted one.

use log::{debug, warn};

use crate::circular_buffer::CircularByteBuffer;
use crate::monitoring::CaptureMetrics;
use crate::resampler::{AudioDesc, ChannelResampler};

/// Timestamps within this many nanoseconds of the system clock are treated
/// as already being in the wall-clock frame.
pub const MAX_TS_VAR: u64 = 2_000_000_000;
/// Timestamp deltas below this are smoothed away rather than treated as a
/// discontinuity.
pub const TS_SMOOTHING_THRESHOLD: u64 = 70_000_000;
/// Capture-side jitter safety margin added to every placed timestamp.
pub const CAPTURE_JITTER_MARGIN: u64 = 100_000_000;
/// Per-plane byte cap: 1000 output blocks' worth of f32 samples.
pub fn max_buf_size(output_frames: usize) -> usize {
    1000 * output_frames * std::mem::size_of::<f32>()
}

fn apply_adjust(ts: u64, adjust: i64) -> u64 {
    (ts as i128 + adjust as i128).max(0) as u64
}

/// Outcome of a discard pass, used by the mix engine to decide whether a
/// channel should be retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardOutcome {
    /// Nothing needed discarding this tick.
    Untouched,
    /// Normal advance: samples before `ts.start` were consumed.
    Advanced,
    /// The channel was cleared back to the empty state after a confirmed
    /// stall.
    Cleared,
    /// Buffering is saturated; this channel's backlog was dropped rather
    /// than growing the buffering-tick count further.
    Ignored,
}

pub struct AudioChannel {
    out_desc: AudioDesc,
    output_frames: usize,

    resampler: ChannelResampler,
    resample_scratch: Vec<Vec<f32>>,

    audio_input_buf: Vec<CircularByteBuffer>,
    audio_output_buf: Vec<Vec<f32>>,

    audio_ts: u64,
    last_audio_ts: u64,
    next_audio_ts_min: u64,
    next_audio_sys_ts_min: u64,
    timing_adjust: i64,

    last_audio_input_buf_size: usize,
    audio_pending: bool,
    pending_stop: bool,
}

impl AudioChannel {
    pub fn new(in_desc: AudioDesc, out_desc: AudioDesc, output_frames: usize) -> anyhow::Result<Self> {
        let resampler = ChannelResampler::new(in_desc, out_desc)?;
        let channels = out_desc.channels.max(1);
        Ok(Self {
            out_desc,
            output_frames,
            resampler,
            resample_scratch: vec![Vec::new(); channels],
            audio_input_buf: (0..channels).map(|_| CircularByteBuffer::new()).collect(),
            audio_output_buf: vec![vec![0.0; output_frames]; channels],
            audio_ts: 0,
            last_audio_ts: 0,
            next_audio_ts_min: 0,
            next_audio_sys_ts_min: 0,
            timing_adjust: 0,
            last_audio_input_buf_size: 0,
            audio_pending: false,
            pending_stop: false,
        })
    }

    pub fn audio_ts(&self) -> u64 {
        self.audio_ts
    }

    pub fn is_pending(&self) -> bool {
        self.audio_pending
    }

    /// Consumes one frame of producer audio: resamples it to the channel's
    /// output format, reconciles its timestamp against the system clock,
    /// and places the converted samples into the per-plane buffers.
    pub fn output_audio(
        &mut self,
        data: &[&[u8]],
        frames: usize,
        in_desc: AudioDesc,
        timestamp_ns: u64,
        os_time: u64,
        metrics: &CaptureMetrics,
    ) -> anyhow::Result<()> {
        if in_desc != self.resampler.in_desc() {
            self.resampler = ChannelResampler::new(in_desc, self.out_desc)?;
            metrics.resampler_rebuilds.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let out_frames = self.resampler.process(data, frames, &mut self.resample_scratch)?;
        if out_frames == 0 {
            return Ok(());
        }
        let resample_offset = self.resampler.resample_offset();

        let raw_ts = timestamp_ns;
        let using_direct_ts = raw_ts.abs_diff(os_time) < MAX_TS_VAR;
        if using_direct_ts {
            self.timing_adjust = 0;
        }

        let mut ts = raw_ts;
        if self.next_audio_ts_min != 0 {
            let diff = self.next_audio_ts_min.abs_diff(ts);
            if diff > MAX_TS_VAR && !using_direct_ts {
                self.timing_adjust = os_time as i64 - ts as i64;
                debug!("audio channel: timestamp jump detected, resetting timing_adjust");
            } else if diff < TS_SMOOTHING_THRESHOLD {
                ts = self.next_audio_ts_min;
            }
        }

        self.last_audio_ts = ts;
        let out_rate = self.out_desc.sample_rate as u64;
        self.next_audio_ts_min = ts + (out_frames as u64 * 1_000_000_000 / out_rate);

        ts = apply_adjust(ts, self.timing_adjust);

        // Open question (see DESIGN.md): next_audio_sys_ts_min is derived
        // from next_audio_ts_min, computed above before the capture-jitter
        // margin and resampler-offset correction are folded into `ts`.
        self.next_audio_sys_ts_min = apply_adjust(self.next_audio_ts_min, self.timing_adjust);

        let resample_offset_ns = resample_offset * 1_000_000_000 / out_rate;
        let ts_final = (ts + CAPTURE_JITTER_MARGIN).saturating_sub(resample_offset_ns);

        let use_place = if self.next_audio_sys_ts_min != 0 && ts_final == self.next_audio_sys_ts_min {
            false
        } else if self.next_audio_sys_ts_min != 0
            && ts_final.abs_diff(self.next_audio_sys_ts_min) < TS_SMOOTHING_THRESHOLD
        {
            false
        } else if self.next_audio_sys_ts_min != 0
            && ts_final.abs_diff(self.next_audio_sys_ts_min) > MAX_TS_VAR
        {
            self.timing_adjust = os_time as i64 - raw_ts as i64;
            true
        } else {
            true
        };

        let n_bytes = out_frames * std::mem::size_of::<f32>();
        let cap = max_buf_size(self.output_frames);

        if use_place {
            self.place_samples(ts_final, n_bytes, cap, metrics);
        } else {
            self.push_back_samples(n_bytes, cap, metrics);
        }

        self.last_audio_input_buf_size = self.audio_input_buf[0].len();
        Ok(())
    }

    fn push_back_samples(&mut self, n_bytes: usize, cap: usize, metrics: &CaptureMetrics) {
        if self.audio_input_buf[0].len() + n_bytes > cap {
            metrics.ingest_overflow_drops.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!("audio channel: ingest would exceed buffer cap, dropping frame");
            return;
        }
        for (plane, buf) in self.resample_scratch.iter().zip(self.audio_input_buf.iter_mut()) {
            let bytes: Vec<u8> = plane.iter().flat_map(|s| s.to_le_bytes()).collect();
            buf.push_back(&bytes);
        }
    }

    fn place_samples(&mut self, ts_final: u64, n_bytes: usize, cap: usize, metrics: &CaptureMetrics) {
        if self.audio_ts == 0 || ts_final < self.audio_ts {
            self.audio_ts = ts_final;
        }
        let sample_bytes = std::mem::size_of::<f32>() as u64;
        let out_rate = self.out_desc.sample_rate as u64;
        let frame_offset = (ts_final - self.audio_ts) * out_rate / 1_000_000_000;
        let byte_offset = (frame_offset * sample_bytes) as usize;

        if byte_offset + n_bytes > cap {
            metrics.ingest_overflow_drops.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!("audio channel: placement would exceed buffer cap, dropping frame");
            return;
        }

        for (plane, buf) in self.resample_scratch.iter().zip(self.audio_input_buf.iter_mut()) {
            let bytes: Vec<u8> = plane.iter().flat_map(|s| s.to_le_bytes()).collect();
            buf.place(byte_offset, &bytes);
            buf.truncate(byte_offset + n_bytes);
        }
    }

    /// Peeks `self.output_frames` frames from each plane into the scratch
    /// output buffer. Leaves `audio_pending` set when there isn't enough
    /// data yet; the mix engine re-checks after every tick's ingest pass.
    pub fn pick_audio_data(&mut self) {
        let size_bytes = self.output_frames * std::mem::size_of::<f32>();
        if self.audio_input_buf[0].len() < size_bytes {
            self.audio_pending = true;
            return;
        }
        self.audio_pending = false;
        for (plane, buf) in self.audio_output_buf.iter_mut().zip(self.audio_input_buf.iter()) {
            let mut bytes = vec![0u8; size_bytes];
            buf.peek_front(&mut bytes);
            for (i, chunk) in bytes.chunks_exact(4).enumerate() {
                plane[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
    }

    /// Returns true when this channel cannot contribute a full block
    /// starting at `min_ts`, latching `audio_pending` in that case.
    pub fn audio_buffer_insufficient(&mut self, min_ts: u64) -> bool {
        if self.audio_pending || self.audio_ts == 0 {
            return false;
        }
        let rate = self.out_desc.sample_rate as u64;
        let mut needed = self.output_frames;
        // At the exact `min_ts` and `min_ts - 1` boundaries the start-point
        // computation is skipped and a full block is required instead.
        // Otherwise an unsigned `audio_ts - min_ts` below `min_ts` would
        // underflow to a huge start point and short-circuit to "sufficient"
        // even though the channel is genuinely short on buffered data.
        if self.audio_ts != min_ts && self.audio_ts != min_ts.wrapping_sub(1) {
            if self.audio_ts < min_ts {
                return false;
            }
            let start_offset_frames = (self.audio_ts - min_ts) * rate / 1_000_000_000;
            if start_offset_frames as usize >= self.output_frames {
                return false;
            }
            needed -= start_offset_frames as usize;
        }
        let available_frames = self.audio_input_buf[0].len() / std::mem::size_of::<f32>();
        if available_frames < needed {
            self.audio_pending = true;
            true
        } else {
            false
        }
    }

    /// Adds this channel's contribution (if any falls within
    /// `[ts_start, ts_end)`) into `mix_out`.
    pub fn mix(&self, mix_out: &mut [Vec<f32>], ts_start: u64, ts_end: u64) {
        if self.audio_pending || self.audio_ts == 0 {
            return;
        }
        if self.audio_ts < ts_start || self.audio_ts >= ts_end {
            return;
        }
        let rate = self.out_desc.sample_rate as u64;
        let start_frame = ((self.audio_ts - ts_start) * rate / 1_000_000_000) as usize;
        if start_frame >= self.output_frames {
            return;
        }
        let n = self.output_frames - start_frame;
        for (src, dst) in self.audio_output_buf.iter().zip(mix_out.iter_mut()) {
            for i in 0..n {
                dst[start_frame + i] += src[i];
            }
        }
    }

    /// Advances the read cursor past `[ts_start, ts_end)`, handling the
    /// stall-latch and buffering-cap-exceeded paths.
    pub fn discard(
        &mut self,
        ts_start: u64,
        ts_end: u64,
        total_buffering_ticks: u32,
        max_buffering_ticks: u32,
    ) -> DiscardOutcome {
        if self.audio_ts == 0 {
            return DiscardOutcome::Untouched;
        }
        if ts_end <= self.audio_ts {
            return DiscardOutcome::Untouched;
        }

        let block_bytes = self.output_frames * std::mem::size_of::<f32>();

        if self.audio_ts + 1 < ts_start {
            let near_empty = self.audio_input_buf[0].len() < block_bytes;
            if self.audio_pending && near_empty {
                if self.pending_stop
                    && self.last_audio_input_buf_size == self.audio_input_buf[0].len()
                {
                    self.clear();
                    return DiscardOutcome::Cleared;
                }
                self.pending_stop = true;
                return DiscardOutcome::Untouched;
            }
            if total_buffering_ticks >= max_buffering_ticks {
                for buf in &mut self.audio_input_buf {
                    buf.clear();
                }
                self.audio_ts = ts_end;
                self.pending_stop = false;
                return DiscardOutcome::Ignored;
            }
        }

        let rate = self.out_desc.sample_rate as u64;
        let start_frame = if self.audio_ts < ts_start {
            0
        } else {
            ((self.audio_ts - ts_start) * rate / 1_000_000_000) as usize
        };
        if start_frame == self.output_frames {
            // This channel's content starts exactly one block ahead of
            // ts_start: nothing to consume this tick, and audio_ts already
            // correctly describes where the buffer begins. Leave it alone
            // so it's reconsidered against the next tick's range.
            return DiscardOutcome::Untouched;
        }
        let consumed_frames = self.output_frames.saturating_sub(start_frame);
        let consumed_bytes = consumed_frames * std::mem::size_of::<f32>();

        for buf in &mut self.audio_input_buf {
            buf.pop_front(None, consumed_bytes);
        }
        self.audio_ts = ts_end;
        self.pending_stop = false;
        DiscardOutcome::Advanced
    }

    fn clear(&mut self) {
        for buf in &mut self.audio_input_buf {
            buf.clear();
        }
        self.audio_ts = 0;
        self.audio_pending = false;
        self.pending_stop = false;
    }
}
