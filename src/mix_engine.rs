//! Component F: the periodic mix loop. Ported from `wasapi_capture_mix_audio`
//! and its helpers in the reference plugin's `wasapi-capture.c` — minimum-
//! timestamp calculation across channels, adaptive buffering-tick
//! injection via front-insertion into a both-ends FIFO, scalar mixing with
//! post-mix saturation, and the discard/ignore path that caps total
//! buffering at [`MAX_BUFFERING_TICKS`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;

use crate::audio_channel::DiscardOutcome;
use crate::channel_map::ChannelMap;
use crate::clock::now_ns;
use crate::monitoring::CaptureMetrics;
use crate::resampler::AudioDesc;

/// Hard ceiling on total injected buffering ticks; beyond this, late
/// sources are dropped instead of growing the backlog further.
pub const MAX_BUFFERING_TICKS: u32 = 45;

#[derive(Debug, Clone, Copy)]
struct TsRange {
    start: u64,
    end: u64,
}

/// One emitted mix-engine block, ready for a downstream [`AudioSink`].
pub struct MixedBlock {
    pub timestamp_ns: u64,
    pub sample_rate: u32,
    pub channels: usize,
    pub frames: usize,
    pub planes: Vec<Vec<f32>>,
}

/// Downstream consumer of mixed audio blocks.
pub trait AudioSink: Send + Sync {
    fn emit_audio(&self, block: &MixedBlock) -> anyhow::Result<()>;
}

pub struct MixEngine {
    channels: Arc<ChannelMap>,
    out_desc: AudioDesc,
    output_frames: usize,
    metrics: Arc<CaptureMetrics>,
    sink: Arc<dyn AudioSink>,

    buffered_timestamps: VecDeque<TsRange>,
    buffering_wait_ticks: u32,
    total_buffering_ticks: u32,
    buffered_ts_anchor: u64,
}

impl MixEngine {
    pub fn new(
        channels: Arc<ChannelMap>,
        out_desc: AudioDesc,
        output_frames: usize,
        metrics: Arc<CaptureMetrics>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            channels,
            out_desc,
            output_frames,
            metrics,
            sink,
            buffered_timestamps: VecDeque::new(),
            buffering_wait_ticks: 0,
            total_buffering_ticks: 0,
            buffered_ts_anchor: 0,
        }
    }

    fn block_ns(&self) -> u64 {
        self.output_frames as u64 * 1_000_000_000 / self.out_desc.sample_rate as u64
    }

    /// Total buffering ticks injected so far, capped at [`MAX_BUFFERING_TICKS`].
    pub fn total_buffering_ticks(&self) -> u32 {
        self.total_buffering_ticks
    }

    /// Runs the tick loop until `capturing` is cleared. The inner `while`
    /// catches the engine up (emitting one block per iteration, never more
    /// than one per call) after the thread has been descheduled.
    pub fn run(&mut self, capturing: &AtomicBool) {
        let block_ns = self.block_ns();
        let mut audio_time = now_ns();

        while capturing.load(Ordering::SeqCst) {
            let os_now = now_ns();
            while audio_time <= os_now && capturing.load(Ordering::SeqCst) {
                let end = audio_time + block_ns;
                self.fetch_and_emit(audio_time, end);
                audio_time = end;
            }
            thread::sleep(Duration::from_nanos((block_ns / 4).max(1)));
        }
    }

    /// One mix-loop iteration. Returns without publishing when buffering
    /// suppression is still active.
    pub fn fetch_and_emit(&mut self, start: u64, end: u64) {
        self.buffered_timestamps.push_back(TsRange { start, end });
        let mut ts = *self.buffered_timestamps.front().expect("just pushed");

        let snapshot = self.channels.snapshot();
        self.metrics.active_channels.store(snapshot.len() as u64, Ordering::Relaxed);

        for (_, channel) in &snapshot {
            if let Ok(mut guard) = channel.lock() {
                guard.pick_audio_data();
            }
        }

        let mut min_ts = self.compute_min_ts(&snapshot, ts.start);
        let mut any_newly_pending = false;
        for (_, channel) in &snapshot {
            if let Ok(mut guard) = channel.lock() {
                if guard.audio_buffer_insufficient(min_ts) {
                    any_newly_pending = true;
                }
            }
        }
        if any_newly_pending {
            // Sticky accumulator: the second pass continues from whatever
            // the first pass already lowered min_ts to, it never resets
            // back up to ts.start (a channel excluded by the first pass
            // must stay excluded).
            min_ts = self.compute_min_ts(&snapshot, min_ts);
        }

        if min_ts < ts.start {
            ts = self.inject_buffering(ts, min_ts);
        }

        let block_frames = self.output_frames;
        let out_channels = self.out_desc.channels.max(1);
        let mut mix_buf: Vec<Vec<f32>> = vec![vec![0.0; block_frames]; out_channels];

        if self.buffering_wait_ticks == 0 {
            for (_, channel) in &snapshot {
                if let Ok(guard) = channel.lock() {
                    guard.mix(&mut mix_buf, ts.start, ts.end);
                }
            }
        }

        for (_, channel) in &snapshot {
            if let Ok(mut guard) = channel.lock() {
                let outcome = guard.discard(ts.start, ts.end, self.total_buffering_ticks, MAX_BUFFERING_TICKS);
                match outcome {
                    DiscardOutcome::Cleared => {
                        self.metrics.stalled_channels_cleared.fetch_add(1, Ordering::Relaxed);
                        self.metrics.channel_resets.fetch_add(1, Ordering::Relaxed);
                    }
                    DiscardOutcome::Ignored => {
                        warn!("mix engine: dropping late channel backlog, buffering cap reached");
                    }
                    _ => {}
                }
            }
        }

        self.buffered_timestamps.pop_front();
        let out_ts = ts.start;

        if self.buffering_wait_ticks > 0 {
            self.buffering_wait_ticks -= 1;
            return;
        }

        clamp(&mut mix_buf);
        let block = MixedBlock {
            timestamp_ns: out_ts,
            sample_rate: self.out_desc.sample_rate,
            channels: out_channels,
            frames: block_frames,
            planes: mix_buf,
        };
        if let Err(e) = self.sink.emit_audio(&block) {
            warn!("mix engine: sink rejected block: {e}");
        }
    }

    fn compute_min_ts(&self, snapshot: &[(u64, Arc<std::sync::Mutex<crate::audio_channel::AudioChannel>>)], start: u64) -> u64 {
        let mut min_ts = start;
        for (_, channel) in snapshot {
            if let Ok(guard) = channel.lock() {
                if !guard.is_pending() && guard.audio_ts() != 0 && guard.audio_ts() < min_ts {
                    min_ts = guard.audio_ts();
                }
            }
        }
        min_ts
    }

    fn inject_buffering(&mut self, ts: TsRange, min_ts: u64, ) -> TsRange {
        let block_ns = self.block_ns();
        let rate = self.out_desc.sample_rate as u64;
        let offset = ts.start - min_ts;
        let frames = offset * rate / 1_000_000_000;
        let mut ticks = ((frames as f64) / self.output_frames as f64).ceil() as u32;
        if ticks == 0 {
            return ts;
        }

        if self.buffering_wait_ticks == 0 {
            self.buffered_ts_anchor = ts.start;
        }

        let projected = self.total_buffering_ticks.saturating_add(ticks);
        if projected > MAX_BUFFERING_TICKS {
            let overflow = projected - MAX_BUFFERING_TICKS;
            ticks = ticks.saturating_sub(overflow);
            self.total_buffering_ticks = MAX_BUFFERING_TICKS;
            warn!("mix engine: buffering cap ({MAX_BUFFERING_TICKS}) reached, truncating injected ticks");
        } else {
            self.total_buffering_ticks = projected;
        }

        let mut new_range = ts;
        for _ in 0..ticks {
            self.buffering_wait_ticks += 1;
            let w = self.buffering_wait_ticks as u64;
            let range = TsRange {
                start: self.buffered_ts_anchor - w * block_ns,
                end: self.buffered_ts_anchor - (w - 1) * block_ns,
            };
            self.buffered_timestamps.push_front(range);
            new_range = range;
        }
        new_range
    }
}

fn clamp(planes: &mut [Vec<f32>]) {
    for plane in planes {
        for sample in plane {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}
