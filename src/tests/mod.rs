//! Cross-module scenario tests (SPEC_FULL.md §8, S1-S6), exercising the
//! public API the way a capture reader and mix engine actually would,
//! rather than module-internal state. Per-module unit tests live beside
//! their modules; this file is the integration layer, matching the
//! teacher's own `src/tests/` split between per-feature unit coverage and
//! cross-cutting scenario coverage.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use crate::audio_channel::AudioChannel;
use crate::channel_map::ChannelMap;
use crate::mix_engine::{AudioSink, MixEngine, MixedBlock};
use crate::monitoring::CaptureMetrics;
use crate::resampler::{AudioDesc, SampleFormat};

fn f32_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

struct RecordingSink {
    blocks: StdMutex<Vec<MixedBlock>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self { blocks: StdMutex::new(Vec::new()) }
    }

    fn count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    fn last_timestamp(&self) -> Option<u64> {
        self.blocks.lock().unwrap().last().map(|b| b.timestamp_ns)
    }
}

impl AudioSink for RecordingSink {
    fn emit_audio(&self, block: &MixedBlock) -> anyhow::Result<()> {
        self.blocks.lock().unwrap().push(MixedBlock {
            timestamp_ns: block.timestamp_ns,
            sample_rate: block.sample_rate,
            channels: block.channels,
            frames: block.frames,
            planes: block.planes.clone(),
        });
        Ok(())
    }
}

/// S1: single stream steady state emits exactly one block, anchored
/// `CAPTURE_JITTER_MARGIN` after the ingest timestamp (the margin the
/// first placement of any stream always carries), with no buffering
/// injected once the tick window actually reaches that anchor.
#[test]
fn s1_single_stream_steady_state() {
    let out_desc = AudioDesc::new(48_000, SampleFormat::F32, 1);
    let channels = Arc::new(ChannelMap::new());
    let channel = channels.get_or_create(1, out_desc, out_desc, 480).unwrap();
    {
        let mut guard = channel.lock().unwrap();
        let bytes = f32_bytes(&vec![0.4f32; 480]);
        guard.output_audio(&[&bytes], 480, out_desc, 0, 0, &CaptureMetrics::new()).unwrap();
    }
    let anchored_ts = channel.lock().unwrap().audio_ts();

    let sink = Arc::new(RecordingSink::new());
    let mut engine = MixEngine::new(channels, out_desc, 480, Arc::new(CaptureMetrics::new()), sink.clone());
    engine.fetch_and_emit(anchored_ts, anchored_ts + 10_000_000);

    assert_eq!(sink.count(), 1);
    assert_eq!(sink.last_timestamp(), Some(anchored_ts));
    assert_eq!(engine.total_buffering_ticks(), 0);
}

/// S2: a source anchored well before the tick window triggers a positive
/// number of buffering ticks proportional to the gap.
#[test]
fn s2_late_source_triggers_proportional_buffering() {
    let out_desc = AudioDesc::new(48_000, SampleFormat::F32, 1);
    let channels = Arc::new(ChannelMap::new());
    let channel = channels.get_or_create(1, out_desc, out_desc, 480).unwrap();
    {
        let mut guard = channel.lock().unwrap();
        let bytes = f32_bytes(&vec![0.2f32; 480]);
        guard.output_audio(&[&bytes], 480, out_desc, 0, 0, &CaptureMetrics::new()).unwrap();
    }

    let sink = Arc::new(RecordingSink::new());
    let mut engine = MixEngine::new(channels, out_desc, 480, Arc::new(CaptureMetrics::new()), sink);
    // Tick window starts 300ms in, well beyond the channel's ~100ms anchor.
    engine.fetch_and_emit(300_000_000, 310_000_000);

    assert!(engine.total_buffering_ticks() > 0);
}

/// S3: a forward timestamp jump on a non-direct source re-anchors the
/// channel near wall-clock time rather than the jumped input timestamp.
#[test]
fn s3_timestamp_jump_reanchors_to_wall_clock() {
    let desc = AudioDesc::new(48_000, SampleFormat::F32, 1);
    let mut ch = AudioChannel::new(desc, desc, 480).unwrap();
    let bytes = f32_bytes(&vec![0.1f32; 480]);

    // First ingest: input timestamps track wall clock directly.
    ch.output_audio(&[&bytes], 480, desc, 1_000_000_000, 1_000_000_000, &CaptureMetrics::new()).unwrap();

    // Second ingest: input clock jumps forward 10s but the system clock
    // only advances by one block, so this is treated as a non-direct jump.
    let os_time = 1_010_000_000u64;
    let jumped_ts = 11_000_000_000u64;
    ch.output_audio(&[&bytes], 480, desc, jumped_ts, os_time, &CaptureMetrics::new()).unwrap();

    // The re-anchored audio_ts should land close to wall-clock time, not
    // anywhere near the jumped 11s input timestamp.
    assert!(ch.audio_ts() < 2_000_000_000, "audio_ts {} did not re-anchor near wall clock", ch.audio_ts());
}

/// S4: a source that stops sending but leaves a residual partial block is
/// cleared only after two successive discard passes confirm the stall.
#[test]
fn s4_perpetual_stall_clears_after_two_passes() {
    let desc = AudioDesc::new(48_000, SampleFormat::F32, 1);
    let mut ch = AudioChannel::new(desc, desc, 480).unwrap();
    let bytes = f32_bytes(&vec![0.1f32; 100]);
    ch.output_audio(&[&bytes], 100, desc, 0, 0, &CaptureMetrics::new()).unwrap();
    ch.pick_audio_data();
    assert!(ch.is_pending());

    let ts_start = ch.audio_ts() + 1_000_000;
    let ts_end = ts_start + 10_000_000;

    let first = ch.discard(ts_start, ts_end, 0, 45);
    assert_ne!(first, crate::audio_channel::DiscardOutcome::Cleared);

    ch.pick_audio_data();
    let second = ch.discard(ts_start, ts_end, 0, 45);
    assert_eq!(second, crate::audio_channel::DiscardOutcome::Cleared);
    assert_eq!(ch.audio_ts(), 0);
}

/// S5: once the buffering cap is reached, further late sources are
/// dropped via the ignore path and the sink keeps receiving blocks.
#[test]
fn s5_buffering_cap_reached_keeps_sink_flowing() {
    let out_desc = AudioDesc::new(48_000, SampleFormat::F32, 1);
    let channels = Arc::new(ChannelMap::new());
    let channel = channels.get_or_create(1, out_desc, out_desc, 480).unwrap();
    {
        let mut guard = channel.lock().unwrap();
        let bytes = f32_bytes(&vec![0.3f32; 480]);
        guard.output_audio(&[&bytes], 480, out_desc, 0, 0, &CaptureMetrics::new()).unwrap();
    }

    let sink = Arc::new(RecordingSink::new());
    let mut engine = MixEngine::new(channels, out_desc, 480, Arc::new(CaptureMetrics::new()), sink.clone());

    // Tick starts 2s after the channel's anchor: far more than 45 ticks'
    // worth of backlog at a 10ms block period, so the cap is reached and
    // the excess is truncated rather than growing the backlog further.
    let mut start = 2_000_000_000u64;
    for _ in 0..80 {
        engine.fetch_and_emit(start, start + 10_000_000);
        assert!(engine.total_buffering_ticks() <= crate::mix_engine::MAX_BUFFERING_TICKS);
        start += 10_000_000;
    }

    // Once the injected backlog has drained, real-time ticks reach the sink.
    assert!(sink.count() >= 1);
}

/// S6: a producer format change mid-stream rebuilds the resampler and
/// keeps publishing at the fixed output descriptor with non-decreasing
/// timestamps.
#[test]
fn s6_format_change_rebuilds_resampler_and_keeps_output_format() {
    let in_desc_a = AudioDesc::new(48_000, SampleFormat::F32, 1);
    let in_desc_b = AudioDesc::new(44_100, SampleFormat::I16, 1);
    let out_desc = AudioDesc::new(48_000, SampleFormat::F32, 1);

    let mut ch = AudioChannel::new(in_desc_a, out_desc, 480).unwrap();
    let bytes_a = f32_bytes(&vec![0.2f32; 480]);
    ch.output_audio(&[&bytes_a], 480, in_desc_a, 0, 0, &CaptureMetrics::new()).unwrap();
    let ts_after_a = ch.audio_ts();

    let samples_b: Vec<i16> = vec![1000i16; 441];
    let bytes_b: Vec<u8> = samples_b.iter().flat_map(|s| s.to_le_bytes()).collect();
    ch.output_audio(&[&bytes_b], 441, in_desc_b, 10_000_000, 10_000_000, &CaptureMetrics::new()).unwrap();

    assert!(ch.audio_ts() >= ts_after_a);
}
