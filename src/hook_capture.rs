//! Component G, producer side — simulated. Actually injecting into a
//! target process and intercepting its render-buffer release calls is
//! platform-specific hooking mechanics excluded by SPEC_FULL.md §1. This
//! module stands in for that hook: it writes correctly-framed records into
//! a [`SharedAudioRing`] on a fixed cadence, exercising the exact producer
//! protocol from SPEC_FULL.md §4.D for tests and the demo binary.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::monitoring::CaptureMetrics;
use crate::resampler::SampleFormat;
use crate::shmem_ring::{AudioRecord, RingProducer};

/// A simulated upstream audio endpoint: fixed format, a simple tone
/// generator, and a wall-clock timestamp taken at write time.
pub struct SimulatedSource {
    pub stream_id: u64,
    pub sample_rate: u32,
    pub channels: u32,
    pub frequency_hz: f32,
    phase: f32,
}

impl SimulatedSource {
    pub fn new(stream_id: u64, sample_rate: u32, channels: u32, frequency_hz: f32) -> Self {
        Self { stream_id, sample_rate, channels, frequency_hz, phase: 0.0 }
    }

    fn next_block(&mut self, frames: usize) -> Vec<u8> {
        let mut payload = Vec::with_capacity(frames * 4);
        let step = std::f32::consts::TAU * self.frequency_hz / self.sample_rate as f32;
        for _ in 0..frames {
            let sample = self.phase.sin() * 0.25;
            payload.extend_from_slice(&sample.to_le_bytes());
            self.phase += step;
            if self.phase > std::f32::consts::TAU {
                self.phase -= std::f32::consts::TAU;
            }
        }
        payload
    }
}

/// Drives one or more [`SimulatedSource`]s into a ring, one block per
/// source per tick, until told to stop.
pub struct HookCaptureSimulator {
    producer: RingProducer,
    sources: Vec<SimulatedSource>,
    frames_per_block: usize,
    metrics: std::sync::Arc<CaptureMetrics>,
}

impl HookCaptureSimulator {
    pub fn new(
        producer: RingProducer,
        sources: Vec<SimulatedSource>,
        frames_per_block: usize,
        metrics: std::sync::Arc<CaptureMetrics>,
    ) -> Self {
        Self { producer, sources, frames_per_block, metrics }
    }

    /// Writes exactly one block per configured source, timestamped at the
    /// given wall-clock instant. Exposed separately from `run` so tests can
    /// drive deterministic ticks without sleeping.
    pub fn tick(&mut self, timestamp_ns: u64) {
        for source in &mut self.sources {
            let payload = source.next_block(self.frames_per_block);
            let record = AudioRecord {
                stream_id: source.stream_id,
                channels: source.channels,
                sample_rate: source.sample_rate,
                format: SampleFormat::F32,
                bytes_per_sample: 4,
                timestamp_ns,
                payload,
            };
            match self.producer.write(&record) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("hook simulator: ring full, dropping record for stream {:#x}", source.stream_id);
                    self.metrics.record_ring_drop();
                }
                Err(e) => debug!("hook simulator: write failed: {e}"),
            }
        }
    }

    /// Runs on a fixed period derived from `frames_per_block` and the
    /// sources' (shared) sample rate, until `capturing` is cleared.
    pub fn run(&mut self, capturing: &std::sync::atomic::AtomicBool) {
        let rate = self.sources.first().map(|s| s.sample_rate).unwrap_or(48_000);
        let period = Duration::from_nanos(self.frames_per_block as u64 * 1_000_000_000 / rate as u64);
        let start = crate::clock::now_ns();
        let mut elapsed_frames: u64 = 0;

        while capturing.load(std::sync::atomic::Ordering::SeqCst) {
            let ts = start + elapsed_frames * 1_000_000_000 / rate as u64;
            self.tick(ts);
            elapsed_frames += self.frames_per_block as u64;
            thread::sleep(period);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem_ring::{RingConsumer, SharedAudioRing};
    use std::sync::Arc;

    #[test]
    fn tick_writes_one_record_per_source() {
        let ring = Arc::new(SharedAudioRing::new(1 << 20));
        let producer = RingProducer::new(ring.clone());
        let consumer = RingConsumer::new(ring, Duration::from_millis(50));
        let sources = vec![SimulatedSource::new(1, 48_000, 1, 440.0), SimulatedSource::new(2, 48_000, 1, 220.0)];
        let metrics = Arc::new(CaptureMetrics::new());
        let mut sim = HookCaptureSimulator::new(producer, sources, 480, metrics);

        sim.tick(0);
        let records = consumer.poll().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload.len(), 480 * 4);
    }
}
