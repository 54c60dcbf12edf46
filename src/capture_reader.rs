//! Component E: the thread that drains the shared-memory ring and
//! demultiplexes records by stream identifier onto per-stream
//! [`AudioChannel`]s, creating a channel on first sight of a stream.
//!
//! Mirrors the reference plugin's `capture_thread_proc`/`output_audio_data`
//! pair in `wasapi-capture.c`: one blocking wait on new data, then a
//! drain-and-dispatch pass per wakeup.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::channel_map::ChannelMap;
use crate::monitoring::CaptureMetrics;
use crate::resampler::AudioDesc;
use crate::shmem_ring::{AudioRecord, RingConsumer};

pub struct CaptureReader {
    consumer: RingConsumer,
    channels: Arc<ChannelMap>,
    out_desc: AudioDesc,
    output_frames: usize,
    metrics: Arc<CaptureMetrics>,
    last_record_age: Arc<std::sync::Mutex<Duration>>,
    last_record_at: std::sync::Mutex<Instant>,
}

impl CaptureReader {
    pub fn new(
        consumer: RingConsumer,
        channels: Arc<ChannelMap>,
        out_desc: AudioDesc,
        output_frames: usize,
        metrics: Arc<CaptureMetrics>,
        last_record_age: Arc<std::sync::Mutex<Duration>>,
    ) -> Self {
        Self {
            consumer,
            channels,
            out_desc,
            output_frames,
            metrics,
            last_record_age,
            last_record_at: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Runs until the ring reports `is_capturing() == false`. Intended to
    /// be the body of the dedicated T_cap thread described in
    /// SPEC_FULL.md §5.
    pub fn run(&self) {
        while self.consumer.is_capturing() {
            match self.consumer.poll() {
                Ok(records) => {
                    for record in records {
                        self.note_record_seen();
                        self.dispatch(record);
                    }
                }
                Err(e) => {
                    warn!("capture reader: ring poll failed: {e}");
                }
            }
            if let (Ok(mut age), Ok(last)) = (self.last_record_age.lock(), self.last_record_at.lock()) {
                *age = last.elapsed();
            }
        }
        debug!("capture reader: exiting on stop signal");
    }

    fn note_record_seen(&self) {
        if let Ok(mut last) = self.last_record_at.lock() {
            *last = Instant::now();
        }
    }

    fn dispatch(&self, record: AudioRecord) {
        let channels = record.channels.max(1) as usize;
        let in_desc = AudioDesc::new(record.sample_rate, record.format, channels);

        let channel = match self.channels.get_or_create(
            record.stream_id,
            in_desc,
            self.out_desc,
            self.output_frames,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!("capture reader: failed to create channel for stream {:#x}: {e}", record.stream_id);
                return;
            }
        };

        let bytes_per_sample = record.bytes_per_sample.max(1) as usize;
        let frames = record.payload.len() / (bytes_per_sample * channels);
        if frames == 0 {
            return;
        }

        // The ring carries interleaved PCM (SPEC_FULL.md §4.D); split it
        // into one de-interleaved byte slice per channel before handing it
        // to `output_audio`/`to_planar_f32`, which expect per-channel
        // planes rather than a single interleaved blob.
        let plane_bytes = frames * bytes_per_sample;
        let owned_planes: Vec<Vec<u8>> = if channels == 1 {
            vec![record.payload[..plane_bytes.min(record.payload.len())].to_vec()]
        } else {
            let mut owned = vec![Vec::with_capacity(plane_bytes); channels];
            let frame_bytes = bytes_per_sample * channels;
            for frame_idx in 0..frames {
                let frame_start = frame_idx * frame_bytes;
                for (ch, plane) in owned.iter_mut().enumerate() {
                    let sample_start = frame_start + ch * bytes_per_sample;
                    plane.extend_from_slice(&record.payload[sample_start..sample_start + bytes_per_sample]);
                }
            }
            owned
        };
        let planes: Vec<&[u8]> = owned_planes.iter().map(|p| p.as_slice()).collect();

        let os_time = crate::clock::now_ns();
        let mut guard = match channel.lock() {
            Ok(g) => g,
            Err(_) => {
                warn!("capture reader: channel mutex poisoned for stream {:#x}", record.stream_id);
                return;
            }
        };

        if let Err(e) = guard.output_audio(&planes, frames, in_desc, record.timestamp_ns, os_time, &self.metrics) {
            warn!("capture reader: ingest failed for stream {:#x}: {e}", record.stream_id);
        }
    }
}

impl CaptureMetrics {
    /// Convenience used by the orchestrator to bump the dropped-record
    /// counter from the producer side when `RingProducer::write` reports a
    /// drop.
    pub fn record_ring_drop(&self) {
        self.dropped_ring_records.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resampler::SampleFormat;
    use crate::shmem_ring::{RingProducer, SharedAudioRing};
    use std::time::Duration;

    #[test]
    fn dispatch_creates_a_channel_on_first_record() {
        let ring = Arc::new(SharedAudioRing::new(8192));
        let producer = RingProducer::new(ring.clone());
        let consumer = RingConsumer::new(ring.clone(), Duration::from_millis(50));
        let channels = Arc::new(ChannelMap::new());
        let out_desc = AudioDesc::new(48_000, SampleFormat::F32, 2);
        let metrics = Arc::new(CaptureMetrics::new());
        let last_record_age = Arc::new(std::sync::Mutex::new(Duration::from_secs(0)));
        let reader = CaptureReader::new(consumer, channels.clone(), out_desc, 480, metrics, last_record_age);

        let samples = vec![0.2f32; 480];
        let payload: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        producer
            .write(&AudioRecord {
                stream_id: 42,
                channels: 1,
                sample_rate: 48_000,
                format: SampleFormat::F32,
                bytes_per_sample: 4,
                timestamp_ns: 0,
                payload,
            })
            .unwrap();

        let records = reader.consumer.poll().unwrap();
        assert_eq!(records.len(), 1);
        reader.dispatch(records.into_iter().next().unwrap());
        assert_eq!(channels.len(), 1);
        ring.stop();
    }

    #[test]
    fn dispatch_deinterleaves_stereo_payload() {
        let ring = Arc::new(SharedAudioRing::new(8192));
        let producer = RingProducer::new(ring.clone());
        let consumer = RingConsumer::new(ring.clone(), Duration::from_millis(50));
        let channel_map = Arc::new(ChannelMap::new());
        let out_desc = AudioDesc::new(48_000, SampleFormat::F32, 2);
        let metrics = Arc::new(CaptureMetrics::new());
        let last_record_age = Arc::new(std::sync::Mutex::new(Duration::from_secs(0)));
        let reader = CaptureReader::new(consumer, channel_map.clone(), out_desc, 4, metrics, last_record_age);

        // Four interleaved stereo frames: left is all 0.5, right is all -0.5.
        let mut payload = Vec::new();
        for _ in 0..4 {
            payload.extend_from_slice(&0.5f32.to_le_bytes());
            payload.extend_from_slice(&(-0.5f32).to_le_bytes());
        }
        producer
            .write(&AudioRecord {
                stream_id: 7,
                channels: 2,
                sample_rate: 48_000,
                format: SampleFormat::F32,
                bytes_per_sample: 4,
                timestamp_ns: 0,
                payload,
            })
            .unwrap();

        let records = reader.consumer.poll().unwrap();
        reader.dispatch(records.into_iter().next().unwrap());

        let channel = channel_map.get_or_create(7, out_desc, out_desc, 4).unwrap();
        let mut guard = channel.lock().unwrap();
        guard.pick_audio_data();
        assert!(!guard.is_pending());
        let ts_start = guard.audio_ts();
        let block_ns = 4u64 * 1_000_000_000 / 48_000;
        let mut mix_buf = vec![vec![0.0f32; 4]; 2];
        guard.mix(&mut mix_buf, ts_start, ts_start + block_ns);
        // Left plane should carry the 0.5 samples, right the -0.5 samples;
        // de-interleaving must not have swapped or blended the channels.
        assert!(mix_buf[0].iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(mix_buf[1].iter().all(|&s| (s - (-0.5)).abs() < 1e-6));
        drop(guard);
        ring.stop();
    }
}
