//! Shared-memory-shaped producer/consumer ring (component D).
//!
//! The reference plugin rendezvouses with its in-process hook through a
//! named Win32 mutex, a named auto-reset event, and a named file mapping.
//! Creating and opening those named kernel objects is platform-specific
//! hooking plumbing and out of scope here (see SPEC_FULL.md §1). What this
//! module keeps is the *protocol*: the header layout, the record framing,
//! and the bounded-wait mutex+event synchronization discipline, implemented
//! over an in-process byte arena with `std::sync::{Mutex, Condvar}` standing
//! in for the named objects. A deployment that needs genuine cross-process
//! delivery swaps the arena for an OS-backed mapping behind this same
//! interface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::resampler::SampleFormat;

/// One decoded record handed from the ring to the capture reader.
#[derive(Debug, Clone)]
pub struct AudioRecord {
    pub stream_id: u64,
    pub channels: u32,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub bytes_per_sample: u32,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

/// Fixed 36-byte header preceding every record's payload (length field
/// included).
const RECORD_HEADER_LEN: usize = 36;

fn format_tag(format: SampleFormat) -> u32 {
    match format {
        SampleFormat::F32 => 0,
        SampleFormat::I16 => 1,
        SampleFormat::U8 => 2,
    }
}

fn format_from_tag(tag: u32) -> Result<SampleFormat> {
    match tag {
        0 => Ok(SampleFormat::F32),
        1 => Ok(SampleFormat::I16),
        2 => Ok(SampleFormat::U8),
        other => Err(anyhow!("unknown sample format tag {other} in ring record")),
    }
}

struct RingState {
    region: Vec<u8>,
    available_audio_size: usize,
    buffer_size: usize,
}

/// In-process stand-in for the named-mutex-plus-named-event-guarded shared
/// memory mapping described in SPEC_FULL.md §4.D.
pub struct SharedAudioRing {
    state: Mutex<RingState>,
    data_ready: Condvar,
    capturing: AtomicBool,
}

impl SharedAudioRing {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                region: Vec::with_capacity(buffer_size),
                available_audio_size: 0,
                buffer_size,
            }),
            data_ready: Condvar::new(),
            capturing: AtomicBool::new(true),
        }
    }

    /// Wakes any blocked consumer and causes subsequent `wait_for_data`
    /// calls to return immediately; used during shutdown.
    pub fn stop(&self) {
        self.capturing.store(false, Ordering::SeqCst);
        self.data_ready.notify_all();
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Producer side: encodes and appends one record. Returns `Ok(false)`
    /// (a dropped record, not an error) when the ring has no room.
    fn push(&self, record: &AudioRecord) -> Result<bool> {
        let payload_len = record.payload.len();
        let record_len = RECORD_HEADER_LEN + payload_len;

        let mut state = self.state.lock().map_err(|_| anyhow!("shared ring mutex poisoned"))?;
        if state.available_audio_size + record_len > state.buffer_size {
            return Ok(false);
        }

        let mut framed = Vec::with_capacity(record_len);
        framed.extend_from_slice(&(record_len as u32).to_le_bytes());
        framed.extend_from_slice(&record.stream_id.to_le_bytes());
        framed.extend_from_slice(&record.channels.to_le_bytes());
        framed.extend_from_slice(&record.sample_rate.to_le_bytes());
        framed.extend_from_slice(&format_tag(record.format).to_le_bytes());
        framed.extend_from_slice(&record.bytes_per_sample.to_le_bytes());
        framed.extend_from_slice(&record.timestamp_ns.to_le_bytes());
        framed.extend_from_slice(&record.payload);
        debug_assert_eq!(framed.len(), record_len);

        state.region.extend_from_slice(&framed);
        state.available_audio_size += record_len;
        drop(state);
        self.data_ready.notify_one();
        Ok(true)
    }

    /// Consumer side: blocks up to `timeout` for at least one record, then
    /// drains everything currently available. Returns an empty vec on
    /// timeout or on shutdown.
    fn drain(&self, timeout: Duration) -> Result<Vec<AudioRecord>> {
        let mut state = self.state.lock().map_err(|_| anyhow!("shared ring mutex poisoned"))?;
        if state.available_audio_size == 0 {
            let (guard, _) = self
                .data_ready
                .wait_timeout(state, timeout)
                .map_err(|_| anyhow!("shared ring mutex poisoned"))?;
            state = guard;
        }

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= state.available_audio_size {
            let len_bytes: [u8; 4] = state.region[offset..offset + 4].try_into().unwrap();
            let record_len = u32::from_le_bytes(len_bytes) as usize;
            if record_len < RECORD_HEADER_LEN || offset + record_len > state.available_audio_size {
                break;
            }
            let rec = &state.region[offset..offset + record_len];
            let stream_id = u64::from_le_bytes(rec[4..12].try_into().unwrap());
            let channels = u32::from_le_bytes(rec[12..16].try_into().unwrap());
            let sample_rate = u32::from_le_bytes(rec[16..20].try_into().unwrap());
            let format = format_from_tag(u32::from_le_bytes(rec[20..24].try_into().unwrap()))?;
            let bytes_per_sample = u32::from_le_bytes(rec[24..28].try_into().unwrap());
            let timestamp_ns = u64::from_le_bytes(rec[28..36].try_into().unwrap());
            let payload = rec[36..record_len].to_vec();

            records.push(AudioRecord {
                stream_id,
                channels,
                sample_rate,
                format,
                bytes_per_sample,
                timestamp_ns,
                payload,
            });
            offset += record_len;
        }

        state.region.drain(0..offset);
        state.available_audio_size -= offset;

        Ok(records)
    }
}

/// Producer handle used by the hook-side capture (component G) and by
/// tests exercising the ring without a real hook.
#[derive(Clone)]
pub struct RingProducer {
    ring: std::sync::Arc<SharedAudioRing>,
}

impl RingProducer {
    pub fn new(ring: std::sync::Arc<SharedAudioRing>) -> Self {
        Self { ring }
    }

    /// Writes one record; returns `false` if it was dropped because the
    /// ring is full (expected, tolerated data loss per SPEC_FULL.md §7).
    pub fn write(&self, record: &AudioRecord) -> Result<bool> {
        self.ring.push(record)
    }
}

/// Consumer handle used by the capture reader (component E).
pub struct RingConsumer {
    ring: std::sync::Arc<SharedAudioRing>,
    wait_timeout: Duration,
}

impl RingConsumer {
    pub fn new(ring: std::sync::Arc<SharedAudioRing>, wait_timeout: Duration) -> Self {
        Self { ring, wait_timeout }
    }

    pub fn poll(&self) -> Result<Vec<AudioRecord>> {
        self.ring.drain(self.wait_timeout)
    }

    pub fn is_capturing(&self) -> bool {
        self.ring.is_capturing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(id: u64, ts: u64, payload: Vec<u8>) -> AudioRecord {
        AudioRecord {
            stream_id: id,
            channels: 2,
            sample_rate: 48_000,
            format: SampleFormat::F32,
            bytes_per_sample: 4,
            timestamp_ns: ts,
            payload,
        }
    }

    #[test]
    fn round_trips_a_single_record() {
        let ring = Arc::new(SharedAudioRing::new(4096));
        let producer = RingProducer::new(ring.clone());
        let consumer = RingConsumer::new(ring, Duration::from_millis(50));

        assert!(producer.write(&record(1, 100, vec![1, 2, 3, 4])).unwrap());
        let got = consumer.poll().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].stream_id, 1);
        assert_eq!(got[0].payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn full_ring_drops_record_without_erroring() {
        let ring = Arc::new(SharedAudioRing::new(RECORD_HEADER_LEN));
        let producer = RingProducer::new(ring);
        let ok = producer.write(&record(1, 0, vec![0u8; 16])).unwrap();
        assert!(!ok);
    }

    #[test]
    fn consumer_times_out_on_empty_ring() {
        let ring = Arc::new(SharedAudioRing::new(4096));
        let consumer = RingConsumer::new(ring, Duration::from_millis(10));
        let got = consumer.poll().unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn drain_consumes_exact_record_bytes() {
        // Buffer sized for exactly two 20-byte-payload records; if `drain`
        // left any slack in `available_audio_size`, a same-sized write
        // right after draining would be rejected as "full".
        let record_len = RECORD_HEADER_LEN + 20;
        let ring = Arc::new(SharedAudioRing::new(record_len * 2));
        let producer = RingProducer::new(ring.clone());
        let consumer = RingConsumer::new(ring, Duration::from_millis(50));

        assert!(producer.write(&record(1, 10, vec![0u8; 20])).unwrap());
        assert!(producer.write(&record(2, 20, vec![1u8; 20])).unwrap());
        let got = consumer.poll().unwrap();
        assert_eq!(got.len(), 2);

        assert!(producer.write(&record(3, 30, vec![2u8; 20])).unwrap());
        assert!(producer.write(&record(4, 40, vec![3u8; 20])).unwrap());
    }

    #[test]
    fn stop_wakes_blocked_consumer() {
        let ring = Arc::new(SharedAudioRing::new(4096));
        ring.stop();
        let consumer = RingConsumer::new(ring, Duration::from_secs(5));
        assert!(!consumer.is_capturing());
        let got = consumer.poll().unwrap();
        assert!(got.is_empty());
    }
}
