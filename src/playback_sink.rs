//! A local speaker [`AudioSink`], standing in for the recording/broadcast
//! pipeline a real deployment would attach instead (SPEC_FULL.md §6). Lets
//! the demo binary make the mixed stream audible.
//!
//! Adapted from the reference project's real-time output path: a lock-free
//! `ringbuf` producer/consumer pair feeding a `cpal` output stream, instead
//! of that project's bespoke zero-copy frame pool (this sink only ever
//! moves interleaved f32 samples, so the plain heap ring is enough).

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use log::{info, warn};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;

use crate::mix_engine::{AudioSink, MixedBlock};

pub struct PlaybackSink {
    _stream: cpal::Stream,
    producer: std::sync::Mutex<ringbuf::HeapProd<f32>>,
}

// cpal's `Stream` is only non-`Send`/`Sync` on some platforms because of an
// internal marker type guarding against platform APIs that aren't
// thread-safe; the producer side here only ever touches the shared,
// mutex-guarded ring buffer, never the stream handle itself.
unsafe impl Send for PlaybackSink {}
unsafe impl Sync for PlaybackSink {}

impl PlaybackSink {
    /// Opens the system's default output device at `sample_rate` /
    /// `channels`, sized to hold a few output blocks' worth of interleaved
    /// samples before the callback starts dropping the oldest.
    pub fn default_device(sample_rate: u32, channels: usize, output_frames: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device available"))?;

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let capacity = output_frames * channels * 8;
        let ring = HeapRb::<f32>::new(capacity);
        let (producer, mut consumer) = ring.split();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = consumer.try_pop().unwrap_or(0.0);
                    }
                },
                move |err| warn!("playback stream error: {err}"),
                None,
            )
            .context("failed to build cpal output stream")?;

        stream.play().context("failed to start playback stream")?;
        info!("playback sink opened at {sample_rate} Hz, {channels} channel(s)");

        Ok(Self { _stream: stream, producer: std::sync::Mutex::new(producer) })
    }
}

impl AudioSink for PlaybackSink {
    fn emit_audio(&self, block: &MixedBlock) -> Result<()> {
        let mut producer = self
            .producer
            .lock()
            .map_err(|_| anyhow!("playback ring producer mutex poisoned"))?;

        for frame in 0..block.frames {
            for plane in &block.planes {
                let _ = producer.try_push(plane[frame]);
            }
        }
        Ok(())
    }
}
