//! # procap
//!
//! A per-process audio capture, re-timing, and mixing core: given a hook
//! that writes raw audio records into a shared ring, this crate
//! reconciles each stream's timestamps against wall-clock time, resamples
//! to a common output format, and mixes every active stream down to a
//! single periodic block handed to an [`AudioSink`].
//!
//! ## Components
//!
//! - [`circular_buffer`] — growable byte buffer used for per-stream ingest
//! - [`resampler`] — format conversion and sample-rate matching (`rubato`)
//! - [`audio_channel`] — per-stream timing reconciliation and buffering
//! - [`channel_map`] — the live set of per-stream channels
//! - [`shmem_ring`] — the producer/consumer record ring the hook writes into
//! - [`capture_reader`] — drains the ring and dispatches into channels
//! - [`mix_engine`] — the periodic tick loop that mixes and emits blocks
//! - [`hook_capture`] — a simulated producer standing in for the real hook
//! - [`playback_sink`] — a local-speaker [`AudioSink`] for the demo binary
//! - [`process_target`] — target-process selector parsing and resolution
//! - [`config`] — persistent configuration
//! - [`monitoring`] — health checks and capture metrics
//! - [`error_recovery`] — circuit breaking for recoverable faults
//! - [`app`] — [`CaptureService`], the top-level orchestrator
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use procap::{CaptureConfig, CaptureService};
//! use procap::playback_sink::PlaybackSink;
//! use std::sync::Arc;
//!
//! let config = CaptureConfig::default();
//! let sink = Arc::new(PlaybackSink::default_device(48_000, 2, 480)?);
//! let mut service = CaptureService::new(config);
//! service.start(sink)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod app;
pub mod audio_channel;
pub mod capture_reader;
pub mod channel_map;
pub mod circular_buffer;
pub mod clock;
pub mod config;
pub mod error_recovery;
pub mod hook_capture;
pub mod mix_engine;
pub mod monitoring;
pub mod playback_sink;
pub mod process_target;
pub mod resampler;
pub mod shmem_ring;

#[cfg(test)]
mod tests;

pub use app::CaptureService;
pub use config::CaptureConfig;
pub use mix_engine::{AudioSink, MixedBlock};
pub use monitoring::{CaptureMetricsSnapshot, HealthMonitor, HealthReport};
