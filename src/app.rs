//! Top-level orchestrator (component H). Owns, in strict lock-acquisition
//! order, the shared ring, the channel map, and the capture-reader and
//! mix-engine threads — the single type a binary or embedder constructs,
//! playing the role the reference project's `VocalCommunicationApp` played
//! for its network/UI stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use crate::capture_reader::CaptureReader;
use crate::channel_map::ChannelMap;
use crate::config::CaptureConfig;
use crate::mix_engine::{AudioSink, MixEngine};
use crate::monitoring::{CaptureMetrics, CaptureMetricsSnapshot, DefaultHealthChecks, HealthMonitor, HealthReport};
use crate::process_target::{SysinfoTargetSelector, TargetProcess, TargetSelector};
use crate::shmem_ring::{RingConsumer, RingProducer, SharedAudioRing};

/// Owns the capture pipeline end to end: the shared ring, the per-stream
/// channel map, and the reader/mixer threads that drive them.
pub struct CaptureService {
    config: CaptureConfig,
    ring: Arc<SharedAudioRing>,
    channels: Arc<ChannelMap>,
    metrics: Arc<CaptureMetrics>,
    health: Arc<HealthMonitor>,
    target_selector: Box<dyn TargetSelector>,

    capturing: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
    mixer_handle: Option<JoinHandle<()>>,
    last_record_age: Arc<Mutex<Duration>>,
}

impl CaptureService {
    pub fn new(config: CaptureConfig) -> Self {
        let ring = Arc::new(SharedAudioRing::new(config.buffering.ring_buffer_size));
        let metrics = Arc::new(CaptureMetrics::new());
        let health = Arc::new(HealthMonitor::new());
        let last_record_age = Arc::new(Mutex::new(Duration::from_secs(0)));

        health.register_check(
            "ring_producer_alive".to_string(),
            DefaultHealthChecks::ring_producer_alive(last_record_age.clone()),
        );
        health.register_check(
            "buffering_headroom".to_string(),
            DefaultHealthChecks::buffering_headroom(metrics.clone(), crate::mix_engine::MAX_BUFFERING_TICKS as u64),
        );

        Self {
            config,
            ring,
            channels: Arc::new(ChannelMap::new()),
            metrics,
            health,
            target_selector: Box::new(SysinfoTargetSelector::new()),
            capturing: Arc::new(AtomicBool::new(false)),
            reader_handle: None,
            mixer_handle: None,
            last_record_age,
        }
    }

    /// Swaps in a different target resolver, e.g. for tests that can't
    /// rely on a real process existing.
    pub fn with_target_selector(mut self, selector: Box<dyn TargetSelector>) -> Self {
        self.target_selector = selector;
        self
    }

    /// Resolves the configured target against the live process list,
    /// rewriting a stale pid if necessary, without starting capture.
    pub fn resolve_target(&mut self) -> Result<TargetProcess> {
        let selector = self
            .config
            .target
            .selector
            .as_deref()
            .context("no target process configured")?;
        let parsed = TargetProcess::parse(selector)?;
        let resolved = self.target_selector.resolve(&parsed)?;
        if resolved != parsed {
            self.config.target.selector = Some(resolved.to_selector());
        }
        Ok(resolved)
    }

    /// Starts the capture-reader and mix-engine threads against `sink`.
    /// Idempotent: calling `start` while already running is a no-op.
    pub fn start(&mut self, sink: Arc<dyn AudioSink>) -> Result<()> {
        if self.capturing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let out_desc = self.config.out_desc();
        let output_frames = self.config.output.output_frames;

        let consumer = RingConsumer::new(
            self.ring.clone(),
            Duration::from_millis(self.config.buffering.ring_wait_timeout_ms),
        );
        let reader = CaptureReader::new(
            consumer,
            self.channels.clone(),
            out_desc,
            output_frames,
            self.metrics.clone(),
            self.last_record_age.clone(),
        );
        self.reader_handle = Some(thread::spawn(move || reader.run()));

        let mut engine = MixEngine::new(self.channels.clone(), out_desc, output_frames, self.metrics.clone(), sink);
        let capturing = self.capturing.clone();
        self.mixer_handle = Some(thread::spawn(move || engine.run(&capturing)));

        info!("capture service started");
        Ok(())
    }

    /// Signals both threads to stop and joins them.
    pub fn stop(&mut self) -> Result<()> {
        if !self.capturing.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.ring.stop();

        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.mixer_handle.take() {
            let _ = handle.join();
        }

        info!("capture service stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Producer handle for the in-process hook (or its simulator, see
    /// [`crate::hook_capture`]) to write records into this service's ring.
    pub fn ring_producer(&self) -> RingProducer {
        RingProducer::new(self.ring.clone())
    }

    pub fn health(&self) -> HealthReport {
        self.health.run_health_checks()
    }

    pub fn metrics(&self) -> CaptureMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
