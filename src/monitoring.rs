//! Health checks and performance counters for the capture pipeline,
//! in the idiom of the reference project's health-monitor module: a
//! registry of named checks producing a worst-case-wins [`HealthReport`],
//! plus a free-standing counter set any pipeline component can update
//! without taking the checks registry's lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

/// Overall or per-check health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub last_updated: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub timestamp: u64,
    pub uptime_seconds: u64,
}

pub type HealthCheckFn = Box<dyn Fn() -> Result<HealthCheck> + Send + Sync>;

/// Registry of named health checks run on demand by the capture service.
pub struct HealthMonitor {
    checks: Arc<Mutex<HashMap<String, HealthCheckFn>>>,
    last_report: Arc<Mutex<Option<HealthReport>>>,
    start_time: Instant,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            checks: Arc::new(Mutex::new(HashMap::new())),
            last_report: Arc::new(Mutex::new(None)),
            start_time: Instant::now(),
        }
    }

    pub fn register_check<F>(&self, name: String, check_fn: F)
    where
        F: Fn() -> Result<HealthCheck> + Send + Sync + 'static,
    {
        if let Ok(mut checks) = self.checks.lock() {
            checks.insert(name.clone(), Box::new(check_fn));
            debug!("registered health check: {}", name);
        }
    }

    pub fn run_health_checks(&self) -> HealthReport {
        let mut check_results = Vec::new();
        let mut overall_status = HealthStatus::Healthy;

        if let Ok(checks) = self.checks.lock() {
            for (name, check_fn) in checks.iter() {
                let start = Instant::now();
                match check_fn() {
                    Ok(mut result) => {
                        result.duration_ms = start.elapsed().as_millis() as u64;
                        result.last_updated = Self::now_secs();
                        match result.status {
                            HealthStatus::Critical => overall_status = HealthStatus::Critical,
                            HealthStatus::Warning if overall_status == HealthStatus::Healthy => {
                                overall_status = HealthStatus::Warning;
                            }
                            _ => {}
                        }
                        check_results.push(result);
                    }
                    Err(e) => {
                        overall_status = HealthStatus::Critical;
                        check_results.push(HealthCheck {
                            name: name.clone(),
                            status: HealthStatus::Critical,
                            message: format!("health check failed: {}", e),
                            last_updated: Self::now_secs(),
                            duration_ms: start.elapsed().as_millis() as u64,
                        });
                        error!("health check '{}' failed: {}", name, e);
                    }
                }
            }
        }

        let report = HealthReport {
            overall_status,
            checks: check_results,
            timestamp: Self::now_secs(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        };

        if let Ok(mut last_report) = self.last_report.lock() {
            *last_report = Some(report.clone());
        }

        if report.overall_status == HealthStatus::Critical {
            warn!("capture health is CRITICAL ({} checks)", report.checks.len());
        } else {
            info!("capture health check completed: {:?}", report.overall_status);
        }

        report
    }

    pub fn get_latest_report(&self) -> Option<HealthReport> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }

    fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free counters updated directly from the capture hot path (ingest,
/// mix tick, and ring consumption) without contending with the health
/// checks registry.
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    pub active_channels: AtomicU64,
    pub total_buffering_ticks: AtomicU64,
    pub dropped_ring_records: AtomicU64,
    pub channel_resets: AtomicU64,
    pub resampler_rebuilds: AtomicU64,
    pub ingest_overflow_drops: AtomicU64,
    pub stalled_channels_cleared: AtomicU64,
    pub last_mix_latency_us: AtomicU64,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CaptureMetricsSnapshot {
        CaptureMetricsSnapshot {
            active_channels: self.active_channels.load(Ordering::Relaxed),
            total_buffering_ticks: self.total_buffering_ticks.load(Ordering::Relaxed),
            dropped_ring_records: self.dropped_ring_records.load(Ordering::Relaxed),
            channel_resets: self.channel_resets.load(Ordering::Relaxed),
            resampler_rebuilds: self.resampler_rebuilds.load(Ordering::Relaxed),
            ingest_overflow_drops: self.ingest_overflow_drops.load(Ordering::Relaxed),
            stalled_channels_cleared: self.stalled_channels_cleared.load(Ordering::Relaxed),
            last_mix_latency_us: self.last_mix_latency_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CaptureMetricsSnapshot {
    pub active_channels: u64,
    pub total_buffering_ticks: u64,
    pub dropped_ring_records: u64,
    pub channel_resets: u64,
    pub resampler_rebuilds: u64,
    pub ingest_overflow_drops: u64,
    pub stalled_channels_cleared: u64,
    pub last_mix_latency_us: u64,
}

/// Default health checks the capture service registers at startup.
pub struct DefaultHealthChecks;

impl DefaultHealthChecks {
    pub fn ring_producer_alive(last_record_age: Arc<Mutex<Duration>>) -> HealthCheckFn {
        Box::new(move || {
            let age = *last_record_age.lock().map_err(|_| anyhow::anyhow!("lock poisoned"))?;
            let (status, message) = if age < Duration::from_secs(2) {
                (HealthStatus::Healthy, "ring is receiving records".to_string())
            } else if age < Duration::from_secs(10) {
                (HealthStatus::Warning, format!("no ring record in {:?}", age))
            } else {
                (HealthStatus::Critical, format!("ring idle for {:?}", age))
            };
            Ok(HealthCheck {
                name: "ring_producer_alive".to_string(),
                status,
                message,
                last_updated: 0,
                duration_ms: 0,
            })
        })
    }

    pub fn buffering_headroom(metrics: Arc<CaptureMetrics>, cap: u64) -> HealthCheckFn {
        Box::new(move || {
            let ticks = metrics.total_buffering_ticks.load(Ordering::Relaxed);
            let (status, message) = if ticks < cap / 2 {
                (HealthStatus::Healthy, format!("{ticks}/{cap} buffering ticks used"))
            } else if ticks < cap {
                (HealthStatus::Warning, format!("{ticks}/{cap} buffering ticks used"))
            } else {
                (HealthStatus::Critical, "buffering cap reached, dropping late sources".to_string())
            };
            Ok(HealthCheck {
                name: "buffering_headroom".to_string(),
                status,
                message,
                last_updated: 0,
                duration_ms: 0,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_monitor_starts_with_no_report() {
        let monitor = HealthMonitor::new();
        assert!(monitor.get_latest_report().is_none());
    }

    #[test]
    fn worst_status_wins_across_checks() {
        let monitor = HealthMonitor::new();
        monitor.register_check("ok".to_string(), || {
            Ok(HealthCheck {
                name: "ok".to_string(),
                status: HealthStatus::Healthy,
                message: "fine".to_string(),
                last_updated: 0,
                duration_ms: 0,
            })
        });
        monitor.register_check("warn".to_string(), || {
            Ok(HealthCheck {
                name: "warn".to_string(),
                status: HealthStatus::Warning,
                message: "meh".to_string(),
                last_updated: 0,
                duration_ms: 0,
            })
        });
        let report = monitor.run_health_checks();
        assert_eq!(report.overall_status, HealthStatus::Warning);
    }

    #[test]
    fn metrics_snapshot_reflects_updates() {
        let metrics = CaptureMetrics::new();
        metrics.total_buffering_ticks.fetch_add(3, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.total_buffering_ticks, 3);
    }

    #[test]
    fn buffering_headroom_check_escalates_at_cap() {
        let metrics = Arc::new(CaptureMetrics::new());
        metrics.total_buffering_ticks.store(45, Ordering::Relaxed);
        let check = DefaultHealthChecks::buffering_headroom(metrics, 45);
        let result = check().unwrap();
        assert_eq!(result.status, HealthStatus::Critical);
    }
}
