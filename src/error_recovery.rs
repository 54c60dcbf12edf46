//! Circuit breaker for the handful of faults SPEC_FULL.md §7 marks as
//! recoverable-with-backoff (shared-ring lock contention, resampler
//! construction failure). Everything else on the audio data path — buffer
//! overflow, pick-insufficient, stalls, the buffering cap — is routine,
//! expected steady-state behavior handled inline by
//! [`crate::audio_channel`] and [`crate::mix_engine`]; it does not pass
//! through here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    RingLockTimeout,
    ResamplerConstruction,
}

impl FaultKind {
    fn key(self) -> &'static str {
        match self {
            FaultKind::RingLockTimeout => "ring_lock_timeout",
            FaultKind::ResamplerConstruction => "resampler_construction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failure_count: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            state: CircuitState::Closed,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Tracks recent failures per [`FaultKind`] and decides whether another
/// attempt should be made.
pub struct ErrorRecoveryManager {
    breakers: Mutex<HashMap<&'static str, CircuitBreaker>>,
}

impl ErrorRecoveryManager {
    pub fn new() -> Self {
        Self { breakers: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` when an operation of this kind should be attempted.
    pub fn should_attempt(&self, fault: FaultKind) -> Result<bool> {
        let breakers = self.breakers.lock().map_err(|_| anyhow::anyhow!("circuit breaker lock poisoned"))?;
        Ok(match breakers.get(fault.key()) {
            None => true,
            Some(b) => match b.state {
                CircuitState::Closed | CircuitState::HalfOpen => true,
                CircuitState::Open => b
                    .last_failure
                    .map(|t| t.elapsed() > b.recovery_timeout)
                    .unwrap_or(true),
            },
        })
    }

    pub fn record_success(&self, fault: FaultKind) {
        if let Ok(mut breakers) = self.breakers.lock() {
            let breaker = breakers.entry(fault.key()).or_insert_with(CircuitBreaker::new);
            breaker.failure_count = 0;
            if breaker.state != CircuitState::Closed {
                breaker.state = CircuitState::Closed;
                info!("circuit breaker closed for {}", fault.key());
            }
        }
    }

    pub fn record_failure(&self, fault: FaultKind) {
        if let Ok(mut breakers) = self.breakers.lock() {
            let breaker = breakers.entry(fault.key()).or_insert_with(CircuitBreaker::new);
            breaker.failure_count += 1;
            breaker.last_failure = Some(Instant::now());
            if breaker.failure_count >= breaker.failure_threshold {
                breaker.state = CircuitState::Open;
                warn!("circuit breaker opened for {} ({} failures)", fault.key(), breaker.failure_count);
            }
        }
    }

    pub fn state_of(&self, fault: FaultKind) -> CircuitState {
        self.breakers
            .lock()
            .ok()
            .and_then(|b| b.get(fault.key()).map(|b| b.state))
            .unwrap_or(CircuitState::Closed)
    }
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}
