//! # Circuit Breaker
//!
//! Decides when remote sync should stop trying. Two independent failure
//! counters feed one mode flag:
//!
//! ```text
//!            storage failures >= 10
//!            or conflicts >= 5
//!   NORMAL ──────────────────────────> LOCAL
//!     ▲  ▲                               │
//!     │  │  mode queried after           │
//!     │  └── next_recovery_attempt ──────┤   (counters kept)
//!     │                                  │
//!     └──── record_full_sync_success ────┘   (everything cleared)
//! ```
//!
//! Recovery is passive. Asking for the mode once the recovery time has
//! passed drops LOCAL so the next sync can probe, but the counters survive:
//! one more failure puts the wallet straight back into LOCAL. Only a full
//! sync success wipes the history.
//!
//! No I/O happens here. The sync engine persists [`CircuitBreakerState`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{to_chrono, Clock};
use crate::config::{CONFLICT_THRESHOLD, LOCAL_MODE_RECOVERY_DELAY, STORAGE_FAILURE_THRESHOLD};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub storage_failure_threshold: u32,
    pub conflict_threshold: u32,
    pub recovery_delay: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            storage_failure_threshold: STORAGE_FAILURE_THRESHOLD,
            conflict_threshold: CONFLICT_THRESHOLD,
            recovery_delay: LOCAL_MODE_RECOVERY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerMode {
    Normal,
    Local,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub local_mode_active: bool,
    pub consecutive_storage_failures: u32,
    pub consecutive_conflicts: u32,
    pub local_mode_activated_at: Option<DateTime<Utc>>,
    pub next_recovery_attempt: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    state: Mutex<CircuitBreakerState>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_state(CircuitBreakerState::default(), config, clock)
    }

    /// Restores a persisted state.
    pub fn with_state(state: CircuitBreakerState, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(state),
            config,
            clock,
        }
    }

    /// Returns `true` if this failure switched the breaker into LOCAL.
    pub fn record_storage_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_storage_failures = state.consecutive_storage_failures.saturating_add(1);
        if state.consecutive_storage_failures >= self.config.storage_failure_threshold {
            return self.enter_local(&mut state, "storage failures");
        }
        false
    }

    /// Resets the storage counter. Leaves the mode alone.
    pub fn record_storage_success(&self) {
        self.state.lock().consecutive_storage_failures = 0;
    }

    /// Returns `true` if this conflict switched the breaker into LOCAL.
    pub fn record_conflict(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_conflicts = state.consecutive_conflicts.saturating_add(1);
        if state.consecutive_conflicts >= self.config.conflict_threshold {
            return self.enter_local(&mut state, "sync conflicts");
        }
        false
    }

    pub fn record_merge_success(&self) {
        self.state.lock().consecutive_conflicts = 0;
    }

    /// Clears both counters and LOCAL mode. Returns `true` if LOCAL was
    /// active.
    pub fn record_full_sync_success(&self) -> bool {
        let mut state = self.state.lock();
        let was_local = state.local_mode_active;
        *state = CircuitBreakerState::default();
        if was_local {
            info!("full sync succeeded, leaving LOCAL mode");
        }
        was_local
    }

    /// Whether remote sync is suspended. Once the recovery time has passed
    /// this clears LOCAL mode (counters are kept) and returns `false`.
    pub fn is_local_mode_active(&self) -> bool {
        let mut state = self.state.lock();
        if !state.local_mode_active {
            return false;
        }
        let now = self.clock.now();
        if state.next_recovery_attempt.is_some_and(|at| now >= at) {
            state.local_mode_active = false;
            state.local_mode_activated_at = None;
            state.next_recovery_attempt = None;
            info!(
                storage_failures = state.consecutive_storage_failures,
                conflicts = state.consecutive_conflicts,
                "LOCAL mode recovery window reached, probing remote storage"
            );
            return false;
        }
        true
    }

    pub fn mode(&self) -> BreakerMode {
        if self.is_local_mode_active() {
            BreakerMode::Local
        } else {
            BreakerMode::Normal
        }
    }

    /// Snapshot for persistence and display. Does not trigger recovery.
    pub fn state(&self) -> CircuitBreakerState {
        self.state.lock().clone()
    }

    fn enter_local(&self, state: &mut CircuitBreakerState, reason: &str) -> bool {
        if state.local_mode_active {
            return false;
        }
        let now = self.clock.now();
        state.local_mode_active = true;
        state.local_mode_activated_at = Some(now);
        state.next_recovery_attempt = Some(now + to_chrono(self.config.recovery_delay));
        warn!(
            reason,
            storage_failures = state.consecutive_storage_failures,
            conflicts = state.consecutive_conflicts,
            "entering LOCAL mode: working offline, will retry sync"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (CircuitBreaker::new(BreakerConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn ten_storage_failures_enter_local() {
        let (b, _) = breaker();
        for _ in 0..9 {
            assert!(!b.record_storage_failure());
        }
        assert!(!b.is_local_mode_active());
        assert!(b.record_storage_failure());
        assert!(b.is_local_mode_active());
        assert_eq!(b.mode(), BreakerMode::Local);
    }

    #[test]
    fn success_in_between_resets_the_streak() {
        let (b, _) = breaker();
        for _ in 0..9 {
            b.record_storage_failure();
        }
        b.record_storage_success();
        b.record_storage_failure();
        assert!(!b.is_local_mode_active());
        assert_eq!(b.state().consecutive_storage_failures, 1);
    }

    #[test]
    fn five_conflicts_enter_local() {
        let (b, _) = breaker();
        for _ in 0..4 {
            b.record_conflict();
        }
        b.record_merge_success();
        for _ in 0..4 {
            assert!(!b.record_conflict());
        }
        assert!(b.record_conflict());
        assert!(b.is_local_mode_active());
    }

    #[test]
    fn recovery_is_passive_and_keeps_counters() {
        let (b, clock) = breaker();
        for _ in 0..10 {
            b.record_storage_failure();
        }
        clock.advance(chrono::Duration::minutes(59));
        assert!(b.is_local_mode_active());
        clock.advance(chrono::Duration::minutes(1));
        assert!(!b.is_local_mode_active());
        assert_eq!(b.state().consecutive_storage_failures, 10);

        // One more failure and we're straight back in.
        assert!(b.record_storage_failure());
        assert!(b.is_local_mode_active());
    }

    #[test]
    fn full_sync_success_clears_everything() {
        let (b, _) = breaker();
        for _ in 0..12 {
            b.record_storage_failure();
        }
        for _ in 0..3 {
            b.record_conflict();
        }
        assert!(b.record_full_sync_success());
        assert_eq!(b.state(), CircuitBreakerState::default());
        assert_eq!(b.mode(), BreakerMode::Normal);
    }

    #[test]
    fn persisted_state_restores() {
        let (b, clock) = breaker();
        for _ in 0..10 {
            b.record_storage_failure();
        }
        let restored = CircuitBreaker::with_state(b.state(), BreakerConfig::default(), clock);
        assert!(restored.is_local_mode_active());
    }
}
