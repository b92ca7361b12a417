// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory and rate budgeting with an operator-facing health snapshot.
//!
//! One mutex around the whole block; every operation is O(1) so
//! contention stays negligible.

use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Fraction of a cap that flips the warning bit.
const WARN_THRESHOLD: f64 = 0.75;
/// Fraction of a cap that flips the critical bit.
const CRIT_THRESHOLD: f64 = 0.90;
/// Drop-rate thresholds.
const DROPS_WARN: f64 = 0.01;
const DROPS_CRIT: f64 = 0.05;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_memory_mb: u64,
    pub max_msg_per_sec: u64,
    pub enable_memory: bool,
    pub enable_rate: bool,
    pub sample_interval_sec: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_memory_mb: 256,
            max_msg_per_sec: 100_000,
            enable_memory: true,
            enable_rate: true,
            sample_interval_sec: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LimitsStats {
    pub current_bytes: u64,
    pub peak_bytes: u64,
    pub msgs_this_sec: u64,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub memory_denied: u64,
    pub rate_denied: u64,
    pub processing_ns_min: u64,
    pub processing_ns_avg: u64,
    pub processing_ns_max: u64,
    pub socket_buffer_size: u64,
    pub socket_buffer_used: u64,
    pub socket_drops: u64,
}

/// Warn/critical booleans per axis; any critical axis makes the whole
/// snapshot unhealthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub memory_warn: bool,
    pub memory_crit: bool,
    pub rate_warn: bool,
    pub rate_crit: bool,
    pub buffer_warn: bool,
    pub buffer_crit: bool,
    pub drops_warn: bool,
    pub drops_crit: bool,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct LimitsState {
    current_bytes: u64,
    peak_bytes: u64,
    msgs_this_sec: u64,
    current_sec: u64,
    total_processed: u64,
    total_dropped: u64,
    memory_denied: u64,
    rate_denied: u64,
    proc_ns_min: u64,
    proc_ns_max: u64,
    proc_ns_sum: u64,
    proc_count: u64,
    socket_buffer_size: u64,
    socket_buffer_used: u64,
    socket_drops: u64,
}

/// Tracks payload bytes in flight and per-second message rate against
/// configured caps.
pub struct ResourceLimits {
    config: LimitsConfig,
    epoch: Instant,
    state: Mutex<LimitsState>,
}

impl ResourceLimits {
    pub fn new(config: LimitsConfig) -> Self {
        ResourceLimits {
            config,
            epoch: Instant::now(),
            state: Mutex::new(LimitsState::default()),
        }
    }

    pub fn config(&self) -> &LimitsConfig {
        &self.config
    }

    fn max_bytes(&self) -> u64 {
        self.config.max_memory_mb * 1024 * 1024
    }

    /// Account for a payload allocation. Denied when the memory cap is
    /// enabled and would be exceeded; the caller must then drop the
    /// event.
    #[must_use]
    pub fn track_alloc(&self, size: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        let next = state.current_bytes + size as u64;
        if self.config.enable_memory && next > self.max_bytes() {
            state.memory_denied += 1;
            state.total_dropped += 1;
            return false;
        }
        state.current_bytes = next;
        state.peak_bytes = state.peak_bytes.max(next);
        true
    }

    pub fn track_free(&self, size: usize) {
        let mut state = self.state.lock().unwrap();
        state.current_bytes = state.current_bytes.saturating_sub(size as u64);
    }

    pub fn can_process(&self) -> bool {
        self.can_process_at(Instant::now())
    }

    /// Rate admission with an explicit clock. The per-second counter
    /// resets on each wall-second transition.
    pub fn can_process_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        let sec = now.saturating_duration_since(self.epoch).as_secs();
        if sec != state.current_sec {
            state.current_sec = sec;
            state.msgs_this_sec = 0;
        }
        if self.config.enable_rate && state.msgs_this_sec >= self.config.max_msg_per_sec {
            state.rate_denied += 1;
            state.total_dropped += 1;
            return false;
        }
        state.msgs_this_sec += 1;
        true
    }

    /// Record one processed message and its processing time.
    pub fn record(&self, size: usize, processing_ns: u64) {
        let mut state = self.state.lock().unwrap();
        state.total_processed += 1;
        let _ = size;
        if state.proc_count == 0 {
            state.proc_ns_min = processing_ns;
            state.proc_ns_max = processing_ns;
        } else {
            state.proc_ns_min = state.proc_ns_min.min(processing_ns);
            state.proc_ns_max = state.proc_ns_max.max(processing_ns);
        }
        state.proc_ns_sum += processing_ns;
        state.proc_count += 1;
    }

    /// Count a drop decided outside this block (queue full, consumer
    /// rate limit).
    pub fn record_drop(&self) {
        self.state.lock().unwrap().total_dropped += 1;
    }

    pub fn update_socket_buffer(&self, size: u64, used: u64, drops: u64) {
        let mut state = self.state.lock().unwrap();
        state.socket_buffer_size = size;
        state.socket_buffer_used = used;
        state.socket_drops = drops;
    }

    pub fn stats(&self) -> LimitsStats {
        let state = self.state.lock().unwrap();
        LimitsStats {
            current_bytes: state.current_bytes,
            peak_bytes: state.peak_bytes,
            msgs_this_sec: state.msgs_this_sec,
            total_processed: state.total_processed,
            total_dropped: state.total_dropped,
            memory_denied: state.memory_denied,
            rate_denied: state.rate_denied,
            processing_ns_min: state.proc_ns_min,
            processing_ns_avg: if state.proc_count == 0 {
                0
            } else {
                state.proc_ns_sum / state.proc_count
            },
            processing_ns_max: state.proc_ns_max,
            socket_buffer_size: state.socket_buffer_size,
            socket_buffer_used: state.socket_buffer_used,
            socket_drops: state.socket_drops,
        }
    }

    /// Zero every counter except bytes currently in flight.
    pub fn reset_stats(&self) {
        let mut state = self.state.lock().unwrap();
        let current_bytes = state.current_bytes;
        *state = LimitsState {
            current_bytes,
            peak_bytes: current_bytes,
            ..LimitsState::default()
        };
    }

    pub fn health(&self) -> HealthSnapshot {
        let state = self.state.lock().unwrap();

        let memory_pct = ratio(state.current_bytes, self.max_bytes());
        let rate_pct = ratio(state.msgs_this_sec, self.config.max_msg_per_sec);
        let buffer_pct = ratio(state.socket_buffer_used, state.socket_buffer_size);
        let attempts = state.total_processed + state.total_dropped;
        let drop_rate = if attempts == 0 {
            0.0
        } else {
            state.total_dropped as f64 / attempts as f64
        };

        let snapshot = HealthSnapshot {
            memory_warn: self.config.enable_memory && memory_pct >= WARN_THRESHOLD,
            memory_crit: self.config.enable_memory && memory_pct >= CRIT_THRESHOLD,
            rate_warn: self.config.enable_rate && rate_pct >= WARN_THRESHOLD,
            rate_crit: self.config.enable_rate && rate_pct >= CRIT_THRESHOLD,
            buffer_warn: buffer_pct >= WARN_THRESHOLD,
            buffer_crit: buffer_pct >= CRIT_THRESHOLD,
            drops_warn: drop_rate >= DROPS_WARN,
            drops_crit: drop_rate >= DROPS_CRIT,
            healthy: true,
        };
        HealthSnapshot {
            healthy: !(snapshot.memory_crit
                || snapshot.rate_crit
                || snapshot.buffer_crit
                || snapshot.drops_crit),
            ..snapshot
        }
    }
}

fn ratio(value: u64, cap: u64) -> f64 {
    if cap == 0 {
        return 0.0;
    }
    value as f64 / cap as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits(max_memory_mb: u64, max_msg_per_sec: u64) -> ResourceLimits {
        ResourceLimits::new(LimitsConfig {
            max_memory_mb,
            max_msg_per_sec,
            ..LimitsConfig::default()
        })
    }

    #[test]
    fn test_memory_cap_denies_and_counts() {
        let limits = limits(1, 1000); // 1 MiB
        assert!(limits.track_alloc(512 * 1024));
        assert!(limits.track_alloc(256 * 1024));
        assert!(!limits.track_alloc(512 * 1024));

        let stats = limits.stats();
        assert_eq!(stats.current_bytes, 768 * 1024);
        assert_eq!(stats.memory_denied, 1);
        assert_eq!(stats.total_dropped, 1);

        limits.track_free(512 * 1024);
        assert!(limits.track_alloc(512 * 1024));
        assert_eq!(limits.stats().peak_bytes, 768 * 1024);
    }

    #[test]
    fn test_memory_cap_disabled() {
        let limits = ResourceLimits::new(LimitsConfig {
            max_memory_mb: 1,
            enable_memory: false,
            ..LimitsConfig::default()
        });
        assert!(limits.track_alloc(64 * 1024 * 1024));
    }

    #[test]
    fn test_rate_cap_resets_each_second() {
        let limits = limits(256, 3);
        let now = Instant::now() + Duration::from_millis(10);
        assert!(limits.can_process_at(now));
        assert!(limits.can_process_at(now));
        assert!(limits.can_process_at(now));
        assert!(!limits.can_process_at(now));
        assert_eq!(limits.stats().rate_denied, 1);

        // Next wall second: counter starts over.
        let next = now + Duration::from_secs(1);
        assert!(limits.can_process_at(next));
        assert_eq!(limits.stats().msgs_this_sec, 1);
    }

    #[test]
    fn test_processing_time_distribution() {
        let limits = limits(256, 1000);
        limits.record(100, 500);
        limits.record(100, 1500);
        limits.record(100, 1000);

        let stats = limits.stats();
        assert_eq!(stats.processing_ns_min, 500);
        assert_eq!(stats.processing_ns_avg, 1000);
        assert_eq!(stats.processing_ns_max, 1500);
        assert_eq!(stats.total_processed, 3);
    }

    #[test]
    fn test_health_thresholds() {
        let limits = limits(1, 1000); // cap 1 MiB
        assert!(limits.health().healthy);

        // ~82% of the cap: warn only.
        assert!(limits.track_alloc(800 * 1024));
        let _ = limits.track_alloc(38 * 1024);
        let health = limits.health();
        assert!(health.memory_warn);
        assert!(!health.memory_crit);
        assert!(health.healthy);

        // Past 90%: critical, overall unhealthy.
        let _ = limits.track_alloc(150 * 1024);
        let health = limits.health();
        assert!(health.memory_crit);
        assert!(!health.healthy);
    }

    #[test]
    fn test_drop_rate_health() {
        let limits = limits(256, 1000);
        for _ in 0..97 {
            limits.record(0, 100);
        }
        for _ in 0..3 {
            limits.record_drop();
        }
        let health = limits.health();
        assert!(health.drops_warn);
        assert!(!health.drops_crit);
        assert!(health.healthy);

        for _ in 0..4 {
            limits.record_drop();
        }
        assert!(limits.health().drops_crit);
        assert!(!limits.health().healthy);
    }

    #[test]
    fn test_socket_buffer_health() {
        let limits = limits(256, 1000);
        limits.update_socket_buffer(1000, 950, 2);
        let health = limits.health();
        assert!(health.buffer_crit);
        assert!(!health.healthy);
        assert_eq!(limits.stats().socket_drops, 2);
    }

    #[test]
    fn test_reset_stats_keeps_inflight_bytes() {
        let limits = limits(256, 1000);
        assert!(limits.track_alloc(1024));
        limits.record(0, 10);
        limits.reset_stats();

        let stats = limits.stats();
        assert_eq!(stats.current_bytes, 1024);
        assert_eq!(stats.total_processed, 0);
    }
}
