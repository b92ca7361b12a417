// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token-bucket admission control, single bucket and per-event-kind map.
//!
//! Refill is computed lazily from the monotonic elapsed time on every
//! operation; nothing ever sleeps waiting for tokens. Bucket state sits
//! behind a mutex, the allowed/denied counters are relaxed atomics and
//! eventually consistent across threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use datadog_netlink::EventKind;
use serde::Serialize;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub denied: u64,
    pub tokens: f64,
    pub rate: f64,
    pub burst: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

/// A token bucket admitting `rate` units per second with bursts up to
/// `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl TokenBucket {
    /// Construction fails for a non-positive rate or a zero burst.
    pub fn new(rate: f64, burst: f64) -> Result<Self, ConfigError> {
        if rate <= 0.0 || !rate.is_finite() {
            return Err(ConfigError::InvalidRate(rate));
        }
        if burst <= 0.0 || !burst.is_finite() {
            return Err(ConfigError::InvalidBurst(burst));
        }
        Ok(TokenBucket {
            state: Mutex::new(BucketState {
                tokens: burst,
                rate,
                burst,
                last_refill: Instant::now(),
            }),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        })
    }

    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    pub fn allow_n(&self, n: u32) -> bool {
        self.allow_n_at(n, Instant::now())
    }

    /// Admission with an explicit clock, the testing seam.
    pub fn allow_n_at(&self, n: u32, now: Instant) -> bool {
        let admitted = {
            let mut state = self.state.lock().unwrap();
            state.refill(now);
            let needed = f64::from(n);
            if state.tokens >= needed {
                state.tokens -= needed;
                true
            } else {
                false
            }
        };
        if admitted {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    pub fn set_rate(&self, rate: f64) -> Result<(), ConfigError> {
        if rate <= 0.0 || !rate.is_finite() {
            return Err(ConfigError::InvalidRate(rate));
        }
        let mut state = self.state.lock().unwrap();
        state.refill(Instant::now());
        state.rate = rate;
        Ok(())
    }

    pub fn set_burst(&self, burst: f64) -> Result<(), ConfigError> {
        if burst <= 0.0 || !burst.is_finite() {
            return Err(ConfigError::InvalidBurst(burst));
        }
        let mut state = self.state.lock().unwrap();
        state.burst = burst;
        state.tokens = state.tokens.min(burst);
        Ok(())
    }

    /// Refill to burst and zero the counters.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.tokens = state.burst;
        state.last_refill = Instant::now();
        self.allowed.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
    }

    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    pub fn tokens_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.refill(now);
        state.tokens
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().unwrap();
        RateLimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            tokens: state.tokens,
            rate: state.rate,
            burst: state.burst,
        }
    }
}

/// Per-event-kind buckets with a default bucket used on miss.
///
/// The map lock only covers entry lookup and replacement; admission
/// itself contends on the individual bucket.
#[derive(Debug)]
pub struct RateLimiterMap {
    default: Arc<TokenBucket>,
    buckets: Mutex<HashMap<EventKind, Arc<TokenBucket>>>,
}

impl RateLimiterMap {
    pub fn new(default_rate: f64, default_burst: f64) -> Result<Self, ConfigError> {
        Ok(RateLimiterMap {
            default: Arc::new(TokenBucket::new(default_rate, default_burst)?),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Create or replace the bucket for one kind.
    pub fn set(&self, kind: EventKind, rate: f64, burst: f64) -> Result<(), ConfigError> {
        let bucket = Arc::new(TokenBucket::new(rate, burst)?);
        self.buckets.lock().unwrap().insert(kind, bucket);
        Ok(())
    }

    pub fn allow(&self, kind: EventKind) -> bool {
        self.allow_at(kind, Instant::now())
    }

    pub fn allow_at(&self, kind: EventKind, now: Instant) -> bool {
        self.bucket_for(kind).allow_n_at(1, now)
    }

    /// Stats of the kind's bucket, or of the default bucket when no
    /// specific entry exists.
    pub fn stats(&self, kind: EventKind) -> RateLimiterStats {
        self.bucket_for(kind).stats()
    }

    pub fn default_stats(&self) -> RateLimiterStats {
        self.default.stats()
    }

    fn bucket_for(&self, kind: EventKind) -> Arc<TokenBucket> {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case(0.0, 10.0)]
    #[case(-5.0, 10.0)]
    #[case(10.0, 0.0)]
    #[case(f64::NAN, 10.0)]
    fn test_invalid_construction(#[case] rate: f64, #[case] burst: f64) {
        assert!(TokenBucket::new(rate, burst).is_err());
    }

    #[test]
    fn test_burst_then_deny() {
        let bucket = TokenBucket::new(10.0, 10.0).unwrap();
        let now = Instant::now();

        // 100 requests inside a 10ms window: exactly the burst admitted.
        let mut admitted = 0;
        for i in 0..100u64 {
            let ts = now + Duration::from_micros(i * 100);
            if bucket.allow_n_at(1, ts) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);

        let stats = bucket.stats();
        assert_eq!(stats.allowed, 10);
        assert_eq!(stats.denied, 90);

        // After one idle second a single request is admitted and nine
        // tokens remain.
        let later = now + Duration::from_secs(1) + Duration::from_millis(10);
        assert!(bucket.allow_n_at(1, later));
        let tokens = bucket.tokens_at(later);
        assert!((tokens - 9.0).abs() < 0.2, "tokens = {tokens}");
    }

    #[test]
    fn test_allowed_bounded_by_rate_times_time() {
        // allowed <= burst + rate * elapsed, uniform submission.
        let bucket = TokenBucket::new(50.0, 20.0).unwrap();
        let now = Instant::now();
        let mut admitted = 0u64;
        // 1000 requests over 2 simulated seconds.
        for i in 0..1000u64 {
            let ts = now + Duration::from_millis(i * 2);
            if bucket.allow_n_at(1, ts) {
                admitted += 1;
            }
        }
        assert!(admitted as f64 <= 20.0 + 50.0 * 2.0 + 1.0, "{admitted}");
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let bucket = TokenBucket::new(100.0, 5.0).unwrap();
        let now = Instant::now();
        assert!((bucket.tokens_at(now + Duration::from_secs(60)) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_allow_n_debits_n() {
        let bucket = TokenBucket::new(1.0, 10.0).unwrap();
        let now = Instant::now();
        assert!(bucket.allow_n_at(8, now));
        assert!(!bucket.allow_n_at(5, now));
        assert!(bucket.allow_n_at(2, now));
    }

    #[test]
    fn test_reset_restores_burst() {
        let bucket = TokenBucket::new(1.0, 4.0).unwrap();
        let now = Instant::now();
        for _ in 0..4 {
            assert!(bucket.allow_n_at(1, now));
        }
        assert!(!bucket.allow_n_at(1, now));
        bucket.reset();
        assert!(bucket.allow());
        assert_eq!(bucket.stats().allowed, 1);
    }

    #[test]
    fn test_set_burst_clamps_tokens() {
        let bucket = TokenBucket::new(1.0, 10.0).unwrap();
        bucket.set_burst(3.0).unwrap();
        assert!(bucket.tokens() <= 3.0);
    }

    #[test]
    fn test_map_uses_specific_then_default() {
        let map = RateLimiterMap::new(1000.0, 1000.0).unwrap();
        map.set(EventKind::RouteNew, 1.0, 1.0).unwrap();
        let now = Instant::now();

        assert!(map.allow_at(EventKind::RouteNew, now));
        assert!(!map.allow_at(EventKind::RouteNew, now));
        // Other kinds ride the roomy default bucket.
        for _ in 0..100 {
            assert!(map.allow_at(EventKind::LinkNew, now));
        }
        assert_eq!(map.stats(EventKind::RouteNew).denied, 1);
        assert_eq!(map.stats(EventKind::AddrNew).allowed, 100);
    }

    #[test]
    fn test_map_set_replaces_entry() {
        let map = RateLimiterMap::new(10.0, 10.0).unwrap();
        map.set(EventKind::Generic, 1.0, 1.0).unwrap();
        map.set(EventKind::Generic, 5.0, 5.0).unwrap();
        assert!((map.stats(EventKind::Generic).burst - 5.0).abs() < f64::EPSILON);
    }
}
