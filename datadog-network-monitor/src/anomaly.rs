// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Statistical anomaly detection over per-kind event rates.
//!
//! Each event kind keeps a rolling baseline of recent rate samples with
//! O(1) running sum and sum-of-squares. The current rate comes from a
//! rolling per-second counter over the configured window; baseline
//! samples are absorbed at most once per minute so a short burst is
//! scored against history rather than against itself.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use datadog_netlink::{EventKind, NetworkEvent};
use serde::Serialize;

/// Cap on retained baseline samples per kind.
const MAX_BASELINE_SAMPLES: usize = 1000;
/// A baseline below this many samples never flags.
const MIN_BASELINE_SAMPLES: usize = 5;
/// Wall-time spacing between baseline samples.
const BASELINE_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
/// Floor applied to the standard deviation when a genuine deviation
/// exists, so a perfectly flat baseline still produces a finite score.
const MIN_STDDEV: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    /// What tripped; currently always a rate spike.
    pub kind: String,
    pub event_type: EventKind,
    pub score: f64,
    pub baseline_mean: f64,
    pub baseline_stddev: f64,
    pub current_value: f64,
    pub detected_at_ns: u64,
}

/// Rolling window of rate samples with O(1) mean and stddev.
#[derive(Debug, Default)]
struct Baseline {
    samples: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl Baseline {
    fn push(&mut self, sample: f64) {
        if self.samples.len() == MAX_BASELINE_SAMPLES {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
                self.sum_sq -= oldest * oldest;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
        self.sum_sq += sample * sample;
    }

    fn initialized(&self) -> bool {
        self.samples.len() >= MIN_BASELINE_SAMPLES
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum / self.samples.len() as f64
    }

    fn variance(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / self.samples.len() as f64 - mean * mean).max(0.0)
    }

    fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Per-second arrival counter over a bounded window.
#[derive(Debug)]
struct RateWindow {
    window_secs: u64,
    epoch: Option<Instant>,
    slots: VecDeque<(u64, u64)>,
    total: u64,
}

impl RateWindow {
    fn new(window_secs: u64) -> Self {
        RateWindow {
            window_secs: window_secs.max(1),
            epoch: None,
            slots: VecDeque::new(),
            total: 0,
        }
    }

    fn record(&mut self, now: Instant) {
        let epoch = *self.epoch.get_or_insert(now);
        let slot = now.saturating_duration_since(epoch).as_secs();
        match self.slots.back_mut() {
            Some((last, count)) if *last == slot => *count += 1,
            _ => self.slots.push_back((slot, 1)),
        }
        self.total += 1;
        while let Some(&(oldest, count)) = self.slots.front() {
            if oldest + self.window_secs <= slot {
                self.total -= count;
                self.slots.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(&self) -> f64 {
        self.total as f64 / self.window_secs as f64
    }
}

#[derive(Debug)]
struct KindState {
    baseline: Baseline,
    rate: RateWindow,
    last_baseline_update: Option<Instant>,
}

/// Detector over every event kind seen so far.
pub struct AnomalyDetector {
    window_secs: u64,
    threshold_sigma: f64,
    kinds: HashMap<EventKind, KindState>,
}

impl AnomalyDetector {
    pub fn new(window_secs: u64, threshold_sigma: f64) -> Self {
        AnomalyDetector {
            window_secs,
            threshold_sigma,
            kinds: HashMap::new(),
        }
    }

    /// Score one event arrival at the current time.
    pub fn process(&mut self, event: &NetworkEvent) -> Option<Anomaly> {
        self.process_at(event, Instant::now())
    }

    /// Score one event arrival with an explicit clock.
    pub fn process_at(&mut self, event: &NetworkEvent, now: Instant) -> Option<Anomaly> {
        let window_secs = self.window_secs;
        let state = self
            .kinds
            .entry(event.kind)
            .or_insert_with(|| KindState {
                baseline: Baseline::default(),
                rate: RateWindow::new(window_secs),
                last_baseline_update: None,
            });
        state.rate.record(now);
        let current = state.rate.rate();
        self.observe_rate(event.kind, current, now)
    }

    /// Feed a rate observation directly. `process_at` derives the rate
    /// from event arrivals; this entry point scores an
    /// externally-computed sample against the same baselines.
    pub fn observe_rate(
        &mut self,
        kind: EventKind,
        rate: f64,
        now: Instant,
    ) -> Option<Anomaly> {
        let window_secs = self.window_secs;
        let state = self.kinds.entry(kind).or_insert_with(|| KindState {
            baseline: Baseline::default(),
            rate: RateWindow::new(window_secs),
            last_baseline_update: None,
        });

        let mut anomaly = None;
        if state.baseline.initialized() {
            let mean = state.baseline.mean();
            let stddev = state.baseline.stddev();
            let deviation = (rate - mean).abs();
            if deviation > 0.0 {
                let score = deviation / stddev.max(MIN_STDDEV);
                if score >= self.threshold_sigma {
                    anomaly = Some(Anomaly {
                        kind: "rate_spike".to_string(),
                        event_type: kind,
                        score,
                        baseline_mean: mean,
                        baseline_stddev: stddev,
                        current_value: rate,
                        detected_at_ns: datadog_netlink::events::wall_clock_ns(),
                    });
                }
            }
        }

        match state.last_baseline_update {
            None => state.last_baseline_update = Some(now),
            Some(last) if now.saturating_duration_since(last) >= BASELINE_UPDATE_INTERVAL => {
                state.baseline.push(rate);
                state.last_baseline_update = Some(now);
            }
            Some(_) => {}
        }
        anomaly
    }

    /// Baseline mean and stddev for one kind, if any samples exist.
    pub fn baseline(&self, kind: EventKind) -> Option<(f64, f64)> {
        self.kinds
            .get(&kind)
            .filter(|s| !s.baseline.samples.is_empty())
            .map(|s| (s.baseline.mean(), s.baseline.stddev()))
    }
}
