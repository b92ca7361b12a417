// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics registry: counters, gauges and histograms keyed by
//! (name, label-string), with text export in the standard scrape
//! format.
//!
//! A metric keeps the type it was created with for life; an operation
//! arriving under the same identity with a different type is logged
//! and ignored.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

/// Histogram boundaries used when the caller doesn't register custom
/// ones. Seconds-scaled.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub bounds: Vec<f64>,
    /// Cumulative counts per bound, plus the +∞ bucket at the end.
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

/// A point-in-time view of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
    Histogram(HistogramSnapshot),
}

#[derive(Debug)]
struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

impl Histogram {
    fn new(bounds: Vec<f64>) -> Self {
        let buckets = bounds.len() + 1;
        Histogram {
            bounds,
            counts: vec![0; buckets],
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Increment every bucket whose boundary admits the value; the
    /// final +∞ bucket always does.
    fn observe(&mut self, value: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                self.counts[i] += 1;
            }
        }
        let last = self.counts.len() - 1;
        self.counts[last] += 1;
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: self.bounds.clone(),
            counts: self.counts.clone(),
            sum: self.sum,
            count: self.count,
            min: if self.count == 0 { 0.0 } else { self.min },
            max: if self.count == 0 { 0.0 } else { self.max },
        }
    }
}

#[derive(Debug)]
enum Metric {
    Counter(u64),
    Gauge(f64),
    Histogram(Histogram),
}

impl Metric {
    fn type_name(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Gauge(_) => "gauge",
            Metric::Histogram(_) => "histogram",
        }
    }

    fn snapshot(&self) -> MetricValue {
        match self {
            Metric::Counter(v) => MetricValue::Counter(*v),
            Metric::Gauge(v) => MetricValue::Gauge(*v),
            Metric::Histogram(h) => MetricValue::Histogram(h.snapshot()),
        }
    }
}

/// Thread-safe metric store.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: Mutex<HashMap<MetricKey, Metric>>,
    help: Mutex<HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Attach a help line shown in the text export. Optional; the
    /// metric name doubles as help otherwise.
    pub fn describe(&self, name: &str, help: &str) {
        self.help
            .lock()
            .unwrap()
            .insert(name.to_string(), help.to_string());
    }

    pub fn counter_inc(&self, name: &str, labels: &str, delta: u64) {
        self.update(name, labels, |existing| match existing {
            Some(Metric::Counter(v)) => {
                *v += delta;
                None
            }
            Some(other) => Some(other.type_name()),
            None => {
                *existing = Some(Metric::Counter(delta));
                None
            }
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &str, value: f64) {
        self.update(name, labels, |existing| match existing {
            Some(Metric::Gauge(v)) => {
                *v = value;
                None
            }
            Some(other) => Some(other.type_name()),
            None => {
                *existing = Some(Metric::Gauge(value));
                None
            }
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &str, value: f64) {
        self.histogram_observe_with(name, labels, value, &DEFAULT_BUCKETS);
    }

    pub fn histogram_observe_with(&self, name: &str, labels: &str, value: f64, bounds: &[f64]) {
        self.update(name, labels, |existing| match existing {
            Some(Metric::Histogram(h)) => {
                h.observe(value);
                None
            }
            Some(other) => Some(other.type_name()),
            None => {
                let mut histogram = Histogram::new(bounds.to_vec());
                histogram.observe(value);
                *existing = Some(Metric::Histogram(histogram));
                None
            }
        });
    }

    fn update<F>(&self, name: &str, labels: &str, apply: F)
    where
        F: FnOnce(&mut Option<Metric>) -> Option<&'static str>,
    {
        let key = MetricKey {
            name: name.to_string(),
            labels: labels.to_string(),
        };
        let mut metrics = self.metrics.lock().unwrap();
        let mut slot = metrics.remove(&key);
        let mismatch = apply(&mut slot);
        if let Some(existing_type) = mismatch {
            warn!(
                name,
                labels, existing_type, "metric type mismatch, operation ignored"
            );
        }
        if let Some(metric) = slot {
            metrics.insert(key, metric);
        }
    }

    pub fn get(&self, name: &str, labels: &str) -> Option<MetricValue> {
        let key = MetricKey {
            name: name.to_string(),
            labels: labels.to_string(),
        };
        self.metrics.lock().unwrap().get(&key).map(Metric::snapshot)
    }

    /// Snapshot every metric, sorted by (name, labels).
    pub fn list(&self) -> Vec<(String, String, MetricValue)> {
        let metrics = self.metrics.lock().unwrap();
        let mut sorted: BTreeMap<MetricKey, MetricValue> = BTreeMap::new();
        for (key, metric) in metrics.iter() {
            sorted.insert(key.clone(), metric.snapshot());
        }
        sorted
            .into_iter()
            .map(|(key, value)| (key.name, key.labels, value))
            .collect()
    }

    /// Zero one metric without changing its type.
    pub fn reset(&self, name: &str, labels: &str) {
        let key = MetricKey {
            name: name.to_string(),
            labels: labels.to_string(),
        };
        let mut metrics = self.metrics.lock().unwrap();
        if let Some(metric) = metrics.get_mut(&key) {
            match metric {
                Metric::Counter(v) => *v = 0,
                Metric::Gauge(v) => *v = 0.0,
                Metric::Histogram(h) => *h = Histogram::new(h.bounds.clone()),
            }
        }
    }

    /// Render every metric in the scrape text format. Returns the
    /// number of bytes written.
    pub fn export_text(&self, out: &mut String) -> usize {
        use std::fmt::Write;

        let start = out.len();
        let help = self.help.lock().unwrap().clone();
        let mut last_name: Option<String> = None;
        for (name, labels, value) in self.list() {
            if last_name.as_deref() != Some(&name) {
                let help_text = help.get(&name).cloned().unwrap_or_else(|| name.clone());
                let type_name = match &value {
                    MetricValue::Counter(_) => "counter",
                    MetricValue::Gauge(_) => "gauge",
                    MetricValue::Histogram(_) => "histogram",
                };
                let _ = writeln!(out, "# HELP {name} {help_text}");
                let _ = writeln!(out, "# TYPE {name} {type_name}");
                last_name = Some(name.clone());
            }
            match value {
                MetricValue::Counter(v) => {
                    let _ = writeln!(out, "{}{} {v}", name, format_labels(&labels));
                }
                MetricValue::Gauge(v) => {
                    let _ = writeln!(out, "{}{} {v}", name, format_labels(&labels));
                }
                MetricValue::Histogram(h) => {
                    for (i, bound) in h.bounds.iter().enumerate() {
                        let _ = writeln!(
                            out,
                            "{}_bucket{} {}",
                            name,
                            merge_labels(&labels, &format!("le=\"{bound}\"")),
                            h.counts[i]
                        );
                    }
                    let _ = writeln!(
                        out,
                        "{}_bucket{} {}",
                        name,
                        merge_labels(&labels, "le=\"+Inf\""),
                        h.counts[h.counts.len() - 1]
                    );
                    let _ = writeln!(out, "{}_sum{} {}", name, format_labels(&labels), h.sum);
                    let _ =
                        writeln!(out, "{}_count{} {}", name, format_labels(&labels), h.count);
                }
            }
        }
        out.len() - start
    }
}

fn format_labels(labels: &str) -> String {
    if labels.is_empty() {
        String::new()
    } else {
        format!("{{{labels}}}")
    }
}

fn merge_labels(labels: &str, extra: &str) -> String {
    if labels.is_empty() {
        format!("{{{extra}}}")
    } else {
        format!("{{{labels},{extra}}}")
    }
}
