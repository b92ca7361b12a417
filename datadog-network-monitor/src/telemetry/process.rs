// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process self-stats: CPU time and memory sampled from /proc.
//!
//! Sampling is rate-limited to once per second; callers always get the
//! cached snapshot in between. CPU usage is the delta of CPU ticks over
//! the delta of wall time, divided by clock ticks per second.

use std::fs;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use super::metrics::Registry;

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub peak_rss_bytes: u64,
}

#[derive(Debug, Default)]
struct SamplerState {
    last_sample: Option<Instant>,
    last_cpu_ticks: u64,
    cached: SystemStats,
}

/// Samples the calling process. Any thread may use it; state sits
/// behind a mutex.
#[derive(Debug, Default)]
pub struct SystemSampler {
    state: Mutex<SamplerState>,
}

impl SystemSampler {
    pub fn new() -> Self {
        SystemSampler::default()
    }

    /// Refresh the snapshot if at least a second has passed, then
    /// return it.
    pub fn sample(&self) -> SystemStats {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let due = state
            .last_sample
            .map_or(true, |last| now.saturating_duration_since(last) >= MIN_SAMPLE_INTERVAL);
        if !due {
            return state.cached;
        }

        let cpu_ticks = read_cpu_ticks().unwrap_or(state.last_cpu_ticks);
        let cpu_percent = match state.last_sample {
            Some(last) => {
                let wall = now.saturating_duration_since(last).as_secs_f64();
                let ticks_per_sec = clock_ticks_per_sec();
                if wall > 0.0 && ticks_per_sec > 0.0 {
                    let cpu_secs =
                        cpu_ticks.saturating_sub(state.last_cpu_ticks) as f64 / ticks_per_sec;
                    (cpu_secs / wall) * 100.0
                } else {
                    state.cached.cpu_percent
                }
            }
            None => 0.0,
        };

        let (vms_bytes, rss_bytes) = read_memory().unwrap_or((
            state.cached.vms_bytes,
            state.cached.rss_bytes,
        ));
        let peak_rss_bytes = read_peak_rss().unwrap_or(state.cached.peak_rss_bytes);

        state.last_sample = Some(now);
        state.last_cpu_ticks = cpu_ticks;
        state.cached = SystemStats {
            cpu_percent,
            rss_bytes,
            vms_bytes,
            peak_rss_bytes,
        };
        state.cached
    }

    /// Refresh and publish the snapshot as gauges.
    pub fn update_metrics(&self, registry: &Registry) {
        let stats = self.sample();
        registry.gauge_set("netmon_process_cpu_percent", "", stats.cpu_percent);
        registry.gauge_set("netmon_process_rss_bytes", "", stats.rss_bytes as f64);
        registry.gauge_set("netmon_process_vms_bytes", "", stats.vms_bytes as f64);
        registry.gauge_set(
            "netmon_process_peak_rss_bytes",
            "",
            stats.peak_rss_bytes as f64,
        );
    }
}

fn clock_ticks_per_sec() -> f64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        100.0
    } else {
        ticks as f64
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}

/// utime + stime from /proc/self/stat. The comm field may contain
/// spaces, so fields are counted from the closing parenthesis.
fn read_cpu_ticks() -> Option<u64> {
    let stat = fs::read_to_string("/proc/self/stat").ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Field 14 (utime) and 15 (stime), 1-based over the whole line;
    // after ")" the state field is index 0.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// (vms, rss) in bytes from /proc/self/statm.
fn read_memory() -> Option<(u64, u64)> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let mut fields = statm.split_whitespace();
    let size_pages: u64 = fields.next()?.parse().ok()?;
    let rss_pages: u64 = fields.next()?.parse().ok()?;
    let page = page_size();
    Some((size_pages * page, rss_pages * page))
}

/// VmHWM from /proc/self/status, in bytes.
fn read_peak_rss() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok()?;
            return Some(kb * 1024);
        }
    }
    debug!("VmHWM not present in /proc/self/status");
    None
}
