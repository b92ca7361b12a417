// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Umbrella wiring: ingestion monitor feeding the event processor,
//! with one readiness loop and the operator surfaces (metrics text,
//! stats, health) exposed behind a single handle.

use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datadog_netlink::{EventSource, Monitor, MonitorError, NetworkEvent, SourceStats};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{AgentConfig, ConfigError};
use crate::event_store::{EventFilter, EventStore, StoreStats};
use crate::limits::{HealthSnapshot, LimitsStats, ResourceLimits};
use crate::processor::{EventProcessor, ProcessorStats, SubmitError};
use crate::telemetry::{Registry, SystemSampler};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AgentHealth {
    pub pipeline: HealthSnapshot,
    pub route_degraded: bool,
    pub generic_degraded: bool,
    pub sock_diag_degraded: bool,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub processor: ProcessorStats,
    pub store: StoreStats,
    pub limits: LimitsStats,
    pub sources: HashMap<&'static str, SourceStats>,
}

/// The long-running agent: construct, register consumers, `start`,
/// then drive `poll_once` from the owning thread.
pub struct NetworkMonitorAgent {
    monitor: Mutex<Monitor>,
    processor: Arc<EventProcessor>,
    store: Arc<EventStore>,
    limits: Arc<ResourceLimits>,
    registry: Arc<Registry>,
    sampler: SystemSampler,
}

impl NetworkMonitorAgent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;

        let store = Arc::new(EventStore::new(config.store.capacity));
        let limits = Arc::new(ResourceLimits::new(config.limits.clone()));
        let registry = Arc::new(Registry::new());
        describe_metrics(&registry);

        let processor = Arc::new(EventProcessor::new(
            config.processor.clone(),
            Arc::clone(&store),
            Arc::clone(&limits),
            Arc::clone(&registry),
        )?);

        let mut monitor = Monitor::new(config.ingestion.clone());
        let submitter = Arc::clone(&processor);
        monitor.set_callback(move |_source, event| {
            match submitter.submit(event) {
                Ok(()) => {}
                // Admission drops already carry their own counters.
                Err(SubmitError::RateLimited)
                | Err(SubmitError::MemoryLimited)
                | Err(SubmitError::QueueFull) => {}
                Err(err) => debug!(%err, "event rejected outside admission"),
            }
        });

        Ok(NetworkMonitorAgent {
            monitor: Mutex::new(monitor),
            processor,
            store,
            limits,
            registry,
            sampler: SystemSampler::new(),
        })
    }

    /// Start the worker pool and enable the configured sources.
    pub fn start(&self) -> Result<(), AgentError> {
        self.processor.start();
        self.monitor.lock().unwrap().enable_configured()?;
        Ok(())
    }

    pub fn register_consumer<F>(&self, consumer: F)
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.processor.register_consumer(consumer);
    }

    /// Wait up to `timeout` for readiness on any enabled source, then
    /// drain every ready one. Returns the number of events dispatched.
    ///
    /// A hard receive error leaves the source degraded but enabled;
    /// the operator sees it in `health()`.
    pub fn poll_once(&self, timeout: Duration) -> Result<usize, AgentError> {
        let mut monitor = self.monitor.lock().unwrap();

        let ready: Vec<EventSource> = {
            let watched: Vec<(EventSource, i32)> = EventSource::ALL
                .iter()
                .filter_map(|&source| monitor.fd(source).map(|fd| (source, fd)))
                .collect();
            if watched.is_empty() {
                return Ok(0);
            }

            // SAFETY: the fds stay open for the duration of the borrow;
            // the monitor is locked and sources cannot be disabled here.
            let borrowed: Vec<BorrowedFd<'_>> = watched
                .iter()
                .map(|&(_, fd)| unsafe { BorrowedFd::borrow_raw(fd) })
                .collect();
            let mut pollfds: Vec<PollFd> = borrowed
                .iter()
                .map(|&fd| PollFd::new(fd, PollFlags::POLLIN))
                .collect();

            let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
            poll(&mut pollfds, PollTimeout::from(millis))?;

            watched
                .iter()
                .zip(pollfds.iter())
                .filter(|(_, pollfd)| {
                    pollfd
                        .revents()
                        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR))
                })
                .map(|(&(source, _), _)| source)
                .collect()
        };

        let mut dispatched = 0;
        for source in ready {
            match monitor.process(source) {
                Ok(drained) => dispatched += drained.events,
                Err(err) => {
                    warn!(source = source.as_str(), %err, "source read failed");
                }
            }
        }
        Ok(dispatched)
    }

    /// Kick off sock-diag dumps for TCP and UDP over IPv4 and IPv6.
    /// Replies arrive through the normal poll loop.
    pub fn request_sock_diag_dumps(&self) -> Result<(), AgentError> {
        let mut monitor = self.monitor.lock().unwrap();
        for family in [libc::AF_INET as u8, libc::AF_INET6 as u8] {
            for protocol in [libc::IPPROTO_TCP as u8, libc::IPPROTO_UDP as u8] {
                monitor.request_sock_diag(family, protocol)?;
            }
        }
        Ok(())
    }

    /// Query the recent-event cache.
    pub fn query<F>(&self, filter: &EventFilter, callback: F) -> usize
    where
        F: FnMut(&NetworkEvent),
    {
        self.store.query(filter, callback)
    }

    /// Render the scrape payload, refreshing gauges and process stats
    /// first.
    pub fn metrics_text(&self) -> String {
        self.refresh_gauges();
        self.sampler.update_metrics(&self.registry);
        let mut out = String::new();
        self.registry.export_text(&mut out);
        out
    }

    pub fn stats(&self) -> AgentStats {
        let monitor = self.monitor.lock().unwrap();
        let mut sources = HashMap::new();
        for &source in &EventSource::ALL {
            if let Some(stats) = monitor.stats(source) {
                sources.insert(source.as_str(), stats);
            }
        }
        AgentStats {
            processor: self.processor.stats(),
            store: self.store.stats(),
            limits: self.limits.stats(),
            sources,
        }
    }

    pub fn health(&self) -> AgentHealth {
        let monitor = self.monitor.lock().unwrap();
        let pipeline = self.limits.health();
        let route_degraded = monitor.is_degraded(EventSource::Route);
        let generic_degraded = monitor.is_degraded(EventSource::Generic);
        let sock_diag_degraded = monitor.is_degraded(EventSource::SockDiag);
        AgentHealth {
            pipeline,
            route_degraded,
            generic_degraded,
            sock_diag_degraded,
            healthy: pipeline.healthy,
        }
    }

    /// Stop the pipeline. Ingestion sockets stay open until drop;
    /// events dispatched after this are rejected as stopping.
    pub fn stop(&self) {
        self.processor.stop();
    }

    fn refresh_gauges(&self) {
        let registry = &self.registry;
        let processor = self.processor.stats();
        let store = self.store.stats();
        let limits = self.limits.stats();

        registry.gauge_set("netmon_queue_depth", "", processor.queue_depth as f64);
        registry.gauge_set("netmon_store_size", "", store.size as f64);
        registry.gauge_set("netmon_store_peak_occupancy", "", store.peak as f64);
        registry.gauge_set("netmon_store_overflow_total", "", store.overflow as f64);
        registry.gauge_set("netmon_memory_bytes", "", limits.current_bytes as f64);
        registry.gauge_set("netmon_memory_peak_bytes", "", limits.peak_bytes as f64);
        registry.gauge_set(
            "netmon_healthy",
            "",
            if self.limits.health().healthy { 1.0 } else { 0.0 },
        );
    }
}

fn describe_metrics(registry: &Registry) {
    registry.describe(
        "netmon_events_submitted_total",
        "Events offered to the pipeline",
    );
    registry.describe(
        "netmon_events_processed_total",
        "Events delivered to consumers",
    );
    registry.describe(
        "netmon_events_dropped_total",
        "Events dropped, by reason",
    );
    registry.describe(
        "netmon_anomalies_total",
        "Event-rate anomalies detected, by event type",
    );
    registry.describe(
        "netmon_processing_seconds",
        "Per-event processing time through the fan-out",
    );
    registry.describe("netmon_queue_depth", "Events currently queued");
    registry.describe("netmon_healthy", "1 when no health axis is critical");
}
