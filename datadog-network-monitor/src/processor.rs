// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The concurrent event processor: admission, bounded queues, a worker
//! pool and at-most-once fan-out to registered consumers.
//!
//! The logical queue is sharded into one bounded channel per worker and
//! sources are routed by a stable source-to-worker map, so events of
//! one source family reach consumers in sequence order while sources
//! proceed in parallel.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use datadog_netlink::{EventKind, NetworkEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::anomaly::AnomalyDetector;
use crate::config::ConfigError;
use crate::event_store::EventStore;
use crate::limits::ResourceLimits;
use crate::rate_limiter::RateLimiterMap;
use crate::telemetry::Registry;

const WORKER_POLL: Duration = Duration::from_millis(50);
const SUBMIT_BLOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest queued event to make room.
    DropOldest,
    /// Reject the incoming event.
    DropNew,
    /// Block the submitter until room frees up (or a stop begins).
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub rate: f64,
    pub burst: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Events held across the worker queues.
    pub buffer_size: usize,
    pub worker_threads: usize,
    /// Optional default admission cap, events per second.
    pub default_rate_limit: Option<f64>,
    /// Burst for the default cap; falls back to the rate.
    pub default_rate_burst: Option<f64>,
    pub per_type_rate_limits: HashMap<EventKind, RateLimitSpec>,
    pub backpressure: BackpressurePolicy,
    pub enable_anomaly_detection: bool,
    pub anomaly_window_sec: u64,
    pub anomaly_threshold_sigma: f64,
    /// Process queued events during `stop` instead of discarding them.
    pub drain_on_stop: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            buffer_size: 8192,
            worker_threads: 2,
            default_rate_limit: None,
            default_rate_burst: None,
            per_type_rate_limits: HashMap::new(),
            backpressure: BackpressurePolicy::DropNew,
            enable_anomaly_detection: true,
            anomaly_window_sec: 60,
            anomaly_threshold_sigma: 3.0,
            drain_on_stop: true,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("processor is not running")]
    NotRunning,
    #[error("processor is stopping")]
    Stopping,
    #[error("event dropped by rate limit")]
    RateLimited,
    #[error("event dropped by memory limit")]
    MemoryLimited,
    #[error("event dropped, queue full")]
    QueueFull,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub submitted: u64,
    pub processed: u64,
    pub dropped_rate: u64,
    pub dropped_memory: u64,
    pub dropped_queue: u64,
    pub anomalies: u64,
    pub queue_depth: usize,
}

/// Consumers receive a shared immutable reference valid only for the
/// duration of the call; they must not retain or mutate it.
type Consumer = Box<dyn Fn(&NetworkEvent) + Send + Sync>;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

#[derive(Default)]
struct StatCounters {
    submitted: AtomicU64,
    processed: AtomicU64,
    dropped_rate: AtomicU64,
    dropped_memory: AtomicU64,
    dropped_queue: AtomicU64,
    anomalies: AtomicU64,
}

struct Shared {
    consumers: RwLock<Vec<Consumer>>,
    store: Arc<EventStore>,
    detector: Option<Mutex<AnomalyDetector>>,
    limits: Arc<ResourceLimits>,
    registry: Arc<Registry>,
    stopping: AtomicBool,
    drain_on_stop: bool,
    counters: StatCounters,
}

impl Shared {
    /// One event through the fan-out: store copy, anomaly scoring,
    /// every consumer in registration order.
    fn handle(&self, event: NetworkEvent) {
        let started = Instant::now();
        let size = event.payload_bytes();

        self.store.add(&event);

        if let Some(detector) = &self.detector {
            let anomaly = detector.lock().unwrap().process(&event);
            if let Some(anomaly) = anomaly {
                self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
                self.registry.counter_inc(
                    "netmon_anomalies_total",
                    &format!("event_type=\"{}\"", anomaly.event_type.as_str()),
                    1,
                );
                warn!(
                    event_type = anomaly.event_type.as_str(),
                    score = anomaly.score,
                    baseline_mean = anomaly.baseline_mean,
                    current = anomaly.current_value,
                    "event rate anomaly detected"
                );
            }
        }

        {
            let consumers = self.consumers.read().unwrap();
            for consumer in consumers.iter() {
                // A failing consumer is logged and stays registered;
                // the others still receive the event.
                if catch_unwind(AssertUnwindSafe(|| consumer(&event))).is_err() {
                    error!("consumer callback panicked");
                }
            }
        }

        let elapsed = started.elapsed();
        self.limits.record(size, elapsed.as_nanos() as u64);
        self.limits.track_free(size);
        self.registry
            .histogram_observe("netmon_processing_seconds", "", elapsed.as_secs_f64());
        self.registry.counter_inc(
            "netmon_events_processed_total",
            &format!("source=\"{}\"", event.source.as_str()),
            1,
        );
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bridges ingestion to consumers with buffering, ordering, rate
/// control and optional anomaly scoring.
pub struct EventProcessor {
    config: ProcessorConfig,
    shared: Arc<Shared>,
    limiter: Option<RateLimiterMap>,
    seq: AtomicU64,
    senders: Vec<Sender<NetworkEvent>>,
    receivers: Vec<Receiver<NetworkEvent>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
}

impl EventProcessor {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<EventStore>,
        limits: Arc<ResourceLimits>,
        registry: Arc<Registry>,
    ) -> Result<Self, ConfigError> {
        if config.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(config.buffer_size));
        }
        if config.worker_threads == 0 {
            return Err(ConfigError::InvalidWorkerThreads(config.worker_threads));
        }

        let limiter = build_limiter(&config)?;
        let detector = config.enable_anomaly_detection.then(|| {
            Mutex::new(AnomalyDetector::new(
                config.anomaly_window_sec,
                config.anomaly_threshold_sigma,
            ))
        });

        let shards = config.worker_threads;
        let per_shard = (config.buffer_size / shards).max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut receivers = Vec::with_capacity(shards);
        for _ in 0..shards {
            let (tx, rx) = bounded(per_shard);
            senders.push(tx);
            receivers.push(rx);
        }

        Ok(EventProcessor {
            shared: Arc::new(Shared {
                consumers: RwLock::new(Vec::new()),
                store,
                detector,
                limits,
                registry,
                stopping: AtomicBool::new(false),
                drain_on_stop: config.drain_on_stop,
                counters: StatCounters::default(),
            }),
            limiter,
            seq: AtomicU64::new(0),
            senders,
            receivers,
            workers: Mutex::new(Vec::new()),
            state: AtomicU8::new(STATE_CREATED),
            config,
        })
    }

    /// Register a consumer callback. Consumers registered after
    /// `start` begin receiving subsequent events.
    pub fn register_consumer<F>(&self, consumer: F)
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        self.shared.consumers.write().unwrap().push(Box::new(consumer));
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(&self) {
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let mut workers = self.workers.lock().unwrap();
        for (index, rx) in self.receivers.iter().enumerate() {
            let rx = rx.clone();
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("netmon-worker-{index}"))
                .spawn(move || worker_loop(&rx, &shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => error!(index, %err, "failed to spawn worker thread"),
            }
        }
        debug!(workers = self.config.worker_threads, "processor started");
    }

    /// Admit one event into the pipeline.
    ///
    /// Assigns the sequence number, then checks memory and rate
    /// admission; an admitted event is queued to its source's worker
    /// under the configured backpressure policy.
    pub fn submit(&self, mut event: NetworkEvent) -> Result<(), SubmitError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => {}
            STATE_STOPPING => return Err(SubmitError::Stopping),
            _ => return Err(SubmitError::NotRunning),
        }

        event.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.registry.counter_inc(
            "netmon_events_submitted_total",
            &format!("source=\"{}\"", event.source.as_str()),
            1,
        );

        let size = event.payload_bytes();
        if !self.shared.limits.track_alloc(size) {
            self.shared
                .counters
                .dropped_memory
                .fetch_add(1, Ordering::Relaxed);
            self.drop_counter("memory");
            return Err(SubmitError::MemoryLimited);
        }

        if let Some(limiter) = &self.limiter {
            if !limiter.allow(event.kind) {
                self.shared.limits.track_free(size);
                self.shared.limits.record_drop();
                self.shared
                    .counters
                    .dropped_rate
                    .fetch_add(1, Ordering::Relaxed);
                self.drop_counter("rate");
                return Err(SubmitError::RateLimited);
            }
        }

        let shard = event.source.index() % self.senders.len();
        self.enqueue(shard, event, size)
    }

    fn enqueue(
        &self,
        shard: usize,
        mut event: NetworkEvent,
        size: usize,
    ) -> Result<(), SubmitError> {
        let tx = &self.senders[shard];
        match self.config.backpressure {
            BackpressurePolicy::DropNew => match tx.try_send(event) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.queue_drop(size);
                    Err(SubmitError::QueueFull)
                }
            },
            BackpressurePolicy::DropOldest => {
                loop {
                    match tx.try_send(event) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Disconnected(_)) => {
                            self.queue_drop(size);
                            return Err(SubmitError::QueueFull);
                        }
                        Err(TrySendError::Full(rejected)) => {
                            event = rejected;
                            // Evict the oldest entry of this shard;
                            // workers may win the race, in which case
                            // the retry simply succeeds.
                            if let Ok(oldest) = self.receivers[shard].try_recv() {
                                self.shared.limits.track_free(oldest.payload_bytes());
                                self.shared.limits.record_drop();
                                self.shared
                                    .counters
                                    .dropped_queue
                                    .fetch_add(1, Ordering::Relaxed);
                                self.drop_counter("queue_full");
                            }
                        }
                    }
                }
            }
            BackpressurePolicy::Block => {
                loop {
                    if self.shared.stopping.load(Ordering::SeqCst) {
                        self.queue_drop(size);
                        return Err(SubmitError::Stopping);
                    }
                    match tx.send_timeout(event, SUBMIT_BLOCK_POLL) {
                        Ok(()) => return Ok(()),
                        Err(crossbeam_channel::SendTimeoutError::Timeout(rejected)) => {
                            event = rejected;
                        }
                        Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                            self.queue_drop(size);
                            return Err(SubmitError::QueueFull);
                        }
                    }
                }
            }
        }
    }

    fn queue_drop(&self, size: usize) {
        self.shared.limits.track_free(size);
        self.shared.limits.record_drop();
        self.shared
            .counters
            .dropped_queue
            .fetch_add(1, Ordering::Relaxed);
        self.drop_counter("queue_full");
    }

    fn drop_counter(&self, reason: &str) {
        self.shared.registry.counter_inc(
            "netmon_events_dropped_total",
            &format!("reason=\"{reason}\""),
            1,
        );
    }

    /// Cooperative shutdown: signal workers, drain or discard the
    /// queues per policy, join, flush self-metrics. Idempotent; no
    /// consumer runs after this returns.
    pub fn stop(&self) {
        match self.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            // Never started, or a concurrent stop owns the shutdown.
            Err(_) => return,
        }
        self.shared.stopping.store(true, Ordering::SeqCst);

        if !self.config.drain_on_stop {
            for rx in &self.receivers {
                while let Ok(event) = rx.try_recv() {
                    self.queue_drop(event.payload_bytes());
                }
            }
        }

        let workers = {
            let mut workers = self.workers.lock().unwrap();
            std::mem::take(&mut *workers)
        };
        for handle in workers {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }

        self.flush_metrics();
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        debug!("processor stopped");
    }

    fn flush_metrics(&self) {
        let stats = self.stats();
        let registry = &self.shared.registry;
        registry.gauge_set("netmon_queue_depth", "", stats.queue_depth as f64);
        registry.gauge_set(
            "netmon_store_peak_occupancy",
            "",
            self.shared.store.stats().peak as f64,
        );
    }

    pub fn stats(&self) -> ProcessorStats {
        let counters = &self.shared.counters;
        ProcessorStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            dropped_rate: counters.dropped_rate.load(Ordering::Relaxed),
            dropped_memory: counters.dropped_memory.load(Ordering::Relaxed),
            dropped_queue: counters.dropped_queue.load(Ordering::Relaxed),
            anomalies: counters.anomalies.load(Ordering::Relaxed),
            queue_depth: self.senders.iter().map(Sender::len).sum(),
        }
    }

    /// Per-kind rate limiter stats, when a limiter is configured.
    pub fn rate_limiter_stats(
        &self,
        kind: EventKind,
    ) -> Option<crate::rate_limiter::RateLimiterStats> {
        self.limiter.as_ref().map(|l| l.stats(kind))
    }
}

impl Drop for EventProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_limiter(config: &ProcessorConfig) -> Result<Option<RateLimiterMap>, ConfigError> {
    if config.default_rate_limit.is_none() && config.per_type_rate_limits.is_empty() {
        return Ok(None);
    }
    // An absent default means "admit everything not specifically
    // capped"; modeled as an effectively unlimited default bucket.
    let (rate, burst) = match config.default_rate_limit {
        Some(rate) => (rate, config.default_rate_burst.unwrap_or(rate)),
        None => (1e18, 1e18),
    };
    let limiter = RateLimiterMap::new(rate, burst)?;
    for (kind, spec) in &config.per_type_rate_limits {
        limiter.set(*kind, spec.rate, spec.burst)?;
    }
    Ok(Some(limiter))
}

fn worker_loop(rx: &Receiver<NetworkEvent>, shared: &Shared) {
    loop {
        match rx.recv_timeout(WORKER_POLL) {
            Ok(event) => shared.handle(event),
            Err(RecvTimeoutError::Timeout) => {
                if shared.stopping.load(Ordering::SeqCst) && rx.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // When discarding on stop the submitter side drains; exit as
        // soon as the shard is empty.
        if shared.stopping.load(Ordering::SeqCst) && !shared.drain_on_stop && rx.is_empty() {
            break;
        }
    }
    // A final sweep so a drain-style stop never strands late arrivals.
    if shared.drain_on_stop {
        while let Ok(event) = rx.try_recv() {
            shared.handle(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::limits::LimitsConfig;
    use datadog_netlink::events::{EventPayload, LostEvent};
    use datadog_netlink::EventSource;
    use std::sync::atomic::AtomicUsize;

    fn test_event(source: EventSource, kind: EventKind) -> NetworkEvent {
        NetworkEvent::new(
            source,
            kind,
            EventPayload::Lost(LostEvent { count: 0 }),
            vec![0u8; 64],
        )
    }

    fn processor(config: ProcessorConfig) -> EventProcessor {
        let store = Arc::new(EventStore::new(StoreConfig::default().capacity));
        let limits = Arc::new(ResourceLimits::new(LimitsConfig::default()));
        let registry = Arc::new(Registry::new());
        EventProcessor::new(config, store, limits, registry).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(EventStore::new(8));
        let limits = Arc::new(ResourceLimits::new(LimitsConfig::default()));
        let registry = Arc::new(Registry::new());
        let config = ProcessorConfig {
            buffer_size: 0,
            ..ProcessorConfig::default()
        };
        assert!(matches!(
            EventProcessor::new(config, store, limits, registry),
            Err(ConfigError::InvalidBufferSize(0))
        ));
    }

    #[test]
    fn test_submit_requires_start() {
        let processor = processor(ProcessorConfig::default());
        let err = processor
            .submit(test_event(EventSource::Route, EventKind::LinkNew))
            .unwrap_err();
        assert_eq!(err, SubmitError::NotRunning);
    }

    #[test]
    fn test_events_flow_to_consumers_in_order() {
        let processor = processor(ProcessorConfig {
            worker_threads: 3,
            ..ProcessorConfig::default()
        });
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        processor.register_consumer(move |event| {
            seen_clone.lock().unwrap().push(event.seq);
        });
        processor.start();

        for _ in 0..50 {
            processor
                .submit(test_event(EventSource::Route, EventKind::LinkNew))
                .unwrap();
        }
        processor.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 50);
        // Single source: strictly increasing sequence numbers.
        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1], "out of order: {pair:?}");
        }
        assert_eq!(processor.stats().processed, 50);
    }

    #[test]
    fn test_consumers_called_in_registration_order() {
        let processor = processor(ProcessorConfig {
            worker_threads: 1,
            ..ProcessorConfig::default()
        });
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        processor.register_consumer(move |_| first.lock().unwrap().push("first"));
        processor.register_consumer(move |_| second.lock().unwrap().push("second"));
        processor.start();
        processor
            .submit(test_event(EventSource::Route, EventKind::LinkNew))
            .unwrap();
        processor.stop();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_panicking_consumer_does_not_starve_others() {
        let processor = processor(ProcessorConfig {
            worker_threads: 1,
            ..ProcessorConfig::default()
        });
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = Arc::clone(&delivered);
        processor.register_consumer(|_| panic!("boom"));
        processor.register_consumer(move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });
        processor.start();
        for _ in 0..3 {
            processor
                .submit(test_event(EventSource::Generic, EventKind::Generic))
                .unwrap();
        }
        processor.stop();
        assert_eq!(delivered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_rate_limit_drops_with_reason() {
        let mut per_type = HashMap::new();
        per_type.insert(
            EventKind::RouteNew,
            RateLimitSpec {
                rate: 1.0,
                burst: 2.0,
            },
        );
        let processor = processor(ProcessorConfig {
            per_type_rate_limits: per_type,
            ..ProcessorConfig::default()
        });
        processor.start();

        let mut denied = 0;
        for _ in 0..10 {
            match processor.submit(test_event(EventSource::Route, EventKind::RouteNew)) {
                Ok(()) => {}
                Err(SubmitError::RateLimited) => denied += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(denied, 8);
        processor.stop();

        let stats = processor.stats();
        assert_eq!(stats.dropped_rate, 8);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.submitted, 10);
    }

    #[test]
    fn test_drop_new_backpressure() {
        // One worker, tiny queue, a consumer that blocks until allowed.
        let gate = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
        let processor = processor(ProcessorConfig {
            worker_threads: 1,
            buffer_size: 2,
            backpressure: BackpressurePolicy::DropNew,
            ..ProcessorConfig::default()
        });
        let gate_clone = Arc::clone(&gate);
        processor.register_consumer(move |_| {
            let (lock, cvar) = &*gate_clone;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        });
        processor.start();

        // First event occupies the worker, the next two fill the
        // queue; eventually submits fail.
        let mut queue_full = 0;
        for _ in 0..10 {
            if processor
                .submit(test_event(EventSource::Route, EventKind::LinkNew))
                == Err(SubmitError::QueueFull)
            {
                queue_full += 1;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(queue_full > 0);

        let (lock, cvar) = &*gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        processor.stop();

        let stats = processor.stats();
        assert_eq!(stats.processed + stats.dropped_queue, stats.submitted);
    }

    #[test]
    fn test_stop_drains_and_accounts_for_everything() {
        let processed = Arc::new(AtomicUsize::new(0));
        let processed_clone = Arc::clone(&processed);
        let processor = processor(ProcessorConfig {
            worker_threads: 2,
            buffer_size: 1000,
            backpressure: BackpressurePolicy::Block,
            ..ProcessorConfig::default()
        });
        processor.register_consumer(move |_| {
            processed_clone.fetch_add(1, Ordering::SeqCst);
        });
        processor.start();

        for _ in 0..500 {
            processor
                .submit(test_event(EventSource::Route, EventKind::LinkNew))
                .unwrap();
        }
        processor.stop();

        let stats = processor.stats();
        assert_eq!(stats.processed + stats.dropped_queue, 500);
        assert_eq!(stats.processed, processed.load(Ordering::SeqCst) as u64);
        assert_eq!(stats.queue_depth, 0);

        // No consumer runs after stop returned.
        let after_stop = processed.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(processed.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_stop_is_idempotent_and_blocks_submit() {
        let processor = processor(ProcessorConfig::default());
        processor.start();
        processor.stop();
        processor.stop();
        let err = processor
            .submit(test_event(EventSource::Route, EventKind::LinkNew))
            .unwrap_err();
        assert_eq!(err, SubmitError::NotRunning);
    }

    #[test]
    fn test_memory_cap_denies_submit() {
        let store = Arc::new(EventStore::new(8));
        let limits = Arc::new(ResourceLimits::new(LimitsConfig {
            max_memory_mb: 0,
            ..LimitsConfig::default()
        }));
        let registry = Arc::new(Registry::new());
        let processor = EventProcessor::new(
            ProcessorConfig::default(),
            store,
            limits,
            registry,
        )
        .unwrap();
        processor.start();

        let err = processor
            .submit(test_event(EventSource::Route, EventKind::LinkNew))
            .unwrap_err();
        assert_eq!(err, SubmitError::MemoryLimited);
        assert_eq!(processor.stats().dropped_memory, 1);
        processor.stop();
    }

    #[test]
    fn test_sources_shard_to_distinct_workers() {
        let processor = processor(ProcessorConfig {
            worker_threads: 3,
            ..ProcessorConfig::default()
        });
        let names: Arc<Mutex<HashMap<&'static str, Vec<u64>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let names_clone = Arc::clone(&names);
        processor.register_consumer(move |event| {
            names_clone
                .lock()
                .unwrap()
                .entry(event.source.as_str())
                .or_default()
                .push(event.seq);
        });
        processor.start();

        for i in 0..30 {
            let source = match i % 3 {
                0 => EventSource::Route,
                1 => EventSource::Generic,
                _ => EventSource::SockDiag,
            };
            processor
                .submit(test_event(source, EventKind::Generic))
                .unwrap();
        }
        processor.stop();

        let names = names.lock().unwrap();
        assert_eq!(names.len(), 3);
        for (_, seqs) in names.iter() {
            assert_eq!(seqs.len(), 10);
            for pair in seqs.windows(2) {
                assert!(pair[0] < pair[1]);
            }
        }
    }
}
