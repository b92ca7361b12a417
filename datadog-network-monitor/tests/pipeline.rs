// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline scenarios, driven without kernel sockets:
//! parsed events are submitted straight into the processor the same
//! way the ingestion callback does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use datadog_netlink::events::{EventPayload, LostEvent};
use datadog_netlink::parser::parse_route_buffer;
use datadog_netlink::wire::NlMsgHdr;
use datadog_netlink::{EventKind, EventSource, NetworkEvent};
use datadog_network_monitor::processor::RateLimitSpec;
use datadog_network_monitor::telemetry::Registry;
use datadog_network_monitor::{
    BackpressurePolicy, EventFilter, EventProcessor, EventStore, LimitsConfig, ProcessorConfig,
    ResourceLimits, SubmitError,
};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn synthetic_event(source: EventSource, kind: EventKind, ifname: &str) -> NetworkEvent {
    let mut event = NetworkEvent::new(
        source,
        kind,
        EventPayload::Lost(LostEvent { count: 0 }),
        vec![0u8; 32],
    );
    event.ifname = Some(ifname.to_string());
    event
}

fn build_processor(config: ProcessorConfig, store_capacity: usize) -> EventProcessor {
    let store = Arc::new(EventStore::new(store_capacity));
    let limits = Arc::new(ResourceLimits::new(LimitsConfig::default()));
    let registry = Arc::new(Registry::new());
    EventProcessor::new(config, store, limits, registry).unwrap()
}

// A real rtnetlink buffer flows from bytes to consumer delivery.
#[test]
fn parsed_link_event_reaches_consumer() {
    init_tracing();
    // RTM_NEWLINK with ifindex 7 and name eth0, built the way the
    // kernel frames it.
    let mut payload = vec![0u8; 16];
    payload[4..8].copy_from_slice(&7i32.to_ne_bytes());
    let mut name_attr = Vec::new();
    name_attr.extend_from_slice(&9u16.to_ne_bytes()); // len 4 + 5
    name_attr.extend_from_slice(&3u16.to_ne_bytes()); // IFLA_IFNAME
    name_attr.extend_from_slice(b"eth0\0");
    name_attr.resize(12, 0);
    payload.extend_from_slice(&name_attr);

    let mut frame = Vec::new();
    NlMsgHdr {
        len: (16 + payload.len()) as u32,
        kind: libc::RTM_NEWLINK,
        flags: 0,
        seq: 1,
        pid: 0,
    }
    .emit(&mut frame);
    frame.extend_from_slice(&payload);

    let batch = parse_route_buffer(&frame);
    assert!(batch.errors.is_empty());
    assert_eq!(batch.events.len(), 1);

    let processor = build_processor(ProcessorConfig::default(), 16);
    let seen: Arc<Mutex<Vec<(EventKind, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    processor.register_consumer(move |event| {
        seen_clone
            .lock()
            .unwrap()
            .push((event.kind, event.ifname.clone()));
    });
    processor.start();
    for event in batch.events {
        processor.submit(event).unwrap();
    }
    processor.stop();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![(EventKind::LinkNew, Some("eth0".to_string()))]
    );
}

// Store and query behavior through the pipeline: capacity 3, five
// events, the query surfaces only the retained tail.
#[test]
fn store_keeps_newest_and_query_filters() {
    let store = Arc::new(EventStore::new(3));
    let limits = Arc::new(ResourceLimits::new(LimitsConfig::default()));
    let registry = Arc::new(Registry::new());
    let processor = EventProcessor::new(
        ProcessorConfig {
            worker_threads: 1,
            ..ProcessorConfig::default()
        },
        Arc::clone(&store),
        limits,
        registry,
    )
    .unwrap();
    processor.start();

    for i in 0..5 {
        processor
            .submit(synthetic_event(
                EventSource::Route,
                EventKind::LinkNew,
                &format!("eth{i}"),
            ))
            .unwrap();
    }
    processor.stop();

    let stats = store.stats();
    assert_eq!(stats.size, 3);
    assert_eq!(stats.overflow, 2);

    let latest: Vec<u64> = store.latest(3).iter().map(|e| e.seq).collect();
    assert_eq!(latest, vec![5, 4, 3]);
    assert_eq!(store.get(0).unwrap().seq, 3);

    let mut filter = EventFilter::with_interface_glob("eth[24]").unwrap();
    filter.max_results = Some(10);
    let mut names = Vec::new();
    store.query(&filter, |e| names.push(e.ifname.clone().unwrap()));
    assert_eq!(names, vec!["eth2", "eth4"]);
}

// Rate caps hold through the full submit path.
#[test]
fn per_type_rate_cap_bounds_admission() {
    let mut per_type = std::collections::HashMap::new();
    per_type.insert(
        EventKind::SockDiag,
        RateLimitSpec {
            rate: 10.0,
            burst: 10.0,
        },
    );
    let processor = build_processor(
        ProcessorConfig {
            per_type_rate_limits: per_type,
            ..ProcessorConfig::default()
        },
        64,
    );
    processor.start();

    let mut admitted = 0;
    let mut denied = 0;
    for _ in 0..100 {
        match processor.submit(synthetic_event(
            EventSource::SockDiag,
            EventKind::SockDiag,
            "lo",
        )) {
            Ok(()) => admitted += 1,
            Err(SubmitError::RateLimited) => denied += 1,
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    // The burst admits 10; a slow run may refill a token or two.
    assert!((10..=12).contains(&admitted), "admitted = {admitted}");
    assert_eq!(admitted + denied, 100);
    processor.stop();
}

// Shutdown with a loaded queue: everything is either processed or
// accounted as dropped, and nothing runs afterwards.
#[test]
fn loaded_shutdown_accounts_for_every_event() {
    init_tracing();
    let processed = Arc::new(AtomicUsize::new(0));
    let processed_clone = Arc::clone(&processed);
    let processor = build_processor(
        ProcessorConfig {
            worker_threads: 4,
            buffer_size: 600,
            backpressure: BackpressurePolicy::Block,
            ..ProcessorConfig::default()
        },
        128,
    );
    processor.register_consumer(move |_| {
        processed_clone.fetch_add(1, Ordering::SeqCst);
    });
    processor.start();

    for i in 0..500 {
        let source = match i % 3 {
            0 => EventSource::Route,
            1 => EventSource::Generic,
            _ => EventSource::SockDiag,
        };
        processor
            .submit(synthetic_event(source, EventKind::Generic, "eth0"))
            .unwrap();
    }
    processor.stop();

    let stats = processor.stats();
    assert_eq!(stats.submitted, 500);
    assert_eq!(stats.processed + stats.dropped_queue, 500);
    assert_eq!(processed.load(Ordering::SeqCst) as u64, stats.processed);

    let settled = processed.load(Ordering::SeqCst);
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(processed.load(Ordering::SeqCst), settled);
}

// Memory accounting drains back to zero once the pipeline is idle.
#[test]
fn payload_bytes_return_to_zero_after_processing() {
    let store = Arc::new(EventStore::new(16));
    let limits = Arc::new(ResourceLimits::new(LimitsConfig::default()));
    let registry = Arc::new(Registry::new());
    let processor = EventProcessor::new(
        ProcessorConfig::default(),
        store,
        Arc::clone(&limits),
        registry,
    )
    .unwrap();
    processor.start();
    for _ in 0..20 {
        processor
            .submit(synthetic_event(EventSource::Route, EventKind::AddrNew, "lo"))
            .unwrap();
    }
    processor.stop();

    let stats = limits.stats();
    assert_eq!(stats.current_bytes, 0);
    assert!(stats.peak_bytes > 0);
    assert_eq!(stats.total_processed, 20);
}
