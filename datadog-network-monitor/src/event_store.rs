// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded circular cache of recent events with filtered query.
//!
//! Many-reader/single-writer: `add` and `clear` take the write lock,
//! everything else reads. Events are copied in on insert so readers
//! never coordinate with the pipeline over payload lifetime. Query
//! callbacks run under the read lock; slow consumers delay writers, so
//! they should copy out and return.

use std::collections::VecDeque;
use std::sync::RwLock;

use datadog_netlink::{EventKind, EventSource, NetworkEvent};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub size: usize,
    pub capacity: usize,
    pub total_added: u64,
    /// Evictions forced by a full ring.
    pub overflow: u64,
    pub peak: usize,
}

/// Query filter; every field is optional and an unset field matches
/// anything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filename-style wildcard matched against the interface name.
    pub interface_glob: Option<glob::Pattern>,
    pub source: Option<EventSource>,
    pub kind: Option<EventKind>,
    pub start_ns: Option<u64>,
    pub end_ns: Option<u64>,
    pub max_results: Option<usize>,
}

impl EventFilter {
    pub fn with_interface_glob(pattern: &str) -> Result<Self, glob::PatternError> {
        Ok(EventFilter {
            interface_glob: Some(glob::Pattern::new(pattern)?),
            ..EventFilter::default()
        })
    }

    fn matches(&self, event: &NetworkEvent) -> bool {
        if let Some(pattern) = &self.interface_glob {
            match &event.ifname {
                Some(ifname) => {
                    if !pattern.matches(ifname) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(source) = self.source {
            if event.source != source {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(start) = self.start_ns {
            if event.timestamp_ns < start {
                return false;
            }
        }
        if let Some(end) = self.end_ns {
            if event.timestamp_ns > end {
                return false;
            }
        }
        true
    }
}

struct StoreInner {
    ring: VecDeque<NetworkEvent>,
    capacity: usize,
    total_added: u64,
    overflow: u64,
    peak: usize,
}

/// Thread-safe bounded ring of recent events.
pub struct EventStore {
    inner: RwLock<StoreInner>,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        EventStore {
            inner: RwLock::new(StoreInner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                total_added: 0,
                overflow: 0,
                peak: 0,
            }),
        }
    }

    /// Copy the event into the ring, evicting the oldest entry when
    /// full.
    pub fn add(&self, event: &NetworkEvent) {
        let mut inner = self.inner.write().unwrap();
        if inner.capacity == 0 {
            return;
        }
        if inner.ring.len() == inner.capacity {
            // Oldest entry and its payload are released here.
            inner.ring.pop_front();
            inner.overflow += 1;
        }
        inner.ring.push_back(event.clone());
        inner.total_added += 1;
        inner.peak = inner.peak.max(inner.ring.len());
    }

    /// Index 0 is the oldest retained event.
    pub fn get(&self, index: usize) -> Option<NetworkEvent> {
        let inner = self.inner.read().unwrap();
        inner.ring.get(index).cloned()
    }

    /// Up to `n` most recent events, newest first.
    pub fn latest(&self, n: usize) -> Vec<NetworkEvent> {
        let inner = self.inner.read().unwrap();
        inner.ring.iter().rev().take(n).cloned().collect()
    }

    /// Yield matching events oldest-first, stopping after
    /// `max_results` matches.
    pub fn query<F>(&self, filter: &EventFilter, mut callback: F) -> usize
    where
        F: FnMut(&NetworkEvent),
    {
        let inner = self.inner.read().unwrap();
        let cap = filter.max_results.unwrap_or(usize::MAX);
        let mut matched = 0;
        for event in &inner.ring {
            if matched == cap {
                break;
            }
            if filter.matches(event) {
                matched += 1;
                callback(event);
            }
        }
        matched
    }

    pub fn size(&self) -> usize {
        self.inner.read().unwrap().ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().unwrap().capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.ring.clear();
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read().unwrap();
        StoreStats {
            size: inner.ring.len(),
            capacity: inner.capacity,
            total_added: inner.total_added,
            overflow: inner.overflow,
            peak: inner.peak,
        }
    }
}
