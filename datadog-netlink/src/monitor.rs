// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingestion layer: one netlink socket per enabled source family,
//! readiness-based draining and synchronous dispatch of parsed events.
//!
//! The monitor is driven by the caller's thread. Each receiver exposes
//! its file descriptor for integration with a poll loop; `process`
//! drains whatever is immediately available and hands every well-formed
//! event to the registered callback.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::BytesMut;
use netlink_sys::{protocols, Socket, SocketAddr};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::events::{EventKind, EventPayload, EventSource, LostEvent, NetworkEvent};
use crate::parser::{self, generic, FamilyCache};
use crate::wire::NlMsgHdr;

// rtnetlink multicast groups joined by the route receiver, v4 and v6.
const RTNLGRP_LINK: u32 = 1;
const RTNLGRP_NEIGH: u32 = 3;
const RTNLGRP_IPV4_IFADDR: u32 = 5;
const RTNLGRP_IPV4_ROUTE: u32 = 7;
const RTNLGRP_IPV4_RULE: u32 = 8;
const RTNLGRP_IPV6_IFADDR: u32 = 9;
const RTNLGRP_IPV6_ROUTE: u32 = 11;
const RTNLGRP_IPV6_RULE: u32 = 19;

const ROUTE_GROUPS: [u32; 8] = [
    RTNLGRP_LINK,
    RTNLGRP_NEIGH,
    RTNLGRP_IPV4_IFADDR,
    RTNLGRP_IPV4_ROUTE,
    RTNLGRP_IPV4_RULE,
    RTNLGRP_IPV6_IFADDR,
    RTNLGRP_IPV6_ROUTE,
    RTNLGRP_IPV6_RULE,
];

/// One datagram read per recv; netlink notifications fit well below
/// this.
const RECV_CHUNK: usize = 64 * 1024;

/// All sock-diag socket states.
const INET_DIAG_ALL_STATES: u32 = u32::MAX;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enable_route: bool,
    pub enable_generic: bool,
    pub enable_sock_diag: bool,
    /// Kernel receive-buffer size requested per socket; large to ride
    /// out notification bursts.
    pub recv_buffer_bytes: usize,
    /// Log the offending bytes when a frame fails to parse.
    pub dump_on_error: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            enable_route: true,
            enable_generic: true,
            enable_sock_diag: true,
            recv_buffer_bytes: 2 * 1024 * 1024,
            dump_on_error: false,
        }
    }
}

/// Per-source ingestion counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub datagrams: u64,
    pub events: u64,
    pub bytes: u64,
    pub parse_errors: u64,
    pub parse_errors_by_kind: HashMap<&'static str, u64>,
    pub overruns: u64,
    /// Set after a hard receive error; the source keeps running but the
    /// operator should know.
    pub degraded: bool,
}

/// What one `process` call drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    pub datagrams: usize,
    pub events: usize,
    pub parse_errors: usize,
}

pub type EventCallback = Box<dyn FnMut(EventSource, NetworkEvent) + Send>;

struct SourceState {
    socket: Socket,
    stats: SourceStats,
}

/// Owns the per-source receivers and dispatches parsed events.
pub struct Monitor {
    config: MonitorConfig,
    sources: [Option<SourceState>; 3],
    callback: Option<EventCallback>,
    families: Arc<FamilyCache>,
    next_seq: u32,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Monitor {
            config,
            sources: [None, None, None],
            callback: None,
            families: Arc::new(FamilyCache::default()),
            next_seq: 1,
        }
    }

    /// Enable every source the config asks for. Failures are returned
    /// per source; sources enabled earlier stay enabled.
    pub fn enable_configured(&mut self) -> Result<(), MonitorError> {
        if self.config.enable_route {
            self.enable(EventSource::Route)?;
        }
        if self.config.enable_generic {
            self.enable(EventSource::Generic)?;
        }
        if self.config.enable_sock_diag {
            self.enable(EventSource::SockDiag)?;
        }
        Ok(())
    }

    /// Register the event sink. Called synchronously from `process`,
    /// one invocation per well-formed event.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(EventSource, NetworkEvent) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// The generic-family name cache, shared with parsing.
    pub fn families(&self) -> Arc<FamilyCache> {
        Arc::clone(&self.families)
    }

    pub fn is_enabled(&self, source: EventSource) -> bool {
        self.sources[source.index()].is_some()
    }

    pub fn enable(&mut self, source: EventSource) -> Result<(), MonitorError> {
        if self.is_enabled(source) {
            return Ok(());
        }
        let protocol = match source {
            EventSource::Route => protocols::NETLINK_ROUTE,
            EventSource::Generic => protocols::NETLINK_GENERIC,
            EventSource::SockDiag => protocols::NETLINK_SOCK_DIAG,
        };
        let mut socket =
            Socket::new(protocol).map_err(|err| MonitorError::SocketCreate { source, err })?;
        socket
            .bind(&SocketAddr::new(0, 0))
            .map_err(|err| MonitorError::Bind { source, err })?;
        if source == EventSource::Route {
            for group in ROUTE_GROUPS {
                socket
                    .add_membership(group)
                    .map_err(|err| MonitorError::Membership { source, group, err })?;
            }
        }
        if let Err(err) = socket.set_rx_buf_sz(self.config.recv_buffer_bytes) {
            // The kernel clamps to rmem_max; not fatal.
            warn!(
                source = source.as_str(),
                requested = self.config.recv_buffer_bytes,
                %err,
                "could not enlarge receive buffer"
            );
        }
        socket
            .set_non_blocking(true)
            .map_err(|err| MonitorError::Io { source, err })?;

        if source == EventSource::Generic {
            let request = build_genl_getfamily_request(self.bump_seq());
            socket
                .send(&request, 0)
                .map_err(|err| MonitorError::Io { source, err })?;
        }

        self.sources[source.index()] = Some(SourceState {
            socket,
            stats: SourceStats::default(),
        });
        debug!(source = source.as_str(), "source enabled");
        Ok(())
    }

    /// Tear the source's socket down. Always succeeds.
    pub fn disable(&mut self, source: EventSource) {
        self.sources[source.index()] = None;
        debug!(source = source.as_str(), "source disabled");
    }

    /// Readable descriptor for the caller's poll loop.
    pub fn fd(&self, source: EventSource) -> Option<RawFd> {
        self.sources[source.index()]
            .as_ref()
            .map(|s| s.socket.as_raw_fd())
    }

    /// Ask the kernel to dump sockets of one (family, protocol) pair.
    /// Replies arrive on the sock-diag descriptor and are drained by
    /// `process`.
    pub fn request_sock_diag(&mut self, family: u8, protocol: u8) -> Result<(), MonitorError> {
        let seq = self.bump_seq();
        let state = self.sources[EventSource::SockDiag.index()]
            .as_mut()
            .ok_or(MonitorError::NotEnabled(EventSource::SockDiag))?;
        let request = build_sock_diag_request(family, protocol, seq);
        state
            .socket
            .send(&request, 0)
            .map_err(|err| MonitorError::Io {
                source: EventSource::SockDiag,
                err,
            })?;
        Ok(())
    }

    /// Drain all immediately available messages from one source,
    /// parsing each and invoking the callback per event. Returns when
    /// the receiver would block.
    ///
    /// A kernel-reported overrun (`ENOBUFS`) synthesizes a `Lost` event
    /// and keeps draining. Hard errors mark the source degraded and
    /// bubble up; the source is not auto-disabled.
    pub fn process(&mut self, source: EventSource) -> Result<Drained, MonitorError> {
        let Monitor {
            config,
            sources,
            callback,
            families,
            ..
        } = self;
        let state = sources[source.index()]
            .as_mut()
            .ok_or(MonitorError::NotEnabled(source))?;

        let mut drained = Drained::default();
        loop {
            let mut buf = BytesMut::with_capacity(RECV_CHUNK);
            match state.socket.recv(&mut buf, 0) {
                Ok(0) => break,
                Ok(n) => {
                    drained.datagrams += 1;
                    state.stats.datagrams += 1;
                    state.stats.bytes += n as u64;

                    let batch = parser::parse_buffer(source, &buf, families);
                    for err in &batch.errors {
                        drained.parse_errors += 1;
                        state.stats.parse_errors += 1;
                        *state
                            .stats
                            .parse_errors_by_kind
                            .entry(err.counter_label())
                            .or_insert(0) += 1;
                        if config.dump_on_error {
                            debug!(
                                source = source.as_str(),
                                %err,
                                bytes = %hex_prefix(&buf),
                                "dropping unparseable frame"
                            );
                        }
                    }
                    for event in batch.events {
                        drained.events += 1;
                        state.stats.events += 1;
                        if let Some(cb) = callback.as_mut() {
                            cb(source, event);
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.raw_os_error() == Some(libc::ENOBUFS) => {
                    state.stats.overruns += 1;
                    warn!(
                        source = source.as_str(),
                        overruns = state.stats.overruns,
                        "kernel receive buffer overrun, messages lost"
                    );
                    let lost = NetworkEvent::new(
                        source,
                        EventKind::Lost,
                        EventPayload::Lost(LostEvent {
                            count: state.stats.overruns,
                        }),
                        Vec::new(),
                    );
                    drained.events += 1;
                    state.stats.events += 1;
                    if let Some(cb) = callback.as_mut() {
                        cb(source, lost);
                    }
                }
                Err(err) => {
                    state.stats.degraded = true;
                    return Err(MonitorError::Io { source, err });
                }
            }
        }
        Ok(drained)
    }

    pub fn stats(&self, source: EventSource) -> Option<SourceStats> {
        self.sources[source.index()].as_ref().map(|s| s.stats.clone())
    }

    pub fn is_degraded(&self, source: EventSource) -> bool {
        self.sources[source.index()]
            .as_ref()
            .map_or(false, |s| s.stats.degraded)
    }

    fn bump_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }
}

/// nlctrl GETFAMILY dump, used to seed the family cache on enable.
fn build_genl_getfamily_request(seq: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    NlMsgHdr {
        len: 20,
        kind: generic::GENL_ID_CTRL,
        flags: (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16,
        seq,
        pid: 0,
    }
    .emit(&mut out);
    out.extend_from_slice(&[generic::CTRL_CMD_GETFAMILY, 2, 0, 0]);
    out
}

/// inet_diag_req_v2 dump covering every socket state.
fn build_sock_diag_request(family: u8, protocol: u8, seq: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(72);
    NlMsgHdr {
        len: 72,
        kind: crate::parser::sock_diag::SOCK_DIAG_BY_FAMILY,
        flags: (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16,
        seq,
        pid: 0,
    }
    .emit(&mut out);
    out.push(family);
    out.push(protocol);
    out.push(0); // idiag_ext
    out.push(0); // pad
    out.extend_from_slice(&INET_DIAG_ALL_STATES.to_ne_bytes());
    out.resize(72, 0); // zeroed inet_diag_sockid
    out
}

fn hex_prefix(buf: &[u8]) -> String {
    const MAX: usize = 32;
    let shown = &buf[..buf.len().min(MAX)];
    let mut out = String::with_capacity(shown.len() * 2 + 1);
    for byte in shown {
        out.push_str(&format!("{byte:02x}"));
    }
    if buf.len() > MAX {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_requires_enabled_source() {
        let mut monitor = Monitor::new(MonitorConfig::default());
        assert!(matches!(
            monitor.process(EventSource::Route),
            Err(MonitorError::NotEnabled(EventSource::Route))
        ));
    }

    #[test]
    fn test_disable_always_succeeds() {
        let mut monitor = Monitor::new(MonitorConfig::default());
        monitor.disable(EventSource::Generic);
        assert!(!monitor.is_enabled(EventSource::Generic));
        assert!(monitor.fd(EventSource::Generic).is_none());
    }

    #[test]
    fn test_getfamily_request_layout() {
        let request = build_genl_getfamily_request(42);
        assert_eq!(request.len(), 20);
        let hdr = NlMsgHdr::parse(&request).unwrap();
        assert_eq!(hdr.len, 20);
        assert_eq!(hdr.kind, generic::GENL_ID_CTRL);
        assert_eq!(hdr.seq, 42);
        assert_eq!(request[16], generic::CTRL_CMD_GETFAMILY);
    }

    #[test]
    fn test_sock_diag_request_layout() {
        let request = build_sock_diag_request(libc::AF_INET as u8, libc::IPPROTO_TCP as u8, 7);
        assert_eq!(request.len(), 72);
        let hdr = NlMsgHdr::parse(&request).unwrap();
        assert_eq!(hdr.len, 72);
        assert_eq!(hdr.kind, crate::parser::sock_diag::SOCK_DIAG_BY_FAMILY);
        assert_eq!(request[16], libc::AF_INET as u8);
        assert_eq!(request[17], libc::IPPROTO_TCP as u8);
        // all states requested
        assert_eq!(
            u32::from_ne_bytes(request[20..24].try_into().unwrap()),
            u32::MAX
        );
    }

    #[test]
    fn test_hex_prefix_caps_output() {
        assert_eq!(hex_prefix(&[0xab, 0xcd]), "abcd");
        let long = vec![0u8; 64];
        let shown = hex_prefix(&long);
        assert!(shown.ends_with('…'));
    }
}
