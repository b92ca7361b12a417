// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The normalized event model shared by the whole pipeline.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock timestamp in nanoseconds. Only ever used for event
/// timestamps; durations come from `Instant` everywhere else.
pub fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// A distinct kernel feed of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Route,
    Generic,
    SockDiag,
}

impl EventSource {
    pub const ALL: [EventSource; 3] =
        [EventSource::Route, EventSource::Generic, EventSource::SockDiag];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Route => "route",
            EventSource::Generic => "generic",
            EventSource::SockDiag => "sock_diag",
        }
    }

    /// Stable index, used to shard work per source.
    pub fn index(&self) -> usize {
        match self {
            EventSource::Route => 0,
            EventSource::Generic => 1,
            EventSource::SockDiag => 2,
        }
    }
}

/// Message kind after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LinkNew,
    LinkDel,
    AddrNew,
    AddrDel,
    RouteNew,
    RouteDel,
    Neighbour,
    Rule,
    Generic,
    SockDiag,
    /// Synthesized when the kernel reports a receive-buffer overrun.
    Lost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LinkNew => "link_new",
            EventKind::LinkDel => "link_del",
            EventKind::AddrNew => "addr_new",
            EventKind::AddrDel => "addr_del",
            EventKind::RouteNew => "route_new",
            EventKind::RouteDel => "route_del",
            EventKind::Neighbour => "neighbour",
            EventKind::Rule => "rule",
            EventKind::Generic => "generic",
            EventKind::SockDiag => "sock_diag",
            EventKind::Lost => "lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkEvent {
    pub ifindex: u32,
    pub ifname: String,
    pub link_type: u16,
    pub flags: u32,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddrEvent {
    pub family: u8,
    pub ifindex: u32,
    pub prefix_len: u8,
    pub scope: u8,
    pub address: IpAddr,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteEvent {
    pub family: u8,
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub route_type: u8,
    pub dst_len: u8,
    pub dst: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub oif: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeighbourEvent {
    pub family: u8,
    pub ifindex: u32,
    pub state: u16,
    pub flags: u8,
    pub dst: Option<IpAddr>,
    pub lladdr: Option<String>,
}

impl NeighbourEvent {
    /// Human name for the NUD state bits, for exporters.
    pub fn state_name(&self) -> &'static str {
        match self.state {
            libc::NUD_INCOMPLETE => "incomplete",
            libc::NUD_REACHABLE => "reachable",
            libc::NUD_STALE => "stale",
            libc::NUD_DELAY => "delay",
            libc::NUD_PROBE => "probe",
            libc::NUD_FAILED => "failed",
            libc::NUD_NOARP => "noarp",
            libc::NUD_PERMANENT => "permanent",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleEvent {
    pub family: u8,
    pub table: u8,
    pub action: u8,
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenericEvent {
    pub family_id: u16,
    /// Resolved family name; for vendor pass-throughs a synthesized
    /// `name:vendor(id,subcmd)` string.
    pub family_name: String,
    pub cmd: u8,
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SockDiagEvent {
    pub family: u8,
    pub state: u8,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub uid: u32,
    pub inode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LostEvent {
    /// Messages the kernel discarded since the previous overrun report.
    pub count: u64,
}

/// Family-specific payload, one variant per source family plus the
/// synthesized overrun record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventPayload {
    Link(LinkEvent),
    Addr(AddrEvent),
    Route(RouteEvent),
    Neighbour(NeighbourEvent),
    Rule(RuleEvent),
    Generic(GenericEvent),
    SockDiag(SockDiagEvent),
    Lost(LostEvent),
}

/// A single record emitted by the parser and consumed by everything
/// downstream. The raw buffer is exclusively owned by whichever
/// container currently holds the event; handoff is by move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkEvent {
    /// Monotonic sequence number, assigned at processor admission.
    pub seq: u64,
    pub timestamp_ns: u64,
    pub source: EventSource,
    pub kind: EventKind,
    pub ifindex: Option<u32>,
    pub ifname: Option<String>,
    pub netns: Option<u64>,
    pub payload: EventPayload,
    /// Original message bytes for verbatim export.
    #[serde(skip_serializing)]
    pub raw: Vec<u8>,
}

impl NetworkEvent {
    pub fn new(
        source: EventSource,
        kind: EventKind,
        payload: EventPayload,
        raw: Vec<u8>,
    ) -> Self {
        NetworkEvent {
            seq: 0,
            timestamp_ns: wall_clock_ns(),
            source,
            kind,
            ifindex: None,
            ifname: None,
            netns: None,
            payload,
            raw,
        }
    }

    /// Payload bytes held by this event, for memory accounting.
    pub fn payload_bytes(&self) -> usize {
        self.raw.len()
    }
}
