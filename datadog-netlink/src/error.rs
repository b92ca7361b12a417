// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the netlink wire and ingestion layers.

use crate::events::EventSource;

/// Errors raised while decoding netlink frames and attributes.
///
/// Unknown attributes are never an error; they are skipped during
/// iteration. A parse error only covers the frame it was raised for,
/// frames decoded earlier in the same receive buffer stay valid.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer ended before the announced message or header length.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    /// A length field is impossible (shorter than its own header).
    #[error("bad length {len}")]
    BadLength { len: usize },
    /// A generic-netlink message referenced a family id we never resolved.
    #[error("unknown generic netlink family {id}")]
    UnknownFamily { id: u16 },
    /// A message kind that demands an attribute arrived without it.
    #[error("missing required attribute {name}")]
    MissingAttribute { name: &'static str },
    /// The kernel reported an error through an NLMSG_ERROR frame.
    #[error("kernel reported errno {errno}")]
    Kernel { errno: i32 },
}

impl ParseError {
    /// Stable label used for per-kind error counters.
    pub fn counter_label(&self) -> &'static str {
        match self {
            ParseError::Truncated { .. } => "truncated",
            ParseError::BadLength { .. } => "bad_length",
            ParseError::UnknownFamily { .. } => "unknown_family",
            ParseError::MissingAttribute { .. } => "attribute_missing",
            ParseError::Kernel { .. } => "kernel_error",
        }
    }
}

/// Errors raised by the ingestion monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("source {0:?} is not enabled")]
    NotEnabled(EventSource),
    #[error("failed to create netlink socket for {source:?}: {err}")]
    SocketCreate {
        source: EventSource,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to bind netlink socket for {source:?}: {err}")]
    Bind {
        source: EventSource,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to join multicast group {group} on {source:?}: {err}")]
    Membership {
        source: EventSource,
        group: u32,
        #[source]
        err: std::io::Error,
    },
    #[error("i/o error on {source:?}: {err}")]
    Io {
        source: EventSource,
        #[source]
        err: std::io::Error,
    },
}
