// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-family message parsers.
//!
//! Each parser turns one framed message into a normalized event, or
//! rejects it with a [`ParseError`]. Batch entry points walk a whole
//! receive buffer and keep well-formed events even when a later frame
//! is broken.

pub mod generic;
pub mod route;
pub mod sock_diag;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ParseError;
use crate::events::{EventSource, NetworkEvent};
use crate::wire::NlMsgIter;

pub use generic::FamilyCache;

/// Result of draining one receive buffer.
#[derive(Debug, Default)]
pub struct ParseBatch {
    pub events: Vec<NetworkEvent>,
    pub errors: Vec<ParseError>,
}

impl ParseBatch {
    fn run<F>(buf: &[u8], mut parse_one: F) -> Self
    where
        F: FnMut(crate::wire::NlMsg<'_>) -> Result<Option<NetworkEvent>, ParseError>,
    {
        let mut batch = ParseBatch::default();
        for item in NlMsgIter::new(buf) {
            match item.and_then(|msg| parse_one(msg)) {
                Ok(Some(event)) => batch.events.push(event),
                Ok(None) => {}
                Err(err) => batch.errors.push(err),
            }
        }
        batch
    }
}

/// Parse a buffer received on the route socket.
pub fn parse_route_buffer(buf: &[u8]) -> ParseBatch {
    ParseBatch::run(buf, route::parse_message)
}

/// Parse a buffer received on the generic socket. Control-family
/// announcements update `families` as a side effect.
pub fn parse_generic_buffer(buf: &[u8], families: &FamilyCache) -> ParseBatch {
    ParseBatch::run(buf, |msg| generic::parse_message(msg, families))
}

/// Parse a buffer received on the sock-diag socket.
pub fn parse_sock_diag_buffer(buf: &[u8]) -> ParseBatch {
    ParseBatch::run(buf, sock_diag::parse_message)
}

/// Dispatch on the source a buffer arrived from.
pub fn parse_buffer(source: EventSource, buf: &[u8], families: &FamilyCache) -> ParseBatch {
    match source {
        EventSource::Route => parse_route_buffer(buf),
        EventSource::Generic => parse_generic_buffer(buf, families),
        EventSource::SockDiag => parse_sock_diag_buffer(buf),
    }
}

/// Decode an address payload for the given family. Fixed-size: exactly
/// 4 bytes for IPv4, exactly 16 for IPv6.
pub(crate) fn ip_from_bytes(family: u8, data: &[u8]) -> Result<IpAddr, ParseError> {
    match family as i32 {
        libc::AF_INET => {
            let octets: [u8; 4] = data
                .try_into()
                .map_err(|_| ParseError::BadLength { len: data.len() })?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        libc::AF_INET6 => {
            let octets: [u8; 16] = data
                .try_into()
                .map_err(|_| ParseError::BadLength { len: data.len() })?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(ParseError::BadLength { len: data.len() }),
    }
}

/// Format a hardware address as colon-separated hex.
pub(crate) fn format_lladdr(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_from_bytes_exact_lengths() {
        let v4 = ip_from_bytes(libc::AF_INET as u8, &[192, 168, 1, 1]).unwrap();
        assert_eq!(v4.to_string(), "192.168.1.1");

        let mut v6 = [0u8; 16];
        v6[15] = 1;
        let addr = ip_from_bytes(libc::AF_INET6 as u8, &v6).unwrap();
        assert_eq!(addr.to_string(), "::1");

        assert!(ip_from_bytes(libc::AF_INET as u8, &[10, 0, 0]).is_err());
        assert!(ip_from_bytes(libc::AF_INET6 as u8, &v6[..12]).is_err());
    }

    #[test]
    fn test_format_lladdr() {
        assert_eq!(
            format_lladdr(&[0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]),
            "00:1a:2b:3c:4d:5e"
        );
        assert_eq!(format_lladdr(&[]), "");
    }
}
