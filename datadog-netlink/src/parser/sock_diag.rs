// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Socket-diagnostic (inet_diag) decoding.
//!
//! These messages only arrive as replies to dump requests issued by the
//! ingestion layer; each reply frame carries one `inet_diag_msg`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ParseError;
use crate::events::{EventKind, EventPayload, EventSource, NetworkEvent, SockDiagEvent};
use crate::wire::NlMsg;

/// Reply frame type shared by all sock-diag families.
pub const SOCK_DIAG_BY_FAMILY: u16 = 20;

/// struct inet_diag_msg: 4 bytes of family/state/timer/retrans, a
/// 48-byte socket id, then expires/rqueue/wqueue/uid/inode.
const INET_DIAG_MSG_LEN: usize = 72;

pub fn parse_message(msg: NlMsg<'_>) -> Result<Option<NetworkEvent>, ParseError> {
    if msg.header.kind != SOCK_DIAG_BY_FAMILY {
        return Ok(None);
    }
    if msg.payload.len() < INET_DIAG_MSG_LEN {
        return Err(ParseError::Truncated {
            needed: INET_DIAG_MSG_LEN,
            available: msg.payload.len(),
        });
    }
    let p = msg.payload;
    let family = p[0];
    let state = p[1];
    // Ports are big-endian on the wire.
    let src_port = u16::from_be_bytes([p[4], p[5]]);
    let dst_port = u16::from_be_bytes([p[6], p[7]]);
    let src_addr = diag_addr(family, &p[8..24])?;
    let dst_addr = diag_addr(family, &p[24..40])?;
    let ifindex = u32::from_ne_bytes(p[40..44].try_into().unwrap_or_default());
    let uid = u32::from_ne_bytes(p[64..68].try_into().unwrap_or_default());
    let inode = u32::from_ne_bytes(p[68..72].try_into().unwrap_or_default());

    let mut event = NetworkEvent::new(
        EventSource::SockDiag,
        EventKind::SockDiag,
        EventPayload::SockDiag(SockDiagEvent {
            family,
            state,
            src_addr: src_addr.to_string(),
            dst_addr: dst_addr.to_string(),
            src_port,
            dst_port,
            uid,
            inode,
        }),
        msg.raw.to_vec(),
    );
    if ifindex != 0 {
        event.ifindex = Some(ifindex);
    }
    Ok(Some(event))
}

/// The socket id always reserves 16 address bytes; IPv4 uses the first
/// four.
fn diag_addr(family: u8, data: &[u8]) -> Result<IpAddr, ParseError> {
    if data.len() != 16 {
        return Err(ParseError::BadLength { len: data.len() });
    }
    match family as i32 {
        libc::AF_INET => {
            let octets: [u8; 4] = data[..4].try_into().unwrap_or_default();
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        libc::AF_INET6 => {
            let octets: [u8; 16] = data.try_into().unwrap_or_default();
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(ParseError::BadLength { len: data.len() }),
    }
}
