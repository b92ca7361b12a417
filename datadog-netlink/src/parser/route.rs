// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! rtnetlink message decoding: links, addresses, routes, neighbours and
//! policy rules.

use tracing::debug;

use super::{format_lladdr, ip_from_bytes};
use crate::error::ParseError;
use crate::events::{
    AddrEvent, EventKind, EventPayload, EventSource, LinkEvent, NeighbourEvent, NetworkEvent,
    RouteEvent, RuleEvent,
};
use crate::wire::{NlAttrIter, NlMsg};

// struct ifinfomsg
const IFINFOMSG_LEN: usize = 16;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;

// struct ifaddrmsg
const IFADDRMSG_LEN: usize = 8;
const IFA_ADDRESS: u16 = 1;
const IFA_LABEL: u16 = 3;

// struct rtmsg
const RTMSG_LEN: usize = 12;
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

// struct ndmsg
const NDMSG_LEN: usize = 12;
const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

// struct fib_rule_hdr
const FIB_RULE_HDR_LEN: usize = 12;
const FRA_PRIORITY: u16 = 6;

/// Classify one route-family message. Kinds this monitor does not track
/// decode to `None`.
pub fn parse_message(msg: NlMsg<'_>) -> Result<Option<NetworkEvent>, ParseError> {
    let event = match msg.header.kind {
        libc::RTM_NEWLINK => Some(parse_link(&msg, EventKind::LinkNew)?),
        libc::RTM_DELLINK => Some(parse_link(&msg, EventKind::LinkDel)?),
        libc::RTM_NEWADDR => Some(parse_addr(&msg, EventKind::AddrNew)?),
        libc::RTM_DELADDR => Some(parse_addr(&msg, EventKind::AddrDel)?),
        libc::RTM_NEWROUTE => Some(parse_route(&msg, EventKind::RouteNew)?),
        libc::RTM_DELROUTE => Some(parse_route(&msg, EventKind::RouteDel)?),
        libc::RTM_NEWNEIGH | libc::RTM_DELNEIGH => Some(parse_neighbour(&msg)?),
        libc::RTM_NEWRULE | libc::RTM_DELRULE => Some(parse_rule(&msg)?),
        kind => {
            debug!(kind, "ignoring untracked rtnetlink message");
            None
        }
    };
    Ok(event)
}

fn require_payload(msg: &NlMsg<'_>, needed: usize) -> Result<(), ParseError> {
    if msg.payload.len() < needed {
        return Err(ParseError::Truncated {
            needed,
            available: msg.payload.len(),
        });
    }
    Ok(())
}

fn parse_link(msg: &NlMsg<'_>, kind: EventKind) -> Result<NetworkEvent, ParseError> {
    require_payload(msg, IFINFOMSG_LEN)?;
    let link_type = u16::from_ne_bytes([msg.payload[2], msg.payload[3]]);
    let ifindex = i32::from_ne_bytes(msg.payload[4..8].try_into().unwrap_or_default()) as u32;
    let flags = u32::from_ne_bytes(msg.payload[8..12].try_into().unwrap_or_default());

    let mut ifname = None;
    let mut mtu = None;
    for attr in NlAttrIter::new(&msg.payload[IFINFOMSG_LEN..]) {
        let attr = attr?;
        match attr.kind {
            IFLA_IFNAME => ifname = Some(attr.as_str()),
            IFLA_MTU => mtu = attr.as_u32().ok(),
            _ => {}
        }
    }
    let ifname = ifname.ok_or(ParseError::MissingAttribute {
        name: "IFLA_IFNAME",
    })?;

    let mut event = NetworkEvent::new(
        EventSource::Route,
        kind,
        EventPayload::Link(LinkEvent {
            ifindex,
            ifname: ifname.clone(),
            link_type,
            flags,
            mtu,
        }),
        msg.raw.to_vec(),
    );
    event.ifindex = Some(ifindex);
    event.ifname = Some(ifname);
    Ok(event)
}

fn parse_addr(msg: &NlMsg<'_>, kind: EventKind) -> Result<NetworkEvent, ParseError> {
    require_payload(msg, IFADDRMSG_LEN)?;
    let family = msg.payload[0];
    let prefix_len = msg.payload[1];
    let scope = msg.payload[3];
    let ifindex = u32::from_ne_bytes(msg.payload[4..8].try_into().unwrap_or_default());

    let mut address = None;
    let mut label = None;
    for attr in NlAttrIter::new(&msg.payload[IFADDRMSG_LEN..]) {
        let attr = attr?;
        match attr.kind {
            IFA_ADDRESS => address = Some(ip_from_bytes(family, attr.data)?),
            IFA_LABEL => label = Some(attr.as_str()),
            _ => {}
        }
    }
    let address = address.ok_or(ParseError::MissingAttribute {
        name: "IFA_ADDRESS",
    })?;

    let mut event = NetworkEvent::new(
        EventSource::Route,
        kind,
        EventPayload::Addr(AddrEvent {
            family,
            ifindex,
            prefix_len,
            scope,
            address,
            label: label.clone(),
        }),
        msg.raw.to_vec(),
    );
    event.ifindex = Some(ifindex);
    event.ifname = label;
    Ok(event)
}

fn parse_route(msg: &NlMsg<'_>, kind: EventKind) -> Result<NetworkEvent, ParseError> {
    require_payload(msg, RTMSG_LEN)?;
    let family = msg.payload[0];
    let dst_len = msg.payload[1];
    let table = msg.payload[4];
    let protocol = msg.payload[5];
    let scope = msg.payload[6];
    let route_type = msg.payload[7];

    let mut dst = None;
    let mut gateway = None;
    let mut oif = None;
    for attr in NlAttrIter::new(&msg.payload[RTMSG_LEN..]) {
        let attr = attr?;
        match attr.kind {
            // Address attributes are fixed-size per family; a wrong
            // length is treated as unrecognized rather than admitted.
            RTA_DST => dst = ip_from_bytes(family, attr.data).ok(),
            RTA_GATEWAY => gateway = ip_from_bytes(family, attr.data).ok(),
            RTA_OIF => oif = attr.as_u32().ok(),
            _ => {}
        }
    }

    let mut event = NetworkEvent::new(
        EventSource::Route,
        kind,
        EventPayload::Route(RouteEvent {
            family,
            table,
            protocol,
            scope,
            route_type,
            dst_len,
            dst,
            gateway,
            oif,
        }),
        msg.raw.to_vec(),
    );
    event.ifindex = oif;
    Ok(event)
}

fn parse_neighbour(msg: &NlMsg<'_>) -> Result<NetworkEvent, ParseError> {
    require_payload(msg, NDMSG_LEN)?;
    let family = msg.payload[0];
    let ifindex = i32::from_ne_bytes(msg.payload[4..8].try_into().unwrap_or_default()) as u32;
    let state = u16::from_ne_bytes([msg.payload[8], msg.payload[9]]);
    let flags = msg.payload[10];

    let mut dst = None;
    let mut lladdr = None;
    for attr in NlAttrIter::new(&msg.payload[NDMSG_LEN..]) {
        let attr = attr?;
        match attr.kind {
            NDA_DST => dst = ip_from_bytes(family, attr.data).ok(),
            NDA_LLADDR => lladdr = Some(format_lladdr(attr.data)),
            _ => {}
        }
    }

    let mut event = NetworkEvent::new(
        EventSource::Route,
        EventKind::Neighbour,
        EventPayload::Neighbour(NeighbourEvent {
            family,
            ifindex,
            state,
            flags,
            dst,
            lladdr,
        }),
        msg.raw.to_vec(),
    );
    event.ifindex = Some(ifindex);
    Ok(event)
}

fn parse_rule(msg: &NlMsg<'_>) -> Result<NetworkEvent, ParseError> {
    require_payload(msg, FIB_RULE_HDR_LEN)?;
    let family = msg.payload[0];
    let table = msg.payload[4];
    let action = msg.payload[7];

    let mut priority = None;
    for attr in NlAttrIter::new(&msg.payload[FIB_RULE_HDR_LEN..]) {
        let attr = attr?;
        if attr.kind == FRA_PRIORITY {
            priority = attr.as_u32().ok();
        }
    }

    Ok(NetworkEvent::new(
        EventSource::Route,
        EventKind::Rule,
        EventPayload::Rule(RuleEvent {
            family,
            table,
            action,
            priority,
        }),
        msg.raw.to_vec(),
    ))
}
