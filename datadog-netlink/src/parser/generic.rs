// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generic netlink decoding.
//!
//! Generic messages carry a resolved family id in the frame header; the
//! id-to-name mapping is learned from nlctrl announcements and kept in a
//! [`FamilyCache`] owned by the ingestion layer. nl80211 vendor
//! pass-throughs are recognized and get a synthesized family name built
//! from the (vendor id, subcommand) tuple.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::ParseError;
use crate::events::{EventKind, EventPayload, EventSource, GenericEvent, NetworkEvent};
use crate::wire::{NlAttrIter, NlMsg};

/// struct genlmsghdr: cmd, version, reserved.
pub const GENL_HDRLEN: usize = 4;
/// The controller family is always id 16.
pub const GENL_ID_CTRL: u16 = 16;

pub const CTRL_CMD_NEWFAMILY: u8 = 1;
pub const CTRL_CMD_DELFAMILY: u8 = 2;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const NL80211_FAMILY_NAME: &str = "nl80211";
const NL80211_CMD_VENDOR: u8 = 103;
const NL80211_ATTR_VENDOR_ID: u16 = 195;
const NL80211_ATTR_VENDOR_SUBCMD: u16 = 196;

/// Thread-safe generic-family id-to-name cache.
///
/// Seeded with the controller family; kept current by
/// [`parse_message`] whenever nlctrl announces or withdraws a family.
#[derive(Debug)]
pub struct FamilyCache {
    inner: Mutex<HashMap<u16, String>>,
}

impl Default for FamilyCache {
    fn default() -> Self {
        let mut seed = HashMap::new();
        seed.insert(GENL_ID_CTRL, "nlctrl".to_string());
        FamilyCache {
            inner: Mutex::new(seed),
        }
    }
}

impl FamilyCache {
    pub fn resolve(&self, id: u16) -> Option<String> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn insert(&self, id: u16, name: String) {
        debug!(id, %name, "learned generic netlink family");
        self.inner.lock().unwrap().insert(id, name);
    }

    pub fn remove(&self, id: u16) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode one generic-family message, updating `families` on nlctrl
/// traffic.
pub fn parse_message(
    msg: NlMsg<'_>,
    families: &FamilyCache,
) -> Result<Option<NetworkEvent>, ParseError> {
    if msg.payload.len() < GENL_HDRLEN {
        return Err(ParseError::Truncated {
            needed: GENL_HDRLEN,
            available: msg.payload.len(),
        });
    }
    let family_id = msg.header.kind;
    let cmd = msg.payload[0];
    let version = msg.payload[1];
    let attrs = &msg.payload[GENL_HDRLEN..];

    if family_id == GENL_ID_CTRL {
        update_family_cache(cmd, attrs, families)?;
    }

    let resolved = families
        .resolve(family_id)
        .ok_or(ParseError::UnknownFamily { id: family_id })?;
    let family_name = if resolved == NL80211_FAMILY_NAME && cmd == NL80211_CMD_VENDOR {
        synthesize_vendor_name(attrs)?
    } else {
        resolved
    };

    Ok(Some(NetworkEvent::new(
        EventSource::Generic,
        EventKind::Generic,
        EventPayload::Generic(GenericEvent {
            family_id,
            family_name,
            cmd,
            version,
        }),
        msg.raw.to_vec(),
    )))
}

fn update_family_cache(
    cmd: u8,
    attrs: &[u8],
    families: &FamilyCache,
) -> Result<(), ParseError> {
    // GETFAMILY dump replies reuse the NEWFAMILY command.
    if cmd != CTRL_CMD_NEWFAMILY && cmd != CTRL_CMD_DELFAMILY {
        return Ok(());
    }
    let mut id = None;
    let mut name = None;
    for attr in NlAttrIter::new(attrs) {
        let attr = attr?;
        match attr.kind {
            CTRL_ATTR_FAMILY_ID => id = Some(attr.as_u16()?),
            CTRL_ATTR_FAMILY_NAME => name = Some(attr.as_str()),
            _ => {}
        }
    }
    match (cmd, id, name) {
        (CTRL_CMD_NEWFAMILY, Some(id), Some(name)) => families.insert(id, name),
        (CTRL_CMD_DELFAMILY, Some(id), _) => families.remove(id),
        _ => {}
    }
    Ok(())
}

fn synthesize_vendor_name(attrs: &[u8]) -> Result<String, ParseError> {
    let mut vendor_id = None;
    let mut subcmd = None;
    for attr in NlAttrIter::new(attrs) {
        let attr = attr?;
        match attr.kind {
            NL80211_ATTR_VENDOR_ID => vendor_id = Some(attr.as_u32()?),
            NL80211_ATTR_VENDOR_SUBCMD => subcmd = Some(attr.as_u32()?),
            _ => {}
        }
    }
    let vendor_id = vendor_id.ok_or(ParseError::MissingAttribute {
        name: "NL80211_ATTR_VENDOR_ID",
    })?;
    let subcmd = subcmd.ok_or(ParseError::MissingAttribute {
        name: "NL80211_ATTR_VENDOR_SUBCMD",
    })?;
    Ok(format!("nl80211:vendor(0x{vendor_id:08x},{subcmd})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_generic_buffer;
    use crate::wire::test_support::{attr, frame};

    fn genl_payload(cmd: u8, attrs: &[u8]) -> Vec<u8> {
        let mut payload = vec![cmd, 1, 0, 0];
        payload.extend_from_slice(attrs);
        payload
    }

    fn new_family_frame(id: u16, name: &str) -> Vec<u8> {
        let mut name_z = name.as_bytes().to_vec();
        name_z.push(0);
        let mut attrs = attr(CTRL_ATTR_FAMILY_ID, &id.to_ne_bytes());
        attrs.extend_from_slice(&attr(CTRL_ATTR_FAMILY_NAME, &name_z));
        frame(GENL_ID_CTRL, 0, &genl_payload(CTRL_CMD_NEWFAMILY, &attrs))
    }

    #[test]
    fn test_ctrl_announcement_updates_cache_and_emits() {
        let families = FamilyCache::default();
        let batch = parse_generic_buffer(&new_family_frame(24, "nl80211"), &families);
        assert!(batch.errors.is_empty());
        assert_eq!(batch.events.len(), 1);
        assert_eq!(families.resolve(24).as_deref(), Some("nl80211"));
        match &batch.events[0].payload {
            EventPayload::Generic(generic) => {
                assert_eq!(generic.family_name, "nlctrl");
                assert_eq!(generic.cmd, CTRL_CMD_NEWFAMILY);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_resolved_family_message() {
        let families = FamilyCache::default();
        families.insert(24, "nl80211".to_string());

        let buf = frame(24, 0, &genl_payload(5, &[]));
        let batch = parse_generic_buffer(&buf, &families);
        assert_eq!(batch.events.len(), 1);
        match &batch.events[0].payload {
            EventPayload::Generic(generic) => {
                assert_eq!(generic.family_name, "nl80211");
                assert_eq!(generic.family_id, 24);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_unknown_family_is_an_error() {
        let families = FamilyCache::default();
        let batch = parse_generic_buffer(&frame(99, 0, &genl_payload(1, &[])), &families);
        assert!(batch.events.is_empty());
        assert_eq!(batch.errors, vec![ParseError::UnknownFamily { id: 99 }]);
    }

    #[test]
    fn test_vendor_passthrough_synthesizes_name() {
        let families = FamilyCache::default();
        families.insert(24, "nl80211".to_string());

        let mut attrs = attr(NL80211_ATTR_VENDOR_ID, &0x001374u32.to_ne_bytes());
        attrs.extend_from_slice(&attr(NL80211_ATTR_VENDOR_SUBCMD, &9u32.to_ne_bytes()));
        let buf = frame(24, 0, &genl_payload(NL80211_CMD_VENDOR, &attrs));

        let batch = parse_generic_buffer(&buf, &families);
        assert_eq!(batch.events.len(), 1);
        match &batch.events[0].payload {
            EventPayload::Generic(generic) => {
                assert_eq!(generic.family_name, "nl80211:vendor(0x00001374,9)");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_vendor_passthrough_requires_both_attrs() {
        let families = FamilyCache::default();
        families.insert(24, "nl80211".to_string());

        let attrs = attr(NL80211_ATTR_VENDOR_ID, &7u32.to_ne_bytes());
        let buf = frame(24, 0, &genl_payload(NL80211_CMD_VENDOR, &attrs));
        let batch = parse_generic_buffer(&buf, &families);
        assert_eq!(
            batch.errors,
            vec![ParseError::MissingAttribute {
                name: "NL80211_ATTR_VENDOR_SUBCMD"
            }]
        );
    }

    #[test]
    fn test_vendor_id_must_be_exact_width() {
        let families = FamilyCache::default();
        families.insert(24, "nl80211".to_string());

        // A 2-byte vendor id payload must not be admitted.
        let mut attrs = attr(NL80211_ATTR_VENDOR_ID, &[0x74, 0x13]);
        attrs.extend_from_slice(&attr(NL80211_ATTR_VENDOR_SUBCMD, &9u32.to_ne_bytes()));
        let buf = frame(24, 0, &genl_payload(NL80211_CMD_VENDOR, &attrs));
        let batch = parse_generic_buffer(&buf, &families);
        assert_eq!(batch.errors, vec![ParseError::BadLength { len: 2 }]);
    }

    #[test]
    fn test_del_family_removes_cache_entry() {
        let families = FamilyCache::default();
        families.insert(24, "nl80211".to_string());

        let attrs = attr(CTRL_ATTR_FAMILY_ID, &24u16.to_ne_bytes());
        let buf = frame(GENL_ID_CTRL, 0, &genl_payload(CTRL_CMD_DELFAMILY, &attrs));
        parse_generic_buffer(&buf, &families);
        assert!(families.resolve(24).is_none());
    }
}
