// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Netlink wire framing: message headers, multipart iteration and TLV
//! attribute streams.
//!
//! Everything here is defensive. Length prefixes are honored but never
//! trusted past the end of the receive buffer, and a truncated trailing
//! frame is reported without invalidating the frames decoded before it.

use crate::error::ParseError;

/// Size of `struct nlmsghdr`.
pub const NLMSG_HDRLEN: usize = 16;
/// Size of `struct nlattr`.
pub const NLA_HDRLEN: usize = 4;
/// Mask stripping the nested / network-byte-order flag bits from an
/// attribute type.
pub const NLA_TYPE_MASK: u16 = 0x3fff;

/// Netlink payloads and attributes are padded to 4-byte boundaries.
pub const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Parsed `struct nlmsghdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMsgHdr {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHdr {
    /// Decode a header from the front of `buf`. Netlink is host byte
    /// order on the wire.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < NLMSG_HDRLEN {
            return Err(ParseError::Truncated {
                needed: NLMSG_HDRLEN,
                available: buf.len(),
            });
        }
        Ok(NlMsgHdr {
            len: read_u32(buf, 0),
            kind: read_u16(buf, 4),
            flags: read_u16(buf, 6),
            seq: read_u32(buf, 8),
            pid: read_u32(buf, 12),
        })
    }

    /// Serialize into the 16-byte wire layout. Used when building dump
    /// requests.
    pub fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_ne_bytes());
        out.extend_from_slice(&self.kind.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.seq.to_ne_bytes());
        out.extend_from_slice(&self.pid.to_ne_bytes());
    }
}

/// One framed message carved out of a receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct NlMsg<'a> {
    pub header: NlMsgHdr,
    /// Payload past the fixed header.
    pub payload: &'a [u8],
    /// The full frame including the header, for verbatim capture.
    pub raw: &'a [u8],
}

/// Iterator over the framed messages of one receive buffer.
///
/// `NLMSG_DONE` ends iteration cleanly, `NLMSG_NOOP` frames are skipped,
/// and an `NLMSG_ERROR` frame surfaces the kernel errno and ends the
/// batch. A kernel ACK (`NLMSG_ERROR` carrying errno 0) also ends the
/// batch, silently.
pub struct NlMsgIter<'a> {
    buf: &'a [u8],
    offset: usize,
    finished: bool,
}

impl<'a> NlMsgIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        NlMsgIter {
            buf,
            offset: 0,
            finished: false,
        }
    }
}

impl<'a> Iterator for NlMsgIter<'a> {
    type Item = Result<NlMsg<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished || self.offset >= self.buf.len() {
                return None;
            }
            let rest = &self.buf[self.offset..];
            let header = match NlMsgHdr::parse(rest) {
                Ok(header) => header,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            };
            let msg_len = header.len as usize;
            if msg_len < NLMSG_HDRLEN {
                self.finished = true;
                return Some(Err(ParseError::BadLength { len: msg_len }));
            }
            if msg_len > rest.len() {
                self.finished = true;
                return Some(Err(ParseError::Truncated {
                    needed: msg_len,
                    available: rest.len(),
                }));
            }
            let raw = &rest[..msg_len];
            let payload = &raw[NLMSG_HDRLEN..];
            self.offset += nlmsg_align(msg_len);

            match header.kind as i32 {
                libc::NLMSG_DONE => {
                    self.finished = true;
                    return None;
                }
                libc::NLMSG_NOOP => continue,
                libc::NLMSG_ERROR => {
                    self.finished = true;
                    if payload.len() < 4 {
                        return Some(Err(ParseError::Truncated {
                            needed: 4,
                            available: payload.len(),
                        }));
                    }
                    // The payload carries a negative errno, 0 for an ACK.
                    let errno = i32::from_ne_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]);
                    if errno == 0 {
                        return None;
                    }
                    return Some(Err(ParseError::Kernel { errno: -errno }));
                }
                _ => return Some(Ok(NlMsg { header, payload, raw })),
            }
        }
    }
}

/// One TLV attribute. `kind` has the flag bits already masked off.
#[derive(Debug, Clone, Copy)]
pub struct NlAttr<'a> {
    pub kind: u16,
    pub data: &'a [u8],
}

impl NlAttr<'_> {
    /// Fixed-size u32 payload. Exactly four bytes, nothing else: a
    /// truncated fixed-size attribute must not be admitted.
    pub fn as_u32(&self) -> Result<u32, ParseError> {
        if self.data.len() != 4 {
            return Err(ParseError::BadLength {
                len: self.data.len(),
            });
        }
        Ok(read_u32(self.data, 0))
    }

    pub fn as_u16(&self) -> Result<u16, ParseError> {
        if self.data.len() != 2 {
            return Err(ParseError::BadLength {
                len: self.data.len(),
            });
        }
        Ok(read_u16(self.data, 0))
    }

    pub fn as_u8(&self) -> Result<u8, ParseError> {
        if self.data.len() != 1 {
            return Err(ParseError::BadLength {
                len: self.data.len(),
            });
        }
        Ok(self.data[0])
    }

    /// Bounded string copy. Takes bytes up to the first NUL, decodes
    /// lossily. The single definition of string truncation for the
    /// whole crate.
    pub fn as_str(&self) -> String {
        bounded_str(self.data)
    }
}

/// Copy a byte slice into an owned string, stopping at the first NUL.
pub fn bounded_str(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Iterator over a TLV attribute stream.
///
/// Attributes are `(type, len, data)` with the stride aligned to four
/// bytes. Unrecognized types are the caller's business; a malformed
/// length terminates iteration with an error.
pub struct NlAttrIter<'a> {
    buf: &'a [u8],
    offset: usize,
    finished: bool,
}

impl<'a> NlAttrIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        NlAttrIter {
            buf,
            offset: 0,
            finished: false,
        }
    }
}

impl<'a> Iterator for NlAttrIter<'a> {
    type Item = Result<NlAttr<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let rest = &self.buf[self.offset..];
        // Anything shorter than an attribute header is trailing padding.
        if rest.len() < NLA_HDRLEN {
            return None;
        }
        let len = read_u16(rest, 0) as usize;
        let kind = read_u16(rest, 2) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN {
            self.finished = true;
            return Some(Err(ParseError::BadLength { len }));
        }
        if len > rest.len() {
            self.finished = true;
            return Some(Err(ParseError::Truncated {
                needed: len,
                available: rest.len(),
            }));
        }
        let data = &rest[NLA_HDRLEN..len];
        self.offset += nlmsg_align(len);
        Some(Ok(NlAttr { kind, data }))
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build one framed message from parts, padding to alignment.
    pub fn frame(kind: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
        let len = NLMSG_HDRLEN + payload.len();
        let mut out = Vec::with_capacity(nlmsg_align(len));
        NlMsgHdr {
            len: len as u32,
            kind,
            flags,
            seq: 1,
            pid: 0,
        }
        .emit(&mut out);
        out.extend_from_slice(payload);
        out.resize(nlmsg_align(len), 0);
        out
    }

    /// Encode one TLV attribute with alignment padding.
    pub fn attr(kind: u16, data: &[u8]) -> Vec<u8> {
        let len = NLA_HDRLEN + data.len();
        let mut out = Vec::with_capacity(nlmsg_align(len));
        out.extend_from_slice(&(len as u16).to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(data);
        out.resize(nlmsg_align(len), 0);
        out
    }
}
