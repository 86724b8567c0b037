// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Routing-level packet parsing: just enough of each header to find the
//! owning connection and the packet's extent within a coalesced
//! datagram. Everything past that is the connection's business.

use qmux_common::{Ecn, Time};

use crate::{
    cid::{ConnectionId, MAX_CID_LEN},
    version::Version,
    Error, Res,
};

/// Smallest datagram that can be an IETF stateless reset
/// (RFC 9000, Section 10.3).
pub const MIN_STATELESS_RESET_SIZE: usize = 21;

/// A parsed view of one packet inside an incoming datagram.
#[derive(Debug)]
pub struct PacketIn<'a> {
    data: &'a [u8],
    dcid: Option<ConnectionId>,
    ecn: Ecn,
    received: Time,
}

impl<'a> PacketIn<'a> {
    pub(crate) const fn new(
        data: &'a [u8],
        dcid: Option<ConnectionId>,
        ecn: Ecn,
        received: Time,
    ) -> Self {
        Self {
            data,
            dcid,
            ecn,
            received,
        }
    }

    /// The packet bytes, header included.
    #[must_use]
    pub const fn data(&self) -> &'a [u8] {
        self.data
    }

    #[must_use]
    pub const fn dcid(&self) -> Option<ConnectionId> {
        self.dcid
    }

    #[must_use]
    pub const fn ecn(&self) -> Ecn {
        self.ecn
    }

    #[must_use]
    pub const fn received(&self) -> Time {
        self.received
    }
}

/// Header shapes the dispatcher cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderKind {
    Long,
    Short,
    VersionNegotiation,
    /// Legacy gQUIC public reset.
    PublicReset,
}

/// What a [`HeaderParser`] recovers from a packet.
#[derive(Debug, PartialEq)]
pub struct ParsedHeader {
    pub kind: HeaderKind,
    pub dcid: Option<ConnectionId>,
    /// Extent of this packet within the datagram; parsing of a
    /// coalesced datagram resumes at this offset.
    pub len: usize,
    pub version: Option<u32>,
}

/// Parses just enough of a packet header to route it. One
/// implementation per header layout; selection is by negotiated
/// version, or by sniffing when no connection is known yet.
pub trait HeaderParser {
    /// Parse the header of the packet starting at `data[0]`.
    /// `scid_len` is the length of locally generated CIDs, which short
    /// headers do not encode.
    ///
    /// # Errors
    /// [`Error::InvalidPacket`] when the bytes do not form a header.
    fn parse(&self, data: &[u8], scid_len: usize) -> Res<ParsedHeader>;
}

/// Decode a QUIC variable-length integer.
fn varint(data: &[u8]) -> Res<(u64, usize)> {
    let first = *data.first().ok_or(Error::InvalidPacket)?;
    let len = 1 << (first >> 6);
    if data.len() < len {
        return Err(Error::InvalidPacket);
    }
    let mut v = u64::from(first & 0x3f);
    for b in &data[1..len] {
        v = v << 8 | u64::from(*b);
    }
    Ok((v, len))
}

fn take_cid(data: &[u8], off: &mut usize, len: usize) -> Res<ConnectionId> {
    if len > MAX_CID_LEN || data.len() < *off + len {
        return Err(Error::InvalidPacket);
    }
    let cid = ConnectionId::from(&data[*off..*off + len]);
    *off += len;
    Ok(cid)
}

/// RFC 9000 headers: long headers bound their packet with a length
/// field, which is what makes coalescing work; short headers run to the
/// end of the datagram.
#[derive(Clone, Copy, Debug, Default)]
pub struct IetfParser {}

impl HeaderParser for IetfParser {
    fn parse(&self, data: &[u8], scid_len: usize) -> Res<ParsedHeader> {
        let first = *data.first().ok_or(Error::InvalidPacket)?;
        if first & 0x80 == 0 {
            // Short header; the fixed bit is the only thing to check.
            if first & 0x40 == 0 || data.len() < 1 + scid_len {
                return Err(Error::InvalidPacket);
            }
            let mut off = 1;
            let dcid = take_cid(data, &mut off, scid_len)?;
            return Ok(ParsedHeader {
                kind: HeaderKind::Short,
                dcid: (scid_len > 0).then_some(dcid),
                len: data.len(),
                version: None,
            });
        }

        if data.len() < 7 {
            return Err(Error::InvalidPacket);
        }
        let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let mut off = 5;
        let dcid_len = usize::from(data[off]);
        off += 1;
        let dcid = take_cid(data, &mut off, dcid_len)?;
        let scid_byte_len = usize::from(*data.get(off).ok_or(Error::InvalidPacket)?);
        off += 1;
        take_cid(data, &mut off, scid_byte_len)?;

        if version == 0 {
            return Ok(ParsedHeader {
                kind: HeaderKind::VersionNegotiation,
                dcid: Some(dcid),
                len: data.len(),
                version: Some(version),
            });
        }

        match (first >> 4) & 0x3 {
            0 => {
                // Initial: skip the token.
                let (token_len, n) = varint(&data[off..])?;
                off += n;
                let token_len = usize::try_from(token_len).map_err(|_| Error::InvalidPacket)?;
                if data.len() < off + token_len {
                    return Err(Error::InvalidPacket);
                }
                off += token_len;
            }
            3 => {
                // Retry carries no length field.
                return Ok(ParsedHeader {
                    kind: HeaderKind::Long,
                    dcid: Some(dcid),
                    len: data.len(),
                    version: Some(version),
                });
            }
            _ => {}
        }

        let (length, n) = varint(&data[off..])?;
        off += n;
        let length = usize::try_from(length).map_err(|_| Error::InvalidPacket)?;
        let total = off.checked_add(length).ok_or(Error::InvalidPacket)?;
        if length == 0 || total > data.len() {
            return Err(Error::InvalidPacket);
        }
        Ok(ParsedHeader {
            kind: HeaderKind::Long,
            dcid: Some(dcid),
            len: total,
            version: Some(version),
        })
    }
}

/// Q046-era headers: IETF-shaped long header with nibble-encoded CID
/// lengths, no coalescing.
#[derive(Clone, Copy, Debug, Default)]
pub struct Q046Parser {}

impl HeaderParser for Q046Parser {
    fn parse(&self, data: &[u8], scid_len: usize) -> Res<ParsedHeader> {
        let first = *data.first().ok_or(Error::InvalidPacket)?;
        if first & 0x80 == 0 {
            if first & 0x40 == 0 || data.len() < 1 + scid_len {
                return Err(Error::InvalidPacket);
            }
            let mut off = 1;
            let dcid = take_cid(data, &mut off, scid_len)?;
            return Ok(ParsedHeader {
                kind: HeaderKind::Short,
                dcid: (scid_len > 0).then_some(dcid),
                len: data.len(),
                version: None,
            });
        }
        if data.len() < 6 {
            return Err(Error::InvalidPacket);
        }
        let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        // CID lengths are nibbles; nonzero values are offset by 3.
        let nibbles = data[5];
        let dcid_len = match nibbles >> 4 {
            0 => 0,
            n => usize::from(n) + 3,
        };
        let scid_nibble_len = match nibbles & 0x0f {
            0 => 0,
            n => usize::from(n) + 3,
        };
        let mut off = 6;
        let dcid = take_cid(data, &mut off, dcid_len)?;
        take_cid(data, &mut off, scid_nibble_len)?;
        Ok(ParsedHeader {
            kind: HeaderKind::Long,
            dcid: (dcid_len > 0).then_some(dcid),
            len: data.len(),
            version: Some(version),
        })
    }
}

/// Q043 public headers: a flags byte, an optional 8-byte CID, and an
/// optional version. Also where public resets are recognized.
#[derive(Clone, Copy, Debug, Default)]
pub struct GquicParser {}

impl HeaderParser for GquicParser {
    fn parse(&self, data: &[u8], _scid_len: usize) -> Res<ParsedHeader> {
        const FLAG_VERSION: u8 = 0x01;
        const FLAG_RESET: u8 = 0x02;
        const FLAG_CID: u8 = 0x08;

        let flags = *data.first().ok_or(Error::InvalidPacket)?;
        let mut off = 1;
        let dcid = if flags & FLAG_CID == 0 {
            None
        } else {
            Some(take_cid(data, &mut off, 8)?)
        };
        if flags & FLAG_RESET != 0 {
            return Ok(ParsedHeader {
                kind: HeaderKind::PublicReset,
                dcid,
                len: data.len(),
                version: None,
            });
        }
        let version = if flags & FLAG_VERSION == 0 {
            None
        } else {
            if data.len() < off + 4 {
                return Err(Error::InvalidPacket);
            }
            let v = u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
            Some(v)
        };
        Ok(ParsedHeader {
            kind: HeaderKind::Short,
            dcid,
            len: data.len(),
            version,
        })
    }
}

/// Used when no connection (and so no negotiated version) is known:
/// looks at the first byte and, for long headers, the version bytes to
/// decide which layout applies.
#[derive(Clone, Copy, Debug, Default)]
pub struct SniffingParser {}

impl HeaderParser for SniffingParser {
    fn parse(&self, data: &[u8], scid_len: usize) -> Res<ParsedHeader> {
        let first = *data.first().ok_or(Error::InvalidPacket)?;
        if first & 0x80 != 0 && data.len() >= 5 && data[1] == b'Q' {
            return Q046Parser {}.parse(data, scid_len);
        }
        IetfParser {}.parse(data, scid_len)
    }
}

/// The parser for a connection's negotiated version.
#[must_use]
pub fn parser_for_version(version: Version) -> &'static dyn HeaderParser {
    match version {
        Version::Q043 => &GquicParser {},
        Version::Q046 => &Q046Parser {},
        Version::V1 => &IetfParser {},
    }
}

#[cfg(test)]
mod tests {
    use super::{
        varint, GquicParser, HeaderKind, HeaderParser as _, IetfParser, Q046Parser, SniffingParser,
    };
    use crate::{cid::ConnectionId, Error};

    fn long_packet(dcid: &[u8], payload_len: usize) -> Vec<u8> {
        let mut p = vec![0xc0];
        p.extend_from_slice(&1u32.to_be_bytes());
        p.push(u8::try_from(dcid.len()).unwrap());
        p.extend_from_slice(dcid);
        p.push(0); // no SCID
        p.push(0); // empty token
        assert!(payload_len < 64);
        p.push(u8::try_from(payload_len).unwrap());
        p.extend(std::iter::repeat(0xee).take(payload_len));
        p
    }

    #[test]
    fn varints() {
        assert_eq!(varint(&[0x25]).unwrap(), (0x25, 1));
        assert_eq!(varint(&[0x7b, 0xbd]).unwrap(), (0x3bbd, 2));
        assert_eq!(
            varint(&[0x9d, 0x7f, 0x3e, 0x7d]).unwrap(),
            (0x1d7f_3e7d, 4)
        );
        assert_eq!(varint(&[0x40]), Err(Error::InvalidPacket));
        assert_eq!(varint(&[]), Err(Error::InvalidPacket));
    }

    #[test]
    fn ietf_long_header() {
        let dcid = [1, 2, 3, 4, 5, 6, 7, 8];
        let p = long_packet(&dcid, 20);
        let hdr = IetfParser {}.parse(&p, 8).unwrap();
        assert_eq!(hdr.kind, HeaderKind::Long);
        assert_eq!(hdr.dcid, Some(ConnectionId::from(&dcid)));
        assert_eq!(hdr.len, p.len());
        assert_eq!(hdr.version, Some(1));
    }

    #[test]
    fn ietf_coalesced_bound() {
        let dcid = [9; 8];
        let mut buf = long_packet(&dcid, 10);
        let first_len = buf.len();
        buf.extend_from_slice(&long_packet(&dcid, 5));
        let hdr = IetfParser {}.parse(&buf, 8).unwrap();
        assert_eq!(hdr.len, first_len);
        let hdr2 = IetfParser {}.parse(&buf[first_len..], 8).unwrap();
        assert_eq!(hdr2.len, buf.len() - first_len);
    }

    #[test]
    fn ietf_truncated_payload() {
        let dcid = [9; 8];
        let mut p = long_packet(&dcid, 10);
        p.truncate(p.len() - 1);
        assert_eq!(IetfParser {}.parse(&p, 8), Err(Error::InvalidPacket));
    }

    #[test]
    fn ietf_short_header() {
        let mut p = vec![0x41];
        p.extend_from_slice(&[7; 8]);
        p.extend_from_slice(&[0; 30]);
        let hdr = IetfParser {}.parse(&p, 8).unwrap();
        assert_eq!(hdr.kind, HeaderKind::Short);
        assert_eq!(hdr.dcid, Some(ConnectionId::from(&[7u8; 8])));
        assert_eq!(hdr.len, p.len());
    }

    #[test]
    fn ietf_short_header_no_fixed_bit() {
        let p = [0x01; 20];
        assert_eq!(IetfParser {}.parse(&p, 8), Err(Error::InvalidPacket));
    }

    #[test]
    fn ietf_version_negotiation() {
        let mut p = vec![0x80];
        p.extend_from_slice(&0u32.to_be_bytes());
        p.push(4);
        p.extend_from_slice(&[1, 2, 3, 4]);
        p.push(0);
        p.extend_from_slice(&1u32.to_be_bytes());
        let hdr = IetfParser {}.parse(&p, 8).unwrap();
        assert_eq!(hdr.kind, HeaderKind::VersionNegotiation);
        assert_eq!(hdr.len, p.len());
    }

    #[test]
    fn gquic_public_reset() {
        let mut p = vec![0x0a];
        p.extend_from_slice(&[3; 8]);
        p.extend_from_slice(&[0; 20]);
        let hdr = GquicParser {}.parse(&p, 0).unwrap();
        assert_eq!(hdr.kind, HeaderKind::PublicReset);
        assert_eq!(hdr.dcid, Some(ConnectionId::from(&[3u8; 8])));
    }

    #[test]
    fn gquic_regular() {
        let mut p = vec![0x09];
        p.extend_from_slice(&[4; 8]);
        p.extend_from_slice(&0x5130_3433u32.to_be_bytes());
        p.extend_from_slice(&[0; 50]);
        let hdr = GquicParser {}.parse(&p, 0).unwrap();
        assert_eq!(hdr.kind, HeaderKind::Short);
        assert_eq!(hdr.version, Some(0x5130_3433));
        assert_eq!(hdr.len, p.len());
    }

    #[test]
    fn q046_long_header() {
        let mut p = vec![0xc3];
        p.extend_from_slice(&0x5130_3436u32.to_be_bytes());
        p.push(0x50); // 8-byte DCID, no SCID
        p.extend_from_slice(&[6; 8]);
        p.extend_from_slice(&[0; 40]);
        let hdr = Q046Parser {}.parse(&p, 8).unwrap();
        assert_eq!(hdr.kind, HeaderKind::Long);
        assert_eq!(hdr.dcid, Some(ConnectionId::from(&[6u8; 8])));
        assert_eq!(hdr.len, p.len());
    }

    #[test]
    fn sniffing_picks_layout() {
        let mut q = vec![0xc3];
        q.extend_from_slice(&0x5130_3436u32.to_be_bytes());
        q.push(0x50);
        q.extend_from_slice(&[6; 8]);
        q.extend_from_slice(&[0; 40]);
        let hdr = SniffingParser {}.parse(&q, 8).unwrap();
        assert_eq!(hdr.dcid, Some(ConnectionId::from(&[6u8; 8])));

        let p = long_packet(&[1; 8], 12);
        let hdr = SniffingParser {}.parse(&p, 8).unwrap();
        assert_eq!(hdr.version, Some(1));
    }

    #[test]
    fn empty_input() {
        assert_eq!(IetfParser {}.parse(&[], 8), Err(Error::InvalidPacket));
        assert_eq!(GquicParser {}.parse(&[], 8), Err(Error::InvalidPacket));
    }
}
