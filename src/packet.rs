use std::{cmp::Ordering, io, ops::Range};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt};
use crate::crypto::{HeaderKey, PacketKey};
use crate::shared::ConnectionId;
use crate::{MAX_CID_SIZE, VERSION};

// Due to packet number encryption, it is impossible to fully decode a header (which includes a
// variable-length packet number) without crypto context. The crypto context is usually part of
// the `Connection`, or can be derived from the destination CID for Initial packets.
//
// To cope with this, we decode the invariant header first, which gives us the destination CID
// and lets us inspect the version and packet type. That information allows the caller to pick
// keys and fully decode and decrypt the packet.
#[derive(Debug)]
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    pub(crate) fn kind(&self) -> PacketKind {
        self.plain_header.kind()
    }

    /// The underlying partially-decoded packet data
    pub(crate) fn data(&self) -> &[u8] {
        self.buf.get_ref()
    }

    pub(crate) fn finish(
        self,
        header_key: Option<&HeaderKey>,
    ) -> Result<Packet, PacketDecodeError> {
        use PlainHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        if let Initial {
            dst_cid,
            src_cid,
            token_pos,
            ..
        } = plain_header
        {
            let number = Self::decrypt_header(&mut buf, header_key.unwrap())?;
            let header_len = buf.position() as usize;
            let mut bytes = buf.into_inner();

            let header_data = bytes.split_to(header_len).freeze();
            let token = header_data.slice(token_pos.start..token_pos.end);
            return Ok(Packet {
                header: Header::Initial {
                    dst_cid,
                    src_cid,
                    token,
                    number,
                },
                header_data,
                payload: bytes,
            });
        }

        let header = match plain_header {
            Long {
                ty,
                dst_cid,
                src_cid,
                ..
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number: Self::decrypt_header(&mut buf, header_key.unwrap())?,
            },
            Retry {
                dst_cid,
                src_cid,
                orig_dst_cid,
            } => Header::Retry {
                dst_cid,
                src_cid,
                orig_dst_cid,
            },
            Short { dst_cid, .. } => {
                let number = Self::decrypt_header(&mut buf, header_key.unwrap())?;
                let key_phase = buf.get_ref()[0] & KEY_PHASE_BIT != 0;
                Header::Short {
                    key_phase,
                    dst_cid,
                    number,
                }
            }
            VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            } => Header::VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            },
            Initial { .. } => unreachable!(),
        };

        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        Ok(Packet {
            header,
            header_data: bytes.split_to(header_len).freeze(),
            payload: bytes,
        })
    }

    fn decrypt_header(
        buf: &mut io::Cursor<BytesMut>,
        header_key: &HeaderKey,
    ) -> Result<PacketNumber, PacketDecodeError> {
        let packet_length = buf.get_ref().len();
        let pn_offset = buf.position() as usize;
        if packet_length < pn_offset + 4 + header_key.sample_size() {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to extract header protection sample",
            ));
        }

        header_key.decrypt(pn_offset, buf.get_mut());

        let len = PacketNumber::decode_len(buf.get_ref()[0]);
        PacketNumber::decode(len, buf)
    }
}

pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

/// Decoded packet headers
#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
    },
    Short {
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl Header {
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use Header::*;
        let start = w.len();
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                w.write(u8::from(LongHeaderType::Initial) | number.tag());
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // Placeholder for payload length
                number.encode(w);
                PartialEncode {
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.write(u8::from(LongHeaderType::Standard(ty)) | number.tag());
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write::<u16>(0); // Placeholder for payload length
                number.encode(w);
                PartialEncode {
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                ref orig_dst_cid,
            } => {
                w.write(u8::from(LongHeaderType::Retry));
                w.write(VERSION);
                Self::encode_cids(w, dst_cid, src_cid);
                w.write(orig_dst_cid.len() as u8);
                w.put_slice(orig_dst_cid);
                PartialEncode {
                    header_len: w.len() - start,
                    pn: None,
                }
            }
            Short {
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.write(FIXED_BIT | if key_phase { KEY_PHASE_BIT } else { 0 } | number.tag());
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    header_len: w.len() - start,
                    pn: Some((number.len(), false)),
                }
            }
            VersionNegotiate {
                random,
                ref dst_cid,
                ref src_cid,
            } => {
                w.write(LONG_HEADER_FORM | random);
                w.write::<u32>(0);
                Self::encode_cids(w, dst_cid, src_cid);
                PartialEncode {
                    header_len: w.len() - start,
                    pn: None,
                }
            }
        }
    }

    fn encode_cids<W: BufMut>(w: &mut W, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        w.put_u8(dst_cid.len() as u8);
        w.put_slice(dst_cid);
        w.put_u8(src_cid.len() as u8);
        w.put_slice(src_cid);
    }

    pub(crate) fn kind(&self) -> PacketKind {
        use Header::*;
        match *self {
            Initial { .. } => PacketKind::Initial,
            Long {
                ty: LongType::Handshake,
                ..
            } => PacketKind::Handshake,
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => PacketKind::ZeroRtt,
            Retry { .. } => PacketKind::Retry,
            Short { .. } => PacketKind::OneRtt,
            VersionNegotiate { .. } => PacketKind::VersionNegotiate,
        }
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use Header::*;
        Some(match *self {
            Initial { number, .. } => number,
            Long { number, .. } => number,
            Short { number, .. } => number,
            _ => return None,
        })
    }

    pub(crate) fn space(&self) -> SpaceId {
        self.kind().space().unwrap_or(SpaceId::Initial)
    }

    pub(crate) fn src_cid(&self) -> Option<ConnectionId> {
        use Header::*;
        match *self {
            Initial { src_cid, .. } => Some(src_cid),
            Long { src_cid, .. } => Some(src_cid),
            Retry { src_cid, .. } => Some(src_cid),
            VersionNegotiate { src_cid, .. } => Some(src_cid),
            Short { .. } => None,
        }
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use Header::*;
        match *self {
            Initial { ref dst_cid, .. } => dst_cid,
            Long { ref dst_cid, .. } => dst_cid,
            Retry { ref dst_cid, .. } => dst_cid,
            Short { ref dst_cid, .. } => dst_cid,
            VersionNegotiate { ref dst_cid, .. } => dst_cid,
        }
    }
}

pub(crate) struct PartialEncode {
    pub header_len: usize,
    // Packet number length, and whether the payload length field must be filled in
    pn: Option<(usize, bool)>,
}

impl PartialEncode {
    /// Fill in the payload length, seal the payload, and apply header protection
    pub(crate) fn finish(
        self,
        buf: &mut Vec<u8>,
        header_key: &HeaderKey,
        packet_crypto: Option<(u64, &PacketKey)>,
    ) {
        let Self { header_len, pn } = self;
        let (pn_len, write_len) = match pn {
            Some(x) => x,
            None => return,
        };

        let pn_pos = header_len - pn_len;
        if write_len {
            let len = buf.len() - header_len
                + pn_len
                + packet_crypto.map_or(0, |(_, key)| key.tag_len());
            assert!(len < 2usize.pow(14)); // Fits in the reserved two-byte varint
            buf[pn_pos - 2..pn_pos].copy_from_slice(&((len as u16) | (0b01 << 14)).to_be_bytes());
        }

        if let Some((number, key)) = packet_crypto {
            key.encrypt(number, buf, header_len);
        }

        debug_assert!(
            pn_pos + 4 + header_key.sample_size() <= buf.len(),
            "packet must be padded to at least {} bytes for header protection sampling",
            pn_pos + 4 + header_key.sample_size()
        );
        header_key.encrypt(pn_pos, buf);
    }
}

#[derive(Debug)]
pub(crate) enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
        len: u64,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
    },
    Short {
        dst_cid: ConnectionId,
    },
    VersionNegotiate {
        random: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn kind(&self) -> PacketKind {
        use PlainHeader::*;
        match self {
            Initial { .. } => PacketKind::Initial,
            Long {
                ty: LongType::Handshake,
                ..
            } => PacketKind::Handshake,
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => PacketKind::ZeroRtt,
            Retry { .. } => PacketKind::Retry,
            Short { .. } => PacketKind::OneRtt,
            VersionNegotiate { .. } => PacketKind::VersionNegotiate,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        use PlainHeader::*;
        match self {
            Initial { len, .. } | Long { len, .. } => Some(*len),
            _ => None,
        }
    }

    fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            let dst_cid = Self::get_cid(buf, local_cid_len)?;
            Ok(Self::Short { dst_cid })
        } else {
            let version = buf.get::<u32>()?;

            let dcil = buf.get::<u8>()? as usize;
            let dst_cid = Self::get_cid(buf, dcil)?;

            let scil = buf.get::<u8>()? as usize;
            let src_cid = Self::get_cid(buf, scil)?;

            if version == 0 {
                let random = first & !LONG_HEADER_FORM;
                return Ok(Self::VersionNegotiate {
                    random,
                    dst_cid,
                    src_cid,
                });
            }

            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    source_cid: src_cid,
                    destination: dst_cid,
                });
            }

            match LongHeaderType::from_byte(first)? {
                LongHeaderType::Initial => {
                    let token_len = buf.get_var()? as usize;
                    let token_start = buf.position() as usize;
                    if buf.remaining() < token_len {
                        return Err(PacketDecodeError::InvalidHeader("token longer than packet"));
                    }
                    buf.advance(token_len);

                    let len = buf.get_var()?;
                    Ok(Self::Initial {
                        dst_cid,
                        src_cid,
                        token_pos: token_start..token_start + token_len,
                        len,
                    })
                }
                LongHeaderType::Retry => {
                    let odcil = buf.get::<u8>()? as usize;
                    let orig_dst_cid = Self::get_cid(buf, odcil)?;

                    Ok(Self::Retry {
                        dst_cid,
                        src_cid,
                        orig_dst_cid,
                    })
                }
                LongHeaderType::Standard(ty) => Ok(Self::Long {
                    ty,
                    dst_cid,
                    src_cid,
                    len: buf.get_var()?,
                }),
            }
        }
    }

    fn get_cid<R: Buf>(buf: &mut R, len: usize) -> Result<ConnectionId, PacketDecodeError> {
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "illegal connection ID length",
            ));
        }
        if buf.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader(
                "connection ID longer than packet",
            ));
        }
        let cid = ConnectionId::new(&buf.chunk()[..len]);
        buf.advance(len);
        Ok(cid)
    }
}

/// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else if range < 1 << 32 {
            Self::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use PacketNumber::*;
        let pn = match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get()?),
            _ => unreachable!(),
        };
        Ok(pn)
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    fn tag(self) -> u8 {
        use PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    /// Recover the full packet number from its truncation, per the draft's Appendix A
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than `expected - hwin` and less than or
        // equal to `expected + hwin`. Calculate a candidate value and keep it in that window.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Long packet type including non-uniform cases
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongHeaderType {
    Initial,
    Retry,
    Standard(LongType),
}

impl LongHeaderType {
    fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use self::{LongHeaderType::*, LongType::*};
        if b & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        Ok(match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => Standard(ZeroRtt),
            0x2 => Standard(Handshake),
            0x3 => Retry,
            _ => unreachable!(),
        })
    }
}

impl From<LongHeaderType> for u8 {
    fn from(ty: LongHeaderType) -> Self {
        use self::{LongHeaderType::*, LongType::*};
        match ty {
            Initial => LONG_HEADER_FORM | FIXED_BIT,
            Standard(ZeroRtt) => LONG_HEADER_FORM | FIXED_BIT | (0x1 << 4),
            Standard(Handshake) => LONG_HEADER_FORM | FIXED_BIT | (0x2 << 4),
            Retry => LONG_HEADER_FORM | FIXED_BIT | (0x3 << 4),
        }
    }
}

/// Long packet types with uniform header structure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    Handshake,
    ZeroRtt,
}

/// Every kind of packet this endpoint can receive
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketKind {
    VersionNegotiate,
    Initial,
    Retry,
    Handshake,
    ZeroRtt,
    OneRtt,
}

impl PacketKind {
    pub(crate) fn space(self) -> Option<SpaceId> {
        use PacketKind::*;
        match self {
            Initial => Some(SpaceId::Initial),
            Handshake => Some(SpaceId::Handshake),
            ZeroRtt | OneRtt => Some(SpaceId::Data),
            Retry | VersionNegotiate => None,
        }
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub(crate) enum PacketDecodeError {
    #[error("unsupported version")]
    UnsupportedVersion {
        source_cid: ConnectionId,
        destination: ConnectionId,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    Handshake = 1,
    /// Application data space, used for 0-RTT and 1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().cloned()
    }
}

/// Encryption levels, each mapping to a packet type for packetization
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl EncryptionLevel {
    /// The packet number space packets of this level live in
    pub fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::ZeroRtt | Self::OneRtt => SpaceId::Data,
        }
    }

    /// Fixed ordering in which the packetizer attempts each level
    pub(crate) const SEND_ORDER: [Self; 4] =
        [Self::Initial, Self::ZeroRtt, Self::Handshake, Self::OneRtt];
}
