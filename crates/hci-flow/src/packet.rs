//! # ACL Data Packets
//!
//! Host-to-controller ACL data framing and the identifiers the scheduler keys
//! its state on.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Handle (12)      |PB |BC |   Data Total Length (16, LE)   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The first 16 bits are a little-endian word: handle in the low 12 bits,
//! packet-boundary flag in bits 12–13, broadcast flag in bits 14–15.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

// ─── Constants ───────────────────────────────────────────────────────────────

/// ACL header length in bytes.
pub const ACL_HEADER_LEN: usize = 4;

/// Largest valid connection handle.
pub const MAX_CONNECTION_HANDLE: u16 = 0x0EFF;

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Controller-assigned connection handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(u16);

impl ConnectionHandle {
    /// Returns `None` for values outside the 12-bit handle range.
    pub fn new(raw: u16) -> Option<Self> {
        (raw <= MAX_CONNECTION_HANDLE).then_some(ConnectionHandle(raw))
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// L2CAP channel a packet belongs to. Used only as a grouping tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Kind of logical link behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// BR/EDR asynchronous connection-oriented link.
    Acl,
    /// Low-energy link.
    Le,
    Sco,
    Esco,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Acl => "acl",
            LinkType::Le => "le",
            LinkType::Sco => "sco",
            LinkType::Esco => "esco",
        }
    }
}

/// Scheduling priority of a queued packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    #[default]
    Low,
    High,
}

// ─── Packet Boundary ─────────────────────────────────────────────────────────

/// Packet-boundary flag (PB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketBoundary {
    /// Start of a non-automatically-flushable PDU. The only start flag LE allows.
    FirstNonFlushable = 0b00,
    /// Continuation fragment of the current PDU.
    Continuing = 0b01,
    /// Start of an automatically-flushable PDU.
    FirstFlushable = 0b10,
}

impl PacketBoundary {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            0b00 => Some(PacketBoundary::FirstNonFlushable),
            0b01 => Some(PacketBoundary::Continuing),
            0b10 => Some(PacketBoundary::FirstFlushable),
            _ => None,
        }
    }

    /// Start flag used for new PDUs on `link_type`.
    pub fn first_for(link_type: LinkType) -> Self {
        match link_type {
            LinkType::Acl => PacketBoundary::FirstFlushable,
            _ => PacketBoundary::FirstNonFlushable,
        }
    }

    pub fn is_continuation(self) -> bool {
        self == PacketBoundary::Continuing
    }
}

// ─── AclPacket ───────────────────────────────────────────────────────────────

/// One ACL data packet: a whole PDU or one fragment of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    pub handle: ConnectionHandle,
    pub boundary: PacketBoundary,
    pub payload: Bytes,
}

impl AclPacket {
    pub fn new(handle: ConnectionHandle, boundary: PacketBoundary, payload: Bytes) -> Self {
        AclPacket {
            handle,
            boundary,
            payload,
        }
    }

    /// Whether this packet opens a PDU.
    pub fn is_head(&self) -> bool {
        !self.boundary.is_continuation()
    }

    /// Payload length (what the controller's packet-size limit applies to).
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize header + payload for the transport.
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.payload.len() <= u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(ACL_HEADER_LEN + self.payload.len());
        // BC = 0b00 (point-to-point).
        let word = self.handle.0 | ((self.boundary as u16) << 12);
        buf.put_u16_le(word);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one packet. Returns `None` on a short buffer, a reserved PB
    /// flag, a broadcast flag, or an out-of-range handle.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < ACL_HEADER_LEN {
            return None;
        }
        let word = buf.get_u16_le();
        let len = buf.get_u16_le() as usize;
        if (word >> 14) != 0 {
            return None;
        }
        let handle = ConnectionHandle::new(word & 0x0FFF)?;
        let boundary = PacketBoundary::from_bits((word >> 12) as u8)?;
        if buf.remaining() < len {
            return None;
        }
        let payload = buf.copy_to_bytes(len);
        Some(AclPacket {
            handle,
            boundary,
            payload,
        })
    }
}

/// Split `pdu` into a head fragment and continuations of at most
/// `max_packet_size` bytes each. An empty PDU yields one empty head packet.
pub fn fragment_pdu(
    handle: ConnectionHandle,
    link_type: LinkType,
    pdu: Bytes,
    max_packet_size: usize,
) -> Vec<AclPacket> {
    assert!(max_packet_size > 0, "max_packet_size must be non-zero");
    let first = PacketBoundary::first_for(link_type);
    if pdu.len() <= max_packet_size {
        return vec![AclPacket::new(handle, first, pdu)];
    }

    let mut fragments = Vec::with_capacity(pdu.len().div_ceil(max_packet_size));
    let mut offset = 0;
    while offset < pdu.len() {
        let end = (offset + max_packet_size).min(pdu.len());
        let boundary = if offset == 0 {
            first
        } else {
            PacketBoundary::Continuing
        };
        fragments.push(AclPacket::new(handle, boundary, pdu.slice(offset..end)));
        offset = end;
    }
    fragments
}
