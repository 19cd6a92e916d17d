//! beamdrop wire format — frames exchanged over the logical channel and the
//! advertisement datagram used for discovery.
//!
//! These bytes ARE the protocol. Tags, the hello sequences and the ack byte
//! are shared with existing receivers and must never change.
//!
//! Frames carry no length field. A frame is exactly the bytes of one write
//! call on the channel; the channel is responsible for delivering each write
//! intact (one SDU per write).

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Radio service identifier advertised by receivers and scanned for by senders.
pub const SERVICE_UUID: &str = "35990ca1-d35d-4380-8f4f-ff456c6c6100";

/// Logical channel identifier (L2CAP PSM) of the data channel.
pub const CHANNEL_PSM: u16 = 0x83;

/// ASCII protocol tag carried by both hello frames.
pub const PROTOCOL_TAG: [u8; 9] = *b"SwiftDrop";

// ── Frame tags ────────────────────────────────────────────────────────────────

pub const TAG_CLIENT_HELLO: u8 = 0xF0;
pub const TAG_SERVER_HELLO: u8 = 0xFF;
pub const TAG_METADATA: u8 = 0xFA;
pub const TAG_CHUNK: u8 = 0xFC;
pub const TAG_TRANSFER_COMPLETE: u8 = 0xFF;

/// Positive acknowledgment. Always sent alone, as a one-byte response.
pub const ACK: u8 = 0xAC;

/// Negative acknowledgment sent by our receiver when it refuses a frame.
/// Senders treat anything other than a lone `ACK` as a rejection.
pub const NAK: u8 = 0x15;

/// Bytes every tagged frame spends on its type tag.
pub const FRAME_OVERHEAD: usize = 1;

pub const CLIENT_HELLO: [u8; 10] = hello(TAG_CLIENT_HELLO);
pub const SERVER_HELLO: [u8; 10] = hello(TAG_SERVER_HELLO);

const fn hello(tag: u8) -> [u8; 10] {
    let mut out = [tag; 10];
    let mut i = 0;
    while i < PROTOCOL_TAG.len() {
        out[i + 1] = PROTOCOL_TAG[i];
        i += 1;
    }
    out
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One tagged protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ClientHello,
    ServerHello,
    /// Canonical JSON encoding of the transfer metadata.
    Metadata(Bytes),
    /// A contiguous slice of the compressed payload.
    Chunk(Bytes),
    TransferComplete,
    Ack,
    Nak,
}

impl Frame {
    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::ClientHello | Frame::ServerHello => CLIENT_HELLO.len(),
            Frame::Metadata(body) | Frame::Chunk(body) => FRAME_OVERHEAD + body.len(),
            Frame::TransferComplete | Frame::Ack | Frame::Nak => 1,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Frame::ClientHello => Bytes::from_static(&CLIENT_HELLO),
            Frame::ServerHello => Bytes::from_static(&SERVER_HELLO),
            Frame::Metadata(body) => tagged(TAG_METADATA, body),
            Frame::Chunk(body) => tagged(TAG_CHUNK, body),
            Frame::TransferComplete => Bytes::from_static(&[TAG_TRANSFER_COMPLETE]),
            Frame::Ack => Bytes::from_static(&[ACK]),
            Frame::Nak => Bytes::from_static(&[NAK]),
        }
    }

    /// Decode a frame travelling from the sender to the receiver.
    ///
    /// `0xFF` is both the server-hello and the transfer-complete tag; on this
    /// direction only the one-byte completion marker is valid.
    pub fn decode_request(buf: &[u8]) -> Result<Frame, WireError> {
        let (&tag, body) = buf.split_first().ok_or(WireError::Empty)?;
        match tag {
            TAG_CLIENT_HELLO => {
                if buf == CLIENT_HELLO {
                    Ok(Frame::ClientHello)
                } else {
                    Err(WireError::BadHello(buf.len()))
                }
            }
            TAG_METADATA => Ok(Frame::Metadata(Bytes::copy_from_slice(body))),
            TAG_CHUNK => Ok(Frame::Chunk(Bytes::copy_from_slice(body))),
            TAG_TRANSFER_COMPLETE if body.is_empty() => Ok(Frame::TransferComplete),
            TAG_TRANSFER_COMPLETE => Err(WireError::UnexpectedLength {
                tag,
                len: buf.len(),
            }),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

fn tagged(tag: u8, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_OVERHEAD + body.len());
    out.put_u8(tag);
    out.put_slice(body);
    out.freeze()
}

/// True only for the exact one-byte positive acknowledgment.
pub fn is_ack(response: &[u8]) -> bool {
    response == [ACK]
}

/// True only for the exact ten-byte server hello.
pub fn is_server_hello(response: &[u8]) -> bool {
    response == SERVER_HELLO
}

// ── Peer identity ─────────────────────────────────────────────────────────────

/// Opaque, stable identifier of a discoverable device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 16]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// First four bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; 16];
        hex::decode_to_slice(s, &mut id).map_err(|_| WireError::BadIdentifier(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Parse a dashed UUID string into its 16 raw bytes.
pub fn parse_uuid(s: &str) -> Result<[u8; 16], WireError> {
    let compact: String = s.chars().filter(|c| *c != '-').collect();
    let mut out = [0u8; 16];
    hex::decode_to_slice(&compact, &mut out).map_err(|_| WireError::BadIdentifier(s.to_string()))?;
    Ok(out)
}

// ── Advertisement ─────────────────────────────────────────────────────────────

/// Maximum bytes of device name carried in an advertisement.
pub const ADVERTISED_NAME_LEN: usize = 32;

/// Current advertisement format version.
pub const ADVERTISEMENT_VERSION: u8 = 0x01;

/// Discovery datagram sent periodically by a receiver.
///
/// Wire size: 72 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Advertisement {
    /// Raw bytes of the service UUID. Datagrams for other services are ignored.
    pub service: [u8; 16],
    /// Advertising peer's identifier.
    pub peer_id: [u8; 16],
    /// TCP port of the logical channel, big-endian.
    pub channel_port: [u8; 2],
    /// Number of valid bytes in `name`.
    pub name_len: u8,
    pub version: u8,
    /// UTF-8 device name, zero padded.
    pub name: [u8; ADVERTISED_NAME_LEN],
    /// Reserved, must be zero.
    pub reserved: [u8; 4],
}

// If this fails, the advertisement format has silently changed.
assert_eq_size!(Advertisement, [u8; 72]);

impl Advertisement {
    /// Build an advertisement. Names longer than 32 bytes are cut at the last
    /// character boundary that fits.
    pub fn new(service: [u8; 16], peer_id: PeerId, channel_port: u16, name: &str) -> Self {
        let mut end = name.len().min(ADVERTISED_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = [0u8; ADVERTISED_NAME_LEN];
        buf[..end].copy_from_slice(&name.as_bytes()[..end]);

        Self {
            service,
            peer_id: peer_id.0,
            channel_port: channel_port.to_be_bytes(),
            name_len: end as u8,
            version: ADVERTISEMENT_VERSION,
            name: buf,
            reserved: [0u8; 4],
        }
    }

    /// Parse and validate a received datagram.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let ad = Self::read_from_prefix(buf).ok_or(WireError::Truncated(buf.len()))?;
        if ad.version != ADVERTISEMENT_VERSION {
            return Err(WireError::UnknownVersion(ad.version));
        }
        if ad.reserved != [0u8; 4] {
            return Err(WireError::ReservedBytesSet);
        }
        if ad.name_len as usize > ADVERTISED_NAME_LEN {
            return Err(WireError::NameTooLong(ad.name_len));
        }
        Ok(ad)
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.peer_id)
    }

    pub fn port(&self) -> u16 {
        u16::from_be_bytes(self.channel_port)
    }

    /// Advertised display name; `None` when empty or not valid UTF-8.
    pub fn name(&self) -> Option<String> {
        let len = (self.name_len as usize).min(ADVERTISED_NAME_LEN);
        match std::str::from_utf8(&self.name[..len]) {
            Ok("") | Err(_) => None,
            Ok(name) => Some(name.to_string()),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown frame tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("malformed hello frame ({0} bytes)")]
    BadHello(usize),

    #[error("frame with tag 0x{tag:02x} has unexpected length {len}")]
    UnexpectedLength { tag: u8, len: usize },

    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown advertisement version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved advertisement bytes are non-zero")]
    ReservedBytesSet,

    #[error("advertised name length {0} exceeds maximum")]
    NameTooLong(u8),

    #[error("invalid identifier: {0}")]
    BadIdentifier(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
