//! NNCP on-disk formats: envelope header, inner packet header and the
//! chunked-transfer meta header.
//!
//! These types ARE the format. Every field and every reserved byte is part
//! of what sits in spools and on removable media; changing anything here
//! strands packets that are already queued.
//!
//! All types are #[repr(C, packed)] with big-endian integers and use
//! zerocopy derives for allocation-free serialization. There is no unsafe
//! code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::identity::NodeId;

pub const ENVELOPE_MAGIC: [u8; 8] = *b"NNCPEv01";
pub const PACKET_MAGIC: [u8; 8] = *b"NNCPPv01";
pub const META_MAGIC: [u8; 8] = *b"NNCPMv01";

/// Longest path field an inner packet can carry.
pub const MAX_PATH_SIZE: usize = 255;

/// Lowest and highest niceness. Lower is more urgent.
pub const NICE_MIN: u8 = 1;
pub const NICE_MAX: u8 = 255;

// ── Envelope header ───────────────────────────────────────────────────────────

/// Outer header of every spooled packet.
///
/// Everything before `signature` is signed by the sender's Ed25519 key; the
/// whole header (signature included) is the associated data of every
/// encrypted payload block.
///
/// Wire size: 184 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EnvelopeHeader {
    pub magic: [u8; 8],
    pub nice: u8,
    /// Must be zero.
    pub reserved: [u8; 7],
    pub sender: [u8; 32],
    pub recipient: [u8; 32],
    /// Ephemeral X25519 public key for this envelope only.
    pub ephemeral: [u8; 32],
    /// Plaintext payload length, padding excluded.
    pub size: U64<BigEndian>,
    pub signature: [u8; 64],
}

assert_eq_size!(EnvelopeHeader, [u8; 184]);

pub const ENVELOPE_HEADER_SIZE: usize = std::mem::size_of::<EnvelopeHeader>();

/// Number of leading header bytes covered by the signature.
pub const ENVELOPE_SIGNED_SIZE: usize = ENVELOPE_HEADER_SIZE - 64;

impl EnvelopeHeader {
    pub fn signed_bytes(&self) -> &[u8] {
        &self.as_bytes()[..ENVELOPE_SIGNED_SIZE]
    }

    pub fn sender_id(&self) -> NodeId {
        NodeId::from_bytes(self.sender)
    }

    pub fn recipient_id(&self) -> NodeId {
        NodeId::from_bytes(self.recipient)
    }

    /// Parse and check magic and reserved bytes. Authentication is the
    /// envelope reader's job.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: ENVELOPE_HEADER_SIZE,
            got: bytes.len(),
        })?;
        if header.magic != ENVELOPE_MAGIC {
            return Err(WireError::BadMagic(header.magic));
        }
        if header.reserved != [0u8; 7] {
            return Err(WireError::ReservedSet);
        }
        if header.nice < NICE_MIN {
            return Err(WireError::BadNice(header.nice));
        }
        Ok(header)
    }
}

// ── Inner packet ──────────────────────────────────────────────────────────────

/// Payload type carried inside an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Deliver the body as a file under the recipient's incoming directory.
    File = 0,
    /// Ask the recipient to send back one of its files.
    Freq = 1,
    /// Run a registered handler with the zlib-compressed body as stdin.
    Exec = 2,
    /// Forward the body, itself an envelope, to another node.
    Trns = 3,
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::File),
            1 => Ok(PacketKind::Freq),
            2 => Ok(PacketKind::Exec),
            3 => Ok(PacketKind::Trns),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<PacketKind> for u8 {
    fn from(k: PacketKind) -> u8 {
        k as u8
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PacketKind::File => "file",
            PacketKind::Freq => "freq",
            PacketKind::Exec => "exec",
            PacketKind::Trns => "trns",
        })
    }
}

/// First bytes of the decrypted payload.
///
/// Wire size: 266 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    pub magic: [u8; 8],
    pub kind: u8,
    pub nice: u8,
    pub path_len: u8,
    /// Zero-padded past `path_len`.
    pub path: [u8; MAX_PATH_SIZE],
}

assert_eq_size!(PacketHeader, [u8; 266]);

pub const PACKET_HEADER_SIZE: usize = std::mem::size_of::<PacketHeader>();

/// Parsed inner packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub nice: u8,
    pub path: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketKind, nice: u8, path: &[u8]) -> Result<Self, WireError> {
        if path.len() > MAX_PATH_SIZE {
            return Err(WireError::PathTooLong(path.len()));
        }
        Ok(Self {
            kind,
            nice,
            path: path.to_vec(),
        })
    }

    /// Exec packets carry `handle\0arg\0arg...` in the path field.
    pub fn exec(nice: u8, handle: &str, args: &[String]) -> Result<Self, WireError> {
        let mut path = handle.as_bytes().to_vec();
        for arg in args {
            path.push(0);
            path.extend_from_slice(arg.as_bytes());
        }
        Self::new(PacketKind::Exec, nice, &path)
    }

    /// Trns packets carry the next hop's raw node id.
    pub fn trns(nice: u8, target: &NodeId) -> Self {
        Self {
            kind: PacketKind::Trns,
            nice,
            path: target.as_bytes().to_vec(),
        }
    }

    pub fn header(&self) -> PacketHeader {
        let mut path = [0u8; MAX_PATH_SIZE];
        path[..self.path.len()].copy_from_slice(&self.path);
        PacketHeader {
            magic: PACKET_MAGIC,
            kind: self.kind.into(),
            nice: self.nice,
            path_len: self.path.len() as u8,
            path,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.header().as_bytes().to_vec()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = PacketHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: PACKET_HEADER_SIZE,
            got: bytes.len(),
        })?;
        if header.magic != PACKET_MAGIC {
            return Err(WireError::BadMagic(header.magic));
        }
        let kind = PacketKind::try_from(header.kind)?;
        let path = header.path;
        Ok(Self {
            kind,
            nice: header.nice,
            path: path[..header.path_len as usize].to_vec(),
        })
    }

    /// Path field as UTF-8 text.
    pub fn path_str(&self) -> Result<&str, WireError> {
        std::str::from_utf8(&self.path).map_err(|_| WireError::BadPath)
    }

    /// Split an Exec path field into handle and arguments.
    pub fn exec_parts(&self) -> Result<(String, Vec<String>), WireError> {
        let mut parts = self.path.split(|b| *b == 0).map(|p| {
            std::str::from_utf8(p)
                .map(str::to_owned)
                .map_err(|_| WireError::BadPath)
        });
        let handle = parts.next().ok_or(WireError::BadPath)??;
        let args = parts.collect::<Result<Vec<_>, _>>()?;
        Ok((handle, args))
    }

    /// Trns target from the path field.
    pub fn trns_target(&self) -> Result<NodeId, WireError> {
        NodeId::from_slice(&self.path).map_err(|_| WireError::BadPath)
    }
}

// ── Chunked meta header ───────────────────────────────────────────────────────

/// Header of a `.nncp.meta` file; followed by `count` 32-byte chunk digests.
///
/// Wire size: 32 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MetaHeader {
    pub magic: [u8; 8],
    pub file_size: U64<BigEndian>,
    pub chunk_size: U64<BigEndian>,
    pub count: U64<BigEndian>,
}

assert_eq_size!(MetaHeader, [u8; 32]);

pub const META_HEADER_SIZE: usize = std::mem::size_of::<MetaHeader>();

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad magic {:?}", String::from_utf8_lossy(.0))]
    BadMagic([u8; 8]),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("truncated header: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("path of {0} bytes exceeds maximum {MAX_PATH_SIZE}")]
    PathTooLong(usize),

    #[error("malformed path field")]
    BadPath,

    #[error("niceness {0} out of range")]
    BadNice(u8),

    #[error("reserved bytes are non-zero")]
    ReservedSet,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
