//! Node identities and the neighbour registry.
//!
//! A `NodeId` is the BLAKE3 digest of a node's Ed25519 signing public key.
//! Its textual form (spool directory names, logs, configuration) is
//! unpadded base32.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use data_encoding::BASE32_NOPAD;

use crate::crypto::{ExchangeKeypair, SigningKeypair};

pub const NODE_ID_SIZE: usize = 32;

/// Default time a call stays up with no traffic.
pub const DEFAULT_ONLINE_DEADLINE: Duration = Duration::from_secs(10);

// ── Base32 ────────────────────────────────────────────────────────────────────

pub fn to_base32(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data)
}

pub fn from_base32(text: &str) -> Result<Vec<u8>, IdentityError> {
    BASE32_NOPAD
        .decode(text.as_bytes())
        .map_err(|_| IdentityError::BadEncoding(text.to_string()))
}

/// Decode a base32 string that must hold exactly 32 bytes.
pub fn key_from_base32(text: &str) -> Result<[u8; 32], IdentityError> {
    let raw = from_base32(text)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| IdentityError::BadLength {
            expected: 32,
            got: raw.len(),
        })
}

// ── NodeId ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub fn from_sign_pub(sign_pub: &[u8; 32]) -> Self {
        Self(crate::crypto::hash(sign_pub))
    }

    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse the raw digest carried in a packet path field.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let raw: [u8; NODE_ID_SIZE] = bytes.try_into().map_err(|_| IdentityError::BadLength {
            expected: NODE_ID_SIZE,
            got: bytes.len(),
        })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_base32(&self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        key_from_base32(s).map(Self)
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// File request policy for one neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreqPolicy {
    /// Absolute directory requested paths are resolved under.
    pub root: PathBuf,
    /// Split replies into chunks of this many bytes.
    pub chunked: Option<u64>,
    /// Pad reply packets to at least this many bytes.
    pub min_size: u64,
}

/// What a neighbour may ask us to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability<'a> {
    FileDelivery,
    FileRequest,
    Exec(&'a str),
}

/// A configured neighbour. Read-only after construction except for the
/// busy flag used by the call scheduler.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub id: NodeId,
    pub exch_pub: [u8; 32],
    pub sign_pub: [u8; 32],
    pub noise_pub: Option<[u8; 32]>,
    pub incoming: Option<PathBuf>,
    pub freq: Option<FreqPolicy>,
    pub exec: HashMap<String, Vec<String>>,
    /// Static relay path, first hop first.
    pub via: Vec<NodeId>,
    pub online_deadline: Duration,
    pub max_online_time: Option<Duration>,
    busy: Mutex<bool>,
}

impl Node {
    /// A neighbour record with no permissions granted.
    pub fn new(name: impl Into<String>, exch_pub: [u8; 32], sign_pub: [u8; 32]) -> Self {
        Self {
            name: name.into(),
            id: NodeId::from_sign_pub(&sign_pub),
            exch_pub,
            sign_pub,
            noise_pub: None,
            incoming: None,
            freq: None,
            exec: HashMap::new(),
            via: Vec::new(),
            online_deadline: DEFAULT_ONLINE_DEADLINE,
            max_online_time: None,
            busy: Mutex::new(false),
        }
    }

    /// The public record of a local node, as its peers would configure it.
    pub fn from_local(name: impl Into<String>, local: &LocalNode) -> Self {
        let mut node = Self::new(name, local.exch.public, local.sign.public());
        node.noise_pub = local.noise_pub;
        node
    }

    pub fn permits(&self, capability: Capability<'_>) -> bool {
        match capability {
            Capability::FileDelivery => self.incoming.is_some(),
            Capability::FileRequest => self.freq.is_some(),
            Capability::Exec(handle) => self
                .exec
                .get(handle)
                .map(|cmdline| !cmdline.is_empty())
                .unwrap_or(false),
        }
    }

    /// Claim the node for a call. Returns None if another caller holds it.
    pub fn try_claim(&self) -> Option<BusyGuard<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        if *busy {
            return None;
        }
        *busy = true;
        Some(BusyGuard { node: self })
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the node's busy flag when dropped.
pub struct BusyGuard<'a> {
    node: &'a Node,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *self.node.busy.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

// ── Local node ────────────────────────────────────────────────────────────────

/// Our own identity, with private keys.
pub struct LocalNode {
    pub id: NodeId,
    pub exch: ExchangeKeypair,
    pub sign: SigningKeypair,
    pub noise_pub: Option<[u8; 32]>,
    pub noise_prv: Option<zeroize::Zeroizing<[u8; 32]>>,
}

impl LocalNode {
    pub fn generate() -> Self {
        let sign = SigningKeypair::generate();
        let noise = ExchangeKeypair::generate();
        Self {
            id: NodeId::from_sign_pub(&sign.public()),
            exch: ExchangeKeypair::generate(),
            sign,
            noise_pub: Some(noise.public),
            noise_prv: Some(noise.private_bytes()),
        }
    }

    pub fn from_keys(exch: ExchangeKeypair, sign: SigningKeypair) -> Self {
        Self {
            id: NodeId::from_sign_pub(&sign.public()),
            exch,
            sign,
            noise_pub: None,
            noise_prv: None,
        }
    }
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNode").field("id", &self.id).finish_non_exhaustive()
    }
}

// ── Neighbours ────────────────────────────────────────────────────────────────

/// All configured nodes, by id and by alias.
#[derive(Debug, Default)]
pub struct Neighbours {
    nodes: HashMap<NodeId, Arc<Node>>,
    aliases: HashMap<String, NodeId>,
}

impl Neighbours {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> Result<Arc<Node>, IdentityError> {
        if self.aliases.contains_key(&node.name) {
            return Err(IdentityError::DuplicateName(node.name));
        }
        let node = Arc::new(node);
        self.aliases.insert(node.name.clone(), node.id);
        self.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    /// Look a node up by alias first, then by base32 id.
    pub fn resolve(&self, name_or_id: &str) -> Result<Arc<Node>, IdentityError> {
        if let Some(id) = self.aliases.get(name_or_id) {
            if let Some(node) = self.nodes.get(id) {
                return Ok(node.clone());
            }
        }
        name_or_id
            .parse::<NodeId>()
            .ok()
            .and_then(|id| self.nodes.get(&id).cloned())
            .ok_or_else(|| IdentityError::UnknownNode(name_or_id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("invalid base32: {0}")]
    BadEncoding(String),
    #[error("expected {expected} bytes, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("node name conflict: {0}")]
    DuplicateName(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
