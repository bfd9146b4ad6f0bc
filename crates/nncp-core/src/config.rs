//! Configuration system for NNCP nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $NNCP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/nncp/config.toml
//!   3. ~/.config/nncp/config.toml
//!
//! The file holds our own keys under `[self]` and one `[neigh.<name>]` table
//! per known node, including a `self` entry describing ourselves. `resolve`
//! validates everything and turns it into the `LocalNode` / `Neighbours`
//! records the rest of the system works with. Sizes in the file are KiB.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{ExchangeKeypair, SigningKeypair};
use crate::identity::{
    key_from_base32, to_base32, FreqPolicy, IdentityError, LocalNode, Neighbours, Node, NodeId,
};

/// Name of the neighbour entry describing ourselves.
pub const SELF_NAME: &str = "self";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NncpConfig {
    /// Spool root. Must be absolute.
    pub spool: PathBuf,
    /// Structured log file. Must be absolute.
    pub log: PathBuf,
    #[serde(rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_keys: Option<SelfConfig>,
    pub neigh: BTreeMap<String, NeighConfig>,
    pub notify: NotifyConfig,
    pub toss: TossConfig,
}

/// Our own keys, base32 encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfConfig {
    pub id: String,
    pub exch_pub: String,
    pub exch_prv: String,
    pub sign_pub: String,
    /// Ed25519 32-byte seed.
    pub sign_prv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_pub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_prv: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighConfig {
    pub id: String,
    pub exch_pub: String,
    pub sign_pub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_pub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<PathBuf>,
    /// Chunk freq replies into pieces of this many KiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_chunked: Option<u64>,
    /// Pad freq replies to at least this many KiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_min_size: Option<u64>,
    /// Relay path, names or ids, first hop first.
    pub via: Vec<String>,
    /// Exec handle → command line.
    pub exec: BTreeMap<String, Vec<String>>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online_deadline: Option<u64>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_online_time: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<NotifyTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<NotifyTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyTarget {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TossConfig {
    /// Skip packets with a niceness above this.
    pub nice: u8,
    pub dry_run: bool,
    /// Leave a `.seen` marker for every tossed packet.
    pub seen: bool,
    /// Repeat every N seconds. 0 = run once.
    pub cycle: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NncpConfig {
    fn default() -> Self {
        Self {
            spool: data_dir().join("spool"),
            log: data_dir().join("log"),
            self_keys: None,
            neigh: BTreeMap::new(),
            notify: NotifyConfig::default(),
            toss: TossConfig::default(),
        }
    }
}

impl Default for TossConfig {
    fn default() -> Self {
        Self {
            nice: 255,
            dry_run: false,
            seen: false,
            cycle: 0,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("nncp")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("nncp")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("[self] section is missing")]
    MissingSelf,
    #[error("neighbour \"self\" is missing or does not match [self]")]
    MissingSelfNeighbour,
    #[error("{node}.{field}: {source}")]
    BadKey {
        node: String,
        field: &'static str,
        source: IdentityError,
    },
    #[error("{0}: id does not match sign_pub")]
    IdMismatch(String),
    #[error("{0}: id already used by another neighbour")]
    DuplicateId(String),
    #[error("{field} must be an absolute path: {}", path.display())]
    NotAbsolute { field: String, path: PathBuf },
    #[error("{0}: freq_chunked must be greater than zero")]
    ZeroChunked(String),
    #[error("{node}.{field}: {kib} KiB is too large")]
    TooLarge {
        node: String,
        field: &'static str,
        kib: u64,
    },
    #[error("{0}: online_deadline must be at least 1 second")]
    BadDeadline(String),
    #[error("{node}: via entry {via} does not name a neighbour")]
    UnknownVia { node: String, via: String },
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NncpConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            NncpConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("NNCP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// A fresh configuration with newly generated keys and a `self`
    /// neighbour that may run sendmail for notifications.
    pub fn generate() -> Self {
        let local = LocalNode::generate();
        let mut me = NeighConfig::from_local(&local);
        me.exec.insert(
            "sendmail".to_string(),
            vec!["/usr/sbin/sendmail".to_string()],
        );
        let mut neigh = BTreeMap::new();
        neigh.insert(SELF_NAME.to_string(), me);
        Self {
            self_keys: Some(SelfConfig::from_local(&local)),
            neigh,
            ..Self::default()
        }
    }

    /// Write a freshly generated config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_generated_to(&path)?;
        Ok(path)
    }

    pub fn write_generated_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&Self::generate()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply NNCP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("NNCP_SPOOL") {
            self.spool = PathBuf::from(v);
        }
        if let Some(v) = var("NNCP_LOG") {
            self.log = PathBuf::from(v);
        }
        if let Some(v) = var("NNCP_TOSS__NICE") {
            if let Ok(n) = v.parse() {
                self.toss.nice = n;
            }
        }
        if let Some(v) = var("NNCP_TOSS__DRY_RUN") {
            self.toss.dry_run = v == "true" || v == "1";
        }
        if let Some(v) = var("NNCP_TOSS__SEEN") {
            self.toss.seen = v == "true" || v == "1";
        }
        if let Some(v) = var("NNCP_TOSS__CYCLE") {
            if let Ok(n) = v.parse() {
                self.toss.cycle = n;
            }
        }
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// Validated configuration, ready for the spool and tossing engine.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub spool: PathBuf,
    pub log: PathBuf,
    pub local: Arc<LocalNode>,
    pub neighbours: Arc<Neighbours>,
    pub notify: NotifyConfig,
    pub toss: TossConfig,
}

fn decode_key(node: &str, field: &'static str, text: &str) -> Result<[u8; 32], ConfigError> {
    key_from_base32(text).map_err(|source| ConfigError::BadKey {
        node: node.to_string(),
        field,
        source,
    })
}

fn require_absolute(field: String, path: &Path) -> Result<(), ConfigError> {
    if !path.is_absolute() {
        return Err(ConfigError::NotAbsolute {
            field,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn kib_to_bytes(node: &str, field: &'static str, kib: u64) -> Result<u64, ConfigError> {
    kib.checked_mul(1024).ok_or_else(|| ConfigError::TooLarge {
        node: node.to_string(),
        field,
        kib,
    })
}

impl SelfConfig {
    pub fn from_local(local: &LocalNode) -> Self {
        Self {
            id: local.id.to_string(),
            exch_pub: to_base32(&local.exch.public),
            exch_prv: to_base32(&*local.exch.private_bytes()),
            sign_pub: to_base32(&local.sign.public()),
            sign_prv: to_base32(&*local.sign.seed()),
            noise_pub: local.noise_pub.map(|k| to_base32(&k)),
            noise_prv: local.noise_prv.as_ref().map(|k| to_base32(&**k)),
        }
    }

    fn to_local(&self) -> Result<LocalNode, ConfigError> {
        let exch = ExchangeKeypair::from_private(decode_key(SELF_NAME, "exch_prv", &self.exch_prv)?);
        if exch.public != decode_key(SELF_NAME, "exch_pub", &self.exch_pub)? {
            return Err(ConfigError::BadKey {
                node: SELF_NAME.to_string(),
                field: "exch_pub",
                source: IdentityError::BadEncoding("does not match exch_prv".to_string()),
            });
        }
        let sign = SigningKeypair::from_seed(decode_key(SELF_NAME, "sign_prv", &self.sign_prv)?);
        if sign.public() != decode_key(SELF_NAME, "sign_pub", &self.sign_pub)? {
            return Err(ConfigError::BadKey {
                node: SELF_NAME.to_string(),
                field: "sign_pub",
                source: IdentityError::BadEncoding("does not match sign_prv".to_string()),
            });
        }
        let mut local = LocalNode::from_keys(exch, sign);
        let id: NodeId = self.id.parse().map_err(|source| ConfigError::BadKey {
            node: SELF_NAME.to_string(),
            field: "id",
            source,
        })?;
        if id != local.id {
            return Err(ConfigError::IdMismatch(SELF_NAME.to_string()));
        }
        if let (Some(public), Some(private)) = (&self.noise_pub, &self.noise_prv) {
            local.noise_pub = Some(decode_key(SELF_NAME, "noise_pub", public)?);
            local.noise_prv = Some(zeroize::Zeroizing::new(decode_key(
                SELF_NAME,
                "noise_prv",
                private,
            )?));
        }
        Ok(local)
    }
}

impl NeighConfig {
    pub fn from_local(local: &LocalNode) -> Self {
        Self {
            id: local.id.to_string(),
            exch_pub: to_base32(&local.exch.public),
            sign_pub: to_base32(&local.sign.public()),
            noise_pub: local.noise_pub.map(|k| to_base32(&k)),
            ..Self::default()
        }
    }

    /// Everything except `via`, which needs the other neighbours.
    fn to_node(&self, name: &str) -> Result<Node, ConfigError> {
        let exch_pub = decode_key(name, "exch_pub", &self.exch_pub)?;
        let sign_pub = decode_key(name, "sign_pub", &self.sign_pub)?;
        let mut node = Node::new(name, exch_pub, sign_pub);
        let id: NodeId = self.id.parse().map_err(|source| ConfigError::BadKey {
            node: name.to_string(),
            field: "id",
            source,
        })?;
        if id != node.id {
            return Err(ConfigError::IdMismatch(name.to_string()));
        }
        if let Some(noise) = &self.noise_pub {
            node.noise_pub = Some(decode_key(name, "noise_pub", noise)?);
        }
        if let Some(incoming) = &self.incoming {
            require_absolute(format!("{name}.incoming"), incoming)?;
            node.incoming = Some(incoming.clone());
        }
        if let Some(root) = &self.freq {
            require_absolute(format!("{name}.freq"), root)?;
            let chunked = match self.freq_chunked {
                Some(0) => return Err(ConfigError::ZeroChunked(name.to_string())),
                Some(kib) => Some(kib_to_bytes(name, "freq_chunked", kib)?),
                None => None,
            };
            let min_size = kib_to_bytes(name, "freq_min_size", self.freq_min_size.unwrap_or(0))?;
            node.freq = Some(FreqPolicy {
                root: root.clone(),
                chunked,
                min_size,
            });
        }
        node.exec = self
            .exec
            .iter()
            .map(|(handle, argv)| (handle.clone(), argv.clone()))
            .collect::<HashMap<_, _>>();
        if let Some(secs) = self.online_deadline {
            if secs < 1 {
                return Err(ConfigError::BadDeadline(name.to_string()));
            }
            node.online_deadline = Duration::from_secs(secs);
        }
        node.max_online_time = self.max_online_time.map(Duration::from_secs);
        Ok(node)
    }
}

impl NncpConfig {
    /// Validate and build the runtime records.
    pub fn resolve(&self) -> Result<Resolved, ConfigError> {
        require_absolute("spool".to_string(), &self.spool)?;
        require_absolute("log".to_string(), &self.log)?;
        let local = self.self_keys.as_ref().ok_or(ConfigError::MissingSelf)?.to_local()?;

        match self.neigh.get(SELF_NAME) {
            Some(me) if me.id.parse::<NodeId>().ok() == Some(local.id) => {}
            _ => return Err(ConfigError::MissingSelfNeighbour),
        }

        let mut nodes = Vec::with_capacity(self.neigh.len());
        let mut by_name = HashMap::new();
        let mut seen_ids = HashMap::new();
        for (name, neigh) in &self.neigh {
            let node = neigh.to_node(name)?;
            if seen_ids.insert(node.id, name.clone()).is_some() {
                return Err(ConfigError::DuplicateId(name.clone()));
            }
            by_name.insert(name.clone(), node.id);
            nodes.push(node);
        }

        for node in &mut nodes {
            for hop in &self.neigh[&node.name].via {
                let id = by_name
                    .get(hop)
                    .copied()
                    .or_else(|| hop.parse::<NodeId>().ok().filter(|id| seen_ids.contains_key(id)))
                    .ok_or_else(|| ConfigError::UnknownVia {
                        node: node.name.clone(),
                        via: hop.clone(),
                    })?;
                node.via.push(id);
            }
        }

        let mut neighbours = Neighbours::new();
        for node in nodes {
            neighbours.insert(node)?;
        }

        Ok(Resolved {
            spool: self.spool.clone(),
            log: self.log.clone(),
            local: Arc::new(local),
            neighbours: Arc::new(neighbours),
            notify: self.notify.clone(),
            toss: self.toss.clone(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
