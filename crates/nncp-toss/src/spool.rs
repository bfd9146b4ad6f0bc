//! Filesystem spool: durable per-node, per-direction packet queues.
//!
//! Layout:
//!   <spool>/<node-id>/rx/<seq>.<digest>       packets addressed to us
//!   <spool>/<node-id>/tx/<seq>.<digest>       packets waiting to be sent
//!   <spool>/<node-id>/<purpose>.lock          advisory locks
//!
//! `<seq>` is a 20-digit arrival sequence, `<digest>` the hex tree hash of
//! the whole file. Writers stage into a hidden temp file, fsync and rename,
//! so a packet name only ever appears with complete content. Enumeration
//! skips dot-files, `.part` files, `.seen` markers and every packet that has
//! a seen marker.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nncp_core::mth::{Digest, MthError, TreeHasher};
use nncp_core::wire::{EnvelopeHeader, ENVELOPE_HEADER_SIZE, NICE_MAX};
use nncp_core::NodeId;
use thiserror::Error;

use crate::lock::{LockError, SpoolLock};

pub const SEEN_SUFFIX: &str = ".seen";
pub const PART_SUFFIX: &str = ".part";

const SEQ_WIDTH: usize = 20;
const COPY_BUF: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Rx => "rx",
            Direction::Tx => "tx",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Spool ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
}

/// Where a packet landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub path: PathBuf,
    pub digest: Digest,
    pub size: u64,
}

impl Spool {
    /// Open (creating if needed) the spool root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| SpoolError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_dir(&self, node: &NodeId) -> PathBuf {
        self.root.join(node.to_string())
    }

    pub fn dir(&self, node: &NodeId, direction: Direction) -> PathBuf {
        self.node_dir(node).join(direction.as_str())
    }

    fn ensure_dir(&self, node: &NodeId, direction: Direction) -> Result<PathBuf, SpoolError> {
        let dir = self.dir(node, direction);
        fs::create_dir_all(&dir).map_err(|e| SpoolError::io(&dir, e))?;
        Ok(dir)
    }

    /// Take the `(node, purpose)` lock without waiting.
    pub fn lock(&self, node: &NodeId, purpose: &str) -> Result<SpoolLock, LockError> {
        let dir = self.node_dir(node);
        let path = dir.join(format!("{purpose}.lock"));
        fs::create_dir_all(&dir).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;
        SpoolLock::acquire(&path)
    }

    /// Snapshot of the queue, ordered by niceness then arrival. Packets
    /// arriving after this call are picked up by the next pass.
    pub fn jobs(&self, node: &NodeId, direction: Direction) -> Result<Jobs, SpoolError> {
        let dir = self.dir(node, direction);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Jobs::default()),
            Err(e) => return Err(SpoolError::io(&dir, e)),
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SpoolError::io(&dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.starts_with('.') || name.ends_with(SEEN_SUFFIX) || name.ends_with(PART_SUFFIX) {
                continue;
            }
            let Some(digest) = parse_packet_name(&name) else {
                tracing::debug!(node = %node, dir = %direction, file = %name, "not a packet, ignored");
                continue;
            };
            let path = entry.path();
            if seen_path(&path).exists() {
                tracing::debug!(node = %node, pkt = %name, "already seen");
                continue;
            }
            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                // Removed by someone else since listing.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SpoolError::io(&path, e)),
            };
            let header = match read_header(&path) {
                Ok(header) => Some(header),
                Err(e) => {
                    tracing::error!(node = %node, pkt = %name, err = %e, "unreadable envelope header");
                    None
                }
            };
            jobs.push(Job {
                nice: header.map(|h| h.nice).unwrap_or(NICE_MAX),
                header,
                path,
                name,
                size,
                digest,
            });
        }
        jobs.sort_by(|a, b| (a.nice, &a.name).cmp(&(b.nice, &b.name)));
        Ok(Jobs {
            jobs: jobs.into_iter(),
        })
    }

    /// Write a complete packet into the queue.
    pub fn enqueue<R: Read>(&self, node: &NodeId, direction: Direction, mut reader: R) -> Result<Stored, SpoolError> {
        let dir = self.ensure_dir(node, direction)?;
        let tmp = dir.join(temp_name());
        let (digest, size) = match stage(&tmp, &mut reader) {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        let path = commit(&dir, &tmp, &digest)?;
        tracing::debug!(node = %node, dir = %direction, pkt = %file_name(&path), size, "queued");
        Ok(Stored { path, digest, size })
    }

    /// Start or resume receiving a packet whose digest and size the sender
    /// announced. Bytes already in `<digest>.part` are kept and only the new
    /// suffix is hashed while it streams in.
    pub fn incoming(
        &self,
        node: &NodeId,
        direction: Direction,
        digest: Digest,
        size: u64,
    ) -> Result<Incoming, SpoolError> {
        let dir = self.ensure_dir(node, direction)?;
        let hex = hex::encode(digest);
        if self.seen(node, direction, &digest)? {
            return Err(SpoolError::AlreadySeen(hex));
        }
        let part = dir.join(format!("{hex}{PART_SUFFIX}"));
        let mut offset = match fs::metadata(&part) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(SpoolError::io(&part, e)),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part)
            .map_err(|e| SpoolError::io(&part, e))?;
        if offset > size {
            tracing::warn!(node = %node, part = %part.display(), offset, size, "oversized partial file, restarting");
            file.set_len(0).map_err(|e| SpoolError::io(&part, e))?;
            offset = 0;
        }
        if offset > 0 {
            tracing::info!(node = %node, pkt = %hex, offset, size, "resuming");
        }
        Ok(Incoming {
            dir,
            part,
            file,
            hasher: TreeHasher::new(size, offset),
            digest,
            size,
            offset,
            written: 0,
        })
    }

    /// Whether a packet with this digest has been processed and marked seen.
    pub fn seen(&self, node: &NodeId, direction: Direction, digest: &Digest) -> Result<bool, SpoolError> {
        let dir = self.dir(node, direction);
        let suffix = format!(".{}{SEEN_SUFFIX}", hex::encode(digest));
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(SpoolError::io(&dir, e)),
        };
        for entry in entries.flatten() {
            if entry.file_name().to_str().is_some_and(|n| n.ends_with(&suffix)) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

/// One queued packet.
#[derive(Debug, Clone)]
pub struct Job {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    /// Tree hash recorded in the file name.
    pub digest: Digest,
    pub nice: u8,
    /// None when the envelope header could not be read or parsed.
    pub header: Option<EnvelopeHeader>,
}

impl Job {
    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    pub fn seen_path(&self) -> PathBuf {
        seen_path(&self.path)
    }

    pub fn mark_seen(&self) -> io::Result<()> {
        File::create(self.seen_path()).map(drop)
    }

    pub fn remove(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Finite, ordered snapshot of a queue directory.
#[derive(Debug, Default)]
pub struct Jobs {
    jobs: std::vec::IntoIter<Job>,
}

impl Iterator for Jobs {
    type Item = Job;

    fn next(&mut self) -> Option<Job> {
        self.jobs.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.jobs.size_hint()
    }
}

// ── Incoming ──────────────────────────────────────────────────────────────────

/// A packet being received, possibly over several sessions.
pub struct Incoming {
    dir: PathBuf,
    part: PathBuf,
    file: File,
    hasher: TreeHasher,
    digest: Digest,
    size: u64,
    offset: u64,
    written: u64,
}

impl Incoming {
    /// Bytes already on disk from earlier attempts; the sender resumes here.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn part_path(&self) -> &Path {
        &self.part
    }

    /// Verify the whole file and move it into the queue. An incomplete file
    /// is kept for the next attempt; a corrupt one is removed.
    pub fn finish(mut self) -> Result<Stored, SpoolError> {
        self.file.sync_all().map_err(|e| SpoolError::io(&self.part, e))?;
        let have = self.offset + self.written;
        if have < self.size {
            return Err(SpoolError::Incomplete {
                have,
                size: self.size,
            });
        }
        let prefix = File::open(&self.part).map_err(|e| SpoolError::io(&self.part, e))?;
        self.hasher.prepend_from(prefix)?;
        let got = self.hasher.sum()?;
        if got != self.digest {
            let _ = fs::remove_file(&self.part);
            return Err(SpoolError::Digest {
                expected: self.digest,
                got,
            });
        }
        let path = commit(&self.dir, &self.part, &got)?;
        tracing::info!(pkt = %file_name(&path), size = self.size, "received");
        Ok(Stored {
            path,
            digest: got,
            size: self.size,
        })
    }
}

impl Write for Incoming {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.hasher
            .update(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Copy `reader` into a new file at `tmp`, hashing on the way. Returns the
/// tree hash and length once the file is synced.
fn stage<R: Read>(tmp: &Path, reader: &mut R) -> Result<(Digest, u64), SpoolError> {
    let mut file = File::create(tmp).map_err(|e| SpoolError::io(tmp, e))?;
    let mut hasher = TreeHasher::new(0, 0);
    let mut buf = vec![0u8; COPY_BUF];
    let mut size = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SpoolError::Source(e)),
        };
        hasher.update(&buf[..n])?;
        file.write_all(&buf[..n]).map_err(|e| SpoolError::io(tmp, e))?;
        size += n as u64;
    }
    file.sync_all().map_err(|e| SpoolError::io(tmp, e))?;
    Ok((hasher.sum()?, size))
}

static LAST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing within the process, roughly wall-clock across them.
fn next_seq() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut last = LAST_SEQ.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_SEQ.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

fn temp_name() -> String {
    format!(".{}.tmp", hex::encode(rand::random::<[u8; 8]>()))
}

/// Rename a staged file to its queue name.
fn commit(dir: &Path, staged: &Path, digest: &Digest) -> Result<PathBuf, SpoolError> {
    let hex = hex::encode(digest);
    loop {
        let path = dir.join(format!("{:0width$}.{hex}", next_seq(), width = SEQ_WIDTH));
        if path.exists() {
            continue;
        }
        fs::rename(staged, &path).map_err(|e| SpoolError::io(&path, e))?;
        return Ok(path);
    }
}

fn read_header(path: &Path) -> Result<EnvelopeHeader, SpoolError> {
    let mut file = File::open(path).map_err(|e| SpoolError::io(path, e))?;
    let mut raw = [0u8; ENVELOPE_HEADER_SIZE];
    let mut filled = 0;
    while filled < raw.len() {
        match file.read(&mut raw[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SpoolError::io(path, e)),
        }
    }
    EnvelopeHeader::parse(&raw[..filled]).map_err(SpoolError::Header)
}

/// `<seq>.<hex digest>` -> digest.
pub fn parse_packet_name(name: &str) -> Option<Digest> {
    let (seq, hex) = name.split_once('.')?;
    if seq.len() != SEQ_WIDTH || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut digest = [0u8; 32];
    hex::decode_to_slice(hex, &mut digest).ok()?;
    Some(digest)
}

pub fn seen_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(SEEN_SUFFIX);
    PathBuf::from(name)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("reading packet source: {0}")]
    Source(io::Error),
    #[error("bad envelope header: {0}")]
    Header(nncp_core::wire::WireError),
    #[error("digest mismatch: expected {}, got {}", hex::encode(expected), hex::encode(got))]
    Digest { expected: Digest, got: Digest },
    #[error("incomplete packet: have {have} of {size} bytes")]
    Incomplete { have: u64, size: u64 },
    #[error(transparent)]
    Mth(#[from] MthError),
    #[error("packet {0} was already processed")]
    AlreadySeen(String),
}

impl SpoolError {
    fn io(path: &Path, source: io::Error) -> Self {
        SpoolError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
