//! Incremental Merkle tree hash over a byte stream.
//!
//! The stream is cut into fixed `BLOCK_SIZE` leaves at absolute offsets.
//! Leaves and inner nodes are BLAKE3 hashes under distinct derived keys, so
//! a leaf digest can never be confused with a node digest. Leaves are folded
//! into a stack of completed subtrees as they arrive; at the end the stack
//! is merged right to left.
//!
//! Leaf boundaries depend only on absolute offsets, never on how `update`
//! calls are split. That is what allows a resumed transfer to hash only the
//! suffix it has just received (`new(size, offset)` + `update`) and fold the
//! already stored prefix in afterwards with `prepend_from`, producing the
//! same digest as hashing everything from offset zero.
//!
//! A declared size of zero means "unknown length": nothing is validated
//! against it and the digest is the same as for a correctly declared size.

use std::io::{self, Read, Write};

/// Leaf size in bytes.
pub const BLOCK_SIZE: usize = 128 * 1024;

pub const DIGEST_SIZE: usize = 32;

pub type Digest = [u8; DIGEST_SIZE];

const LEAF_CONTEXT: &str = "nncp 2024-01 tree hash leaf";
const NODE_CONTEXT: &str = "nncp 2024-01 tree hash node";

#[derive(Clone)]
struct Keys {
    leaf: [u8; 32],
    node: [u8; 32],
}

impl Keys {
    fn derive() -> Self {
        Self {
            leaf: blake3::derive_key(LEAF_CONTEXT, b""),
            node: blake3::derive_key(NODE_CONTEXT, b""),
        }
    }

    fn leaf(&self, data: &[u8]) -> Digest {
        *blake3::keyed_hash(&self.leaf, data).as_bytes()
    }

    fn node(&self, left: &Digest, right: &Digest) -> Digest {
        let mut hasher = blake3::Hasher::new_keyed(&self.node);
        hasher.update(left);
        hasher.update(right);
        *hasher.finalize().as_bytes()
    }
}

/// Streaming, resumable tree hasher.
#[derive(Clone)]
pub struct TreeHasher {
    keys: Keys,
    size: u64,
    offset: u64,
    /// Bytes accepted by `update`, counted from `offset`.
    written: u64,
    /// Bytes of the suffix that belong to the leaf straddling `offset`.
    head_need: usize,
    head: Vec<u8>,
    /// Pending bytes of the current, not yet full, leaf.
    buf: Vec<u8>,
    /// Suffix leaves waiting for the prefix to be prepended.
    deferred: Vec<Digest>,
    /// Completed subtrees as (level, digest), lowest level last.
    levels: Vec<(u32, Digest)>,
    prefixed: bool,
}

impl TreeHasher {
    /// `size` is the total stream length (0 = unknown); `offset` is where
    /// the first `update` call starts in that stream.
    pub fn new(size: u64, offset: u64) -> Self {
        let rem = (offset % BLOCK_SIZE as u64) as usize;
        Self {
            keys: Keys::derive(),
            size,
            offset,
            written: 0,
            head_need: if rem == 0 { 0 } else { BLOCK_SIZE - rem },
            head: Vec::new(),
            buf: Vec::new(),
            deferred: Vec::new(),
            levels: Vec::new(),
            prefixed: offset == 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn update(&mut self, mut data: &[u8]) -> Result<(), MthError> {
        let end = self.offset + self.written + data.len() as u64;
        if self.size != 0 && end > self.size {
            return Err(MthError::Overflow {
                size: self.size,
                end,
            });
        }
        self.written += data.len() as u64;

        if !self.prefixed && self.head.len() < self.head_need {
            let take = (self.head_need - self.head.len()).min(data.len());
            self.head.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        self.feed(data);
        Ok(())
    }

    fn feed(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.buf.is_empty() && data.len() >= BLOCK_SIZE {
                let leaf = self.keys.leaf(&data[..BLOCK_SIZE]);
                self.push_leaf(leaf);
                data = &data[BLOCK_SIZE..];
                continue;
            }
            let take = (BLOCK_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == BLOCK_SIZE {
                let leaf = self.keys.leaf(&self.buf);
                self.buf.clear();
                self.push_leaf(leaf);
            }
        }
    }

    fn push_leaf(&mut self, leaf: Digest) {
        if self.prefixed {
            fold(&self.keys, &mut self.levels, leaf);
        } else {
            self.deferred.push(leaf);
        }
    }

    /// Consume exactly `offset` bytes of the same stream from its start and
    /// fold them in front of what `update` has seen. Returns the number of
    /// bytes read.
    pub fn prepend_from<R: Read>(&mut self, mut reader: R) -> Result<u64, MthError> {
        if self.prefixed {
            return Ok(0);
        }
        let full_leaves = self.offset / BLOCK_SIZE as u64;
        let rem = (self.offset % BLOCK_SIZE as u64) as usize;
        let mut consumed = 0u64;
        let mut block = vec![0u8; BLOCK_SIZE];

        let mut prefix_levels = Vec::new();
        for _ in 0..full_leaves {
            let got = read_full(&mut reader, &mut block)?;
            consumed += got as u64;
            if got < BLOCK_SIZE {
                return Err(MthError::ShortRead {
                    expected: self.offset,
                    got: consumed,
                });
            }
            fold(&self.keys, &mut prefix_levels, self.keys.leaf(&block));
        }

        let mut straddle = vec![0u8; rem];
        let got = read_full(&mut reader, &mut straddle)?;
        consumed += got as u64;
        if got < rem {
            return Err(MthError::ShortRead {
                expected: self.offset,
                got: consumed,
            });
        }

        self.levels = prefix_levels;
        self.prefixed = true;
        straddle.append(&mut self.head);

        if rem == 0 || straddle.len() == BLOCK_SIZE {
            if rem != 0 {
                let leaf = self.keys.leaf(&straddle);
                fold(&self.keys, &mut self.levels, leaf);
            }
            for leaf in std::mem::take(&mut self.deferred) {
                fold(&self.keys, &mut self.levels, leaf);
            }
        } else {
            // The suffix never reached the next leaf boundary, so nothing
            // was buffered or deferred past the straddling leaf.
            debug_assert!(self.buf.is_empty() && self.deferred.is_empty());
            self.buf = straddle;
        }
        Ok(consumed)
    }

    /// Digest of everything seen so far. Does not consume the hasher.
    pub fn sum(&self) -> Result<Digest, MthError> {
        if !self.prefixed {
            return Err(MthError::MissingPrefix {
                offset: self.offset,
            });
        }
        let total = self.offset + self.written;
        if self.size != 0 && total != self.size {
            return Err(MthError::Incomplete {
                size: self.size,
                got: total,
            });
        }

        Ok(finish(&self.keys, self.levels.clone(), &self.buf))
    }
}

impl Write for TreeHasher {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.update(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Close the trailing partial leaf and merge the stack right to left.
fn finish(keys: &Keys, mut levels: Vec<(u32, Digest)>, tail: &[u8]) -> Digest {
    if !tail.is_empty() {
        fold(keys, &mut levels, keys.leaf(tail));
    }
    let mut rest = levels.iter().rev();
    let Some(&(_, mut digest)) = rest.next() else {
        return keys.leaf(&[]);
    };
    for (_, left) in rest {
        digest = keys.node(left, &digest);
    }
    digest
}

fn fold(keys: &Keys, levels: &mut Vec<(u32, Digest)>, leaf: Digest) {
    let mut level = 0u32;
    let mut digest = leaf;
    while let Some(&(top_level, top)) = levels.last() {
        if top_level != level {
            break;
        }
        levels.pop();
        digest = keys.node(&top, &digest);
        level += 1;
    }
    levels.push((level, digest));
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Tree hash of an in-memory buffer.
pub fn tree_hash(data: &[u8]) -> Digest {
    let mut hasher = TreeHasher::new(0, 0);
    hasher.feed(data);
    finish(&hasher.keys, hasher.levels, &hasher.buf)
}

/// Tree hash of everything a reader yields.
pub fn tree_hash_reader<R: Read>(mut reader: R) -> io::Result<Digest> {
    let mut hasher = TreeHasher::new(0, 0);
    io::copy(&mut reader, &mut hasher)?;
    hasher
        .sum()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MthError {
    #[error("short read while prepending: expected {expected} bytes, got {got}")]
    ShortRead { expected: u64, got: u64 },
    #[error("write past declared size {size} (would end at {end})")]
    Overflow { size: u64, end: u64 },
    #[error("declared size {size}, hashed {got}")]
    Incomplete { size: u64, got: u64 },
    #[error("prefix of {offset} bytes was never prepended")]
    MissingPrefix { offset: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
