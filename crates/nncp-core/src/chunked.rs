//! Chunked transfer descriptor.
//!
//! A large file travels as `<name>.nncp.part0 .. partN-1` plus a small
//! `<name>.nncp.meta` carrying the file size, chunk size and one tree-hash
//! digest per chunk. Splitting and reassembly live in the tossing crate;
//! this module owns the descriptor and its on-disk encoding.

use serde::Serialize;
use zerocopy::byteorder::U64;
use zerocopy::{AsBytes, FromBytes};

use crate::mth::{Digest, DIGEST_SIZE};
use crate::wire::{MetaHeader, META_HEADER_SIZE, META_MAGIC};

pub const META_SUFFIX: &str = ".nncp.meta";
pub const PART_SUFFIX: &str = ".nncp.part";

/// Upper bound on chunk count accepted when decoding, so a corrupt header
/// cannot make us allocate without limit.
const MAX_CHUNKS: u64 = 1 << 24;

/// Number of chunks a file of `file_size` bytes splits into.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

pub fn meta_name(name: &str) -> String {
    format!("{name}{META_SUFFIX}")
}

pub fn part_name(name: &str, index: u64) -> String {
    format!("{name}{PART_SUFFIX}{index}")
}

/// `report.pdf.nncp.meta` -> `report.pdf`.
pub fn strip_meta_suffix(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(META_SUFFIX)
        .filter(|base| !base.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedMeta {
    pub file_size: u64,
    pub chunk_size: u64,
    pub checksums: Vec<Digest>,
}

impl ChunkedMeta {
    pub fn new(file_size: u64, chunk_size: u64, checksums: Vec<Digest>) -> Result<Self, ChunkedError> {
        let meta = Self {
            file_size,
            chunk_size,
            checksums,
        };
        meta.validate()?;
        Ok(meta)
    }

    fn validate(&self) -> Result<(), ChunkedError> {
        if self.chunk_size == 0 {
            return Err(ChunkedError::ZeroChunkSize);
        }
        let expected = chunk_count(self.file_size, self.chunk_size);
        if self.checksums.len() as u64 != expected {
            return Err(ChunkedError::CountMismatch {
                expected,
                got: self.checksums.len() as u64,
            });
        }
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.checksums.len() as u64
    }

    /// Expected size of chunk `index`. The last chunk holds the remainder,
    /// or a full chunk when the file size is an exact multiple.
    pub fn chunk_len(&self, index: u64) -> u64 {
        let last = self.count().saturating_sub(1);
        if index < last {
            return self.chunk_size;
        }
        match self.file_size % self.chunk_size {
            0 => self.chunk_size,
            rem => rem,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = MetaHeader {
            magic: META_MAGIC,
            file_size: U64::new(self.file_size),
            chunk_size: U64::new(self.chunk_size),
            count: U64::new(self.count()),
        };
        let mut out = Vec::with_capacity(META_HEADER_SIZE + self.checksums.len() * DIGEST_SIZE);
        out.extend_from_slice(header.as_bytes());
        for digest in &self.checksums {
            out.extend_from_slice(digest);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChunkedError> {
        let header = MetaHeader::read_from_prefix(bytes).ok_or(ChunkedError::Truncated)?;
        if header.magic != META_MAGIC {
            return Err(ChunkedError::BadMagic);
        }
        let count = header.count.get();
        if count > MAX_CHUNKS {
            return Err(ChunkedError::TooManyChunks(count));
        }
        let body = &bytes[META_HEADER_SIZE..];
        if body.len() as u64 != count * DIGEST_SIZE as u64 {
            return Err(ChunkedError::Truncated);
        }
        let checksums = body
            .chunks_exact(DIGEST_SIZE)
            .map(|c| {
                let mut d = [0u8; DIGEST_SIZE];
                d.copy_from_slice(c);
                d
            })
            .collect();
        Self::new(header.file_size.get(), header.chunk_size.get(), checksums)
    }

    pub fn summary(&self) -> MetaSummary {
        MetaSummary {
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            chunks: self.checksums.iter().map(hex::encode).collect(),
        }
    }
}

/// JSON-friendly view of a meta file.
#[derive(Debug, Clone, Serialize)]
pub struct MetaSummary {
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<String>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkedError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("meta lists {got} chunks, file needs {expected}")]
    CountMismatch { expected: u64, got: u64 },
    #[error("meta file truncated")]
    Truncated,
    #[error("not a chunked meta file")]
    BadMagic,
    #[error("meta claims {0} chunks")]
    TooManyChunks(u64),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
