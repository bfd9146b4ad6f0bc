//! Splitting files into chunks and putting delivered chunks back together.
//!
//! Chunk and meta files sit side by side: `<name>.nncp.part<i>` and
//! `<name>.nncp.meta`. Reassembly verifies every chunk's presence, size and
//! tree hash before writing anything, then places the joined file through
//! the same collision policy as plain file delivery.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use nncp_core::chunked::{self, ChunkedMeta, META_SUFFIX};
use nncp_core::mth::{tree_hash_reader, Digest, TreeHasher};

use crate::context::Context;
use crate::error::TossError;
use crate::placement::TempFile;

const COPY_BUF: usize = 128 * 1024;

// ── Split ─────────────────────────────────────────────────────────────────────

/// Cut `size` bytes of `reader` into chunk files named after `name` in
/// `dir`, and write the meta file next to them.
pub fn split_into<R: Read>(
    mut reader: R,
    size: u64,
    dir: &Path,
    name: &str,
    chunk_size: u64,
) -> Result<(ChunkedMeta, Vec<PathBuf>), TossError> {
    if chunk_size == 0 {
        return Err(chunked::ChunkedError::ZeroChunkSize.into());
    }
    fs::create_dir_all(dir).map_err(|e| TossError::io(format!("mkdir {}", dir.display()), e))?;

    let count = chunked::chunk_count(size, chunk_size);
    let mut paths = Vec::with_capacity(count as usize);
    let mut checksums = Vec::with_capacity(count as usize);
    let mut left = size;
    for index in 0..count {
        let len = left.min(chunk_size);
        let path = dir.join(chunked::part_name(name, index));
        checksums.push(write_chunk(&path, (&mut reader).take(len), len)?);
        paths.push(path);
        left -= len;
    }

    let meta = ChunkedMeta::new(size, chunk_size, checksums)?;
    let meta_path = dir.join(chunked::meta_name(name));
    fs::write(&meta_path, meta.encode()).map_err(|e| TossError::io(format!("write {}", meta_path.display()), e))?;
    tracing::debug!(name, size, chunk_size, chunks = count, "split");
    Ok((meta, paths))
}

/// Split the file at `source` into `dir`, keeping its file name.
pub fn split(source: &Path, dir: &Path, chunk_size: u64) -> Result<(ChunkedMeta, Vec<PathBuf>), TossError> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TossError::BadPath(source.display().to_string()))?;
    let what = || format!("open {}", source.display());
    let file = File::open(source).map_err(|e| TossError::io(what(), e))?;
    let size = file.metadata().map_err(|e| TossError::io(what(), e))?.len();
    split_into(file, size, dir, name, chunk_size)
}

fn write_chunk<R: Read>(path: &Path, mut reader: R, len: u64) -> Result<Digest, TossError> {
    let what = || format!("write {}", path.display());
    let mut file = File::create(path).map_err(|e| TossError::io(what(), e))?;
    let mut hasher = TreeHasher::new(len, 0);
    let mut buf = vec![0u8; COPY_BUF];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TossError::io("read source", e)),
        };
        hasher.write_all(&buf[..n]).map_err(|e| TossError::io(what(), e))?;
        file.write_all(&buf[..n]).map_err(|e| TossError::io(what(), e))?;
        written += n as u64;
    }
    if written != len {
        return Err(TossError::io(
            what(),
            io::Error::new(io::ErrorKind::UnexpectedEof, format!("source ended after {written} of {len} bytes")),
        ));
    }
    file.sync_all().map_err(|e| TossError::io(what(), e))?;
    hasher
        .sum()
        .map_err(|e| TossError::io(what(), io::Error::new(io::ErrorKind::InvalidData, e)))
}

// ── Reassemble ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ReassembleOptions {
    /// Leave chunk and meta files in place after joining.
    pub keep: bool,
    /// Verify only.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassembleOutcome {
    /// The joined file is at `path`.
    Complete { path: PathBuf },
    /// Dry run: every chunk is present and valid.
    Ready,
    /// Not joined. Chunk indices by problem.
    Incomplete {
        missing: Vec<u64>,
        bad_size: Vec<u64>,
        bad_digest: Vec<u64>,
    },
}

impl ReassembleOutcome {
    /// Corrupt chunks, as opposed to ones that have not arrived yet.
    pub fn is_bad(&self) -> bool {
        matches!(self, ReassembleOutcome::Incomplete { bad_size, bad_digest, .. }
            if !bad_size.is_empty() || !bad_digest.is_empty())
    }
}

pub fn read_meta(meta_path: &Path) -> Result<ChunkedMeta, TossError> {
    let raw = fs::read(meta_path).map_err(|e| TossError::io(format!("read {}", meta_path.display()), e))?;
    Ok(ChunkedMeta::decode(&raw)?)
}

/// Verify and join the chunks described by `meta_path`.
pub fn reassemble(meta_path: &Path, opts: ReassembleOptions) -> Result<ReassembleOutcome, TossError> {
    let name = meta_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(chunked::strip_meta_suffix)
        .ok_or_else(|| TossError::BadPath(meta_path.display().to_string()))?;
    let dir = meta_path.parent().unwrap_or_else(|| Path::new("."));
    let meta = read_meta(meta_path)?;

    let parts: Vec<PathBuf> = (0..meta.count())
        .map(|i| dir.join(chunked::part_name(name, i)))
        .collect();

    let mut missing = Vec::new();
    let mut bad_size = Vec::new();
    for (i, part) in (0u64..).zip(&parts) {
        match fs::metadata(part) {
            Ok(m) if m.len() == meta.chunk_len(i) => {}
            Ok(m) => {
                tracing::error!(meta = %meta_path.display(), chunk = i, size = m.len(), expected = meta.chunk_len(i), "invalid chunk size");
                bad_size.push(i);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(meta = %meta_path.display(), chunk = i, "missing");
                missing.push(i);
            }
            Err(e) => return Err(TossError::io(format!("stat {}", part.display()), e)),
        }
    }
    if !missing.is_empty() || !bad_size.is_empty() {
        return Ok(ReassembleOutcome::Incomplete {
            missing,
            bad_size,
            bad_digest: Vec::new(),
        });
    }

    let mut bad_digest = Vec::new();
    for ((i, part), expected) in (0u64..).zip(&parts).zip(&meta.checksums) {
        let file = File::open(part).map_err(|e| TossError::io(format!("open {}", part.display()), e))?;
        let got = tree_hash_reader(file).map_err(|e| TossError::io(format!("read {}", part.display()), e))?;
        if &got != expected {
            tracing::error!(meta = %meta_path.display(), chunk = i, "checksum is bad");
            bad_digest.push(i);
        }
    }
    if !bad_digest.is_empty() {
        return Ok(ReassembleOutcome::Incomplete {
            missing,
            bad_size,
            bad_digest,
        });
    }

    if opts.dry_run {
        tracing::info!(meta = %meta_path.display(), "ready");
        return Ok(ReassembleOutcome::Ready);
    }

    let mut tmp = TempFile::create_in(dir).map_err(|e| TossError::io(format!("mktemp in {}", dir.display()), e))?;
    for part in &parts {
        let mut file = File::open(part).map_err(|e| TossError::io(format!("open {}", part.display()), e))?;
        io::copy(&mut file, &mut tmp).map_err(|e| TossError::io(format!("copy {}", part.display()), e))?;
    }
    tmp.flush().map_err(|e| TossError::io("flush", e))?;
    let path = tmp
        .persist(&dir.join(name))
        .map_err(|e| TossError::io(format!("place {name}"), e))?;

    if !opts.keep {
        for part in parts.iter().map(PathBuf::as_path).chain([meta_path]) {
            if let Err(e) = fs::remove_file(part) {
                tracing::warn!(path = %part.display(), err = %e, "remove failed");
            }
        }
    }
    tracing::info!(meta = %meta_path.display(), path = %path.display(), size = meta.file_size, "reassembled");
    Ok(ReassembleOutcome::Complete { path })
}

/// Every `*.nncp.meta` file under `dir`, in name order. Hidden entries are
/// skipped.
pub fn find_metas(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(entry.path());
            } else if kind.is_file() && name.ends_with(META_SUFFIX) {
                found.push(entry.path());
            }
        }
    }
    found.sort();
    Ok(found)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassReport {
    pub complete: usize,
    pub pending: usize,
    pub bad: usize,
}

impl ReassReport {
    pub fn merge(&mut self, other: ReassReport) {
        self.complete += other.complete;
        self.pending += other.pending;
        self.bad += other.bad;
    }

    pub fn is_bad(&self) -> bool {
        self.bad > 0
    }
}

/// Reassemble every meta file found under `dir`.
pub fn reassemble_dir(dir: &Path, opts: ReassembleOptions) -> ReassReport {
    let mut report = ReassReport::default();
    let metas = match find_metas(dir) {
        Ok(metas) => metas,
        Err(e) => {
            tracing::error!(dir = %dir.display(), err = %e, "listing failed");
            report.bad += 1;
            return report;
        }
    };
    for meta in metas {
        match reassemble(&meta, opts) {
            Ok(outcome) if outcome.is_bad() => report.bad += 1,
            Ok(ReassembleOutcome::Incomplete { .. }) => report.pending += 1,
            Ok(_) => report.complete += 1,
            Err(e) => {
                tracing::error!(meta = %meta.display(), err = %e, "reassembly failed");
                report.bad += 1;
            }
        }
    }
    report
}

/// Reassemble everything waiting in the neighbours' incoming directories.
/// A directory shared by several neighbours is visited once.
pub fn reassemble_all(ctx: &Context, opts: ReassembleOptions) -> ReassReport {
    let dirs: BTreeSet<PathBuf> = ctx
        .neighbours
        .iter()
        .filter_map(|node| node.incoming.clone())
        .collect();
    let mut report = ReassReport::default();
    for dir in dirs {
        report.merge(reassemble_dir(&dir, opts));
    }
    report
}
