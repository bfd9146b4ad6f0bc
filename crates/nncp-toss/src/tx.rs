//! Outbound packet production.
//!
//! Every packet is sealed for its destination. When the destination has a
//! `via` path, the sealed envelope becomes the body of a Trns packet sealed
//! for the last relay, and so on outwards until the first hop; the result is
//! queued in the first hop's `tx` directory. Layers are nested `Read`
//! adapters, so nothing but the final envelope touches the disk.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use flate2::read::ZlibEncoder;
use flate2::Compression;
use nncp_core::chunked::{self, ChunkedMeta};
use nncp_core::envelope::SealingReader;
use nncp_core::mth::TreeHasher;
use nncp_core::wire::PACKET_HEADER_SIZE;
use nncp_core::{Node, Packet, PacketKind};

use crate::context::Context;
use crate::error::{from_spool, TossError};
use crate::spool::{Direction, Stored};

/// Seal `packet` followed by `size` bytes of `body` for `node`, wrap it for
/// every relay on the node's `via` path and queue it for the first hop.
/// Only the outermost envelope is padded up to `min_size`.
pub fn tx<'a, R: Read + 'a>(
    ctx: &Context,
    node: &Node,
    packet: &Packet,
    size: u64,
    body: R,
    min_size: u64,
) -> Result<Stored, TossError> {
    let hops = node
        .via
        .iter()
        .map(|id| ctx.node(id).cloned().ok_or(TossError::UnknownTarget(*id)))
        .collect::<Result<Vec<Arc<Node>>, _>>()?;

    let header = packet.to_bytes();
    let plain_size = header.len() as u64 + size;
    let pad = if hops.is_empty() { min_size } else { 0 };
    let inner = SealingReader::new(&ctx.local, node, packet.nice, plain_size, pad, Cursor::new(header).chain(body))?;
    let mut sealed_size = inner.total_size();
    let mut sealed: Box<dyn Read + 'a> = Box::new(inner);
    let mut target = node.id;

    for (i, hop) in hops.iter().enumerate().rev() {
        let trns = Packet::trns(packet.nice, &target);
        let layer_size = PACKET_HEADER_SIZE as u64 + sealed_size;
        let pad = if i == 0 { min_size } else { 0 };
        let layer = SealingReader::new(
            &ctx.local,
            hop,
            packet.nice,
            layer_size,
            pad,
            Cursor::new(trns.to_bytes()).chain(sealed),
        )?;
        sealed_size = layer.total_size();
        sealed = Box::new(layer);
        target = hop.id;
    }

    let stored = ctx.spool.enqueue(&target, Direction::Tx, sealed).map_err(from_spool)?;
    tracing::info!(
        node = %node.name,
        kind = %packet.kind,
        hops = hops.len(),
        size = stored.size,
        "queued"
    );
    Ok(stored)
}

fn open_source(src: &Path) -> Result<(File, u64), TossError> {
    let what = || format!("open {}", src.display());
    let file = File::open(src).map_err(|e| TossError::io(what(), e))?;
    let size = file.metadata().map_err(|e| TossError::io(what(), e))?.len();
    Ok((file, size))
}

/// Send the file at `src` to be stored as `dst` under the node's incoming
/// directory.
pub fn tx_file(
    ctx: &Context,
    node: &Node,
    nice: u8,
    src: &Path,
    dst: &str,
    min_size: u64,
) -> Result<Stored, TossError> {
    let (file, size) = open_source(src)?;
    let packet = Packet::new(PacketKind::File, nice, dst.as_bytes())?;
    tx(ctx, node, &packet, size, file, min_size)
}

/// Like `tx_file`, but files larger than `chunk_size` travel as
/// `<dst>.nncp.part<i>` packets followed by a `<dst>.nncp.meta` packet.
/// Returns every queued packet, meta last.
pub fn tx_file_chunked(
    ctx: &Context,
    node: &Node,
    nice: u8,
    src: &Path,
    dst: &str,
    min_size: u64,
    chunk_size: u64,
) -> Result<Vec<Stored>, TossError> {
    let (mut file, file_size) = open_source(src)?;
    if chunk_size == 0 || file_size <= chunk_size {
        let packet = Packet::new(PacketKind::File, nice, dst.as_bytes())?;
        return Ok(vec![tx(ctx, node, &packet, file_size, file, min_size)?]);
    }

    let count = chunked::chunk_count(file_size, chunk_size);
    let mut queued = Vec::with_capacity(count as usize + 1);
    let mut checksums = Vec::with_capacity(count as usize);
    let mut left = file_size;
    for index in 0..count {
        let len = left.min(chunk_size);
        let packet = Packet::new(PacketKind::File, nice, chunked::part_name(dst, index).as_bytes())?;
        let mut hashing = HashingReader::new(file.by_ref().take(len), len);
        queued.push(tx(ctx, node, &packet, len, &mut hashing, min_size)?);
        checksums.push(hashing.sum()?);
        left -= len;
    }

    let meta = ChunkedMeta::new(file_size, chunk_size, checksums)?.encode();
    let packet = Packet::new(PacketKind::File, nice, chunked::meta_name(dst).as_bytes())?;
    queued.push(tx(ctx, node, &packet, meta.len() as u64, &meta[..], min_size)?);
    tracing::debug!(node = %node.name, dst, chunks = count, "chunked file queued");
    Ok(queued)
}

/// Ask `node` to send us its file `src` (relative to its freq root), to be
/// stored here as `dst`.
pub fn tx_freq(ctx: &Context, node: &Node, nice: u8, src: &str, dst: &str) -> Result<Stored, TossError> {
    let packet = Packet::new(PacketKind::Freq, nice, src.as_bytes())?;
    tx(ctx, node, &packet, dst.len() as u64, dst.as_bytes(), 0)
}

/// Run `handle` with `args` on `node`, feeding it `body` on stdin. The body
/// travels zlib-compressed.
pub fn tx_exec<R: Read>(
    ctx: &Context,
    node: &Node,
    nice: u8,
    handle: &str,
    args: &[String],
    body: R,
    min_size: u64,
) -> Result<Stored, TossError> {
    let packet = Packet::exec(nice, handle, args)?;
    let mut compressed = Vec::new();
    ZlibEncoder::new(body, Compression::default())
        .read_to_end(&mut compressed)
        .map_err(|e| TossError::io("compress exec body", e))?;
    tx(ctx, node, &packet, compressed.len() as u64, &compressed[..], min_size)
}

/// Queue `size` bytes of an already sealed envelope for `node` verbatim.
/// This is the relay half of a Trns hop.
pub fn tx_trns<R: Read>(ctx: &Context, node: &Node, nice: u8, size: u64, body: R) -> Result<Stored, TossError> {
    let stored = ctx
        .spool
        .enqueue(&node.id, Direction::Tx, body.take(size))
        .map_err(from_spool)?;
    if stored.size != size {
        let _ = std::fs::remove_file(&stored.path);
        return Err(TossError::io(
            "relay",
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("relayed {} of {size} bytes", stored.size),
            ),
        ));
    }
    tracing::debug!(node = %node.name, nice, size, "relayed");
    Ok(stored)
}

/// Passes bytes through while tree-hashing them.
struct HashingReader<R> {
    inner: R,
    hasher: TreeHasher,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            hasher: TreeHasher::new(size, 0),
        }
    }

    fn sum(&self) -> Result<nncp_core::mth::Digest, TossError> {
        self.hasher
            .sum()
            .map_err(|e| TossError::io("chunk digest", io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher
            .update(&buf[..n])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(n)
    }
}
