//! Tossing: decrypt, validate and dispatch every packet waiting in a node's
//! `rx` queue.
//!
//! One pass holds the node's `toss` lock for its whole duration and works
//! through a snapshot of the queue in niceness order. Each job ends in one of
//! three ways:
//!
//! - delivered: the side effect happened, the packet is retired (optional
//!   `.seen` marker first, then deletion);
//! - skipped: too nice for this pass or its type is disabled, left queued;
//! - bad: integrity, policy or I/O failure, logged, left queued.
//!
//! A bad job never stops the pass. Only failures to use the spool itself do.

use std::fs::DirBuilder;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::read::ZlibDecoder;
use nncp_core::config::TossConfig;
use nncp_core::envelope::EnvelopeReader;
use nncp_core::wire::{WireError, MAX_PATH_SIZE, NICE_MAX, PACKET_HEADER_SIZE};
use nncp_core::identity::Capability;
use nncp_core::{Node, NodeId, Packet, PacketKind};

use crate::context::Context;
use crate::error::{ErrorClass, TossError};
use crate::placement;
use crate::spool::{Direction, Job};
use crate::tx;

/// Lock purpose shared by tossing and the integrity check.
pub const LOCK_PURPOSE: &str = "toss";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TossOptions {
    /// Leave packets with a higher niceness for a later pass.
    pub nice: u8,
    /// Validate everything, change nothing.
    pub dry_run: bool,
    /// Leave a `.seen` marker before deleting a tossed packet.
    pub do_seen: bool,
    pub no_file: bool,
    pub no_freq: bool,
    pub no_exec: bool,
    pub no_trns: bool,
}

impl Default for TossOptions {
    fn default() -> Self {
        Self {
            nice: NICE_MAX,
            dry_run: false,
            do_seen: false,
            no_file: false,
            no_freq: false,
            no_exec: false,
            no_trns: false,
        }
    }
}

impl TossOptions {
    pub fn from_config(cfg: &TossConfig) -> Self {
        Self {
            nice: cfg.nice,
            dry_run: cfg.dry_run,
            do_seen: cfg.seen,
            ..Self::default()
        }
    }

    fn skips(&self, kind: PacketKind) -> bool {
        match kind {
            PacketKind::File => self.no_file,
            PacketKind::Freq => self.no_freq,
            PacketKind::Exec => self.no_exec,
            PacketKind::Trns => self.no_trns,
        }
    }
}

/// Outcome of one pass over a node's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TossReport {
    pub processed: usize,
    pub skipped: usize,
    pub bad: usize,
}

impl TossReport {
    pub fn is_bad(&self) -> bool {
        self.bad > 0
    }
}

/// What a dispatched job did, for logging and notifications.
enum Delivery {
    File { dst: String, size: u64 },
    Freq { src: String },
    Exec,
    Trns,
}

enum Outcome {
    Delivered,
    Skipped,
}

/// Toss every packet in `node`'s rx queue once.
///
/// Fails only if the lock is held elsewhere or the spool cannot be read;
/// per-packet failures are counted in the report.
pub fn toss(ctx: &Context, node: &NodeId, opts: &TossOptions) -> Result<TossReport, TossError> {
    let _lock = ctx.spool.lock(node, LOCK_PURPOSE)?;
    let jobs = ctx.spool.jobs(node, Direction::Rx).map_err(TossError::SpoolRoot)?;

    let mut report = TossReport::default();
    for job in jobs {
        if job.header.is_none() {
            tracing::error!(node = %node, pkt = %job.name, class = ?ErrorClass::Integrity, "unreadable envelope header");
            report.bad += 1;
            continue;
        }
        if job.nice > opts.nice {
            tracing::debug!(node = %node, pkt = %job.name, nice = job.nice, "too nice");
            report.skipped += 1;
            continue;
        }
        match toss_job(ctx, &job, opts) {
            Ok(Outcome::Delivered) => report.processed += 1,
            Ok(Outcome::Skipped) => report.skipped += 1,
            Err(e) => match e.class() {
                ErrorClass::Fatal => return Err(e),
                ErrorClass::Transient => {
                    tracing::info!(node = %node, pkt = %job.name, err = %e, "postponed");
                    report.skipped += 1;
                }
                class => {
                    tracing::error!(node = %node, pkt = %job.name, ?class, err = %e, "bad packet");
                    report.bad += 1;
                }
            },
        }
    }
    tracing::debug!(
        node = %node,
        processed = report.processed,
        skipped = report.skipped,
        bad = report.bad,
        "toss pass finished"
    );
    Ok(report)
}

fn toss_job(ctx: &Context, job: &Job, opts: &TossOptions) -> Result<Outcome, TossError> {
    let file = job
        .open()
        .map_err(|e| TossError::io(format!("open {}", job.path.display()), e))?;
    let mut envelope = EnvelopeReader::open(BufReader::new(file), &ctx.local, &ctx.neighbours)?;
    let sender = envelope.sender().clone();

    let mut raw = [0u8; PACKET_HEADER_SIZE];
    envelope.read_exact(&mut raw).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => TossError::Packet(WireError::Truncated {
            need: PACKET_HEADER_SIZE,
            got: envelope.size() as usize,
        }),
        _ => TossError::from(e),
    })?;
    let packet = Packet::parse(&raw)?;
    let size = envelope.size() - PACKET_HEADER_SIZE as u64;
    tracing::debug!(pkt = %job.name, sender = %sender.name, kind = %packet.kind, size, "taken");

    if opts.skips(packet.kind) {
        tracing::debug!(pkt = %job.name, kind = %packet.kind, "type disabled, skipped");
        return Ok(Outcome::Skipped);
    }

    let delivery = match packet.kind {
        PacketKind::File => toss_file(&sender, &packet, &mut envelope, opts)?,
        PacketKind::Freq => toss_freq(ctx, &sender, &packet, &mut envelope, opts)?,
        PacketKind::Exec => toss_exec(ctx, &sender, &packet, &mut envelope, opts)?,
        PacketKind::Trns => toss_trns(ctx, &packet, job.nice, size, &mut envelope, opts)?,
    };

    match &delivery {
        Delivery::File { dst, size } => {
            tracing::info!(pkt = %job.name, sender = %sender.name, kind = "file", dst = %dst, size, dry_run = opts.dry_run, "tossed")
        }
        Delivery::Freq { src } => {
            tracing::info!(pkt = %job.name, sender = %sender.name, kind = "freq", src = %src, dry_run = opts.dry_run, "tossed")
        }
        Delivery::Exec | Delivery::Trns => {
            tracing::info!(pkt = %job.name, sender = %sender.name, kind = %packet.kind, dry_run = opts.dry_run, "tossed")
        }
    }
    if opts.dry_run {
        return Ok(Outcome::Delivered);
    }

    retire(job, opts.do_seen)?;
    match delivery {
        Delivery::File { dst, size } => ctx.notifier.file_received(&sender.name, &dst, size),
        Delivery::Freq { src } => ctx.notifier.freq_served(&sender.name, &src),
        Delivery::Exec | Delivery::Trns => {}
    }
    Ok(Outcome::Delivered)
}

/// Seen marker first, so a crash before the delete still leaves evidence.
fn retire(job: &Job, do_seen: bool) -> Result<(), TossError> {
    if do_seen {
        job.mark_seen()
            .map_err(|e| TossError::io(format!("mark {} seen", job.name), e))?;
    }
    job.remove()
        .map_err(|e| TossError::io(format!("remove {}", job.name), e))
}

/// Read and authenticate the rest of a body without using it.
fn drain<R: Read>(mut body: R) -> Result<u64, TossError> {
    Ok(io::copy(&mut body, &mut io::sink())?)
}

// ── File ──────────────────────────────────────────────────────────────────────

fn toss_file<R: Read>(sender: &Node, packet: &Packet, body: R, opts: &TossOptions) -> Result<Delivery, TossError> {
    let dst = packet.path_str()?.to_owned();
    let rel = relative_path(&dst)?;
    let incoming = match &sender.incoming {
        Some(dir) if sender.permits(Capability::FileDelivery) => dir,
        _ => {
            return Err(TossError::NotPermitted {
                node: sender.name.clone(),
                what: "deliver files",
            })
        }
    };
    let target = incoming.join(rel);

    if opts.dry_run {
        let size = drain(body)?;
        return Ok(Delivery::File { dst, size });
    }
    if let Some(dir) = target.parent() {
        create_private_dirs(dir).map_err(|e| TossError::io(format!("mkdir {}", dir.display()), e))?;
    }
    let (placed, size) = placement::write_new(&target, body)?;
    tracing::debug!(sender = %sender.name, path = %placed.display(), size, "written");
    Ok(Delivery::File { dst, size })
}

#[cfg(unix)]
fn create_private_dirs(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dirs(dir: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).create(dir)
}

/// A packet path as a relative path that cannot climb out of its root.
pub fn relative_path(raw: &str) -> Result<PathBuf, TossError> {
    let bad = || TossError::BadPath(raw.to_string());
    let mut rel = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(bad()),
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(bad());
    }
    Ok(rel)
}

// ── Freq ──────────────────────────────────────────────────────────────────────

fn toss_freq<R: Read>(
    ctx: &Context,
    sender: &Node,
    packet: &Packet,
    body: R,
    opts: &TossOptions,
) -> Result<Delivery, TossError> {
    let src = packet.path_str()?.to_owned();
    let rel = relative_path(&src)?;
    let freq = match &sender.freq {
        Some(freq) if sender.permits(Capability::FileRequest) => freq,
        _ => {
            return Err(TossError::NotPermitted {
                node: sender.name.clone(),
                what: "request files",
            })
        }
    };

    let mut dst = Vec::new();
    body.take(MAX_PATH_SIZE as u64 + 1).read_to_end(&mut dst)?;
    if dst.len() > MAX_PATH_SIZE {
        return Err(WireError::PathTooLong(dst.len()).into());
    }
    let dst = String::from_utf8(dst).map_err(|_| WireError::BadPath)?;
    if opts.dry_run {
        return Ok(Delivery::Freq { src });
    }

    let source = freq.root.join(rel);
    match freq.chunked {
        Some(chunk_size) => {
            tx::tx_file_chunked(ctx, sender, packet.nice, &source, &dst, freq.min_size, chunk_size)?;
        }
        None => {
            tx::tx_file(ctx, sender, packet.nice, &source, &dst, freq.min_size)?;
        }
    }
    tracing::debug!(sender = %sender.name, src = %src, dst = %dst, "reply queued");
    Ok(Delivery::Freq { src })
}

// ── Exec ──────────────────────────────────────────────────────────────────────

fn toss_exec<R: Read>(
    ctx: &Context,
    sender: &Node,
    packet: &Packet,
    body: R,
    opts: &TossOptions,
) -> Result<Delivery, TossError> {
    let (handle, args) = packet.exec_parts()?;
    let (program, fixed) = match sender.exec.get(&handle).and_then(|c| c.split_first()) {
        Some(parts) if sender.permits(Capability::Exec(&handle)) => parts,
        _ => {
            return Err(TossError::UnknownHandle {
                node: sender.name.clone(),
                handle,
            })
        }
    };
    let mut input = ZlibDecoder::new(body);
    if opts.dry_run {
        return drain(input).map(|_| Delivery::Exec);
    }

    let mut child = Command::new(program)
        .args(fixed)
        .args(&args)
        .env("NNCP_SELF", ctx.local.id.to_string())
        .env("NNCP_SENDER", sender.id.to_string())
        .env("NNCP_NICE", packet.nice.to_string())
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| TossError::io(format!("spawn {handle}"), e))?;

    let fed = match child.stdin.take() {
        Some(mut stdin) => io::copy(&mut input, &mut stdin).map(drop),
        None => Ok(()),
    };
    match fed {
        // The command is free to stop reading early.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }
        Ok(()) => {}
    }
    let status = child
        .wait()
        .map_err(|e| TossError::io(format!("wait {handle}"), e))?;
    if !status.success() {
        return Err(TossError::ExecFailed {
            handle,
            status: status.to_string(),
        });
    }
    tracing::debug!(sender = %sender.name, handle = %handle, args = ?args, "executed");
    Ok(Delivery::Exec)
}

// ── Trns ──────────────────────────────────────────────────────────────────────

fn toss_trns<R: Read>(
    ctx: &Context,
    packet: &Packet,
    nice: u8,
    size: u64,
    body: R,
    opts: &TossOptions,
) -> Result<Delivery, TossError> {
    let target_id = packet.trns_target()?;
    let target = ctx.node(&target_id).cloned().ok_or(TossError::UnknownTarget(target_id))?;
    if opts.dry_run {
        drain(body)?;
        return Ok(Delivery::Trns);
    }
    tx::tx_trns(ctx, &target, nice, size, body)?;
    tracing::debug!(dst = %target.name, size, "relayed");
    Ok(Delivery::Trns)
}
