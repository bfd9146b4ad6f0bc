//! Offline integrity sweep over a node's queues.
//!
//! Every packet file is re-hashed and compared with the digest in its name.
//! Mismatches are reported and logged; nothing is deleted or moved.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use nncp_core::mth::{tree_hash, Digest};
use nncp_core::NodeId;

use crate::context::Context;
use crate::error::TossError;
use crate::spool::Direction;
use crate::toss::LOCK_PURPOSE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub checked: usize,
    /// Packets whose content does not match their name, or could not be read.
    pub bad: Vec<PathBuf>,
}

impl CheckReport {
    pub fn is_bad(&self) -> bool {
        !self.bad.is_empty()
    }
}

/// Verify every packet in `node`'s rx and tx queues.
pub fn check(ctx: &Context, node: &NodeId) -> Result<CheckReport, TossError> {
    let _lock = ctx.spool.lock(node, LOCK_PURPOSE)?;
    let mut report = CheckReport::default();
    for direction in [Direction::Rx, Direction::Tx] {
        let jobs = ctx.spool.jobs(node, direction).map_err(TossError::SpoolRoot)?;
        for job in jobs {
            report.checked += 1;
            match file_digest(&job.path) {
                Ok(got) if got == job.digest => {
                    tracing::debug!(node = %node, dir = %direction, pkt = %job.name, "ok");
                }
                Ok(got) => {
                    tracing::error!(
                        node = %node,
                        dir = %direction,
                        pkt = %job.name,
                        got = %hex::encode(got),
                        "digest mismatch"
                    );
                    report.bad.push(job.path);
                }
                Err(e) => {
                    tracing::error!(node = %node, dir = %direction, pkt = %job.name, err = %e, "unreadable");
                    report.bad.push(job.path);
                }
            }
        }
    }
    tracing::info!(node = %node, checked = report.checked, bad = report.bad.len(), "check finished");
    Ok(report)
}

fn file_digest(path: &Path) -> io::Result<Digest> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(tree_hash(&[]));
    }
    // Safety: opened read-only, the mapping is dropped before returning
    let map = unsafe { Mmap::map(&file)? };
    Ok(tree_hash(&map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::Spool;
    use nncp_core::{LocalNode, Neighbours};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn context() -> Context {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("nncp-check-test-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        Context::new(
            Spool::open(dir).unwrap(),
            Arc::new(LocalNode::generate()),
            Arc::new(Neighbours::new()),
        )
    }

    #[test]
    fn clean_queues_pass() {
        let ctx = context();
        let node = NodeId::from_bytes([4; 32]);
        ctx.spool.enqueue(&node, Direction::Rx, &b"one"[..]).unwrap();
        ctx.spool.enqueue(&node, Direction::Tx, &b"two"[..]).unwrap();
        ctx.spool.enqueue(&node, Direction::Tx, &b""[..]).unwrap();

        let report = check(&ctx, &node).unwrap();
        assert_eq!(report.checked, 3);
        assert!(!report.is_bad());
        let _ = std::fs::remove_dir_all(ctx.spool.root());
    }

    #[test]
    fn corruption_is_reported_not_removed() {
        let ctx = context();
        let node = NodeId::from_bytes([5; 32]);
        let stored = ctx.spool.enqueue(&node, Direction::Tx, &vec![7u8; 5000][..]).unwrap();
        let mut data = std::fs::read(&stored.path).unwrap();
        data[4000] ^= 1;
        std::fs::write(&stored.path, data).unwrap();

        let report = check(&ctx, &node).unwrap();
        assert_eq!(report.bad, vec![stored.path.clone()]);
        assert!(stored.path.exists());
        let _ = std::fs::remove_dir_all(ctx.spool.root());
    }

    #[test]
    fn busy_lock_fails_fast() {
        let ctx = context();
        let node = NodeId::from_bytes([6; 32]);
        let _held = ctx.spool.lock(&node, LOCK_PURPOSE).unwrap();
        let err = check(&ctx, &node).unwrap_err();
        assert!(matches!(err, TossError::Lock(ref e) if e.is_busy()));
        let _ = std::fs::remove_dir_all(ctx.spool.root());
    }
}
