//! NNCP integration test harness.
//!
//! Every test builds a small network of nodes that live entirely on the
//! local filesystem: each node has its own spool, incoming and freq
//! directories under a per-test temp root. A "call" between two nodes is
//! simulated by `deliver`, which moves packets from the sender's tx queue
//! into the receiver's rx queue through the resumable receive path.
//!
//!   cargo test --test integration
//!
//! Tests never share a root, so they run in parallel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use std::io::{Read, Seek, SeekFrom, Write};

use nncp_core::identity::FreqPolicy;
use nncp_core::{LocalNode, Neighbours, Node, NodeId};
use nncp_toss::spool::{Direction, Spool};
use nncp_toss::Context;

mod delivery;
mod exec;
mod freq;
mod queue;
mod relay;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Removes the test root on drop, including on panic.
pub struct TempRoot(PathBuf);

impl TempRoot {
    pub fn new(tag: &str) -> Self {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("nncp-it-{tag}-{}-{id}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// A set of nodes that all know each other's keys.
pub struct Net {
    pub root: TempRoot,
    peers: Vec<(String, Arc<LocalNode>)>,
}

impl Net {
    pub fn new(tag: &str, names: &[&str]) -> Self {
        Self {
            root: TempRoot::new(tag),
            peers: names
                .iter()
                .map(|n| (n.to_string(), Arc::new(LocalNode::generate())))
                .collect(),
        }
    }

    pub fn local(&self, name: &str) -> &Arc<LocalNode> {
        &self
            .peers
            .iter()
            .find(|(n, _)| n == name)
            .unwrap_or_else(|| panic!("no peer {name}"))
            .1
    }

    pub fn id(&self, name: &str) -> NodeId {
        self.local(name).id
    }

    /// Where `name` stores files delivered by its neighbours.
    pub fn incoming(&self, name: &str) -> PathBuf {
        self.root.path().join(name).join("in")
    }

    /// What `name` serves to file requests.
    pub fn public(&self, name: &str) -> PathBuf {
        self.root.path().join(name).join("pub")
    }

    /// `name`'s view of the network with default permissions: every
    /// neighbour may deliver files and request files.
    pub fn ctx(&self, name: &str) -> Context {
        self.ctx_with(name, |_| true)
    }

    /// Like `ctx`, with a hook that can adjust each neighbour record or
    /// drop it (return false) from `name`'s configuration.
    pub fn ctx_with(&self, name: &str, mut setup: impl FnMut(&mut Node) -> bool) -> Context {
        let local = self.local(name).clone();
        let mut neighbours = Neighbours::new();
        for (peer, key) in &self.peers {
            if peer == name {
                continue;
            }
            let mut node = Node::from_local(peer.as_str(), key);
            node.incoming = Some(self.incoming(name));
            node.freq = Some(FreqPolicy {
                root: self.public(name),
                chunked: None,
                min_size: 0,
            });
            if setup(&mut node) {
                neighbours.insert(node).unwrap();
            }
        }
        let spool = Spool::open(self.root.path().join(name).join("spool")).unwrap();
        Context::new(spool, local, Arc::new(neighbours))
    }
}

/// `ctx`'s record for a neighbour.
pub fn peer(ctx: &Context, id: &NodeId) -> Arc<Node> {
    ctx.node(id).cloned().unwrap_or_else(|| panic!("{id} is not a neighbour"))
}

/// Simulate a call: move every packet queued in `from` for `to` into `to`'s
/// rx queue. Returns how many packets moved.
pub fn deliver(from: &Context, to: &Context) -> Result<usize> {
    let mut moved = 0;
    for job in from.spool.jobs(&to.local.id, Direction::Tx)? {
        let mut incoming = to
            .spool
            .incoming(&from.local.id, Direction::Rx, job.digest, job.size)
            .context("start receiving")?;
        let mut file = job.open()?;
        file.seek(SeekFrom::Start(incoming.offset()))?;
        std::io::copy(&mut file, &mut incoming)?;
        incoming.finish().context("finish receiving")?;
        job.remove()?;
        moved += 1;
    }
    Ok(moved)
}

/// Like `deliver` for a single packet, but the session drops after `cut`
/// bytes and a second session sends the rest.
pub fn deliver_interrupted(from: &Context, to: &Context, cut: u64) -> Result<()> {
    let job = from
        .spool
        .jobs(&to.local.id, Direction::Tx)?
        .next()
        .context("nothing queued")?;
    let data = std::fs::read(&job.path)?;

    let mut first = to.spool.incoming(&from.local.id, Direction::Rx, job.digest, job.size)?;
    first.write_all(&data[..cut as usize])?;
    drop(first);

    let mut second = to.spool.incoming(&from.local.id, Direction::Rx, job.digest, job.size)?;
    anyhow::ensure!(second.offset() == cut, "resumed at {} instead of {cut}", second.offset());
    second.write_all(&data[cut as usize..])?;
    second.finish()?;
    job.remove()?;
    Ok(())
}

/// Number of packets waiting in `ctx`'s queue for `node`.
pub fn queued(ctx: &Context, node: &NodeId, direction: Direction) -> usize {
    ctx.spool.jobs(node, direction).map(Iterator::count).unwrap_or(0)
}

pub fn read_to_string(path: &Path) -> String {
    let mut s = String::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_string(&mut s))
        .unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    s
}

pub fn write_file(path: &Path, data: &[u8]) {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).unwrap();
    }
    std::fs::write(path, data).unwrap();
}
