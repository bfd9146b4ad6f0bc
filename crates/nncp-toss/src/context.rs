//! Everything a toss, check or tx operation needs to know about this node.

use std::sync::Arc;

use nncp_core::config::Resolved;
use nncp_core::{LocalNode, Neighbours, Node, NodeId};

use crate::notify::Notifier;
use crate::spool::{Spool, SpoolError};

/// Shared, read-only state. Cheap to clone into per-node worker tasks.
#[derive(Debug, Clone)]
pub struct Context {
    pub spool: Spool,
    pub local: Arc<LocalNode>,
    pub neighbours: Arc<Neighbours>,
    pub notifier: Notifier,
}

impl Context {
    pub fn new(spool: Spool, local: Arc<LocalNode>, neighbours: Arc<Neighbours>) -> Self {
        Self {
            spool,
            local,
            neighbours,
            notifier: Notifier::disabled(),
        }
    }

    /// Open the spool named by a validated configuration and wire up
    /// notifications from it.
    pub fn from_resolved(resolved: &Resolved) -> Result<Self, SpoolError> {
        let spool = Spool::open(&resolved.spool)?;
        let notifier = Notifier::from_config(&resolved.neighbours, &resolved.local.id, &resolved.notify);
        Ok(Self {
            spool,
            local: resolved.local.clone(),
            neighbours: resolved.neighbours.clone(),
            notifier,
        })
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<Node>> {
        self.neighbours.get(id)
    }
}
