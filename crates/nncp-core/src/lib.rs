//! nncp-core: node identities, keys, the incremental tree hash, on-disk
//! formats and packet envelopes. All other NNCP crates depend on this one.

pub mod chunked;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod identity;
pub mod mth;
pub mod wire;

pub use identity::{LocalNode, Neighbours, Node, NodeId};
pub use wire::{Packet, PacketKind};
