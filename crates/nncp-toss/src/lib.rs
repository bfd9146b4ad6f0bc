//! nncp-toss: the spool, its locks, outbound packet production and the
//! tossing engine that turns received packets into files, replies, command
//! runs and relayed packets.

pub mod check;
pub mod chunked;
pub mod context;
pub mod error;
pub mod lock;
pub mod notify;
pub mod placement;
pub mod spool;
pub mod toss;
pub mod tx;

pub use check::{check, CheckReport};
pub use context::Context;
pub use error::{ErrorClass, TossError};
pub use spool::{Direction, Spool};
pub use toss::{toss, TossOptions, TossReport};
