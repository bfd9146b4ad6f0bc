//! Tossing errors and their failure classes.

use std::io;

use nncp_core::chunked::ChunkedError;
use nncp_core::envelope::EnvelopeError;
use nncp_core::identity::IdentityError;
use nncp_core::wire::WireError;
use nncp_core::NodeId;
use thiserror::Error;

use crate::lock::LockError;
use crate::spool::SpoolError;

/// How a failure affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Decryption, authentication or digest failure. The job is bad.
    Integrity,
    /// The sender is not allowed to do this. The job is bad.
    Policy,
    /// A side effect of this job failed. The job is bad.
    Io,
    /// Try again later: busy lock, missing chunks.
    Transient,
    /// The run cannot continue.
    Fatal,
}

#[derive(Debug, Error)]
pub enum TossError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("bad packet: {0}")]
    Packet(#[from] WireError),

    #[error("{node} is not allowed to {what}")]
    NotPermitted { node: String, what: &'static str },

    #[error("{node} has no exec handle {handle:?}")]
    UnknownHandle { node: String, handle: String },

    #[error("unknown transit target {0}")]
    UnknownTarget(NodeId),

    #[error("path {0:?} must be relative and stay inside its root")]
    BadPath(String),

    #[error("{handle}: {status}")]
    ExecFailed { handle: String, status: String },

    #[error("{what}: {source}")]
    Io { what: String, source: io::Error },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Spool(#[from] SpoolError),

    /// Listing or opening the spool itself failed.
    #[error("spool unusable: {0}")]
    SpoolRoot(SpoolError),

    #[error(transparent)]
    Chunked(#[from] ChunkedError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl TossError {
    pub fn io(what: impl Into<String>, source: io::Error) -> Self {
        TossError::Io {
            what: what.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TossError::Envelope(EnvelopeError::Io(_)) => ErrorClass::Io,
            TossError::Envelope(_) | TossError::Packet(_) | TossError::Chunked(_) => {
                ErrorClass::Integrity
            }
            TossError::NotPermitted { .. }
            | TossError::UnknownHandle { .. }
            | TossError::UnknownTarget(_)
            | TossError::BadPath(_)
            | TossError::Identity(_) => ErrorClass::Policy,
            TossError::ExecFailed { .. } | TossError::Io { .. } => ErrorClass::Io,
            TossError::Lock(LockError::Busy(_)) => ErrorClass::Transient,
            TossError::Lock(LockError::Io { .. }) | TossError::SpoolRoot(_) => ErrorClass::Fatal,
            TossError::Spool(e) => match e {
                SpoolError::Digest { .. } | SpoolError::Header(_) | SpoolError::Mth(_) => {
                    ErrorClass::Integrity
                }
                SpoolError::Incomplete { .. } | SpoolError::AlreadySeen(_) => ErrorClass::Transient,
                SpoolError::Io { .. } | SpoolError::Source(_) => ErrorClass::Io,
            },
        }
    }
}

impl From<io::Error> for TossError {
    /// Reading through an envelope surfaces authentication failures as I/O
    /// errors; turn those back into integrity errors.
    fn from(e: io::Error) -> Self {
        match EnvelopeError::from(e) {
            EnvelopeError::Io(e) => TossError::io("payload", e),
            other => TossError::Envelope(other),
        }
    }
}

/// Like `From<SpoolError>`, but recovers envelope failures hidden in a
/// packet source.
pub(crate) fn from_spool(e: SpoolError) -> TossError {
    match e {
        SpoolError::Source(inner) => TossError::from(inner),
        other => TossError::Spool(other),
    }
}
