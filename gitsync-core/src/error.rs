//! Error taxonomy for the protocol engine.
//!
//! A concrete, matchable enum rather than a top-level `anyhow::Error`,
//! because callers of this crate need to branch on error *kind*: most
//! variants abort the conversation, while a `RemoteError` carried inside a
//! push result is just data about one rejected ref.

use crate::hash::Hash;
use crate::refs::RefName;
use std::fmt;

/// The phase a per-phase timeout fired during.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Advertisement,
    NegotiationRound,
    PackReceive,
    PackTransmit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Advertisement => "advertisement",
            Self::NegotiationRound => "negotiation round",
            Self::PackReceive => "pack receive",
            Self::PackTransmit => "pack transmit",
        };
        f.write_str(s)
    }
}

pub type GitSyncResult<T> = Result<T, GitSyncError>;

#[derive(Debug, thiserror::Error)]
pub enum GitSyncError {
    #[error("malformed pkt-line frame: {0}")]
    MalformedFrame(String),

    #[error("malformed ref advertisement: {0}")]
    MalformedAdvertisement(String),

    #[error("capability `{0}` was asserted but never advertised by the server")]
    UnknownCapabilityAsserted(String),

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("packfile checksum mismatch")]
    BadChecksum,

    #[error("delta chain exceeded maximum depth of {max}")]
    DeltaChainTooDeep { max: u32 },

    #[error("bad object header: {0}")]
    BadObjectHeader(String),

    #[error("negotiation did not converge within {rounds} rounds")]
    NegotiationStalled { rounds: u32 },

    #[error("object store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("transport timed out during {0}")]
    TransportTimeout(Phase),

    #[error("want `{0}` was not advertised and the server does not allow reachable/tip sha1 wants")]
    WantNotAdvertised(Hash),

    #[error("cannot delete ref `{0}`: server did not advertise delete-refs")]
    DeleteRefsNotSupported(RefName),
}

impl GitSyncError {
    pub fn store<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Store(Box::new(err))
    }

    /// Integrity and syntactic errors abort the conversation; everything else
    /// (e.g. a single rejected ref during push) is surfaced as data instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RemoteError(_))
    }
}
