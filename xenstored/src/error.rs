//! Service error taxonomy
//!
//! Every request-level variant maps onto one of the nul-terminated XSD error
//! strings a peer can receive in an `Error` reply.

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = core::result::Result<T, Error>;

/// Everything that can go wrong inside the service
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed request, bad path or bad arguments
    #[error("invalid request")]
    Invalid,

    /// Path lookup failed
    #[error("no such node")]
    NotFound,

    /// Path longer than the wire maximum, accounted as an allocation failure
    /// on the wire as the original service did
    #[error("path too long")]
    PathTooLong,

    /// A transaction is already in progress for this domain
    #[error("transaction already in progress")]
    TransactionBusy,

    /// Opcode accepted by the protocol but not provided here
    #[error("operation not implemented")]
    Unimplemented,

    /// Payload cannot fit the ring alongside its header
    #[error("payload exceeds ring capacity")]
    PayloadTooBig,

    /// Domain already has a running worker
    #[error("domain {0} is already connected")]
    AlreadyConnected(u16),

    /// No worker is running for the domain
    #[error("domain {0} is not connected")]
    NotConnected(u16),

    /// Every worker slot is taken
    #[error("no worker slot available")]
    SlotsExhausted,

    /// A platform primitive failed
    #[error("platform: {0}")]
    Platform(&'static str),
}

impl Error {
    /// The XSD string carried in an `Error` reply for this error
    ///
    /// Untranslatable errors degrade to `EINVAL`, matching the fallback of
    /// the original error table scan.
    pub fn wire_str(&self) -> &'static str {
        match self {
            Error::Invalid => "EINVAL",
            Error::NotFound => "ENOENT",
            Error::PathTooLong => "ENOMEM",
            Error::TransactionBusy => "EBUSY",
            Error::Unimplemented => "ENOSYS",
            Error::PayloadTooBig => "E2BIG",
            _ => "EINVAL",
        }
    }
}
