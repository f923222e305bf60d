//! Crate-wide error taxonomy.
//!
//! Validation failures at the wire boundary are silently dropped by the handler that encounters
//! them and never reach this type; `Error` is for failures a caller of this
//! crate's public API needs to observe — a local signed-seq conflict, a failed lookup, a
//! hole-punch that didn't make it.

use crate::identity::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed wire payload: {0}")]
    Malformed(&'static str),

    #[error("mutable put rejected: seq {seq} already used with a different value")]
    SeqReused { seq: u64 },

    #[error("mutable put rejected: seq {seq} is not newer than the stored seq {stored}")]
    SeqTooLow { seq: u64, stored: u64 },

    #[error("immutable put rejected: hash(value) != target")]
    TargetMismatch,

    #[error("value exceeds the 1000-byte limit ({len} bytes)")]
    ValueTooLarge { len: usize },

    #[error("no peer record found for target {0}")]
    PeerNotFound(Hash),

    #[error("hole-punch aborted by a local or remote veto")]
    HolepunchAborted,

    #[error("hole-punch timed out before a 5-tuple was locked")]
    HolepunchTimeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("server is not listening")]
    NotListening,

    #[error("server or socket already closed")]
    AlreadyClosed,

    #[error("DHT RPC failed: {0}")]
    Rpc(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The compact numeric codes actually carried on the wire. Only a subset of
/// [`Error`] variants are meaningful to a remote peer; the rest are purely local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireError {
    SeqReused = 0,
    SeqTooLow = 1,
    InvalidSignature = 2,
    PeerNotFound = 3,
    HolepunchAborted = 4,
    HolepunchTimeout = 5,
}

impl TryFrom<u8> for WireError {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(WireError::SeqReused),
            1 => Ok(WireError::SeqTooLow),
            2 => Ok(WireError::InvalidSignature),
            3 => Ok(WireError::PeerNotFound),
            4 => Ok(WireError::HolepunchAborted),
            5 => Ok(WireError::HolepunchTimeout),
            _ => Err(Error::Malformed("unknown wire error code")),
        }
    }
}

impl From<WireError> for u8 {
    fn from(value: WireError) -> Self {
        value as u8
    }
}

impl TryFrom<&Error> for WireError {
    type Error = ();

    fn try_from(error: &Error) -> Result<Self, ()> {
        match error {
            Error::SeqReused { .. } => Ok(WireError::SeqReused),
            Error::SeqTooLow { .. } => Ok(WireError::SeqTooLow),
            Error::InvalidSignature => Ok(WireError::InvalidSignature),
            Error::PeerNotFound(_) => Ok(WireError::PeerNotFound),
            Error::HolepunchAborted => Ok(WireError::HolepunchAborted),
            Error::HolepunchTimeout => Ok(WireError::HolepunchTimeout),
            _ => Err(()),
        }
    }
}
