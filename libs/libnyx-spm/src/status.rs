//! Status codes and error types
//!
//! Every externally facing operation reports a [`PsaError`] (or a raw
//! [`PsaStatus`] once it crosses the mailbox). Internal invariant violations
//! never become values: they go through [`spm_panic!`] and abort the current
//! execution context.

use thiserror::Error;

/// Raw PSA status as carried on the wire
pub type PsaStatus = i32;

/// Operation completed successfully
pub const PSA_SUCCESS: PsaStatus = 0;

/// PSA client/service API errors
///
/// Discriminants match the PSA Firmware Framework status values, so
/// `err as i32` is the wire value.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PsaError {
    /// The caller broke the API contract
    #[error("programmer error")]
    ProgrammerError = -129,
    /// Service absent, caller unauthorized, or version unsupported
    #[error("connection refused")]
    ConnectionRefused = -130,
    /// No connection slot free; retry later
    #[error("connection busy")]
    ConnectionBusy = -131,
    /// Unspecified failure
    #[error("generic error")]
    GenericError = -132,
    /// Operation not permitted
    #[error("not permitted")]
    NotPermitted = -133,
    /// Operation not supported
    #[error("not supported")]
    NotSupported = -134,
    /// Malformed arguments (bad io-vectors, untranslatable identity)
    #[error("invalid argument")]
    InvalidArgument = -135,
    /// Handle does not name a live object
    #[error("invalid handle")]
    InvalidHandle = -136,
    /// Object is in the wrong state for the request
    #[error("bad state")]
    BadState = -137,
    /// Output buffer too small
    #[error("buffer too small")]
    BufferTooSmall = -138,
    /// Object already exists
    #[error("already exists")]
    AlreadyExists = -139,
    /// Object does not exist
    #[error("does not exist")]
    DoesNotExist = -140,
    /// Out of memory
    #[error("insufficient memory")]
    InsufficientMemory = -141,
}

impl PsaError {
    /// Wire value of this error
    #[inline]
    pub const fn status(self) -> PsaStatus {
        self as PsaStatus
    }

    /// Decode a wire status; `None` for success or service-defined codes
    pub const fn from_status(status: PsaStatus) -> Option<Self> {
        Some(match status {
            -129 => Self::ProgrammerError,
            -130 => Self::ConnectionRefused,
            -131 => Self::ConnectionBusy,
            -132 => Self::GenericError,
            -133 => Self::NotPermitted,
            -134 => Self::NotSupported,
            -135 => Self::InvalidArgument,
            -136 => Self::InvalidHandle,
            -137 => Self::BadState,
            -138 => Self::BufferTooSmall,
            -139 => Self::AlreadyExists,
            -140 => Self::DoesNotExist,
            -141 => Self::InsufficientMemory,
            _ => return None,
        })
    }

    /// Caller misbehaved; secure callers are aborted rather than told
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::ProgrammerError)
    }

    /// Resource exhaustion: the same request may succeed later
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionBusy | Self::InsufficientMemory)
    }
}

/// Flatten a result into a wire status
#[inline]
pub fn to_status(result: Result<(), PsaError>) -> PsaStatus {
    match result {
        Ok(()) => PSA_SUCCESS,
        Err(err) => err.status(),
    }
}

/// Mailbox-internal errors
///
/// These never reach the non-secure client; they steer the secure-side
/// mailbox agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MailboxError {
    /// No free slot
    #[error("mailbox queue full")]
    QueueFull,
    /// Malformed request or handle
    #[error("invalid mailbox parameters")]
    InvalidParams,
    /// Caller lacks permission
    #[error("mailbox permission denied")]
    NoPerms,
    /// Nothing to do
    #[error("no pending mailbox event")]
    NoPendEvent,
    /// Channel busy
    #[error("mailbox channel busy")]
    ChanBusy,
    /// RPC callbacks could not be registered
    #[error("RPC callback registration failed")]
    CallbackRegError,
    /// Platform initialization failed
    #[error("mailbox initialization failed")]
    InitError,
    /// Unspecified failure
    #[error("mailbox error")]
    GenericError,
}

impl MailboxError {
    /// Wire code (`i32::MIN + n`, leaving zero for success)
    pub const fn code(self) -> i32 {
        i32::MIN
            + match self {
                Self::QueueFull => 1,
                Self::InvalidParams => 2,
                Self::NoPerms => 3,
                Self::NoPendEvent => 4,
                Self::ChanBusy => 5,
                Self::CallbackRegError => 6,
                Self::InitError => 7,
                Self::GenericError => 8,
            }
    }
}

/// Abort the current execution context after logging why
///
/// Used for programmer errors by trusted runtime code and for queue
/// corruption. Returning a value would let a corrupted state machine keep
/// running.
macro_rules! spm_panic {
    ($($arg:tt)+) => {{
        log::error!("SPM panic: {}", format_args!($($arg)+));
        panic!($($arg)+)
    }};
}
pub(crate) use spm_panic;
