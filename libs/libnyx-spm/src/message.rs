//! Messages handed to the dispatch backend

use crate::config::PSA_MAX_IOVEC;
use crate::handle::PsaHandle;
use crate::service::{ClientId, Sid};
use crate::status::{PsaError, PsaStatus};

/// Address in the client's memory space
pub type ClientAddr = u32;

/// One io-vector descriptor (`psa_invec` / `psa_outvec`)
///
/// `base` is an address in the client's memory. The buffers themselves are
/// never copied by the core; only the descriptors are.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoVec {
    /// Buffer address
    pub base: ClientAddr,
    /// Buffer length in bytes
    pub len: u32,
}

impl IoVec {
    /// Descriptor for `len` bytes at `base`
    pub const fn new(base: ClientAddr, len: u32) -> Self {
        Self { base, len }
    }

    /// All-zero descriptor
    pub const EMPTY: Self = Self { base: 0, len: 0 };
}

/// Message type carried to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Connection request
    Connect,
    /// Service call with a service-defined non-negative type
    Call(i32),
    /// Connection teardown
    Disconnect,
}

impl MessageType {
    /// `PSA_IPC_CONNECT`
    pub const CONNECT: i32 = -1;
    /// `PSA_IPC_CALL`
    pub const CALL: i32 = 0;
    /// `PSA_IPC_DISCONNECT`
    pub const DISCONNECT: i32 = -2;

    /// Wire value
    pub const fn raw(self) -> i32 {
        match self {
            Self::Connect => Self::CONNECT,
            Self::Call(ty) => ty,
            Self::Disconnect => Self::DISCONNECT,
        }
    }

    /// Decode a wire value
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            Self::CONNECT => Some(Self::Connect),
            Self::DISCONNECT => Some(Self::Disconnect),
            ty if ty >= 0 => Some(Self::Call(ty)),
            _ => None,
        }
    }
}

/// Who receives the reply once a message completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOwner {
    /// A co-located secure caller
    Local,
    /// An RPC transport, with the transport's own message handle
    Rpc(u32),
}

/// How the backend disposed of a submitted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Queued; the service runtime will call [`Spm::complete`] later
    ///
    /// [`Spm::complete`]: crate::spm::Spm::complete
    Deferred,
    /// The service answered inside `submit`
    Replied(PsaStatus),
}

/// A prepared message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Connection or static handle the message was sent on
    pub handle: PsaHandle,
    /// Target service
    pub sid: Sid,
    /// Message type
    pub ty: MessageType,
    /// Caller identity
    pub client_id: ClientId,
    /// Reverse handle set by the service
    pub rhandle: usize,
    invecs: [IoVec; PSA_MAX_IOVEC],
    in_len: usize,
    outvecs: [IoVec; PSA_MAX_IOVEC],
    out_len: usize,
    /// Reply routing
    pub reply_to: ReplyOwner,
}

impl Message {
    /// Message without io-vectors
    pub const fn new(
        handle: PsaHandle,
        sid: Sid,
        ty: MessageType,
        client_id: ClientId,
        reply_to: ReplyOwner,
    ) -> Self {
        Self {
            handle,
            sid,
            ty,
            client_id,
            rhandle: 0,
            invecs: [IoVec::EMPTY; PSA_MAX_IOVEC],
            in_len: 0,
            outvecs: [IoVec::EMPTY; PSA_MAX_IOVEC],
            out_len: 0,
            reply_to,
        }
    }

    /// Attach io-vectors
    ///
    /// Fails with `PROGRAMMER_ERROR` if the combined count exceeds
    /// [`PSA_MAX_IOVEC`].
    pub fn set_vectors(&mut self, invecs: &[IoVec], outvecs: &[IoVec]) -> Result<(), PsaError> {
        if invecs.len() + outvecs.len() > PSA_MAX_IOVEC {
            return Err(PsaError::ProgrammerError);
        }
        self.invecs = [IoVec::EMPTY; PSA_MAX_IOVEC];
        self.outvecs = [IoVec::EMPTY; PSA_MAX_IOVEC];
        self.invecs[..invecs.len()].copy_from_slice(invecs);
        self.outvecs[..outvecs.len()].copy_from_slice(outvecs);
        self.in_len = invecs.len();
        self.out_len = outvecs.len();
        Ok(())
    }

    /// Input vectors
    pub fn in_vecs(&self) -> &[IoVec] {
        &self.invecs[..self.in_len]
    }

    /// Output vectors
    pub fn out_vecs(&self) -> &[IoVec] {
        &self.outvecs[..self.out_len]
    }

    /// Output vectors; services shrink `len` to the bytes written
    pub fn out_vecs_mut(&mut self) -> &mut [IoVec] {
        &mut self.outvecs[..self.out_len]
    }
}

/// A completion routed back to its requester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Where the reply goes
    pub owner: ReplyOwner,
    /// Value returned to the client (a handle for a successful connect)
    pub status: PsaStatus,
    outvecs: [IoVec; PSA_MAX_IOVEC],
    out_len: usize,
}

impl Reply {
    pub(crate) fn new(owner: ReplyOwner, status: PsaStatus, outvecs: &[IoVec]) -> Self {
        let out_len = outvecs.len().min(PSA_MAX_IOVEC);
        let mut vecs = [IoVec::EMPTY; PSA_MAX_IOVEC];
        vecs[..out_len].copy_from_slice(&outvecs[..out_len]);
        Self {
            owner,
            status,
            outvecs: vecs,
            out_len,
        }
    }

    /// Output vectors as last updated by the service
    pub fn out_vecs(&self) -> &[IoVec] {
        &self.outvecs[..self.out_len]
    }
}

/// Delivers prepared messages to the target service's runtime
///
/// This is the seam to the scheduler. A thread backend queues the message
/// and returns [`Completion::Deferred`]; a function-call backend runs the
/// service inline and returns [`Completion::Replied`], updating output
/// vector lengths in `msg` as it goes.
pub trait MessageBackend: Send + Sync {
    /// Hand `msg` to the service runtime
    fn submit(&self, msg: &mut Message) -> Result<Completion, PsaError>;
}
