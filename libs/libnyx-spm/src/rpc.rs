//! RPC transport registration
//!
//! A transport that relays requests from another domain (the mailbox agent
//! today) registers an [`RpcOps`] implementation here. Service runtimes then
//! route completions through [`Rpc::reply`] without knowing which transport
//! produced the request.

use spin::RwLock;

use crate::message::{IoVec, Reply, ReplyOwner};
use crate::status::{MailboxError, PsaStatus};

/// Capability interface of a relaying transport
pub trait RpcOps: Send + Sync {
    /// New requests are waiting in the transport
    fn handle_req(&self);

    /// Deliver the reply for transport message `token`
    ///
    /// `outvecs` are the output vectors as last updated by the service.
    fn reply(&self, token: u32, status: PsaStatus, outvecs: &[IoVec]);
}

/// Registry holding at most one transport
pub struct Rpc<'a> {
    ops: RwLock<Option<&'a dyn RpcOps>>,
}

impl<'a> Rpc<'a> {
    /// Registry with nothing registered
    pub const fn new() -> Self {
        Self {
            ops: RwLock::new(None),
        }
    }

    /// Register `ops`; fails if a transport is already registered
    pub fn register_ops(&self, ops: &'a dyn RpcOps) -> Result<(), MailboxError> {
        let mut slot = self.ops.write();
        if slot.is_some() {
            log::warn!("RPC ops already registered");
            return Err(MailboxError::CallbackRegError);
        }
        *slot = Some(ops);
        Ok(())
    }

    /// Drop the registered transport
    pub fn unregister_ops(&self) {
        *self.ops.write() = None;
    }

    /// Whether a transport is registered
    pub fn is_registered(&self) -> bool {
        self.ops.read().is_some()
    }

    /// Signal the transport that requests are waiting
    pub fn handle_req(&self) {
        if let Some(ops) = *self.ops.read() {
            ops.handle_req();
        }
    }

    /// Route a completion to its transport
    ///
    /// Replies owned by local callers are not transport traffic and are
    /// ignored. Returns false if the reply was not delivered.
    pub fn reply(&self, reply: &Reply) -> bool {
        let ReplyOwner::Rpc(token) = reply.owner else {
            return false;
        };
        match *self.ops.read() {
            Some(ops) => {
                ops.reply(token, reply.status, reply.out_vecs());
                true
            }
            None => {
                log::warn!("RPC reply for {} dropped: no transport", token);
                false
            }
        }
    }
}

impl Default for Rpc<'_> {
    fn default() -> Self {
        Self::new()
    }
}
