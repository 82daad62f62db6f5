//! # libnyx-spm - Secure Partition Manager IPC core
//!
//! The secure-side half of the Nyx TEE firmware: it brokers PSA client calls
//! between callers (secure partitions and the non-secure world) and isolated
//! service partitions, and relays non-secure calls arriving over a
//! cross-core shared-memory mailbox.
//!
//! ## Features
//!
//! - **Connection lifecycle** - `connect`/`call`/`close`/`set_rhandle` over a
//!   fixed connection pool, with fail-closed authorization and versioning
//! - **Mailbox transport** - bitmask-driven request/reply slots shared with
//!   the non-secure core, mirrored into secure-local slots before dispatch
//! - **RPC registry** - transport-agnostic reply routing
//! - **Boot data** - access-controlled reads of the bootloader TLV area
//!
//! ## Quick Start
//!
//! ```no_run
//! use libnyx_spm::prelude::*;
//! # fn demo(dir: &dyn ServiceDirectory, backend: &dyn MessageBackend) -> Result<(), PsaError> {
//! let spm = Spm::new(dir, backend);
//!
//! let conn = spm.connect(0x1000, 1, -1, ReplyOwner::Local)?;
//! let mut out = [IoVec::new(0x2000, 64)];
//! spm.call(conn.handle, 0, &[], &mut out, -1, ReplyOwner::Local)?;
//! spm.close(conn.handle, -1, ReplyOwner::Local)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Refusals come back as [`PsaError`]; mailbox bookkeeping uses
//! [`MailboxError`]. Misuse by trusted runtime code and queue corruption
//! panic instead of returning.
//!
//! ## Cargo features
//!
//! - `connection-based` (default) - connection-based services: `connect`,
//!   `close`, `set_rhandle` and the mailbox CONNECT/CLOSE requests

#![no_std]

#[cfg(test)]
extern crate std;

pub mod boot_data;
pub mod config;
pub mod connection;
pub mod handle;
pub mod mailbox;
pub mod message;
pub mod rpc;
pub mod service;
pub mod spm;
pub mod status;

pub use handle::{PsaHandle, PSA_NULL_HANDLE};
pub use mailbox::{MailboxAgent, MailboxHal, NsMailbox, NsMailboxQueue};
pub use message::{Completion, IoVec, Message, MessageBackend, MessageType, Reply, ReplyOwner};
pub use rpc::{Rpc, RpcOps};
pub use service::{ClientId, ServiceDescriptor, ServiceDirectory, Sid, StaticDirectory};
pub use spm::Spm;
pub use status::{MailboxError, PsaError, PsaStatus, PSA_SUCCESS};

/// Prelude for common imports
pub mod prelude {
    pub use crate::handle::{PsaHandle, PSA_NULL_HANDLE};
    pub use crate::message::{Completion, IoVec, MessageBackend, ReplyOwner};
    pub use crate::service::{ServiceDescriptor, ServiceDirectory, StaticDirectory};
    pub use crate::spm::Spm;
    pub use crate::status::{MailboxError, PsaError, PSA_SUCCESS};
}
