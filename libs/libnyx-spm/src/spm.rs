//! Connection lifecycle controller
//!
//! [`Spm`] implements the PSA client API (`connect`, `call`, `close`,
//! `version`, `framework_version`) and `set_rhandle` against a
//! [`ServiceDirectory`], a [`MessageBackend`] and the [`ConnectionRegistry`].
//!
//! Refusals and exhaustion come back as [`PsaError`] values. Misuse by
//! trusted runtime code aborts through `spm_panic!`. For secure partition
//! callers the `client_*` wrappers make `PROGRAMMER_ERROR` fatal as well;
//! transports relaying non-secure requests report it as a status instead.

use log::{debug, trace, warn};

use crate::config::{PSA_FRAMEWORK_VERSION, PSA_MAX_IOVEC, PSA_VERSION_NONE};
use crate::connection::{ConnectionRegistry, ConnectionStatus};
use crate::handle::{HandleKind, PsaHandle};
use crate::message::{Completion, IoVec, Message, MessageBackend, MessageType, Reply, ReplyOwner};
use crate::service::{is_ns_client, ClientId, ServiceDirectory, ServiceFlags, Sid};
use crate::status::{spm_panic, PsaError, PsaStatus, PSA_SUCCESS};

/// Outcome of a successful connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    /// New connection handle
    pub handle: PsaHandle,
    /// Whether the service has already accepted
    pub completion: Completion,
}

/// Secure partition manager IPC core
pub struct Spm<'a> {
    directory: &'a dyn ServiceDirectory,
    backend: &'a dyn MessageBackend,
    connections: ConnectionRegistry,
}

impl<'a> Spm<'a> {
    /// Build a manager over `directory`, dispatching through `backend`
    pub fn new(directory: &'a dyn ServiceDirectory, backend: &'a dyn MessageBackend) -> Self {
        Self {
            directory,
            backend,
            connections: ConnectionRegistry::new(),
        }
    }

    /// The connection registry
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// The service directory
    pub fn directory(&self) -> &'a dyn ServiceDirectory {
        self.directory
    }

    /// `psa_framework_version`
    pub fn framework_version(&self) -> u32 {
        PSA_FRAMEWORK_VERSION
    }

    /// `psa_version`
    ///
    /// [`PSA_VERSION_NONE`] when the service is absent or hidden from a
    /// non-secure caller.
    pub fn version(&self, sid: Sid, client_id: ClientId) -> u32 {
        match self.directory.lookup(sid) {
            Some(service)
                if !is_ns_client(client_id)
                    || service.flags.contains(ServiceFlags::NS_ACCESSIBLE) =>
            {
                service.version
            }
            _ => PSA_VERSION_NONE,
        }
    }

    /// `psa_connect`
    ///
    /// Checks run in a fixed order and the first failure wins: unknown
    /// service, stateless service, unauthorized caller, unsupported version,
    /// exhausted pool. The record only becomes `Active` once the backend has
    /// accepted the CONNECT message.
    #[cfg(feature = "connection-based")]
    pub fn connect(
        &self,
        sid: Sid,
        version: u32,
        client_id: ClientId,
        reply_to: ReplyOwner,
    ) -> Result<Connected, PsaError> {
        let Some(service) = self.directory.lookup(sid) else {
            warn!("connect: unknown service {:#x}", sid);
            return Err(PsaError::ConnectionRefused);
        };
        if self.directory.is_stateless(service) {
            warn!("connect: service {:#x} is stateless", sid);
            return Err(PsaError::ProgrammerError);
        }
        if !self.directory.is_authorized(sid, service, client_id) {
            warn!("connect: client {} not authorized for {:#x}", client_id, sid);
            return Err(PsaError::ConnectionRefused);
        }
        if !self.directory.version_supported(service, version) {
            warn!("connect: {:#x} does not support version {}", sid, version);
            return Err(PsaError::ConnectionRefused);
        }

        let conn = self
            .connections
            .allocate(sid, client_id, reply_to)
            .ok_or(PsaError::ConnectionBusy)?;
        let handle = conn.handle;
        let mut msg = conn.msg;

        let completion = match self.backend.submit(&mut msg) {
            Ok(completion) => completion,
            Err(err) => {
                warn!("connect: dispatch to {:#x} failed: {}", sid, err);
                self.connections.free(handle);
                return Err(err);
            }
        };
        self.connections
            .with(handle, |c| c.transition(ConnectionStatus::Active));

        if let Completion::Replied(status) = completion {
            if status != PSA_SUCCESS {
                debug!("connect: {:#x} rejected client {} ({})", sid, client_id, status);
                self.connections.free(handle);
                return Err(PsaError::ConnectionRefused);
            }
        }
        debug!("connect: client {} -> {:#x} as {:#x}", client_id, sid, handle);
        Ok(Connected { handle, completion })
    }

    /// `psa_close`
    ///
    /// Closing the null handle succeeds without touching the registry. A
    /// static, unresolvable or foreign handle is a programmer error.
    #[cfg(feature = "connection-based")]
    pub fn close(
        &self,
        handle: PsaHandle,
        client_id: ClientId,
        reply_to: ReplyOwner,
    ) -> Result<Completion, PsaError> {
        match HandleKind::classify(handle) {
            HandleKind::Null => return Ok(Completion::Replied(PSA_SUCCESS)),
            HandleKind::Connection { .. } => {}
            HandleKind::Static { .. } | HandleKind::Invalid => {
                warn!("close: {:#x} is not a connection handle", handle);
                return Err(PsaError::ProgrammerError);
            }
        }

        let mut msg = self
            .connections
            .with(handle, |c| {
                if c.client_id != client_id || c.status != ConnectionStatus::Active {
                    return None;
                }
                c.msg.ty = MessageType::Disconnect;
                c.msg.reply_to = reply_to;
                c.transition(ConnectionStatus::ToFree);
                Some(c.msg)
            })
            .flatten()
            .ok_or_else(|| {
                warn!("close: client {} does not own {:#x}", client_id, handle);
                PsaError::ProgrammerError
            })?;

        match self.backend.submit(&mut msg) {
            Ok(Completion::Replied(_)) => {
                self.connections.reclaim(handle);
                Ok(Completion::Replied(PSA_SUCCESS))
            }
            Ok(Completion::Deferred) => Ok(Completion::Deferred),
            Err(err) => {
                warn!("close: dispatch of {:#x} failed: {}", handle, err);
                self.connections.free(handle);
                Err(err)
            }
        }
    }

    /// `psa_set_rhandle`
    ///
    /// Called by service runtimes only; every misuse is fatal.
    #[cfg(feature = "connection-based")]
    pub fn set_rhandle(&self, handle: PsaHandle, rhandle: usize) {
        if let HandleKind::Static { .. } = HandleKind::classify(handle) {
            spm_panic!("set_rhandle on stateless handle {:#x}", handle);
        }
        let stored = self.connections.with(handle, |c| {
            if c.status == ConnectionStatus::ToFree {
                return false;
            }
            c.msg.rhandle = rhandle;
            true
        });
        match stored {
            Some(true) => trace!("set_rhandle {:#x} = {:#x}", handle, rhandle),
            Some(false) => spm_panic!("set_rhandle on closing connection {:#x}", handle),
            None => spm_panic!("set_rhandle on unknown handle {:#x}", handle),
        }
    }

    /// `psa_call`
    ///
    /// A static handle reaches its stateless service directly; a connection
    /// handle must be `Active` and owned by `client_id`. When the backend
    /// answers inline, output lengths reported by the service are copied
    /// back into `outvecs`.
    pub fn call(
        &self,
        handle: PsaHandle,
        ty: i32,
        invecs: &[IoVec],
        outvecs: &mut [IoVec],
        client_id: ClientId,
        reply_to: ReplyOwner,
    ) -> Result<Completion, PsaError> {
        if ty < 0 || invecs.len() + outvecs.len() > PSA_MAX_IOVEC {
            warn!("call: bad type {} or {} + {} vectors", ty, invecs.len(), outvecs.len());
            return Err(PsaError::ProgrammerError);
        }

        let mut msg = match HandleKind::classify(handle) {
            HandleKind::Static { index, version } => {
                let service = self
                    .directory
                    .lookup_stateless(index)
                    .ok_or(PsaError::ProgrammerError)?;
                if !self.directory.is_stateless(service)
                    || !self.directory.version_supported(service, version)
                    || !self.directory.is_authorized(service.sid, service, client_id)
                {
                    warn!("call: static handle {:#x} refused for client {}", handle, client_id);
                    return Err(PsaError::ProgrammerError);
                }
                Message::new(handle, service.sid, MessageType::Call(ty), client_id, reply_to)
            }
            HandleKind::Connection { .. } => self
                .connections
                .with(handle, |c| {
                    if c.client_id != client_id || c.status != ConnectionStatus::Active {
                        return None;
                    }
                    let mut msg = c.msg;
                    msg.ty = MessageType::Call(ty);
                    msg.reply_to = reply_to;
                    Some(msg)
                })
                .flatten()
                .ok_or_else(|| {
                    warn!("call: client {} has no live connection {:#x}", client_id, handle);
                    PsaError::ProgrammerError
                })?,
            HandleKind::Null | HandleKind::Invalid => return Err(PsaError::ProgrammerError),
        };
        msg.set_vectors(invecs, outvecs)?;

        let completion = self.backend.submit(&mut msg)?;
        if let Completion::Replied(_) = completion {
            for (dst, src) in outvecs.iter_mut().zip(msg.out_vecs()) {
                dst.len = src.len.min(dst.len);
            }
        }
        trace!("call {:#x} type {} -> {:?}", handle, ty, completion);
        Ok(completion)
    }

    /// Complete a message the backend deferred
    ///
    /// Service runtimes call this exactly once per deferred message. The
    /// returned [`Reply`] carries the value for the client: the connection
    /// handle for an accepted CONNECT, `CONNECTION_REFUSED` for a rejected
    /// one, the service status for a CALL.
    pub fn complete(&self, msg: &Message, status: PsaStatus) -> Reply {
        let value = match msg.ty {
            MessageType::Connect if status == PSA_SUCCESS => msg.handle,
            MessageType::Connect => {
                debug!("connect {:#x} rejected by service ({})", msg.handle, status);
                match self.connections.with(msg.handle, |c| c.status) {
                    Some(ConnectionStatus::Active) => {
                        self.connections.free(msg.handle);
                    }
                    // The queued DISCONNECT completion reclaims it
                    Some(ConnectionStatus::ToFree) => {
                        debug!("{:#x} pending teardown, left for disconnect", msg.handle);
                    }
                    _ => {}
                }
                PsaError::ConnectionRefused.status()
            }
            MessageType::Disconnect => {
                if !self.connections.reclaim(msg.handle) {
                    spm_panic!("disconnect completion for {:#x} not pending teardown", msg.handle);
                }
                PSA_SUCCESS
            }
            MessageType::Call(_) => status,
        };
        Reply::new(msg.reply_to, value, msg.out_vecs())
    }

    /// [`Spm::connect`] for secure partition callers
    #[cfg(feature = "connection-based")]
    pub fn client_connect(&self, sid: Sid, version: u32, client_id: ClientId) -> Result<Connected, PsaError> {
        self.connect(sid, version, client_id, ReplyOwner::Local)
            .map_err(|err| Self::check_caller("connect", client_id, err))
    }

    /// [`Spm::close`] for secure partition callers
    #[cfg(feature = "connection-based")]
    pub fn client_close(&self, handle: PsaHandle, client_id: ClientId) -> Result<Completion, PsaError> {
        self.close(handle, client_id, ReplyOwner::Local)
            .map_err(|err| Self::check_caller("close", client_id, err))
    }

    /// [`Spm::call`] for secure partition callers
    pub fn client_call(
        &self,
        handle: PsaHandle,
        ty: i32,
        invecs: &[IoVec],
        outvecs: &mut [IoVec],
        client_id: ClientId,
    ) -> Result<Completion, PsaError> {
        self.call(handle, ty, invecs, outvecs, client_id, ReplyOwner::Local)
            .map_err(|err| Self::check_caller("call", client_id, err))
    }

    fn check_caller(op: &str, client_id: ClientId, err: PsaError) -> PsaError {
        if err.is_fatal() {
            spm_panic!("{}: programmer error from partition {}", op, client_id);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{PartitionInfo, ServiceDescriptor, StaticDirectory};
    use std::vec::Vec;

    struct Inline(PsaStatus);

    impl MessageBackend for Inline {
        fn submit(&self, msg: &mut Message) -> Result<Completion, PsaError> {
            for vec in msg.out_vecs_mut() {
                vec.len /= 2;
            }
            Ok(Completion::Replied(self.0))
        }
    }

    fn services() -> Vec<ServiceDescriptor> {
        std::vec![
            ServiceDescriptor::new("svc", 0x10, 1, 1).ns_accessible(),
            ServiceDescriptor::new("hidden", 0x20, 3, 1),
            ServiceDescriptor::new("hash", 0x30, 1, 1).ns_accessible().stateless(2),
        ]
    }

    #[test]
    fn test_version_visibility() {
        let services = services();
        let partitions = [PartitionInfo::new(5, &[0x20])];
        let dir = StaticDirectory::new(&services, &partitions);
        let backend = Inline(PSA_SUCCESS);
        let spm = Spm::new(&dir, &backend);

        assert_eq!(spm.framework_version(), PSA_FRAMEWORK_VERSION);
        assert_eq!(spm.version(0x10, -1), 1);
        assert_eq!(spm.version(0x20, -1), PSA_VERSION_NONE);
        assert_eq!(spm.version(0x20, 5), 3);
        assert_eq!(spm.version(0x99, 5), PSA_VERSION_NONE);
    }

    #[test]
    fn test_inline_call_copies_lengths() {
        let services = services();
        let dir = StaticDirectory::new(&services, &[]);
        let backend = Inline(7);
        let spm = Spm::new(&dir, &backend);

        let handle = crate::handle::static_handle(2, 1);
        let mut out = [IoVec::new(0x400, 16)];
        let result = spm.call(handle, 0, &[IoVec::new(0x100, 4)], &mut out, -1, ReplyOwner::Local);
        assert_eq!(result, Ok(Completion::Replied(7)));
        assert_eq!(out[0].len, 8);
    }

    #[test]
    fn test_call_rejects_negative_type() {
        let services = services();
        let dir = StaticDirectory::new(&services, &[]);
        let backend = Inline(PSA_SUCCESS);
        let spm = Spm::new(&dir, &backend);
        let handle = crate::handle::static_handle(2, 1);
        assert_eq!(
            spm.call(handle, -1, &[], &mut [], -1, ReplyOwner::Local),
            Err(PsaError::ProgrammerError)
        );
    }

    #[cfg(feature = "connection-based")]
    #[test]
    fn test_inline_rejection_frees_record() {
        let services = services();
        let dir = StaticDirectory::new(&services, &[]);
        let backend = Inline(PsaError::NotPermitted.status());
        let spm = Spm::new(&dir, &backend);

        assert_eq!(spm.connect(0x10, 1, -1, ReplyOwner::Local), Err(PsaError::ConnectionRefused));
        assert_eq!(spm.connections().in_use(), 0);
    }

    #[cfg(feature = "connection-based")]
    #[test]
    #[should_panic(expected = "programmer error")]
    fn test_secure_client_programmer_error_is_fatal() {
        let services = services();
        let partitions = [PartitionInfo::new(5, &[0x30])];
        let dir = StaticDirectory::new(&services, &partitions);
        let backend = Inline(PSA_SUCCESS);
        let spm = Spm::new(&dir, &backend);
        let _ = spm.client_connect(0x30, 1, 5);
    }
}
