//! Secure-side mailbox agent

use log::{debug, trace, warn};
use spin::Mutex;

use super::layout::{MailboxMsg, MailboxReply, NsMailboxQueue, Request};
use super::queue::SpeQueue;
use super::{ClientMemory, CriticalSection, MailboxHal, MsgHandle, QueueStatus, MAILBOX_MSG_NULL_HANDLE};
use crate::config::{CLIENT_ID_OWNER_MAGIC, NUM_MAILBOX_QUEUE_SLOT};
use crate::message::{Completion, IoVec, ReplyOwner};
use crate::rpc::{Rpc, RpcOps};
use crate::service::ClientId;
use crate::spm::Spm;
use crate::status::{MailboxError, PsaError, PsaStatus};

/// Version queries only depend on the caller's domain
const NS_CALLER: ClientId = -1;

/// Relays requests from the shared [`NsMailboxQueue`] into [`Spm`]
///
/// NS slot `i` is always mirrored into SPE slot `i`. Replies are written
/// back into the same NS slot.
pub struct MailboxAgent<'a, const N: usize = NUM_MAILBOX_QUEUE_SLOT> {
    spm: &'a Spm<'a>,
    hal: &'a dyn MailboxHal,
    memory: &'a dyn ClientMemory,
    ns: &'a NsMailboxQueue<N>,
    queue: Mutex<SpeQueue<N>>,
    ns_slot_count: usize,
}

impl<'a, const N: usize> MailboxAgent<'a, N> {
    /// Set up the agent over `ns`, using its first `ns_slot_count` slots
    pub fn init(
        spm: &'a Spm<'a>,
        hal: &'a dyn MailboxHal,
        memory: &'a dyn ClientMemory,
        ns: &'a NsMailboxQueue<N>,
        ns_slot_count: usize,
    ) -> Result<Self, MailboxError> {
        if ns_slot_count == 0 || ns_slot_count > N || N > QueueStatus::BITS as usize {
            warn!("mailbox: {} NS slots do not fit a {}-slot queue", ns_slot_count, N);
            return Err(MailboxError::InitError);
        }
        debug!("mailbox: agent ready with {} NS slots", ns_slot_count);
        Ok(Self {
            spm,
            hal,
            memory,
            ns,
            queue: Mutex::new(SpeQueue::new(ns_slot_count)),
            ns_slot_count,
        })
    }

    /// Register as the RPC transport
    pub fn register(&'a self, rpc: &Rpc<'a>) -> Result<(), MailboxError> {
        rpc.register_ops(self)
    }

    /// Bitmask of free SPE slots
    pub fn empty_slots(&self) -> QueueStatus {
        self.queue.lock().empty_slots()
    }

    /// Service every request pending at the time of the call
    ///
    /// Returns [`MailboxError::NoPendEvent`] without touching any state when
    /// nothing is pending. Bits raised by the peer during the pass are left
    /// for the next pass.
    pub fn handle_msg(&self) -> Result<(), MailboxError> {
        let pend_slots = {
            let _cs = CriticalSection::enter(self.hal);
            self.ns.status.pending()
        };
        if pend_slots == 0 {
            return Err(MailboxError::NoPendEvent);
        }

        let mut reply_slots: QueueStatus = 0;
        for idx in 0..self.ns_slot_count {
            let mask = 1 << idx;
            if pend_slots & mask == 0 {
                continue;
            }
            let Some(msg) = self.ns.read_msg(idx) else {
                continue;
            };
            let handle = {
                let mut queue = self.queue.lock();
                queue.claim(idx, msg);
                if Self::check_msg(&msg).is_err() {
                    queue.clean(idx);
                    continue;
                }
                SpeQueue::<N>::handle_for(idx)
            };
            trace!("mailbox: slot {} claimed as {}", idx, handle);

            match self.dispatch(idx, handle, &msg) {
                Ok(Some(result)) => {
                    reply_slots |= mask;
                    self.direct_reply(&mut self.queue.lock(), idx, result);
                }
                Ok(None) => trace!("mailbox: slot {} dispatched asynchronously", idx),
                Err(err) => {
                    warn!("mailbox: dropping slot {} (tag {}): {}", idx, msg.call_type, err);
                    self.queue.lock().clean(idx);
                }
            }
        }

        {
            let _cs = CriticalSection::enter(self.hal);
            self.ns.status.clear_pending(pend_slots);
            self.ns.status.set_replied(reply_slots);
        }
        if reply_slots != 0 {
            self.hal.notify_peer();
        }
        Ok(())
    }

    /// Complete the request behind `handle` with `result`
    ///
    /// The null handle addresses slot 0; only one outstanding call may use
    /// it at a time. Replying to an empty slot is a no-op reported as
    /// [`MailboxError::NoPendEvent`].
    pub fn reply_msg(&self, handle: MsgHandle, result: PsaStatus) -> Result<(), MailboxError> {
        if handle == MAILBOX_MSG_NULL_HANDLE {
            debug!("mailbox: null-handle reply routed to slot 0");
        }
        let idx = SpeQueue::<N>::slot_for(handle);
        {
            let mut queue = self.queue.lock();
            if queue.is_empty(idx) {
                return Err(MailboxError::NoPendEvent);
            }
            self.direct_reply(&mut queue, idx, result);
        }

        {
            let _cs = CriticalSection::enter(self.hal);
            self.ns.status.set_replied(1 << idx);
        }
        self.hal.notify_peer();
        Ok(())
    }

    fn check_msg(_msg: &MailboxMsg) -> Result<(), MailboxError> {
        // Decoding rejects malformed content; nothing else to verify yet.
        Ok(())
    }

    /// `Ok(Some(_))` for a synchronous result, `Ok(None)` when the reply
    /// arrives later through [`RpcOps::reply`], `Err` to drop the request
    fn dispatch(
        &self,
        idx: usize,
        handle: MsgHandle,
        msg: &MailboxMsg,
    ) -> Result<Option<PsaStatus>, MailboxError> {
        let result = match Request::decode(msg)? {
            Request::FrameworkVersion => self.spm.framework_version() as PsaStatus,
            Request::Version { sid } => self.spm.version(sid, NS_CALLER) as PsaStatus,
            Request::Call(params) => {
                let staged = self.queue.lock().stage_vectors(idx, &params, self.memory);
                let mut vectors = match staged {
                    Ok(vectors) => vectors,
                    Err(_) => return Ok(Some(PsaError::InvalidArgument.status())),
                };
                let Some(client_id) = self.translate(msg.client_id) else {
                    return Ok(Some(PsaError::InvalidArgument.status()));
                };
                let inputs = vectors;
                match self.spm.call(
                    params.handle,
                    params.ty,
                    inputs.in_vecs(),
                    vectors.out_vecs_mut(),
                    client_id,
                    ReplyOwner::Rpc(handle),
                ) {
                    Ok(Completion::Deferred) => return Ok(None),
                    Ok(Completion::Replied(status)) => {
                        self.queue.lock().update_out_lens(idx, vectors.out_vecs());
                        status
                    }
                    Err(err) => err.status(),
                }
            }
            #[cfg(feature = "connection-based")]
            Request::Connect { sid, version } => {
                let Some(client_id) = self.translate(msg.client_id) else {
                    return Ok(Some(PsaError::InvalidArgument.status()));
                };
                match self.spm.connect(sid, version, client_id, ReplyOwner::Local) {
                    Ok(connected) => connected.handle,
                    Err(err) => err.status(),
                }
            }
            #[cfg(feature = "connection-based")]
            Request::Close { handle: conn } => {
                let Some(client_id) = self.translate(msg.client_id) else {
                    return Ok(Some(PsaError::InvalidArgument.status()));
                };
                match self.spm.close(conn, client_id, ReplyOwner::Local) {
                    Ok(_) => crate::status::PSA_SUCCESS,
                    Err(err) => err.status(),
                }
            }
            #[cfg(not(feature = "connection-based"))]
            Request::Connect { .. } | Request::Close { .. } => {
                return Err(MailboxError::InvalidParams);
            }
        };
        Ok(Some(result))
    }

    fn translate(&self, ns_client_id: ClientId) -> Option<ClientId> {
        let id = self.hal.translate_client_id(CLIENT_ID_OWNER_MAGIC, ns_client_id);
        if id.is_none() {
            warn!("mailbox: cannot translate NS client id {}", ns_client_id);
        }
        id
    }

    fn direct_reply(&self, queue: &mut SpeQueue<N>, idx: usize, result: PsaStatus) {
        queue.copy_back(idx, result, self.memory);
        let ns_idx = queue.ns_reply_slot(idx);
        self.ns.write_reply(ns_idx, MailboxReply { return_val: result });
        queue.clean(idx);
        trace!("mailbox: slot {} replied {}", idx, result);
    }
}

impl<const N: usize> RpcOps for MailboxAgent<'_, N> {
    fn handle_req(&self) {
        if let Err(err) = self.handle_msg() {
            trace!("mailbox: {}", err);
        }
    }

    fn reply(&self, token: u32, status: PsaStatus, outvecs: &[IoVec]) {
        let idx = SpeQueue::<N>::slot_for(token);
        self.queue.lock().update_out_lens(idx, outvecs);
        if let Err(err) = self.reply_msg(token, status) {
            debug!("mailbox: reply for {} ignored: {}", token, err);
        }
    }
}
