//! Secure-local mirror of the mailbox queue
//!
//! Requests are copied here before dispatch and io-vector descriptors are
//! staged into the shadow table, so nothing the non-secure side writes after
//! the claim can affect an in-flight request.

use log::warn;

use super::layout::{CallParams, MailboxMsg};
use super::{ClientMemory, MsgHandle, QueueStatus, MAILBOX_MSG_NULL_HANDLE};
use crate::config::PSA_MAX_IOVEC;
use crate::message::{ClientAddr, IoVec};
use crate::status::{spm_panic, MailboxError, PsaStatus, PSA_SUCCESS};

/// Staged io-vectors of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Vectors {
    in_vec: [IoVec; PSA_MAX_IOVEC],
    in_len: usize,
    out_vec: [IoVec; PSA_MAX_IOVEC],
    out_len: usize,
    /// Caller's output vector array, for copying lengths back
    ns_out_vec: ClientAddr,
    in_use: bool,
}

impl Vectors {
    const EMPTY: Self = Self {
        in_vec: [IoVec::EMPTY; PSA_MAX_IOVEC],
        in_len: 0,
        out_vec: [IoVec::EMPTY; PSA_MAX_IOVEC],
        out_len: 0,
        ns_out_vec: 0,
        in_use: false,
    };

    pub(crate) fn in_vecs(&self) -> &[IoVec] {
        &self.in_vec[..self.in_len]
    }

    pub(crate) fn out_vecs(&self) -> &[IoVec] {
        &self.out_vec[..self.out_len]
    }

    pub(crate) fn out_vecs_mut(&mut self) -> &mut [IoVec] {
        &mut self.out_vec[..self.out_len]
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    msg: MailboxMsg,
    msg_handle: MsgHandle,
    ns_slot_idx: usize,
}

impl Entry {
    const EMPTY: Self = Self {
        msg: MailboxMsg::ZERO,
        msg_handle: MAILBOX_MSG_NULL_HANDLE,
        ns_slot_idx: 0,
    };
}

pub(crate) struct SpeQueue<const N: usize> {
    entries: [Entry; N],
    vectors: [Vectors; N],
    empty_slots: QueueStatus,
    ns_slot_count: usize,
}

impl<const N: usize> SpeQueue<N> {
    pub(crate) const fn new(ns_slot_count: usize) -> Self {
        Self {
            entries: [Entry::EMPTY; N],
            vectors: [Vectors::EMPTY; N],
            empty_slots: Self::all_slots(),
            ns_slot_count,
        }
    }

    const fn all_slots() -> QueueStatus {
        if N >= 32 {
            QueueStatus::MAX
        } else {
            (1 << N) - 1
        }
    }

    /// Handle for slot `idx`; never the null handle
    pub(crate) const fn handle_for(idx: usize) -> MsgHandle {
        (idx + 1) as MsgHandle
    }

    /// Slot addressed by `handle`; the null handle means slot 0
    pub(crate) const fn slot_for(handle: MsgHandle) -> usize {
        if handle == MAILBOX_MSG_NULL_HANDLE {
            0
        } else {
            (handle - 1) as usize
        }
    }

    /// Out-of-range slots read as occupied
    pub(crate) fn is_empty(&self, idx: usize) -> bool {
        idx < N && self.empty_slots & (1 << idx) != 0
    }

    pub(crate) fn empty_slots(&self) -> QueueStatus {
        self.empty_slots
    }

    /// Take slot `idx` for the request copied from NS slot `idx`
    pub(crate) fn claim(&mut self, idx: usize, msg: MailboxMsg) {
        if idx >= N {
            spm_panic!("mailbox claim of slot {} beyond {}", idx, N);
        }
        self.empty_slots &= !(1 << idx);
        self.entries[idx] = Entry {
            msg,
            msg_handle: Self::handle_for(idx),
            ns_slot_idx: idx,
        };
    }

    pub(crate) fn msg_handle(&self, idx: usize) -> Option<MsgHandle> {
        self.entries.get(idx).map(|e| e.msg_handle)
    }

    /// Zero slot `idx` and mark it free
    pub(crate) fn clean(&mut self, idx: usize) {
        if idx >= N {
            return;
        }
        self.entries[idx] = Entry::EMPTY;
        self.vectors[idx] = Vectors::EMPTY;
        self.empty_slots |= 1 << idx;
    }

    /// NS slot that receives the reply for slot `idx`
    ///
    /// An index outside either queue means the bookkeeping is corrupt.
    pub(crate) fn ns_reply_slot(&self, idx: usize) -> usize {
        if idx >= N {
            spm_panic!("mailbox reply for slot {} beyond {}", idx, N);
        }
        let ns_idx = self.entries[idx].ns_slot_idx;
        if ns_idx >= N || ns_idx >= self.ns_slot_count {
            spm_panic!("mailbox slot {} maps to invalid NS slot {}", idx, ns_idx);
        }
        ns_idx
    }

    /// Copy the caller's io-vectors for slot `idx` into the shadow table
    pub(crate) fn stage_vectors(
        &mut self,
        idx: usize,
        params: &CallParams,
        memory: &dyn ClientMemory,
    ) -> Result<Vectors, MailboxError> {
        let in_len = params.in_len as usize;
        let out_len = params.out_len as usize;

        if (params.in_vec == 0 && in_len != 0) || (params.out_vec == 0 && out_len != 0) {
            return Err(MailboxError::InvalidParams);
        }
        if in_len > PSA_MAX_IOVEC || out_len > PSA_MAX_IOVEC || in_len + out_len > PSA_MAX_IOVEC {
            return Err(MailboxError::InvalidParams);
        }
        let vectors = self.vectors.get_mut(idx).ok_or(MailboxError::InvalidParams)?;

        let mut staged = Vectors::EMPTY;
        if in_len > 0 {
            memory
                .read_iovecs(params.in_vec, &mut staged.in_vec[..in_len])
                .map_err(|fault| {
                    warn!("mailbox: input vectors unreadable at {:#x}", fault.addr);
                    MailboxError::InvalidParams
                })?;
        }
        if out_len > 0 {
            memory
                .read_iovecs(params.out_vec, &mut staged.out_vec[..out_len])
                .map_err(|fault| {
                    warn!("mailbox: output vectors unreadable at {:#x}", fault.addr);
                    MailboxError::InvalidParams
                })?;
        }
        staged.in_len = in_len;
        staged.out_len = out_len;
        staged.ns_out_vec = params.out_vec;
        staged.in_use = true;

        *vectors = staged;
        Ok(staged)
    }

    /// Record output lengths reported by the service
    ///
    /// Lengths never grow past what the caller supplied.
    pub(crate) fn update_out_lens(&mut self, idx: usize, outvecs: &[IoVec]) {
        let Some(vectors) = self.vectors.get_mut(idx) else {
            return;
        };
        if !vectors.in_use {
            return;
        }
        for (shadow, reported) in vectors.out_vecs_mut().iter_mut().zip(outvecs) {
            shadow.len = reported.len.min(shadow.len);
        }
    }

    /// Write staged output lengths back to the caller when `result` is success
    pub(crate) fn copy_back(&mut self, idx: usize, result: PsaStatus, memory: &dyn ClientMemory) {
        let Some(vectors) = self.vectors.get_mut(idx) else {
            return;
        };
        if vectors.in_use && result == PSA_SUCCESS {
            for (i, vec) in vectors.out_vec[..vectors.out_len].iter().enumerate() {
                if let Err(fault) = memory.write_iovec_len(vectors.ns_out_vec, i, vec.len) {
                    warn!("mailbox: output length write-back failed at {:#x}", fault.addr);
                }
            }
        }
        vectors.in_use = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MemoryFault;

    struct NoMemory;

    impl ClientMemory for NoMemory {
        fn read_iovecs(&self, addr: ClientAddr, _out: &mut [IoVec]) -> Result<(), MemoryFault> {
            Err(MemoryFault { addr })
        }

        fn write_iovec_len(&self, addr: ClientAddr, _index: usize, _len: u32) -> Result<(), MemoryFault> {
            Err(MemoryFault { addr })
        }
    }

    fn params(in_len: u32, out_len: u32) -> CallParams {
        CallParams {
            handle: 1,
            ty: 0,
            in_vec: 0,
            in_len,
            out_vec: 0,
            out_len,
        }
    }

    #[test]
    fn test_handles_skip_zero() {
        assert_eq!(SpeQueue::<4>::handle_for(0), 1);
        assert_eq!(SpeQueue::<4>::slot_for(1), 0);
        assert_eq!(SpeQueue::<4>::slot_for(MAILBOX_MSG_NULL_HANDLE), 0);
        assert_eq!(SpeQueue::<4>::slot_for(4), 3);
    }

    #[test]
    fn test_claim_and_clean() {
        let mut queue = SpeQueue::<4>::new(4);
        assert_eq!(queue.empty_slots(), 0b1111);
        queue.claim(2, MailboxMsg::ZERO);
        assert!(!queue.is_empty(2));
        assert_eq!(queue.msg_handle(2), Some(3));
        assert_eq!(queue.ns_reply_slot(2), 2);
        queue.clean(2);
        assert!(queue.is_empty(2));
        // Out of range is a no-op
        queue.clean(9);
        assert!(!queue.is_empty(9));
    }

    #[test]
    fn test_stage_rejects_null_with_length() {
        let mut queue = SpeQueue::<4>::new(4);
        assert_eq!(
            queue.stage_vectors(0, &params(1, 0), &NoMemory),
            Err(MailboxError::InvalidParams)
        );
    }

    #[test]
    fn test_stage_rejects_too_many_vectors() {
        let mut queue = SpeQueue::<4>::new(4);
        let mut p = params(3, 2);
        p.in_vec = 0x100;
        p.out_vec = 0x200;
        assert_eq!(queue.stage_vectors(0, &p, &NoMemory), Err(MailboxError::InvalidParams));
    }

    #[test]
    fn test_stage_without_vectors_never_reads_memory() {
        let mut queue = SpeQueue::<4>::new(4);
        let staged = queue.stage_vectors(1, &params(0, 0), &NoMemory).unwrap();
        assert!(staged.in_vecs().is_empty());
        assert!(staged.in_use);
    }

    #[test]
    #[should_panic(expected = "beyond")]
    fn test_reply_slot_out_of_range_panics() {
        let queue = SpeQueue::<4>::new(4);
        queue.ns_reply_slot(4);
    }

    #[test]
    #[should_panic(expected = "invalid NS slot")]
    fn test_reply_slot_beyond_ns_count_panics() {
        let mut queue = SpeQueue::<4>::new(2);
        queue.claim(3, MailboxMsg::ZERO);
        queue.ns_reply_slot(3);
    }
}
