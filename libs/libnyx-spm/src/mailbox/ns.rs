//! Non-secure side of the mailbox
//!
//! Used by host platforms and tests to play the non-secure core. A slot is
//! free when it is neither pending, replied, nor held locally by a caller
//! still waiting for its reply.

use spin::Mutex;

use super::layout::{NsMailboxQueue, Request};
use super::{CriticalSection, MailboxHal, QueueStatus};
use crate::config::NUM_MAILBOX_QUEUE_SLOT;
use crate::service::ClientId;
use crate::status::MailboxError;

/// Non-secure mailbox client
pub struct NsMailbox<'a, const N: usize = NUM_MAILBOX_QUEUE_SLOT> {
    queue: &'a NsMailboxQueue<N>,
    hal: &'a dyn MailboxHal,
    slot_count: usize,
    in_use: Mutex<QueueStatus>,
}

impl<'a, const N: usize> NsMailbox<'a, N> {
    /// Client over the first `slot_count` slots of `queue`
    pub fn new(queue: &'a NsMailboxQueue<N>, hal: &'a dyn MailboxHal, slot_count: usize) -> Self {
        Self {
            queue,
            hal,
            slot_count: slot_count.min(N),
            in_use: Mutex::new(0),
        }
    }

    /// Write `request` into a free slot and mark it pending
    ///
    /// Returns the slot index to wait on.
    pub fn submit(&self, request: &Request, client_id: ClientId) -> Result<usize, MailboxError> {
        let idx = {
            let mut in_use = self.in_use.lock();
            let busy = {
                let _cs = CriticalSection::enter(self.hal);
                *in_use | self.queue.status.pending() | self.queue.status.replied()
            };
            let idx = (0..self.slot_count)
                .find(|i| busy & (1 << i) == 0)
                .ok_or(MailboxError::QueueFull)?;
            *in_use |= 1 << idx;
            idx
        };

        self.queue.write_msg(idx, &request.encode(client_id));
        {
            let _cs = CriticalSection::enter(self.hal);
            self.queue.status.set_pending(1 << idx);
        }
        log::trace!("ns mailbox: request {:?} in slot {}", request, idx);
        Ok(idx)
    }

    /// Collect the reply for slot `idx`, if it has arrived
    ///
    /// The slot is released once its reply is taken.
    pub fn fetch_reply(&self, idx: usize) -> Option<i32> {
        if idx >= self.slot_count {
            return None;
        }
        let mask = 1 << idx;
        {
            let _cs = CriticalSection::enter(self.hal);
            if self.queue.status.replied() & mask == 0 {
                return None;
            }
            self.queue.status.clear_replied(mask);
        }
        let reply = self.queue.read_reply(idx)?;
        *self.in_use.lock() &= !mask;
        Some(reply.return_val)
    }

    /// Collect every arrived reply, calling `f(slot, value)` for each
    pub fn poll_replies(&self, mut f: impl FnMut(usize, i32)) -> usize {
        let replied = {
            let _cs = CriticalSection::enter(self.hal);
            self.queue.status.replied()
        };
        let mut count = 0;
        for idx in 0..self.slot_count {
            if replied & (1 << idx) == 0 {
                continue;
            }
            if let Some(value) = self.fetch_reply(idx) {
                f(idx, value);
                count += 1;
            }
        }
        count
    }

    /// Slots held by callers waiting for replies
    pub fn in_flight(&self) -> QueueStatus {
        *self.in_use.lock()
    }
}
