//! Shared-memory layout
//!
//! Everything here is placed in memory both cores can see, so every type is
//! `#[repr(C)]` with fixed-width fields. The secure side never acts on these
//! structures directly: it copies a message out with [`NsMailboxQueue::read_msg`]
//! and decodes it into a [`Request`] first.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use static_assertions::const_assert_eq;

use super::QueueStatus;
use crate::config::NUM_MAILBOX_QUEUE_SLOT;
use crate::handle::PsaHandle;
use crate::message::ClientAddr;
use crate::service::{ClientId, Sid};
use crate::status::MailboxError;

/// Pending and replied bitmasks
///
/// Both fields are only read-modify-written inside the platform critical
/// section; the atomics keep single accesses tear-free.
#[repr(C)]
#[derive(Debug)]
pub struct MailboxStatus {
    pend_slots: AtomicU32,
    replied_slots: AtomicU32,
}

impl MailboxStatus {
    /// Both masks clear
    pub const fn new() -> Self {
        Self {
            pend_slots: AtomicU32::new(0),
            replied_slots: AtomicU32::new(0),
        }
    }

    /// Slots submitted by the non-secure side and not yet claimed
    pub fn pending(&self) -> QueueStatus {
        self.pend_slots.load(Ordering::Acquire)
    }

    /// Slots with a reply not yet consumed
    pub fn replied(&self) -> QueueStatus {
        self.replied_slots.load(Ordering::Acquire)
    }

    /// Raise pending bits
    pub fn set_pending(&self, mask: QueueStatus) {
        self.pend_slots.fetch_or(mask, Ordering::AcqRel);
    }

    /// Drop pending bits
    pub fn clear_pending(&self, mask: QueueStatus) {
        self.pend_slots.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Raise replied bits
    pub fn set_replied(&self, mask: QueueStatus) {
        self.replied_slots.fetch_or(mask, Ordering::AcqRel);
    }

    /// Drop replied bits
    pub fn clear_replied(&self, mask: QueueStatus) {
        self.replied_slots.fetch_and(!mask, Ordering::AcqRel);
    }
}

impl Default for MailboxStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized request: call-type tag plus a parameter union
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxMsg {
    /// Request tag (see [`Request`])
    pub call_type: u32,
    /// Parameters, interpreted per tag
    pub params: [u32; 6],
    /// Client id as known to the non-secure side
    pub client_id: ClientId,
}

impl MailboxMsg {
    /// All-zero message
    pub const ZERO: Self = Self {
        call_type: 0,
        params: [0; 6],
        client_id: 0,
    };
}

/// Serialized reply
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxReply {
    /// PSA status, version or handle
    pub return_val: i32,
}

/// One request/reply slot
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NsSlot {
    /// Request written by the non-secure side
    pub msg: MailboxMsg,
    /// Reply written by the secure side
    pub reply: MailboxReply,
}

impl NsSlot {
    const ZERO: Self = Self {
        msg: MailboxMsg::ZERO,
        reply: MailboxReply { return_val: 0 },
    };
}

const_assert_eq!(core::mem::size_of::<MailboxStatus>(), 8);
const_assert_eq!(core::mem::size_of::<MailboxMsg>(), 32);
const_assert_eq!(core::mem::size_of::<MailboxReply>(), 4);
const_assert_eq!(core::mem::size_of::<NsSlot>(), 36);

/// The shared queue region
///
/// Slot contents are accessed with volatile copies. Which side may touch a
/// slot at any moment is decided by the status bitmasks.
#[repr(C)]
pub struct NsMailboxQueue<const N: usize = NUM_MAILBOX_QUEUE_SLOT> {
    /// Pending/replied bitmasks
    pub status: MailboxStatus,
    slots: [UnsafeCell<NsSlot>; N],
}

// SAFETY: slot ownership is handed between cores through the status
// bitmasks; accesses are whole-field volatile copies.
unsafe impl<const N: usize> Sync for NsMailboxQueue<N> {}

impl<const N: usize> NsMailboxQueue<N> {
    /// Zeroed region
    pub const fn new() -> Self {
        Self {
            status: MailboxStatus::new(),
            slots: [const { UnsafeCell::new(NsSlot::ZERO) }; N],
        }
    }

    /// Number of slots
    pub const fn len(&self) -> usize {
        N
    }

    /// Always false; a queue has at least one slot
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// Copy out the request in slot `idx`
    pub fn read_msg(&self, idx: usize) -> Option<MailboxMsg> {
        let slot = self.slots.get(idx)?;
        // SAFETY: the pointer is valid for the queue's lifetime
        Some(unsafe { ptr::read_volatile(ptr::addr_of!((*slot.get()).msg)) })
    }

    /// Write the request in slot `idx`
    pub fn write_msg(&self, idx: usize, msg: &MailboxMsg) -> bool {
        let Some(slot) = self.slots.get(idx) else {
            return false;
        };
        // SAFETY: see read_msg
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*slot.get()).msg), *msg) };
        true
    }

    /// Copy out the reply in slot `idx`
    pub fn read_reply(&self, idx: usize) -> Option<MailboxReply> {
        let slot = self.slots.get(idx)?;
        // SAFETY: see read_msg
        Some(unsafe { ptr::read_volatile(ptr::addr_of!((*slot.get()).reply)) })
    }

    /// Write the reply in slot `idx`
    pub fn write_reply(&self, idx: usize, reply: MailboxReply) -> bool {
        let Some(slot) = self.slots.get(idx) else {
            return false;
        };
        // SAFETY: see read_msg
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*slot.get()).reply), reply) };
        true
    }
}

impl<const N: usize> Default for NsMailboxQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of a `psa_call` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallParams {
    /// Static or connection handle
    pub handle: PsaHandle,
    /// Service-defined call type
    pub ty: i32,
    /// Address of the input vector array
    pub in_vec: ClientAddr,
    /// Number of input vectors
    pub in_len: u32,
    /// Address of the output vector array
    pub out_vec: ClientAddr,
    /// Number of output vectors
    pub out_len: u32,
}

/// A decoded mailbox request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `psa_framework_version`
    FrameworkVersion,
    /// `psa_version`
    Version {
        /// Queried service
        sid: Sid,
    },
    /// `psa_connect`
    Connect {
        /// Target service
        sid: Sid,
        /// Requested version
        version: u32,
    },
    /// `psa_call`
    Call(CallParams),
    /// `psa_close`
    Close {
        /// Connection handle
        handle: PsaHandle,
    },
}

impl Request {
    /// Tag of [`Request::FrameworkVersion`]
    pub const FRAMEWORK_VERSION: u32 = 1;
    /// Tag of [`Request::Version`]
    pub const VERSION: u32 = 2;
    /// Tag of [`Request::Connect`]
    pub const CONNECT: u32 = 3;
    /// Tag of [`Request::Call`]
    pub const CALL: u32 = 4;
    /// Tag of [`Request::Close`]
    pub const CLOSE: u32 = 5;

    /// Decode a message copied out of the shared region
    pub fn decode(msg: &MailboxMsg) -> Result<Self, MailboxError> {
        let p = &msg.params;
        Ok(match msg.call_type {
            Self::FRAMEWORK_VERSION => Self::FrameworkVersion,
            Self::VERSION => Self::Version { sid: p[0] },
            Self::CONNECT => Self::Connect {
                sid: p[0],
                version: p[1],
            },
            Self::CALL => Self::Call(CallParams {
                handle: p[0] as PsaHandle,
                ty: p[1] as i32,
                in_vec: p[2],
                in_len: p[3],
                out_vec: p[4],
                out_len: p[5],
            }),
            Self::CLOSE => Self::Close {
                handle: p[0] as PsaHandle,
            },
            _ => return Err(MailboxError::InvalidParams),
        })
    }

    /// Serialize for `client_id`
    pub fn encode(&self, client_id: ClientId) -> MailboxMsg {
        let mut params = [0u32; 6];
        let call_type = match *self {
            Self::FrameworkVersion => Self::FRAMEWORK_VERSION,
            Self::Version { sid } => {
                params[0] = sid;
                Self::VERSION
            }
            Self::Connect { sid, version } => {
                params[0] = sid;
                params[1] = version;
                Self::CONNECT
            }
            Self::Call(c) => {
                params = [
                    c.handle as u32,
                    c.ty as u32,
                    c.in_vec,
                    c.in_len,
                    c.out_vec,
                    c.out_len,
                ];
                Self::CALL
            }
            Self::Close { handle } => {
                params[0] = handle as u32;
                Self::CLOSE
            }
        };
        MailboxMsg {
            call_type,
            params,
            client_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_params_layout() {
        let req = Request::Call(CallParams {
            handle: 0x4000_0101,
            ty: 3,
            in_vec: 0x1000,
            in_len: 1,
            out_vec: 0x2000,
            out_len: 2,
        });
        let msg = req.encode(7);
        assert_eq!(msg.call_type, Request::CALL);
        assert_eq!(msg.params, [0x4000_0101, 3, 0x1000, 1, 0x2000, 2]);
        assert_eq!(Request::decode(&msg), Ok(req));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        for tag in [0, 6, u32::MAX] {
            let msg = MailboxMsg {
                call_type: tag,
                ..MailboxMsg::ZERO
            };
            assert_eq!(Request::decode(&msg), Err(MailboxError::InvalidParams));
        }
    }

    #[test]
    fn test_status_masks() {
        let status = MailboxStatus::new();
        status.set_pending(0b0101);
        status.clear_pending(0b0001);
        status.set_replied(0b0010);
        assert_eq!(status.pending(), 0b0100);
        assert_eq!(status.replied(), 0b0010);
        status.clear_replied(0b0010);
        assert_eq!(status.replied(), 0);
    }

    #[test]
    fn test_slot_access_is_bounded() {
        let queue: NsMailboxQueue<2> = NsMailboxQueue::new();
        assert!(queue.write_msg(1, &Request::FrameworkVersion.encode(-1)));
        assert!(!queue.write_msg(2, &MailboxMsg::ZERO));
        assert_eq!(queue.read_msg(1).map(|m| m.call_type), Some(Request::FRAMEWORK_VERSION));
        assert!(queue.read_reply(2).is_none());
    }
}
