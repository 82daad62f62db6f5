//! Cross-core mailbox transport
//!
//! The non-secure core writes requests into a shared [`NsMailboxQueue`] and
//! raises pending bits; the secure core's [`MailboxAgent`] claims them into a
//! secure-local mirror, dispatches them through [`Spm`], and writes replies
//! back. Only bitmask updates happen inside the platform critical section.
//!
//! [`Spm`]: crate::spm::Spm

mod agent;
pub mod layout;
pub mod ns;
mod queue;

pub use agent::MailboxAgent;
pub use layout::{MailboxMsg, MailboxReply, MailboxStatus, NsMailboxQueue, Request};
pub use ns::NsMailbox;

use crate::message::{ClientAddr, IoVec};
use crate::service::ClientId;

/// Bitmask over mailbox slots
pub type QueueStatus = u32;

/// Secure-side message handle (slot index + 1)
pub type MsgHandle = u32;

/// Reserved "no handle"; replies with it target slot 0
pub const MAILBOX_MSG_NULL_HANDLE: MsgHandle = 0;

/// Platform services the mailbox needs
pub trait MailboxHal: Send + Sync {
    /// Enter the cross-core critical section
    fn enter_critical(&self);

    /// Leave the cross-core critical section
    fn exit_critical(&self);

    /// Signal the peer core that replies are ready
    fn notify_peer(&self);

    /// Map an external client id to an internal one under `owner`
    fn translate_client_id(&self, owner: u32, ns_client_id: ClientId) -> Option<ClientId>;
}

/// RAII guard over [`MailboxHal::enter_critical`]
pub struct CriticalSection<'a> {
    hal: &'a dyn MailboxHal,
}

impl<'a> CriticalSection<'a> {
    /// Enter; the section ends when the guard drops
    pub fn enter(hal: &'a dyn MailboxHal) -> Self {
        hal.enter_critical();
        Self { hal }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.hal.exit_critical();
    }
}

/// Fault while reading or writing client memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFault {
    /// Faulting address
    pub addr: ClientAddr,
}

/// Access to io-vector arrays in non-secure memory
pub trait ClientMemory: Send + Sync {
    /// Copy `out.len()` descriptors from the array at `addr`
    fn read_iovecs(&self, addr: ClientAddr, out: &mut [IoVec]) -> Result<(), MemoryFault>;

    /// Overwrite the `len` field of descriptor `index` in the array at `addr`
    fn write_iovec_len(&self, addr: ClientAddr, index: usize, len: u32) -> Result<(), MemoryFault>;
}

/// Non-secure client id translation into a reserved negative range
///
/// Non-negative external ids map to `max - id`; negative ids must already
/// lie in `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdRange {
    /// Owner tag the range belongs to
    pub owner: u32,
    /// Lowest internal id (most negative)
    pub min: ClientId,
    /// Highest internal id
    pub max: ClientId,
}

impl ClientIdRange {
    /// Range for `owner`; `max` must be negative and `min <= max`
    pub const fn new(owner: u32, min: ClientId, max: ClientId) -> Option<Self> {
        if max >= 0 || min > max {
            return None;
        }
        Some(Self { owner, min, max })
    }

    /// Translate `ns_client_id` issued by `owner`
    pub fn translate(&self, owner: u32, ns_client_id: ClientId) -> Option<ClientId> {
        if owner != self.owner {
            return None;
        }
        let id = if ns_client_id >= 0 {
            self.max.checked_sub(ns_client_id)?
        } else {
            ns_client_id
        };
        (self.min..=self.max).contains(&id).then_some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_range() {
        let range = ClientIdRange::new(7, -0x3FFF_FFFF, -0x3C00_0000).unwrap();
        assert_eq!(range.translate(7, 0), Some(-0x3C00_0000));
        assert_eq!(range.translate(7, 5), Some(-0x3C00_0005));
        assert_eq!(range.translate(7, -0x3D00_0000), Some(-0x3D00_0000));
        assert_eq!(range.translate(7, -1), None);
        assert_eq!(range.translate(8, 0), None);
        assert_eq!(range.translate(7, i32::MAX), None);
    }

    #[test]
    fn test_client_id_range_rejects_secure_space() {
        assert!(ClientIdRange::new(1, -10, 0).is_none());
        assert!(ClientIdRange::new(1, -1, -10).is_none());
    }
}
