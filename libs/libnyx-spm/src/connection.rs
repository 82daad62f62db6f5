//! Connection registry
//!
//! A fixed pool of connection records shared by every dispatch path. All
//! access goes through one spin lock; the lock is never held across a call
//! into the dispatch backend.

use spin::Mutex;

use crate::config::CONNECTION_POOL_SIZE;
use crate::handle::{connection_handle, HandleKind, PsaHandle};
use crate::message::{Message, MessageType, ReplyOwner};
use crate::service::{ClientId, Sid};
use crate::status::spm_panic;

/// Connection state
///
/// Records move `Idle -> Active -> ToFree` and are then reclaimed into the
/// pool. No other move is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Allocated, connect not yet accepted by the backend
    Idle,
    /// Connected
    Active,
    /// Disconnect dispatched, waiting for reclamation
    ToFree,
}

/// One connection record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    /// Handle issued to the client
    pub handle: PsaHandle,
    /// Connected service
    pub sid: Sid,
    /// Owning client
    pub client_id: ClientId,
    /// Current state
    pub status: ConnectionStatus,
    /// Embedded message descriptor (type, reverse handle, vectors)
    pub msg: Message,
}

impl Connection {
    /// Move to `next`, aborting on an illegal transition
    pub fn transition(&mut self, next: ConnectionStatus) {
        use ConnectionStatus::*;
        match (self.status, next) {
            (Idle, Active) | (Active, ToFree) | (ToFree, Idle) => {
                log::debug!(
                    "connection {:#x}: {:?} -> {:?}",
                    self.handle,
                    self.status,
                    next
                );
                self.status = next;
            }
            (from, to) => spm_panic!(
                "connection {:#x}: illegal transition {:?} -> {:?}",
                self.handle,
                from,
                to
            ),
        }
    }
}

#[derive(Clone, Copy)]
struct Slot {
    generation: u16,
    conn: Option<Connection>,
}

impl Slot {
    const EMPTY: Self = Self {
        generation: 0,
        conn: None,
    };
}

/// Fixed-capacity pool of connection records
pub struct ConnectionRegistry {
    slots: Mutex<[Slot; CONNECTION_POOL_SIZE]>,
}

impl ConnectionRegistry {
    /// Empty registry
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new([Slot::EMPTY; CONNECTION_POOL_SIZE]),
        }
    }

    /// Claim a free record for `client_id` connecting to `sid`
    ///
    /// The record starts `Idle` with a CONNECT message. Returns `None` when
    /// the pool is exhausted.
    pub fn allocate(
        &self,
        sid: Sid,
        client_id: ClientId,
        reply_to: ReplyOwner,
    ) -> Option<Connection> {
        let mut slots = self.slots.lock();
        let (index, slot) = slots.iter_mut().enumerate().find(|(_, s)| s.conn.is_none())?;

        let handle = connection_handle(index, slot.generation);
        let conn = Connection {
            handle,
            sid,
            client_id,
            status: ConnectionStatus::Idle,
            msg: Message::new(handle, sid, MessageType::Connect, client_id, reply_to),
        };
        slot.conn = Some(conn);
        log::trace!("connection slot {} allocated as {:#x}", index, handle);
        Some(conn)
    }

    /// Release a record regardless of its state
    ///
    /// Returns false if `handle` does not name a live record.
    pub fn free(&self, handle: PsaHandle) -> bool {
        let mut slots = self.slots.lock();
        match Self::resolve(&mut slots, handle) {
            Some(slot) => {
                slot.conn = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            None => false,
        }
    }

    /// Return a `ToFree` record to the pool
    ///
    /// Returns false if the record is missing or not waiting for teardown.
    pub fn reclaim(&self, handle: PsaHandle) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = Self::resolve(&mut slots, handle) else {
            return false;
        };
        match slot.conn.as_mut() {
            Some(conn) if conn.status == ConnectionStatus::ToFree => {
                conn.transition(ConnectionStatus::Idle);
                slot.conn = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    /// Run `f` on the live record named by `handle`
    pub fn with<R>(&self, handle: PsaHandle, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        Self::resolve(&mut slots, handle)
            .and_then(|slot| slot.conn.as_mut())
            .map(f)
    }

    /// Snapshot of the live record named by `handle`
    pub fn get(&self, handle: PsaHandle) -> Option<Connection> {
        self.with(handle, |conn| *conn)
    }

    /// Number of live records
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.conn.is_some()).count()
    }

    fn resolve(slots: &mut [Slot; CONNECTION_POOL_SIZE], handle: PsaHandle) -> Option<&mut Slot> {
        match HandleKind::classify(handle) {
            HandleKind::Connection { index, generation } => {
                let slot = slots.get_mut(index)?;
                (slot.generation == generation && slot.conn.is_some()).then_some(slot)
            }
            _ => None,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
