//! Host platform primitives
//!
//! Stand-ins for what a dual-core board provides: a cross-core critical
//! section, a doorbell in each direction, and the non-secure memory the
//! io-vectors point into.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use libnyx_spm::mailbox::{ClientIdRange, ClientMemory, MailboxHal, MemoryFault};
use libnyx_spm::message::ClientAddr;
use libnyx_spm::{ClientId, IoVec};
use tokio::sync::Notify;

use crate::error::WardenError;

/// Size of one io-vector as laid out in non-secure memory
pub const IOVEC_SIZE: usize = 8;

/// Addresses below this are never handed out, so 0 stays null
const ARENA_BASE: usize = 0x10;

/// Platform services for the secure core
///
/// The critical section is a ticket lock shared by both simulated cores;
/// peer notification wakes whoever waits on [`HostHal::peer`].
pub struct HostHal {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    peer: Arc<Notify>,
    ids: ClientIdRange,
    notifications: AtomicUsize,
}

impl HostHal {
    pub fn new(ids: ClientIdRange) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            peer: Arc::new(Notify::new()),
            ids,
            notifications: AtomicUsize::new(0),
        }
    }

    /// Doorbell rung by the secure core when replies are ready
    pub fn peer(&self) -> Arc<Notify> {
        Arc::clone(&self.peer)
    }

    /// Number of peer notifications raised so far
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl MailboxHal for HostHal {
    fn enter_critical(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
    }

    fn exit_critical(&self) {
        self.now_serving.fetch_add(1, Ordering::Release);
    }

    fn notify_peer(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        self.peer.notify_one();
    }

    fn translate_client_id(&self, owner: u32, ns_client_id: ClientId) -> Option<ClientId> {
        self.ids.translate(owner, ns_client_id)
    }
}

struct Arena {
    bytes: Vec<u8>,
    next: usize,
}

/// Simulated non-secure memory
///
/// Addresses are offsets into one byte arena. Allocation is a bump pointer;
/// [`HostMemory::reset`] releases everything at once.
pub struct HostMemory {
    arena: Mutex<Arena>,
}

impl HostMemory {
    pub fn new(size: usize) -> Self {
        Self {
            arena: Mutex::new(Arena {
                bytes: vec![0; size.max(ARENA_BASE)],
                next: ARENA_BASE,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Arena> {
        // A panicking writer leaves plain bytes behind; keep going
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve `len` zeroed bytes, 4-byte aligned
    pub fn alloc(&self, len: usize) -> Result<ClientAddr, WardenError> {
        let mut arena = self.lock();
        let start = arena.next.next_multiple_of(4);
        let end = start
            .checked_add(len)
            .filter(|&end| end <= arena.bytes.len() && end <= u32::MAX as usize)
            .ok_or(WardenError::OutOfMemory(len))?;
        arena.bytes[start..end].fill(0);
        arena.next = end;
        Ok(start as ClientAddr)
    }

    /// Copy `data` into freshly allocated memory
    pub fn place(&self, data: &[u8]) -> Result<ClientAddr, WardenError> {
        let addr = self.alloc(data.len())?;
        self.write(addr, data).map_err(|_| WardenError::OutOfMemory(data.len()))?;
        Ok(addr)
    }

    /// Lay out `vecs` as an io-vector array
    pub fn place_iovecs(&self, vecs: &[IoVec]) -> Result<ClientAddr, WardenError> {
        let mut raw = Vec::with_capacity(vecs.len() * IOVEC_SIZE);
        for vec in vecs {
            raw.extend_from_slice(&vec.base.to_le_bytes());
            raw.extend_from_slice(&vec.len.to_le_bytes());
        }
        self.place(&raw)
    }

    /// Release every allocation
    pub fn reset(&self) {
        self.lock().next = ARENA_BASE;
    }

    pub fn read(&self, addr: ClientAddr, out: &mut [u8]) -> Result<(), MemoryFault> {
        let arena = self.lock();
        let range = Self::range(&arena, addr, out.len())?;
        out.copy_from_slice(&arena.bytes[range]);
        Ok(())
    }

    pub fn write(&self, addr: ClientAddr, data: &[u8]) -> Result<(), MemoryFault> {
        let mut arena = self.lock();
        let range = Self::range(&arena, addr, data.len())?;
        arena.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Read the `len` bytes an io-vector describes
    pub fn read_vec(&self, vec: &IoVec) -> Result<Vec<u8>, MemoryFault> {
        let mut out = vec![0; vec.len as usize];
        if !out.is_empty() {
            self.read(vec.base, &mut out)?;
        }
        Ok(out)
    }

    fn range(arena: &Arena, addr: ClientAddr, len: usize) -> Result<std::ops::Range<usize>, MemoryFault> {
        let start = addr as usize;
        if start < ARENA_BASE {
            return Err(MemoryFault { addr });
        }
        start
            .checked_add(len)
            .filter(|&end| end <= arena.bytes.len())
            .map(|end| start..end)
            .ok_or(MemoryFault { addr })
    }
}

impl ClientMemory for HostMemory {
    fn read_iovecs(&self, addr: ClientAddr, out: &mut [IoVec]) -> Result<(), MemoryFault> {
        let mut raw = vec![0u8; out.len() * IOVEC_SIZE];
        self.read(addr, &mut raw)?;
        for (vec, chunk) in out.iter_mut().zip(raw.chunks_exact(IOVEC_SIZE)) {
            let base = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let len = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            *vec = IoVec::new(base, len);
        }
        Ok(())
    }

    fn write_iovec_len(&self, addr: ClientAddr, index: usize, len: u32) -> Result<(), MemoryFault> {
        let offset = index
            .checked_mul(IOVEC_SIZE)
            .and_then(|off| off.checked_add(4))
            .and_then(|off| u32::try_from(off).ok())
            .and_then(|off| addr.checked_add(off))
            .ok_or(MemoryFault { addr })?;
        self.write(offset, &len.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libnyx_spm::config::CLIENT_ID_OWNER_MAGIC;

    #[test]
    fn test_iovec_roundtrip_through_memory() {
        let mem = HostMemory::new(256);
        let vecs = [IoVec::new(0x40, 3), IoVec::new(0x80, 16)];
        let addr = mem.place_iovecs(&vecs).unwrap();

        let mut read = [IoVec::EMPTY; 2];
        mem.read_iovecs(addr, &mut read).unwrap();
        assert_eq!(read, vecs);

        mem.write_iovec_len(addr, 1, 7).unwrap();
        mem.read_iovecs(addr, &mut read).unwrap();
        assert_eq!(read[1], IoVec::new(0x80, 7));
    }

    #[test]
    fn test_null_and_out_of_range_fault() {
        let mem = HostMemory::new(64);
        let mut buf = [0u8; 4];
        assert_eq!(mem.read(0, &mut buf), Err(MemoryFault { addr: 0 }));
        assert_eq!(mem.read(62, &mut buf), Err(MemoryFault { addr: 62 }));
        assert!(matches!(mem.alloc(128), Err(WardenError::OutOfMemory(128))));
    }

    #[test]
    fn test_reset_reuses_arena() {
        let mem = HostMemory::new(64);
        let first = mem.place(b"abcd").unwrap();
        mem.reset();
        let second = mem.alloc(4).unwrap();
        assert_eq!(first, second);

        let mut buf = [0xFFu8; 4];
        mem.read(second, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_critical_section_is_reusable() {
        let ids = ClientIdRange::new(CLIENT_ID_OWNER_MAGIC, -100, -10).unwrap();
        let hal = HostHal::new(ids);
        for _ in 0..3 {
            hal.enter_critical();
            hal.exit_critical();
        }
        hal.notify_peer();
        assert_eq!(hal.notifications(), 1);
        assert_eq!(hal.translate_client_id(CLIENT_ID_OWNER_MAGIC, 0), Some(-10));
    }
}
