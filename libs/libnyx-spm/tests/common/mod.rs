//! Shared mock collaborators for the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Mutex;

use libnyx_spm::config::CLIENT_ID_OWNER_MAGIC;
use libnyx_spm::mailbox::{ClientIdRange, ClientMemory, MailboxHal, MemoryFault};
use libnyx_spm::message::ClientAddr;
use libnyx_spm::service::{ClientId, PartitionInfo, VersionPolicy};
use libnyx_spm::{
    Completion, IoVec, Message, MessageBackend, PsaError, PsaStatus, ServiceDescriptor, Spm,
    StaticDirectory,
};

/// Connection-based, NS-accessible, relaxed versioning
pub const ECHO_SID: u32 = 0x1000;
/// Connection-based, NS-accessible, strict version 2
pub const STRICT_SID: u32 = 0x1001;
/// Connection-based, secure callers only
pub const PRIVATE_SID: u32 = 0x1002;
/// Stateless (static index 0), NS-accessible
pub const HASH_SID: u32 = 0x2000;
/// Not in the directory
pub const UNKNOWN_SID: u32 = 0xDEAD;

/// Secure partition that depends on PRIVATE_SID and HASH_SID
pub const SECURE_CLIENT: ClientId = 5;

/// Internal id the test HAL gives NS client 0
pub const NS_CLIENT: ClientId = -0x3C00_0000;

/// How the mock backend answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Deferred,
    Replied(PsaStatus),
    Fail(PsaError),
}

/// Backend that records every submitted message
pub struct MockBackend {
    mode: Mutex<Mode>,
    submitted: Mutex<Vec<Message>>,
}

impl MockBackend {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn submitted(&self) -> Vec<Message> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Message> {
        self.submitted.lock().unwrap().last().copied()
    }
}

impl MessageBackend for MockBackend {
    fn submit(&self, msg: &mut Message) -> Result<Completion, PsaError> {
        self.submitted.lock().unwrap().push(*msg);
        match *self.mode.lock().unwrap() {
            Mode::Deferred => Ok(Completion::Deferred),
            Mode::Replied(status) => Ok(Completion::Replied(status)),
            Mode::Fail(err) => Err(err),
        }
    }
}

pub fn services() -> Vec<ServiceDescriptor> {
    vec![
        ServiceDescriptor::new("echo", ECHO_SID, 1, 1).ns_accessible(),
        ServiceDescriptor::new("strict", STRICT_SID, 2, 1)
            .ns_accessible()
            .policy(VersionPolicy::Strict),
        ServiceDescriptor::new("private", PRIVATE_SID, 1, 1),
        ServiceDescriptor::new("hash", HASH_SID, 1, 1)
            .ns_accessible()
            .stateless(0),
    ]
}

pub fn partitions() -> Vec<PartitionInfo> {
    vec![
        PartitionInfo::new(1, &[]),
        PartitionInfo::new(SECURE_CLIENT, &[PRIVATE_SID, HASH_SID]),
    ]
}

/// Directory and backend with 'static tables
pub struct Fixture {
    pub directory: StaticDirectory<'static>,
    pub backend: MockBackend,
}

impl Fixture {
    pub fn new(mode: Mode) -> Self {
        let services: &'static [ServiceDescriptor] = Box::leak(services().into_boxed_slice());
        let partitions: &'static [PartitionInfo] = Box::leak(partitions().into_boxed_slice());
        Self {
            directory: StaticDirectory::new(services, partitions),
            backend: MockBackend::new(mode),
        }
    }

    pub fn spm(&self) -> Spm<'_> {
        Spm::new(&self.directory, &self.backend)
    }
}

/// HAL that counts critical sections and notifications
pub struct TestHal {
    range: ClientIdRange,
    depth: AtomicIsize,
    pub critical_sections: AtomicUsize,
    pub notifications: AtomicUsize,
}

impl TestHal {
    pub fn new() -> Self {
        Self {
            range: ClientIdRange::new(CLIENT_ID_OWNER_MAGIC, -0x3FFF_FFFF, NS_CLIENT).unwrap(),
            depth: AtomicIsize::new(0),
            critical_sections: AtomicUsize::new(0),
            notifications: AtomicUsize::new(0),
        }
    }

    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Critical sections currently open
    pub fn depth(&self) -> isize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl MailboxHal for TestHal {
    fn enter_critical(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.critical_sections.fetch_add(1, Ordering::SeqCst);
    }

    fn exit_critical(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify_peer(&self) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
    }

    fn translate_client_id(&self, owner: u32, ns_client_id: ClientId) -> Option<ClientId> {
        self.range.translate(owner, ns_client_id)
    }
}

/// Io-vector arrays in "non-secure memory", keyed by address
#[derive(Default)]
pub struct TestMemory {
    arrays: Mutex<HashMap<ClientAddr, Vec<IoVec>>>,
}

impl TestMemory {
    pub fn place(&self, addr: ClientAddr, vecs: &[IoVec]) {
        self.arrays.lock().unwrap().insert(addr, vecs.to_vec());
    }

    pub fn array(&self, addr: ClientAddr) -> Vec<IoVec> {
        self.arrays.lock().unwrap().get(&addr).cloned().unwrap_or_default()
    }
}

impl ClientMemory for TestMemory {
    fn read_iovecs(&self, addr: ClientAddr, out: &mut [IoVec]) -> Result<(), MemoryFault> {
        let arrays = self.arrays.lock().unwrap();
        let src = arrays.get(&addr).ok_or(MemoryFault { addr })?;
        if src.len() < out.len() {
            return Err(MemoryFault { addr });
        }
        out.copy_from_slice(&src[..out.len()]);
        Ok(())
    }

    fn write_iovec_len(&self, addr: ClientAddr, index: usize, len: u32) -> Result<(), MemoryFault> {
        let mut arrays = self.arrays.lock().unwrap();
        let vec = arrays
            .get_mut(&addr)
            .and_then(|a| a.get_mut(index))
            .ok_or(MemoryFault { addr })?;
        vec.len = len;
        Ok(())
    }
}
