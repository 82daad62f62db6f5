//! Service directory
//!
//! The directory is owned by the platform and is read-only from the core's
//! point of view. [`StaticDirectory`] covers the common case of tables baked
//! into the image (or built once at startup by a host platform).

use bitflags::bitflags;
use heapless::{String, Vec};

use crate::config::{MAX_PARTITION_DEPS, SERVICE_NAME_LEN};

/// Service identifier
pub type Sid = u32;

/// Client identity; negative values are non-secure callers
pub type ClientId = i32;

/// Secure partition identifier
pub type PartitionId = i32;

/// True when `client_id` names a non-secure caller
#[inline]
pub const fn is_ns_client(client_id: ClientId) -> bool {
    client_id < 0
}

bitflags! {
    /// Service attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u32 {
        /// Called through static handles, never connected
        const STATELESS = 1 << 0;
        /// Reachable from the non-secure side
        const NS_ACCESSIBLE = 1 << 1;
    }
}

/// How a requested version is matched against the service version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Only the exact version
    Strict,
    /// Any version up to and including the service version
    #[default]
    Relaxed,
}

impl VersionPolicy {
    /// Check `requested` against `current`
    pub const fn accepts(self, current: u32, requested: u32) -> bool {
        match self {
            Self::Strict => requested == current,
            Self::Relaxed => requested <= current,
        }
    }
}

/// Static description of one RoT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Human-readable name (truncated to [`SERVICE_NAME_LEN`])
    pub name: String<SERVICE_NAME_LEN>,
    /// Service identifier
    pub sid: Sid,
    /// Current service version
    pub version: u32,
    /// Version matching rule
    pub policy: VersionPolicy,
    /// Attributes
    pub flags: ServiceFlags,
    /// Partition hosting the service
    pub partition: PartitionId,
    /// Index in the static handle space, for stateless services
    pub stateless_index: Option<u8>,
}

impl ServiceDescriptor {
    /// Describe a connection-based service
    pub fn new(name: &str, sid: Sid, version: u32, partition: PartitionId) -> Self {
        let mut short = String::new();
        for ch in name.chars() {
            if short.push(ch).is_err() {
                break;
            }
        }
        Self {
            name: short,
            sid,
            version,
            policy: VersionPolicy::default(),
            flags: ServiceFlags::empty(),
            partition,
            stateless_index: None,
        }
    }

    /// Mark the service stateless, reachable through static handle `index`
    pub fn stateless(mut self, index: u8) -> Self {
        self.flags |= ServiceFlags::STATELESS;
        self.stateless_index = Some(index);
        self
    }

    /// Allow non-secure callers
    pub fn ns_accessible(mut self) -> Self {
        self.flags |= ServiceFlags::NS_ACCESSIBLE;
        self
    }

    /// Set the version policy
    pub fn policy(mut self, policy: VersionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Stateless services take no connection
    #[inline]
    pub fn is_stateless(&self) -> bool {
        self.flags.contains(ServiceFlags::STATELESS)
    }
}

/// A secure partition and the services it may call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Partition identifier (also its client id)
    pub id: PartitionId,
    /// Services this partition declared it depends on
    pub dependencies: Vec<Sid, MAX_PARTITION_DEPS>,
}

impl PartitionInfo {
    /// Partition with the given dependencies; extra entries are dropped
    pub fn new(id: PartitionId, dependencies: &[Sid]) -> Self {
        let mut deps = Vec::new();
        for sid in dependencies.iter().take(MAX_PARTITION_DEPS) {
            // Capacity is checked by take()
            let _ = deps.push(*sid);
        }
        Self { id, dependencies: deps }
    }
}

/// Read-only view of the services and partitions in the image
pub trait ServiceDirectory: Send + Sync {
    /// Find a service by identifier
    fn lookup(&self, sid: Sid) -> Option<&ServiceDescriptor>;

    /// Find a stateless service by static handle index
    fn lookup_stateless(&self, index: usize) -> Option<&ServiceDescriptor>;

    /// Find a partition by identifier
    fn partition(&self, id: PartitionId) -> Option<&PartitionInfo>;

    /// Whether the service is called without a connection
    fn is_stateless(&self, service: &ServiceDescriptor) -> bool {
        service.is_stateless()
    }

    /// Whether `client_id` may use `service`
    ///
    /// Non-secure callers need [`ServiceFlags::NS_ACCESSIBLE`]; secure
    /// callers must list the SID among their partition's dependencies.
    fn is_authorized(&self, sid: Sid, service: &ServiceDescriptor, client_id: ClientId) -> bool {
        if is_ns_client(client_id) {
            return service.flags.contains(ServiceFlags::NS_ACCESSIBLE);
        }
        self.partition(client_id)
            .map(|p| p.dependencies.contains(&sid))
            .unwrap_or(false)
    }

    /// Whether the service accepts `requested`
    fn version_supported(&self, service: &ServiceDescriptor, requested: u32) -> bool {
        service.policy.accepts(service.version, requested)
    }
}

/// Directory over borrowed tables
pub struct StaticDirectory<'a> {
    services: &'a [ServiceDescriptor],
    partitions: &'a [PartitionInfo],
}

impl<'a> StaticDirectory<'a> {
    /// Wrap the given tables
    pub const fn new(services: &'a [ServiceDescriptor], partitions: &'a [PartitionInfo]) -> Self {
        Self { services, partitions }
    }

    /// All services
    pub fn services(&self) -> &'a [ServiceDescriptor] {
        self.services
    }
}

impl ServiceDirectory for StaticDirectory<'_> {
    fn lookup(&self, sid: Sid) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.sid == sid)
    }

    fn lookup_stateless(&self, index: usize) -> Option<&ServiceDescriptor> {
        self.services
            .iter()
            .find(|s| s.is_stateless() && s.stateless_index.map(usize::from) == Some(index))
    }

    fn partition(&self, id: PartitionId) -> Option<&PartitionInfo> {
        self.partitions.iter().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    fn fixture() -> (std::vec::Vec<ServiceDescriptor>, std::vec::Vec<PartitionInfo>) {
        let services = vec![
            ServiceDescriptor::new("crypto", 0x100, 2, 1).ns_accessible(),
            ServiceDescriptor::new("storage", 0x200, 1, 2).policy(VersionPolicy::Strict),
            ServiceDescriptor::new("attest", 0x300, 1, 2).stateless(0),
        ];
        let partitions = vec![PartitionInfo::new(1, &[0x200]), PartitionInfo::new(2, &[])];
        (services, partitions)
    }

    #[test]
    fn test_version_policy() {
        assert!(VersionPolicy::Strict.accepts(2, 2));
        assert!(!VersionPolicy::Strict.accepts(2, 1));
        assert!(VersionPolicy::Relaxed.accepts(2, 1));
        assert!(!VersionPolicy::Relaxed.accepts(2, 3));
    }

    #[test]
    fn test_authorization() {
        let (services, partitions) = fixture();
        let dir = StaticDirectory::new(&services, &partitions);

        let crypto = dir.lookup(0x100).unwrap();
        let storage = dir.lookup(0x200).unwrap();
        assert!(dir.is_authorized(0x100, crypto, -1));
        assert!(!dir.is_authorized(0x200, storage, -1));
        assert!(dir.is_authorized(0x200, storage, 1));
        assert!(!dir.is_authorized(0x200, storage, 2));
        // Unknown partitions are never authorized
        assert!(!dir.is_authorized(0x200, storage, 42));
    }

    #[test]
    fn test_stateless_lookup() {
        let (services, partitions) = fixture();
        let dir = StaticDirectory::new(&services, &partitions);
        assert_eq!(dir.lookup_stateless(0).map(|s| s.sid), Some(0x300));
        assert!(dir.lookup_stateless(1).is_none());
        assert!(dir.is_stateless(dir.lookup(0x300).unwrap()));
    }

    #[test]
    fn test_long_names_truncate() {
        let long = "a-service-name-that-is-much-longer-than-the-limit";
        let svc = ServiceDescriptor::new(long, 1, 1, 1);
        assert_eq!(svc.name.len(), SERVICE_NAME_LEN);
    }
}
