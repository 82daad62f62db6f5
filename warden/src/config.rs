//! Warden configuration
//!
//! The service manifest of the simulated image: mailbox geometry, secure
//! partitions and the services they host.

use std::collections::HashSet;
use std::path::Path;

use libnyx_spm::config::{CLIENT_ID_OWNER_MAGIC, NUM_MAILBOX_QUEUE_SLOT, STATIC_HANDLE_NUM_LIMIT};
use libnyx_spm::mailbox::ClientIdRange;
use libnyx_spm::service::{PartitionInfo, VersionPolicy};
use libnyx_spm::ServiceDescriptor;
use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Mailbox settings
    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Secure partitions
    #[serde(default, rename = "partition")]
    pub partitions: Vec<PartitionConfig>,

    /// RoT services
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// Mailbox geometry and non-secure identity mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Slots in use (at most the build-time slot count)
    #[serde(default = "default_slots")]
    pub slots: usize,

    /// Lowest internal id handed to non-secure clients
    #[serde(default = "default_client_id_min")]
    pub client_id_min: i32,

    /// Highest internal id handed to non-secure clients
    #[serde(default = "default_client_id_max")]
    pub client_id_max: i32,

    /// Size of the simulated non-secure memory in bytes
    #[serde(default = "default_ns_memory")]
    pub ns_memory: usize,

    /// How long the non-secure side waits for a reply (milliseconds)
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            client_id_min: default_client_id_min(),
            client_id_max: default_client_id_max(),
            ns_memory: default_ns_memory(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

/// A secure partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition id (also its client id)
    pub id: i32,

    /// Name, for logs
    #[serde(default)]
    pub name: String,

    /// Services this partition may call
    #[serde(default)]
    pub dependencies: Vec<u32>,
}

/// Version matching rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyConfig {
    Strict,
    #[default]
    Relaxed,
}

impl From<PolicyConfig> for VersionPolicy {
    fn from(policy: PolicyConfig) -> Self {
        match policy {
            PolicyConfig::Strict => VersionPolicy::Strict,
            PolicyConfig::Relaxed => VersionPolicy::Relaxed,
        }
    }
}

/// What a simulated service does with a call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Behaviour {
    /// Copy the inputs into the outputs, answered by the partition runtime
    #[default]
    Echo,
    /// Answer every call with `status`, from the partition runtime
    Status { status: i32 },
    /// Answer every call with `status` from inside the dispatch backend
    Inline { status: i32 },
}

/// A RoT service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Name
    pub name: String,

    /// Service id
    pub sid: u32,

    /// Current version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Version matching rule
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Called through static handles instead of connections
    #[serde(default)]
    pub stateless: bool,

    /// Reachable from the non-secure side
    #[serde(default)]
    pub ns_accessible: bool,

    /// Hosting partition
    pub partition: i32,

    /// Simulated behaviour
    #[serde(default)]
    pub behaviour: Behaviour,
}

fn default_slots() -> usize {
    NUM_MAILBOX_QUEUE_SLOT
}

fn default_client_id_min() -> i32 {
    -0x3FFF_FFFF
}

fn default_client_id_max() -> i32 {
    -0x3C00_0000
}

fn default_ns_memory() -> usize {
    64 * 1024
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

fn default_version() -> u32 {
    1
}

impl WardenConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Check the manifest for inconsistencies
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.mailbox.slots == 0 || self.mailbox.slots > NUM_MAILBOX_QUEUE_SLOT {
            return Err(WardenError::SlotCount(self.mailbox.slots, NUM_MAILBOX_QUEUE_SLOT));
        }
        self.client_id_range()?;

        let mut partitions = HashSet::new();
        for partition in &self.partitions {
            if !partitions.insert(partition.id) {
                return Err(WardenError::DuplicatePartition(partition.id));
            }
        }

        let mut sids = HashSet::new();
        for service in &self.services {
            if !sids.insert(service.sid) {
                return Err(WardenError::DuplicateSid(service.sid));
            }
            if !partitions.contains(&service.partition) {
                return Err(WardenError::UnknownPartition {
                    service: service.name.clone(),
                    partition: service.partition,
                });
            }
        }

        let stateless = self.services.iter().filter(|s| s.stateless).count();
        if stateless > STATIC_HANDLE_NUM_LIMIT {
            return Err(WardenError::TooManyStateless(stateless, STATIC_HANDLE_NUM_LIMIT));
        }
        Ok(())
    }

    /// Non-secure client id translation
    pub fn client_id_range(&self) -> Result<ClientIdRange, WardenError> {
        let (min, max) = (self.mailbox.client_id_min, self.mailbox.client_id_max);
        ClientIdRange::new(CLIENT_ID_OWNER_MAGIC, min, max)
            .ok_or(WardenError::ClientIdRange { min, max })
    }

    /// Directory tables for the secure side
    ///
    /// Stateless services get static handle indices in manifest order.
    pub fn directory_tables(&self) -> (Vec<ServiceDescriptor>, Vec<PartitionInfo>) {
        let mut next_static = 0u8;
        let services = self
            .services
            .iter()
            .map(|s| {
                let mut desc = ServiceDescriptor::new(&s.name, s.sid, s.version, s.partition)
                    .policy(s.policy.into());
                if s.ns_accessible {
                    desc = desc.ns_accessible();
                }
                if s.stateless {
                    desc = desc.stateless(next_static);
                    next_static += 1;
                }
                desc
            })
            .collect();
        let partitions = self
            .partitions
            .iter()
            .map(|p| PartitionInfo::new(p.id, &p.dependencies))
            .collect();
        (services, partitions)
    }

    /// Static handle index assigned to stateless service `sid`
    pub fn stateless_index(&self, sid: u32) -> Option<usize> {
        self.services
            .iter()
            .filter(|s| s.stateless)
            .position(|s| s.sid == sid)
    }
}
