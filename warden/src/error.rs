//! Warden errors

use std::time::Duration;

use libnyx_spm::service::{PartitionId, Sid};
use libnyx_spm::MailboxError;
use thiserror::Error;

/// Configuration and scenario failures
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("mailbox slot count {0} outside 1..={1}")]
    SlotCount(usize, usize),

    #[error("duplicate service id {0:#x}")]
    DuplicateSid(Sid),

    #[error("duplicate partition id {0}")]
    DuplicatePartition(PartitionId),

    #[error("{0} stateless services exceed the static handle limit of {1}")]
    TooManyStateless(usize, usize),

    #[error("service {service} belongs to unknown partition {partition}")]
    UnknownPartition { service: String, partition: PartitionId },

    #[error("invalid non-secure client id range {min}..={max}")]
    ClientIdRange { min: i32, max: i32 },

    #[error("non-secure memory exhausted ({0} bytes requested)")]
    OutOfMemory(usize),

    #[error("mailbox: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("step {step}: {reason}")]
    Script { step: usize, reason: String },

    #[error("no reply from the secure core within {0:?}")]
    Timeout(Duration),

    #[error("client memory fault at {0:#x}")]
    MemoryFault(u32),
}
