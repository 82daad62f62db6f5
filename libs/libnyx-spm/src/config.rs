//! Build-time configuration
//!
//! These values size every fixed table in the crate. Both sides of the
//! mailbox must be built with the same `NUM_MAILBOX_QUEUE_SLOT`.

use static_assertions::const_assert;

/// Number of mailbox queue slots shared with the non-secure side
pub const NUM_MAILBOX_QUEUE_SLOT: usize = 4;

/// Maximum number of io-vectors (inputs + outputs) in one call
pub const PSA_MAX_IOVEC: usize = 4;

/// Capacity of the connection registry
pub const CONNECTION_POOL_SIZE: usize = 8;

/// Framework version reported to clients (1.1)
pub const PSA_FRAMEWORK_VERSION: u32 = 0x0101;

/// Version reported for services that do not exist or are not visible
pub const PSA_VERSION_NONE: u32 = 0;

/// Upper bound on stateless services reachable through static handles
pub const STATIC_HANDLE_NUM_LIMIT: usize = 32;

/// Maximum number of services one partition may declare as dependencies
pub const MAX_PARTITION_DEPS: usize = 16;

/// Maximum length of a service name
pub const SERVICE_NAME_LEN: usize = 32;

/// Owner tag passed to client-id translation for mailbox traffic ("MBOX")
pub const CLIENT_ID_OWNER_MAGIC: u32 = 0x4D42_4F58;

// Queue status words are 32-bit bitmasks.
const_assert!(NUM_MAILBOX_QUEUE_SLOT > 0 && NUM_MAILBOX_QUEUE_SLOT <= 32);
// Connection handles carry index + 1 in their low byte.
const_assert!(CONNECTION_POOL_SIZE > 0 && CONNECTION_POOL_SIZE < 0xFF);
const_assert!(STATIC_HANDLE_NUM_LIMIT <= 32);
