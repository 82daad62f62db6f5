//! Warden
//!
//! Host platform for `libnyx-spm`. A [`board::Board`] hosts the secure image
//! (SPM, mailbox agent, partition runtime) on tokio tasks, and an
//! [`client::NsClient`] plays the non-secure core across the shared mailbox.

pub mod board;
pub mod client;
pub mod config;
pub mod error;
pub mod platform;
pub mod runtime;
pub mod script;

pub use board::Board;
pub use client::{CallOutcome, NsClient};
pub use config::WardenConfig;
pub use error::WardenError;
