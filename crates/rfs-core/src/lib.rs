//! Shared types for the rfs mount supervisor.
//!
//! This crate holds everything the CLI client and the daemon must agree on:
//! - mount naming and target parsing ([`types`])
//! - the JSON command/response wire protocol ([`protocol`])
//! - the on-disk state directory layout ([`config`])

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::StateDir;
pub use error::WireError;
pub use protocol::{Command, Response};
pub use types::{mount_name, parse_target, resolve_mount_name, MountRecord, MountSpec};
