//! rfs daemon - mounts remote SFTP trees through a loopback NFS server
//!
//! This crate provides:
//! - SSH transport with reconnect (`ssh`)
//! - the backend filesystem contract the NFS host consumes (`vfs`)
//! - an SFTP implementation of that contract (`sftp_fs`)
//! - the per-mount NFS server host (`server`)
//! - the mount lifecycle engine (`engine`)
//! - the single-instance supervisor and its control socket (`supervisor`)
//! - the CLI client side (`client`)
//!
//! # Architecture
//!
//! ```text
//! rfs up devbox:~/src
//!   │ unix socket (JSON)
//!   ▼
//! supervisor ──► engine ──► ssh connect ─► sftp adapter ─► nfs server
//!   │                                                        │ tcp :<ephemeral>
//!   │ registry + monitor loop                                ▼
//!   └────────────────────────────────────── host `mount -t nfs localhost:/ ...`
//! ```
//!
//! Each mount owns its SSH connection, SFTP adapter, log file, and NFS
//! server task; the supervisor's registry is the only authoritative source
//! of mount liveness while it runs.

pub mod client;
pub mod engine;
pub mod rpath;
pub mod server;
pub mod sftp_fs;
pub mod ssh;
pub mod state;
pub mod supervisor;
pub mod vfs;

#[cfg(test)]
pub(crate) mod memfs;

pub use engine::MountEngine;
pub use server::NfsBridge;
pub use sftp_fs::SftpFs;
pub use ssh::SshClient;
pub use supervisor::Supervisor;

use std::time::Duration;

/// TTL for cached directory listings in the SFTP adapter.
pub const DIR_CACHE_TTL: Duration = Duration::from_secs(5);

/// How often the supervisor probes mount liveness.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Freshly created mounts are exempt from liveness checks for this long.
pub const MONITOR_GRACE: Duration = Duration::from_secs(10);

/// Time given to the NFS server to start accepting before `mount` runs.
pub const SERVER_WARMUP: Duration = Duration::from_secs(2);

/// Per-mount log files are halved once they reach this size.
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
