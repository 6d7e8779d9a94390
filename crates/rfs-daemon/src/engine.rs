//! Mount lifecycle engine.
//!
//! `up` drives the pipeline: log file → ephemeral port → mount directory →
//! SSH connect → session liveness check → SFTP adapter → NFS server →
//! warm-up → host `mount`. Every stage undoes all prior stages on failure,
//! so a returned error means no resources are left behind. The host
//! `mount` invocation itself is the one deliberate exception: its failure
//! is logged but the NFS server and SSH connection stay up so the user can
//! retry the mount by hand.
//!
//! `teardown` is best-effort on every step and succeeds even when the SSH
//! connection is already dead.

use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use rfs_core::{MountRecord, MountSpec};

use crate::server::{self, NfsBridge};
use crate::sftp_fs::SftpFs;
use crate::ssh::{SshClient, SshError};
use crate::state::{LogFile, StateStore};
use crate::vfs::{Creds, RemoteFs};
use crate::SERVER_WARMUP;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to create log: {0}")]
    Log(#[source] std::io::Error),

    #[error("no free port: {0}")]
    Port(#[source] std::io::Error),

    #[error("failed to create mount dir {dir}: {source}")]
    MountDir {
        dir: String,
        source: std::io::Error,
    },

    #[error("ssh connect: {0}")]
    Connect(#[source] SshError),

    #[error("session check: {0}")]
    Session(String),

    #[error("new fs: {0}")]
    Adapter(#[source] SshError),

    #[error("nfs server: {0}")]
    Server(String),
}

/// Everything a live mount owns.
///
/// The runtime is the sole owner of its SSH client, SFTP adapter, log
/// handle, mount directory and NFS server task; `teardown` releases all
/// five in order (adapter before client).
pub struct MountRuntime {
    pub record: MountRecord,
    pub log: Arc<LogFile>,
    pub fs: Arc<SftpFs>,
    pub client: Arc<SshClient>,
    server: JoinHandle<()>,
    pub created_at: Instant,
}

/// Builds mounts up and tears them down.
pub struct MountEngine {
    store: StateStore,
    owner: Creds,
}

impl MountEngine {
    pub fn new(store: StateStore, owner: Creds) -> Self {
        Self { store, owner }
    }

    /// Run the up pipeline for `spec`.
    pub async fn up(&self, spec: &MountSpec) -> Result<MountRuntime, EngineError> {
        let name = spec.name();
        let log = Arc::new(self.store.open_log(&name).map_err(EngineError::Log)?);
        log.append(&format!("starting {name} ({}:{})", spec.ssh_alias, spec.remote_path));

        let port = server::free_port().map_err(EngineError::Port)?;

        let mount_dir = spec
            .mount_dir
            .clone()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.store.dir().default_mount_dir(&name));
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&mount_dir)
            .map_err(|source| EngineError::MountDir {
                dir: mount_dir.display().to_string(),
                source,
            })?;

        let client = match SshClient::connect(&spec.ssh_alias).await {
            Ok(client) => client,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&mount_dir);
                return Err(EngineError::Connect(err));
            }
        };

        // cheap end-to-end session check before committing further
        match client.run_command("echo").await {
            Ok((0, output)) => log.write_bytes(&output),
            Ok((status, output)) => {
                log.write_bytes(&output);
                client.close().await;
                let _ = std::fs::remove_dir_all(&mount_dir);
                return Err(EngineError::Session(format!("echo exited with status {status}")));
            }
            Err(err) => {
                client.close().await;
                let _ = std::fs::remove_dir_all(&mount_dir);
                return Err(EngineError::Session(err.to_string()));
            }
        }

        let fs = match SftpFs::new(Arc::clone(&client), &spec.remote_path, self.owner).await {
            Ok(fs) => fs,
            Err(err) => {
                client.close().await;
                let _ = std::fs::remove_dir_all(&mount_dir);
                return Err(EngineError::Adapter(err));
            }
        };

        let shared: Arc<dyn RemoteFs> = Arc::clone(&fs) as Arc<dyn RemoteFs>;
        let listener = match NfsBridge::new(shared, self.owner).await {
            Ok(bridge) => match server::bind_listener(bridge, port).await {
                Ok(listener) => listener,
                Err(err) => {
                    let _ = fs.close().await;
                    client.close().await;
                    let _ = std::fs::remove_dir_all(&mount_dir);
                    return Err(EngineError::Server(err.to_string()));
                }
            },
            Err(err) => {
                let _ = fs.close().await;
                client.close().await;
                let _ = std::fs::remove_dir_all(&mount_dir);
                return Err(EngineError::Server(err.to_string()));
            }
        };

        let server_log = Arc::clone(&log);
        let server = tokio::spawn(async move {
            if let Err(err) = server::serve(listener).await {
                server_log.append(&format!("nfs server error: {err}"));
            }
        });
        info!(%name, port, "nfs server started");

        // give the listener a moment before pointing the kernel at it
        tokio::time::sleep(SERVER_WARMUP).await;

        // clear any stale mount left on the directory
        let _ = Command::new("umount").arg("-f").arg(&mount_dir).output().await;

        let options = format!("nolock,noacl,soft,vers=3,tcp,port={port},mountport={port}");
        let mount_result = Command::new("mount")
            .args(["-o", &options, "-t", "nfs", "localhost:/"])
            .arg(&mount_dir)
            .output()
            .await;
        match mount_result {
            Ok(output) if output.status.success() => {
                log.append(&format!("mounted at {}", mount_dir.display()));
            }
            Ok(output) => {
                // deliberately not fatal: the NFS server and SSH stay up so
                // the user can retry the mount by hand
                log.append(&format!("mount failed: {}", output.status));
                log.write_bytes(&output.stdout);
                log.write_bytes(&output.stderr);
                warn!(%name, "mount command failed; nfs server left running");
            }
            Err(err) => {
                log.append(&format!("mount failed: {err}"));
                warn!(%name, "mount command failed: {err}");
            }
        }

        let record = MountRecord {
            name: name.clone(),
            pid: std::process::id(),
            port: port.to_string(),
            mount_dir: mount_dir.display().to_string(),
            ssh_alias: spec.ssh_alias.clone(),
            remote_path: spec.remote_path.clone(),
            started_at: Utc::now(),
            log_file: log.path().display().to_string(),
        };

        Ok(MountRuntime {
            record,
            log,
            fs,
            client,
            server,
            created_at: Instant::now(),
        })
    }

    /// Release everything a runtime owns. Best-effort throughout; safe when
    /// the SSH connection is already dead.
    pub async fn teardown(&self, runtime: &MountRuntime) {
        let dir = &runtime.record.mount_dir;
        let _ = Command::new("umount").arg("-f").arg(dir).output().await;

        let _ = runtime.fs.close().await;
        runtime.client.close().await;
        runtime.server.abort();
        runtime.log.append("stopped");

        let _ = std::fs::remove_dir_all(dir);
        info!(name = %runtime.record.name, "mount stopped");
    }
}

/// Whether the host mount table lists `mount_dir`.
pub async fn is_mounted(mount_dir: &str) -> bool {
    match Command::new("mount").output().await {
        Ok(output) => mount_table_contains(&String::from_utf8_lossy(&output.stdout), mount_dir),
        Err(_) => false,
    }
}

fn mount_table_contains(table: &str, mount_dir: &str) -> bool {
    table.contains(&format!(" on {mount_dir} "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_table_search() {
        let table = "localhost:/ on /home/me/.local/rfs/devbox:~ type nfs (rw,relatime)\n\
                     tmpfs on /tmp type tmpfs (rw)\n";
        assert!(mount_table_contains(table, "/home/me/.local/rfs/devbox:~"));
        assert!(!mount_table_contains(table, "/home/me/.local/rfs/devbox"));
        assert!(!mount_table_contains(table, "/tm"));
    }
}
