//! State directory layout.
//!
//! Everything the supervisor persists lives under one directory:
//!
//! ```text
//! ~/.local/rfs/
//! ├── daemon.sock            control socket
//! ├── <name>/                default mount points
//! └── mounts/
//!     ├── <name>.state       pretty-printed MountRecord JSON
//!     └── <name>.log         per-mount log, capped at 10 MiB
//! ```
//!
//! The root is overridable with `RFS_STATE_DIR`.

use std::path::{Path, PathBuf};

use directories::BaseDirs;

/// Environment variable overriding the state directory root.
pub const STATE_DIR_ENV: &str = "RFS_STATE_DIR";

/// Resolved state directory layout.
#[derive(Clone, Debug)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Resolve from the environment: `$RFS_STATE_DIR`, else
    /// `<home>/.local/rfs`.
    pub fn resolve() -> Self {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            if !dir.is_empty() {
                return Self::at(PathBuf::from(dir));
            }
        }
        let home = BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self::at(home.join(".local").join("rfs"))
    }

    /// Use an explicit root (tests, embedding).
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `.state` and `.log` files.
    pub fn mounts_dir(&self) -> PathBuf {
        self.root.join("mounts")
    }

    /// The supervisor's control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn state_file(&self, name: &str) -> PathBuf {
        self.mounts_dir().join(format!("{name}.state"))
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.mounts_dir().join(format!("{name}.log"))
    }

    /// Default mount point for a mount with no explicit directory.
    pub fn default_mount_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let state = StateDir::at(PathBuf::from("/tmp/rfs-test"));
        assert_eq!(state.socket_path(), PathBuf::from("/tmp/rfs-test/daemon.sock"));
        assert_eq!(
            state.state_file("devbox:~"),
            PathBuf::from("/tmp/rfs-test/mounts/devbox:~.state")
        );
        assert_eq!(
            state.log_file("devbox:~"),
            PathBuf::from("/tmp/rfs-test/mounts/devbox:~.log")
        );
        assert_eq!(
            state.default_mount_dir("devbox"),
            PathBuf::from("/tmp/rfs-test/devbox")
        );
    }
}
