//! Mount naming and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable description of a requested mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSpec {
    /// Key in the user's SSH client configuration.
    pub ssh_alias: String,
    /// Remote path: absolute, `~`, `~/...`, or empty (remote home).
    pub remote_path: String,
    /// Local mount point; derived from the state dir when absent.
    pub mount_dir: Option<String>,
}

impl MountSpec {
    pub fn new(ssh_alias: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            ssh_alias: ssh_alias.into(),
            remote_path: remote_path.into(),
            mount_dir: None,
        }
    }

    /// Deterministic, filesystem-safe identifier for this mount.
    pub fn name(&self) -> String {
        mount_name(&self.ssh_alias, &self.remote_path)
    }
}

/// Derive the canonical mount name from an alias and a remote path.
///
/// Empty path and `/` collapse to the bare alias, `~` becomes `alias:~`, and
/// any other path is appended with its leading `/` stripped and every
/// remaining `/` replaced by `:`.
pub fn mount_name(alias: &str, path: &str) -> String {
    if path.is_empty() || path == "/" {
        return alias.to_string();
    }
    if path == "~" {
        return format!("{alias}:~");
    }
    let safe = path.strip_prefix('/').unwrap_or(path).replace('/', ":");
    format!("{alias}:{safe}")
}

/// Split a CLI target of the form `alias[:path]` into its parts.
///
/// Trailing slashes are ignored; a missing path defaults to `~`.
pub fn parse_target(target: &str) -> (String, String) {
    let target = target.trim_end_matches('/');
    match target.split_once(':') {
        Some((alias, path)) => (alias.to_string(), path.to_string()),
        None => (target.to_string(), "~".to_string()),
    }
}

/// Resolve a CLI target directly to its mount name.
pub fn resolve_mount_name(target: &str) -> String {
    let (alias, path) = parse_target(target);
    mount_name(&alias, &path)
}

/// Persistent record of a running mount.
///
/// Serialized pretty-printed to `<state>/mounts/<name>.state` and carried on
/// the wire inside [`crate::protocol::Response`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountRecord {
    pub name: String,
    /// Pid of the supervisor process hosting this mount.
    pub pid: u32,
    /// NFS server port, as decimal digits.
    pub port: String,
    pub mount_dir: String,
    pub ssh_alias: String,
    pub remote_path: String,
    pub started_at: DateTime<Utc>,
    pub log_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_name_root_and_empty() {
        assert_eq!(mount_name("devbox", ""), "devbox");
        assert_eq!(mount_name("devbox", "/"), "devbox");
    }

    #[test]
    fn test_mount_name_home() {
        assert_eq!(mount_name("devbox", "~"), "devbox:~");
    }

    #[test]
    fn test_mount_name_flattens_slashes() {
        assert_eq!(mount_name("devbox", "/var/log"), "devbox:var:log");
        assert_eq!(mount_name("devbox", "src"), "devbox:src");
        // `~/x` follows the same rule: no leading slash to strip, `/` -> `:`
        assert_eq!(mount_name("devbox", "~/src"), "devbox:~:src");
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("devbox:/var/log"),
            ("devbox".into(), "/var/log".into())
        );
        assert_eq!(parse_target("devbox"), ("devbox".into(), "~".into()));
        assert_eq!(parse_target("devbox:~/src/"), ("devbox".into(), "~/src".into()));
        // only the first colon splits
        assert_eq!(parse_target("devbox:a:b"), ("devbox".into(), "a:b".into()));
    }

    #[test]
    fn test_resolve_mount_name() {
        assert_eq!(resolve_mount_name("devbox:~/src"), "devbox:~:src");
        assert_eq!(resolve_mount_name("devbox"), "devbox:~");
        assert_eq!(resolve_mount_name("devbox:/"), "devbox");
    }

    #[test]
    fn test_record_round_trip() {
        let record = MountRecord {
            name: "devbox:~".into(),
            pid: 4242,
            port: "51234".into(),
            mount_dir: "/home/me/.local/rfs/devbox:~".into(),
            ssh_alias: "devbox".into(),
            remote_path: "~".into(),
            started_at: Utc::now(),
            log_file: "/home/me/.local/rfs/mounts/devbox:~.log".into(),
        };
        let json = serde_json::to_string_pretty(&record).unwrap();
        assert!(json.contains("\"mountDir\""));
        assert!(json.contains("\"sshAlias\""));
        let back: MountRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
