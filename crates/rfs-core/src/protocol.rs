//! Wire protocol between the CLI client and the supervisor.
//!
//! One JSON-encoded [`Command`] goes in over the Unix socket, one JSON
//! [`Response`] comes back, and the connection closes. Objects are written as
//! a single line; framing is the JSON value itself.

use serde::{Deserialize, Serialize};

use crate::types::MountRecord;

/// A request sent to the supervisor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    /// Bring up a mount for `sshAlias:remotePath`.
    #[serde(rename_all = "camelCase")]
    Up {
        ssh_alias: String,
        remote_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mount_dir: Option<String>,
    },
    /// List all registered mounts.
    Ls,
    /// Stop the named mounts; an empty list stops everything.
    Down {
        #[serde(default)]
        names: Vec<String>,
    },
}

/// The supervisor's reply to a [`Command`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<MountRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
}

impl Response {
    /// A failure reply carrying `message` verbatim.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_mount(record: MountRecord) -> Self {
        Self {
            ok: true,
            mount: Some(record),
            ..Default::default()
        }
    }

    pub fn with_mounts(records: Vec<MountRecord>) -> Self {
        Self {
            ok: true,
            mounts: Some(records),
            ..Default::default()
        }
    }

    pub fn with_names(names: Vec<String>) -> Self {
        Self {
            ok: true,
            names: Some(names),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tagging() {
        let cmd = Command::Up {
            ssh_alias: "devbox".into(),
            remote_path: "~/src".into(),
            mount_dir: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"up\""));
        assert!(json.contains("\"sshAlias\":\"devbox\""));
        assert!(!json.contains("mountDir"));

        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_ls_is_bare() {
        let json = serde_json::to_string(&Command::Ls).unwrap();
        assert_eq!(json, r#"{"type":"ls"}"#);
    }

    #[test]
    fn test_down_names_default() {
        let cmd: Command = serde_json::from_str(r#"{"type":"down"}"#).unwrap();
        assert_eq!(cmd, Command::Down { names: vec![] });
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let json = serde_json::to_string(&Response::failure("no such alias")).unwrap();
        assert!(json.contains("\"error\":\"no such alias\""));
        assert!(!json.contains("mounts"));
        assert!(!json.contains("names"));
    }
}
