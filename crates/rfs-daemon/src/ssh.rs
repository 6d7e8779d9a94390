//! SSH transport with reconnect.
//!
//! Host configuration comes from the user's own OpenSSH client config,
//! queried by running `ssh -G <alias>` and parsing the flattened `key value`
//! output. Authentication is the union of the profile's identity files and
//! whatever the SSH agent offers; host keys are verified against the user's
//! `known_hosts`, and a missing or unreadable `known_hosts` is fatal.
//!
//! All operations on an [`SshClient`] are serialized by one async mutex;
//! callers must not hold any other lock while awaiting them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::ssh_key::Algorithm;
use russh::keys::{check_known_hosts_path, load_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reconnect attempts before giving up.
const RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("ssh: {0}")]
    Protocol(#[from] russh::Error),

    #[error("sftp: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot locate home directory for known_hosts")]
    NoHome,

    #[error("known_hosts unavailable at {path}: {reason}")]
    KnownHosts { path: PathBuf, reason: String },

    #[error("host key for {0} not accepted by known_hosts")]
    HostKeyRejected(String),

    #[error("authentication failed for {0}: no identity accepted")]
    AuthFailed(String),

    #[error("ssh agent: {0}")]
    Agent(String),

    #[error("not connected")]
    NotConnected,

    #[error("failed to reconnect to {alias} after {attempts} attempts")]
    ReconnectFailed { alias: String, attempts: u32 },
}

/// Per-alias connection settings parsed from `ssh -G`.
#[derive(Clone, Debug, Default)]
struct HostProfile {
    user: String,
    hostname: String,
    port: u16,
    identity_files: Vec<PathBuf>,
    agent_socket: Option<String>,
}

async fn load_profile(alias: &str) -> Result<HostProfile, SshError> {
    let output = tokio::process::Command::new("ssh")
        .arg("-G")
        .arg(alias)
        .output()
        .await?;

    let mut profile = HostProfile {
        port: 22,
        agent_socket: std::env::var("SSH_AUTH_SOCK").ok().filter(|s| !s.is_empty()),
        ..Default::default()
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        match key {
            "user" => profile.user = value.to_string(),
            "hostname" => profile.hostname = value.to_string(),
            "port" => profile.port = value.parse().unwrap_or(22),
            "identityfile" => profile.identity_files.push(expand_home(value)),
            "identityagent" => profile.agent_socket = Some(value.to_string()),
            _ => {}
        }
    }

    debug!(
        alias,
        user = %profile.user,
        host = %profile.hostname,
        port = profile.port,
        identities = profile.identity_files.len(),
        "parsed ssh profile"
    );
    Ok(profile)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

/// Host key verifier backed by the user's `known_hosts`.
struct KnownHostsVerifier {
    hostname: String,
    port: u16,
    path: PathBuf,
}

impl client::Handler for KnownHostsVerifier {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match check_known_hosts_path(&self.hostname, self.port, server_public_key, &self.path) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.hostname, "host key not present in known_hosts");
                Ok(false)
            }
            Err(err) => Err(SshError::KnownHosts {
                path: self.path.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

/// Dial an alias: resolve its profile, verify the host key, authenticate
/// with file identities then agent identities.
async fn dial(alias: &str) -> Result<Handle<KnownHostsVerifier>, SshError> {
    let profile = load_profile(alias).await?;

    let known_hosts = home_dir().ok_or(SshError::NoHome)?.join(".ssh").join("known_hosts");
    if !known_hosts.is_file() {
        return Err(SshError::KnownHosts {
            path: known_hosts,
            reason: "file not found".into(),
        });
    }

    let config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(15)),
        ..Default::default()
    });
    let verifier = KnownHostsVerifier {
        hostname: profile.hostname.clone(),
        port: profile.port,
        path: known_hosts,
    };

    let mut handle = client::connect(
        config,
        (profile.hostname.as_str(), profile.port),
        verifier,
    )
    .await?;

    let rsa_hash: Option<HashAlg> = handle.best_supported_rsa_hash().await.ok().flatten().flatten();

    // Identity files first. Unreadable or unparsable keys are collected,
    // logged, and skipped.
    let mut key_errors = Vec::new();
    for path in &profile.identity_files {
        let key = match load_secret_key(path, None) {
            Ok(key) => key,
            Err(err) => {
                key_errors.push(format!("{}: {err}", path.display()));
                continue;
            }
        };
        let hash = match key.algorithm() {
            Algorithm::Rsa { .. } => rsa_hash,
            _ => None,
        };
        let auth = handle
            .authenticate_publickey(
                profile.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash),
            )
            .await?;
        if auth.success() {
            info!(alias, key = %path.display(), "authenticated with identity file");
            return Ok(handle);
        }
    }
    if !key_errors.is_empty() {
        warn!(alias, "skipped identity files: {}", key_errors.join("; "));
    }

    // Then everything the agent offers.
    if let Some(socket) = &profile.agent_socket {
        match AgentClient::connect_uds(socket).await {
            Ok(mut agent) => {
                let identities = agent
                    .request_identities()
                    .await
                    .map_err(|e| SshError::Agent(e.to_string()))?;
                for key in identities {
                    let hash = match key.algorithm() {
                        Algorithm::Rsa { .. } => rsa_hash,
                        _ => None,
                    };
                    let auth = handle
                        .authenticate_publickey_with(profile.user.clone(), key, hash, &mut agent)
                        .await
                        .map_err(|e| SshError::Agent(e.to_string()))?;
                    if auth.success() {
                        info!(alias, "authenticated with agent identity");
                        return Ok(handle);
                    }
                }
            }
            Err(err) => warn!(alias, socket = %socket, "failed to dial ssh agent: {err}"),
        }
    }

    Err(SshError::AuthFailed(alias.to_string()))
}

/// A serialized SSH connection to one alias.
pub struct SshClient {
    alias: String,
    conn: Mutex<Option<Handle<KnownHostsVerifier>>>,
}

impl SshClient {
    /// Connect to an alias from the user's SSH configuration.
    pub async fn connect(alias: &str) -> Result<Arc<Self>, SshError> {
        let handle = dial(alias).await?;
        info!(alias, "ssh connected");
        Ok(Arc::new(Self {
            alias: alias.to_string(),
            conn: Mutex::new(Some(handle)),
        }))
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Whether a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        let guard = self.conn.lock().await;
        guard.as_ref().map(|h| !h.is_closed()).unwrap_or(false)
    }

    /// Reconnect if the connection is gone; a no-op when already connected.
    pub async fn ensure_connected(&self) -> Result<(), SshError> {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().map(|h| !h.is_closed()).unwrap_or(false) {
            return Ok(());
        }
        *guard = None;
        self.reconnect_locked(&mut guard).await
    }

    /// 5 attempts, linear backoff of `2·i` seconds for attempt `i`.
    async fn reconnect_locked(
        &self,
        slot: &mut Option<Handle<KnownHostsVerifier>>,
    ) -> Result<(), SshError> {
        for attempt in 1..=RECONNECT_ATTEMPTS {
            info!(alias = %self.alias, attempt, "reconnecting");
            match dial(&self.alias).await {
                Ok(handle) => {
                    *slot = Some(handle);
                    info!(alias = %self.alias, "reconnected");
                    return Ok(());
                }
                Err(err) => {
                    let wait = Duration::from_secs(2 * u64::from(attempt));
                    warn!(
                        alias = %self.alias,
                        attempt,
                        "reconnect failed: {err}; retrying in {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
        Err(SshError::ReconnectFailed {
            alias: self.alias.clone(),
            attempts: RECONNECT_ATTEMPTS,
        })
    }

    /// Run a command on a fresh exec session, returning the exit status and
    /// combined output.
    pub async fn run_command(&self, command: &str) -> Result<(u32, Vec<u8>), SshError> {
        let guard = self.conn.lock().await;
        let handle = guard.as_ref().ok_or(SshError::NotConnected)?;

        let mut channel = handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = Vec::new();
        let mut status = 0u32;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status,
                _ => {}
            }
        }
        Ok((status, output))
    }

    /// Open an SFTP subsystem channel on the current connection.
    pub async fn sftp_session(&self) -> Result<SftpSession, SshError> {
        let guard = self.conn.lock().await;
        let handle = guard.as_ref().ok_or(SshError::NotConnected)?;

        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    /// Drop the connection. Best-effort; safe to call twice.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(handle) = guard.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "closing", "en")
                .await;
            debug!(alias = %self.alias, "ssh closed");
        }
    }
}
