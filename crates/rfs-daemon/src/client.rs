//! Client side of the supervisor socket.
//!
//! Encodes one command, reads one response. When the socket is not there
//! the daemon is spawned from the current executable and the dial is
//! retried for up to a second.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use rfs_core::{Command, Response, StateDir, WireError};

/// Dial attempts after spawning the daemon.
const DIAL_RETRIES: u32 = 20;
const DIAL_INTERVAL: Duration = Duration::from_millis(50);

/// Send a command to the supervisor for the default state directory,
/// starting the daemon if necessary.
pub async fn send_command(command: &Command) -> Result<Response, WireError> {
    let state = StateDir::resolve();
    send_command_at(&state, command, true).await
}

/// Send a command against an explicit state directory. With `autostart`
/// the daemon is spawned and the dial retried when the socket is dead.
pub async fn send_command_at(
    state: &StateDir,
    command: &Command,
    autostart: bool,
) -> Result<Response, WireError> {
    let socket = state.socket_path();

    let stream = match UnixStream::connect(&socket).await {
        Ok(stream) => stream,
        Err(err) if autostart => {
            debug!("supervisor not reachable ({err}), starting it");
            spawn_daemon()?;
            dial_retry(&socket).await.ok_or(WireError::DaemonUnavailable)?
        }
        Err(err) => return Err(err.into()),
    };

    exchange(stream, command).await
}

async fn exchange(stream: UnixStream, command: &Command) -> Result<Response, WireError> {
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_string(command)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
    writer.flush().await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Err(WireError::Truncated);
    }
    Ok(serde_json::from_str(&line)?)
}

/// Launch `<current exe> daemon` detached, inheriting stderr so startup
/// failures are visible to the user.
fn spawn_daemon() -> Result<(), WireError> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()?;
    Ok(())
}

async fn dial_retry(socket: &Path) -> Option<UnixStream> {
    for _ in 0..DIAL_RETRIES {
        tokio::time::sleep(DIAL_INTERVAL).await;
        if let Ok(stream) = UnixStream::connect(socket).await {
            return Some(stream);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    /// One-shot fake supervisor answering every connection with `response`.
    async fn fake_supervisor(socket: std::path::PathBuf, response: Response) {
        let listener = UnixListener::bind(&socket).unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        // must be a single JSON object on one line
        let _: Command = serde_json::from_str(&line).unwrap();

        let mut payload = serde_json::to_string(&response).unwrap();
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let tmp = tempdir().unwrap();
        let state = StateDir::at(tmp.path().to_path_buf());

        let server = tokio::spawn(fake_supervisor(
            state.socket_path(),
            Response::with_names(vec!["devbox:~".into()]),
        ));
        // give the listener a beat to bind
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = send_command_at(&state, &Command::Down { names: vec![] }, false)
            .await
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.names.unwrap(), vec!["devbox:~".to_string()]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_socket_without_autostart() {
        let tmp = tempdir().unwrap();
        let state = StateDir::at(tmp.path().to_path_buf());
        let err = send_command_at(&state, &Command::Ls, false).await.unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }
}
