//! Single-instance supervisor daemon.
//!
//! Owns the mount registry, a Unix-socket command loop, and the monitor
//! loop. One JSON command comes in per connection, one response goes out,
//! and the connection closes; after every response the supervisor exits if
//! the registry is empty (the client auto-starts it on demand, so an idle
//! daemon has no reason to stay resident).
//!
//! The registry mutex only guards the map itself: liveness probing and
//! teardown happen on snapshots taken under the lock and released before
//! any network or process I/O.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use rfs_core::{Command, MountSpec, Response, StateDir};

use crate::engine::{self, MountEngine, MountRuntime};
use crate::state::StateStore;
use crate::vfs::Creds;
use crate::{MONITOR_GRACE, MONITOR_INTERVAL};

pub struct Supervisor {
    store: StateStore,
    engine: MountEngine,
    registry: Mutex<HashMap<String, Arc<MountRuntime>>>,
}

impl Supervisor {
    pub fn new(state: StateDir) -> Arc<Self> {
        let store = StateStore::new(state);
        let owner = Creds::invoking_user();
        Arc::new(Self {
            engine: MountEngine::new(store.clone(), owner),
            store,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Run the accept loop; never returns under normal operation (the
    /// supervisor exits the process when the registry drains).
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        self.store.ensure_dirs()?;

        for name in self.store.stale_state_names() {
            // scan-only: reported and left in place
            warn!(%name, "orphaned state file from a previous run");
        }
        self.store.cleanup_old_logs();

        let socket = self.store.dir().socket_path();
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket)?;
        std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o777))?;
        info!(socket = %socket.display(), "supervisor listening");

        tokio::spawn(Arc::clone(&self).monitor_loop());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(Arc::clone(&self).handle_conn(stream));
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut line = String::new();

        let response = match BufReader::new(reader).read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => match serde_json::from_str::<Command>(&line) {
                Ok(command) => self.dispatch(command).await,
                Err(err) => Response::failure(err.to_string()),
            },
            Err(err) => Response::failure(err.to_string()),
        };

        if let Ok(mut payload) = serde_json::to_string(&response) {
            payload.push('\n');
            let _ = writer.write_all(payload.as_bytes()).await;
            let _ = writer.flush().await;
        }

        if self.registry.lock().is_empty() {
            info!("no mounts registered, exiting");
            std::process::exit(0);
        }
    }

    pub async fn dispatch(&self, command: Command) -> Response {
        match command {
            Command::Up {
                ssh_alias,
                remote_path,
                mount_dir,
            } => {
                self.handle_up(MountSpec {
                    ssh_alias,
                    remote_path,
                    mount_dir,
                })
                .await
            }
            Command::Ls => self.handle_ls(),
            Command::Down { names } => self.handle_down(names).await,
        }
    }

    async fn handle_up(&self, spec: MountSpec) -> Response {
        let name = spec.name();
        if self.registry.lock().contains_key(&name) {
            return Response::failure(format!("already mounted: {name}"));
        }

        match self.engine.up(&spec).await {
            Ok(runtime) => {
                let record = runtime.record.clone();
                self.registry.lock().insert(name, Arc::new(runtime));
                // persist only after the registry insert
                if let Err(err) = self.store.save_record(&record) {
                    warn!(name = %record.name, "failed to persist state: {err}");
                }
                Response::with_mount(record)
            }
            Err(err) => Response::failure(err.to_string()),
        }
    }

    fn handle_ls(&self) -> Response {
        let records = self
            .registry
            .lock()
            .values()
            .map(|runtime| runtime.record.clone())
            .collect();
        Response::with_mounts(records)
    }

    async fn handle_down(&self, mut names: Vec<String>) -> Response {
        if names.is_empty() {
            names = self.registry.lock().keys().cloned().collect();
        }

        let mut stopped = Vec::new();
        for name in names {
            if self.stop_mount(&name).await {
                stopped.push(name);
            }
        }
        Response::with_names(stopped)
    }

    /// Stop one mount. Unknown names are a silent no-op. The `.state` file
    /// is removed before the registry entry.
    async fn stop_mount(&self, name: &str) -> bool {
        if !self.registry.lock().contains_key(name) {
            return false;
        }
        self.store.delete_record(name);

        let Some(runtime) = self.registry.lock().remove(name) else {
            return false;
        };
        self.engine.teardown(&runtime).await;
        true
    }

    /// Periodically stop mounts whose SSH connection dropped or whose
    /// directory left the host mount table. Fresh mounts get a grace
    /// window so a slow `mount` cannot race the check.
    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let candidates: Vec<(String, Arc<MountRuntime>)> = self
                .registry
                .lock()
                .iter()
                .filter(|(_, runtime)| runtime.created_at.elapsed() >= MONITOR_GRACE)
                .map(|(name, runtime)| (name.clone(), Arc::clone(runtime)))
                .collect();

            for (name, runtime) in candidates {
                let connected = runtime.client.is_connected().await;
                let mounted = engine::is_mounted(&runtime.record.mount_dir).await;
                if connected && mounted {
                    continue;
                }
                warn!(%name, connected, mounted, "mount unhealthy, stopping");
                runtime
                    .log
                    .append(&format!("monitor: connected={connected} mounted={mounted}, stopping"));
                self.stop_mount(&name).await;
            }
        }
    }
}
