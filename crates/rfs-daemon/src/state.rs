//! Persistent supervisor state: mount records and per-mount log files.
//!
//! Records are pretty-printed JSON at `<state>/mounts/<name>.state`,
//! written after a mount is registered and removed before it is
//! deregistered. Log files live next to them and are capped at
//! [`MAX_LOG_SIZE`]: on overflow the first half of the content is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::{debug, warn};

use rfs_core::{MountRecord, StateDir};

use crate::MAX_LOG_SIZE;

/// Filesystem-side store for everything under the state directory.
#[derive(Clone)]
pub struct StateStore {
    dir: StateDir,
}

impl StateStore {
    pub fn new(dir: StateDir) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &StateDir {
        &self.dir
    }

    /// Create the state directory tree.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.dir.mounts_dir())
    }

    /// Persist a record; called only after registry insertion.
    pub fn save_record(&self, record: &MountRecord) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        fs::write(self.dir.state_file(&record.name), json)
    }

    pub fn load_record(&self, name: &str) -> std::io::Result<MountRecord> {
        let data = fs::read(self.dir.state_file(name))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Remove a record; called before registry deletion. Best-effort.
    pub fn delete_record(&self, name: &str) {
        let _ = fs::remove_file(self.dir.state_file(name));
    }

    /// Names of `.state` files left over from a previous supervisor.
    ///
    /// They are reported, not reaped: the files stay in place.
    pub fn stale_state_names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.dir.mounts_dir()) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".state").map(str::to_string)
            })
            .collect()
    }

    /// Delete log files that were not written today.
    pub fn cleanup_old_logs(&self) {
        let Ok(entries) = fs::read_dir(self.dir.mounts_dir()) else {
            return;
        };
        let today = Local::now().date_naive();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "log") {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if DateTime::<Local>::from(modified).date_naive() != today {
                debug!(path = %path.display(), "removing old log");
                let _ = fs::remove_file(&path);
            }
        }
    }

    /// Open (and reset) the log file for a mount.
    pub fn open_log(&self, name: &str) -> std::io::Result<LogFile> {
        LogFile::create(self.dir.log_file(name), MAX_LOG_SIZE)
    }
}

/// Append-only log file with a size cap.
///
/// When a write finds the file at or beyond `max_size`, the first half of
/// the content is dropped before the write proceeds.
pub struct LogFile {
    path: PathBuf,
    file: Mutex<File>,
    max_size: u64,
}

impl LogFile {
    pub fn create(path: PathBuf, max_size: u64) -> std::io::Result<Self> {
        let _ = fs::remove_file(&path);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            max_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    pub fn append(&self, message: &str) {
        let stamp = Local::now().format("%Y/%m/%d %H:%M:%S");
        self.write_bytes(format!("{stamp} {message}\n").as_bytes());
    }

    /// Append raw output (already newline-terminated or not; passed through
    /// as-is).
    pub fn write_bytes(&self, data: &[u8]) {
        let mut file = self.file.lock();
        if let Err(err) = self.enforce_cap(&mut file) {
            warn!(path = %self.path.display(), "log cap enforcement failed: {err}");
        }
        if let Err(err) = file.write_all(data) {
            warn!(path = %self.path.display(), "log write failed: {err}");
        }
    }

    fn enforce_cap(&self, file: &mut File) -> std::io::Result<()> {
        let size = file.metadata()?.len();
        if size < self.max_size {
            return Ok(());
        }
        let content = fs::read(&self.path)?;
        let keep = content[content.len() / 2..].to_vec();
        fs::write(&self.path, keep)?;
        *file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rfs_core::MountRecord;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, StateStore) {
        let tmp = tempdir().unwrap();
        let store = StateStore::new(StateDir::at(tmp.path().to_path_buf()));
        store.ensure_dirs().unwrap();
        (tmp, store)
    }

    fn record(name: &str) -> MountRecord {
        MountRecord {
            name: name.to_string(),
            pid: 1,
            port: "50000".into(),
            mount_dir: format!("/tmp/{name}"),
            ssh_alias: "devbox".into(),
            remote_path: "~".into(),
            started_at: Utc::now(),
            log_file: format!("/tmp/{name}.log"),
        }
    }

    #[test]
    fn test_record_round_trip_on_disk() {
        let (_tmp, store) = store();
        let rec = record("devbox:~");
        store.save_record(&rec).unwrap();

        let loaded = store.load_record("devbox:~").unwrap();
        assert_eq!(loaded, rec);

        // pretty-printed on disk
        let raw = fs::read_to_string(store.dir().state_file("devbox:~")).unwrap();
        assert!(raw.contains('\n'));

        store.delete_record("devbox:~");
        assert!(store.load_record("devbox:~").is_err());
        // deleting twice is a no-op
        store.delete_record("devbox:~");
    }

    #[test]
    fn test_stale_state_names() {
        let (_tmp, store) = store();
        store.save_record(&record("a")).unwrap();
        store.save_record(&record("b:~")).unwrap();
        fs::write(store.dir().log_file("a"), "log").unwrap();

        let mut names = store.stale_state_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b:~".to_string()]);
        // the scan must not delete anything
        assert!(store.load_record("a").is_ok());
    }

    #[test]
    fn test_log_file_resets_on_create() {
        let (_tmp, store) = store();
        fs::write(store.dir().log_file("m"), "old contents").unwrap();
        let log = store.open_log("m").unwrap();
        log.append("fresh start");

        let content = fs::read_to_string(log.path()).unwrap();
        assert!(!content.contains("old contents"));
        assert!(content.contains("fresh start"));
    }

    #[test]
    fn test_log_file_halves_on_overflow() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("m.log");
        let log = LogFile::create(path.clone(), 64).unwrap();

        log.write_bytes(&[b'a'; 64]);
        // the next write must drop the first half before appending
        log.write_bytes(b"tail");

        let content = fs::read(&path).unwrap();
        assert_eq!(content.len(), 32 + 4);
        assert!(content.ends_with(b"tail"));
    }

    #[test]
    fn test_cleanup_old_logs_spares_todays() {
        let (_tmp, store) = store();
        fs::write(store.dir().log_file("fresh"), "x").unwrap();
        store.cleanup_old_logs();
        assert!(store.dir().log_file("fresh").exists());
    }
}
