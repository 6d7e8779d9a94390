//! SFTP implementation of the backend filesystem contract.
//!
//! One [`SftpFs`] serves one mount: it owns an SFTP session over a shared
//! [`SshClient`], resolves NFS-visible paths under its root directory, and
//! keeps a short-lived per-directory listing cache so that bursts of
//! `stat`/`lstat` traffic (the NFS client's favourite pastime) do not each
//! cost a network round-trip.
//!
//! Connection loss is absorbed in two places: mutating operations go
//! through a probe that re-establishes the session when a cheap `lstat "."`
//! fails, and lookup/open paths run under a single-retry combinator that
//! rebuilds the session once and replays the operation. Errors that mean
//! "the file is not there" are returned verbatim and never trigger a
//! reconnect.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::ssh::{SshClient, SshError};
use crate::vfs::{
    decode_handle, encode_handle, fnv1a64, is_root_path, nfs_visible, Attributes, Creds, FileInfo,
    OpenMode, RemoteFile, RemoteFs, VfsError, VfsResult, S_IFDIR, S_IFLNK, S_IFMT,
};
use crate::{rpath, DIR_CACHE_TTL};

type RawError = russh_sftp::client::error::Error;
type RawFile = russh_sftp::client::fs::File;

/// Resolve an NFS-visible path under a root directory.
///
/// `""`, `.`, `/` and `~` are the root itself; `~/x` is root-relative;
/// absolute paths already under the root pass through cleaned; any other
/// absolute path is treated as chroot-relative and re-anchored below the
/// root; relative paths are joined onto the root.
pub fn resolve_under_root(root_dir: &str, path: &str) -> String {
    if is_root_path(path, root_dir) {
        return root_dir.to_string();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return rpath::join(root_dir, rest);
    }

    let clean_root = rpath::clean(root_dir);
    if rpath::is_abs(path) {
        if clean_root == "/" {
            return rpath::clean(path);
        }
        if path.starts_with(clean_root.as_str()) {
            return rpath::clean(path);
        }
        return rpath::join(&clean_root, &path[1..]);
    }
    rpath::join(&clean_root, path)
}

fn is_not_found(err: &RawError) -> bool {
    if let RawError::Status(status) = err {
        if status.status_code == StatusCode::NoSuchFile {
            return true;
        }
    }
    let msg = err.to_string();
    msg.contains("file does not exist") || msg.contains("no such file") || msg.contains("No such file")
}

fn map_err(path: &str, err: RawError) -> VfsError {
    if is_not_found(&err) {
        VfsError::NotFound(path.to_string())
    } else {
        VfsError::Remote(err.to_string())
    }
}

/// Single-quote an argument for a remote POSIX shell.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// The SFTP session plus the client that can rebuild it.
struct SftpConn {
    client: Arc<SshClient>,
    session: tokio::sync::Mutex<SftpSession>,
}

impl SftpConn {
    /// Replace the session in `slot` with a freshly opened one, reconnecting
    /// the SSH transport first if needed.
    async fn rebuild(&self, slot: &mut SftpSession) -> Result<(), SshError> {
        self.client.ensure_connected().await?;
        *slot = self.client.sftp_session().await?;
        debug!("sftp session rebuilt");
        Ok(())
    }
}

struct DirCacheEntry {
    entries: Vec<FileInfo>,
    expires_at: Instant,
}

/// Per-directory listing cache keyed by NFS-visible directory path.
struct DirCache {
    map: Mutex<HashMap<String, DirCacheEntry>>,
    ttl: Duration,
}

impl DirCache {
    fn new(ttl: Duration) -> Self {
        Self { map: Mutex::new(HashMap::new()), ttl }
    }

    fn get(&self, dir: &str) -> Option<Vec<FileInfo>> {
        let map = self.map.lock();
        map.get(dir)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| entry.entries.clone())
    }

    fn set(&self, dir: &str, entries: Vec<FileInfo>) {
        self.map.lock().insert(
            dir.to_string(),
            DirCacheEntry { entries, expires_at: Instant::now() + self.ttl },
        );
    }

    fn clear(&self) {
        self.map.lock().clear();
    }

    /// Probe the cache for `path` under `dir`. Outer `None`: no usable
    /// cache entry. `Some(Some(info))`: hit. `Some(None)`: the directory
    /// listing is fresh and does not contain the name — a negative result.
    fn find(&self, path: &str, dir: &str) -> Option<Option<FileInfo>> {
        if path.is_empty() || path == "/" {
            return None;
        }
        let entries = self.get(dir)?;
        let base = rpath::base(path);
        Some(entries.into_iter().find(|e| e.name() == base))
    }
}

/// SFTP-backed filesystem rooted at a remote directory.
pub struct SftpFs {
    conn: Arc<SftpConn>,
    cache: Arc<DirCache>,
    root_dir: String,
    owner: Creds,
    creds: Mutex<Option<Creds>>,
}

impl SftpFs {
    /// Open an SFTP session on `client` and root it at `root_dir`.
    ///
    /// `~`, `~/x` and the empty path are resolved against the remote
    /// working directory.
    pub async fn new(
        client: Arc<SshClient>,
        root_dir: &str,
        owner: Creds,
    ) -> Result<Arc<Self>, SshError> {
        let session = client.sftp_session().await?;
        let root_dir = Self::normalize_root(&session, root_dir).await;
        debug!(root = %root_dir, "sftp adapter ready");

        Ok(Arc::new(Self {
            conn: Arc::new(SftpConn { client, session: tokio::sync::Mutex::new(session) }),
            cache: Arc::new(DirCache::new(DIR_CACHE_TTL)),
            root_dir,
            owner,
            creds: Mutex::new(None),
        }))
    }

    async fn normalize_root(session: &SftpSession, root: &str) -> String {
        if let Some(rest) = root.strip_prefix("~/") {
            let home = session
                .canonicalize(".")
                .await
                .unwrap_or_else(|_| "/".to_string());
            return rpath::join(&home, rest);
        }
        if root.is_empty() || root == "~" {
            return session
                .canonicalize(".")
                .await
                .unwrap_or_else(|_| "/".to_string());
        }
        root.to_string()
    }

    pub fn root_dir(&self) -> &str {
        &self.root_dir
    }

    fn resolve_path(&self, path: &str) -> String {
        resolve_under_root(&self.root_dir, path)
    }

    /// Caller-space and resolved parent directory of `path`; the root's
    /// parent is the directory containing the root itself.
    fn parent_dir(&self, path: &str) -> (String, String) {
        if is_root_path(path, &self.root_dir) {
            let dir = rpath::parent(&self.root_dir);
            return (dir.clone(), dir);
        }
        let dir = rpath::parent(path);
        let full = self.resolve_path(&dir);
        (dir, full)
    }

    fn build_info(&self, name: &str, nfs_path: &str, attrs: &FileAttributes) -> FileInfo {
        build_info(name, nfs_path, &self.root_dir, self.owner, attrs)
    }

    /// Refresh the listing cache for `dir_path` from `full_dir_path`.
    /// Failures leave the cache untouched.
    async fn populate_dir(&self, sftp: &SftpSession, dir_path: &str, full_dir_path: &str) {
        if let Ok(listing) = sftp.read_dir(full_dir_path.to_string()).await {
            let entries = listing
                .into_iter()
                .map(|entry| {
                    let name = entry.file_name();
                    let nfs_path = rpath::join(dir_path, &name);
                    self.build_info(&name, &nfs_path, &entry.metadata())
                })
                .collect();
            self.cache.set(dir_path, entries);
        }
    }

    /// [`populate_dir`](Self::populate_dir) with its own session lock.
    async fn populate_parent(&self, dir_path: &str, full_dir_path: &str) {
        let guard = self.conn.session.lock().await;
        self.populate_dir(&guard, dir_path, full_dir_path).await;
    }

    /// Probe the session with a cheap `lstat "."` and rebuild it when the
    /// probe fails. Used by operations that would otherwise mutate through
    /// a dead connection.
    async fn ensure_ready(&self) -> VfsResult<()> {
        let mut guard = self.conn.session.lock().await;
        if guard.symlink_metadata(".").await.is_err() {
            warn!("sftp connection stale, reconnecting");
            self.conn
                .rebuild(&mut guard)
                .await
                .map_err(|e| VfsError::Remote(format!("sftp reconnect failed: {e}")))?;
            self.cache.clear();
        }
        Ok(())
    }

    /// Single-retry combinator: on any error that is not "does not exist",
    /// rebuild the session (clearing the directory cache) and replay `op`
    /// exactly once.
    ///
    /// `op` must move owned data into the future it returns; the future may
    /// borrow nothing but the session argument.
    async fn with_reconnect<T, F>(&self, path: &str, op: F) -> VfsResult<T>
    where
        F: for<'a> Fn(&'a SftpSession) -> BoxFuture<'a, Result<T, RawError>>,
    {
        let mut guard = self.conn.session.lock().await;
        match op(&guard).await {
            Ok(value) => Ok(value),
            Err(err) if is_not_found(&err) => Err(VfsError::NotFound(path.to_string())),
            Err(err) => {
                warn!("sftp operation on {path} failed: {err}; reconnecting");
                self.conn.rebuild(&mut guard).await.map_err(|re| {
                    VfsError::Remote(format!("operation failed: {err}, reconnection failed: {re}"))
                })?;
                self.cache.clear();
                op(&guard).await.map_err(|e| map_err(path, e))
            }
        }
    }

    async fn lookup_info(&self, path: &str) -> VfsResult<FileInfo> {
        let (dir_path, full_dir_path) = self.parent_dir(path);

        if let Some(cached) = self.cache.find(path, &dir_path) {
            return cached.ok_or_else(|| VfsError::NotFound(path.to_string()));
        }

        let full_path = self.resolve_path(path);
        let result = self
            .with_reconnect(path, |sftp| {
                let full_path = full_path.clone();
                Box::pin(async move { sftp.symlink_metadata(full_path).await })
            })
            .await;

        // refresh the parent listing either way so the next probe is
        // answered from cache
        self.populate_parent(&dir_path, &full_dir_path).await;

        let attrs = result?;
        Ok(self.build_info(&rpath::base(path), path, &attrs))
    }

    fn make_file(
        &self,
        handle: Option<RawFile>,
        full_path: String,
        dir_like: bool,
    ) -> Box<dyn RemoteFile> {
        Box::new(SftpFile {
            handle,
            full_path,
            dir_like,
            conn: Arc::clone(&self.conn),
            cache: Arc::clone(&self.cache),
            root_dir: self.root_dir.clone(),
            owner: self.owner,
        })
    }
}

fn build_info(
    name: &str,
    nfs_path: &str,
    root_dir: &str,
    owner: Creds,
    attrs: &FileAttributes,
) -> FileInfo {
    FileInfo::new(
        name,
        attrs.size.unwrap_or(0),
        attrs.permissions.unwrap_or(0),
        attrs.mtime.map(i64::from).unwrap_or(0),
        attrs.atime.map(i64::from),
        nfs_path,
        root_dir,
        owner,
    )
}

fn to_open_flags(mode: OpenMode) -> OpenFlags {
    let mut flags = OpenFlags::empty();
    if mode.read {
        flags |= OpenFlags::READ;
    }
    if mode.write {
        flags |= OpenFlags::WRITE;
    }
    if mode.append {
        flags |= OpenFlags::APPEND;
    }
    if mode.create {
        flags |= OpenFlags::CREATE;
    }
    if mode.truncate {
        flags |= OpenFlags::TRUNCATE;
    }
    if flags.is_empty() {
        flags = OpenFlags::READ;
    }
    flags
}

#[async_trait]
impl RemoteFs for SftpFs {
    fn set_creds(&self, creds: Creds) {
        // recorded, never consulted: ownership is always the invoking user
        *self.creds.lock() = Some(creds);
    }

    async fn create(&self, path: &str) -> VfsResult<Box<dyn RemoteFile>> {
        self.ensure_ready().await?;
        let full_path = self.resolve_path(path);
        let handle = {
            let guard = self.conn.session.lock().await;
            guard
                .create(full_path.clone())
                .await
                .map_err(|e| map_err(path, e))?
        };
        Ok(self.make_file(Some(handle), full_path, false))
    }

    async fn mkdir_all(&self, path: &str, _mode: u32) -> VfsResult<()> {
        self.ensure_ready().await?;
        let full_path = self.resolve_path(path);
        let (dir_path, full_dir_path) = (rpath::parent(path), rpath::parent(&full_path));

        let guard = self.conn.session.lock().await;
        // create every missing ancestor, then verify the leaf
        let mut prefix = String::new();
        for part in full_path.split('/').filter(|p| !p.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            if guard.symlink_metadata(prefix.clone()).await.is_err() {
                let _ = guard.create_dir(prefix.clone()).await;
            }
        }
        guard
            .symlink_metadata(full_path.clone())
            .await
            .map_err(|e| map_err(path, e))?;

        self.populate_dir(&guard, &dir_path, &full_dir_path).await;
        Ok(())
    }

    async fn open(&self, path: &str) -> VfsResult<Box<dyn RemoteFile>> {
        let full_path = self.resolve_path(path);
        let is_root = is_root_path(path, &self.root_dir);

        let (handle, dir_like) = self
            .with_reconnect(path, |sftp| {
                let full_path = full_path.clone();
                Box::pin(async move {
                    let attrs = sftp.symlink_metadata(full_path.clone()).await?;
                    let mode = attrs.permissions.unwrap_or(0);
                    let is_symlink = mode & S_IFMT == S_IFLNK;
                    let is_dir = mode & S_IFMT == S_IFDIR;

                    // directories (and symlinked directory roots) have no
                    // remote handle; their reads go through readdir
                    let followed_dir = if is_symlink {
                        sftp.metadata(full_path.clone())
                            .await
                            .map(|a| a.permissions.unwrap_or(0) & S_IFMT == S_IFDIR)
                            .unwrap_or(false)
                    } else {
                        is_dir
                    };

                    let handle = if followed_dir {
                        None
                    } else {
                        Some(sftp.open(full_path).await?)
                    };
                    Ok((handle, is_dir && !is_symlink))
                })
            })
            .await?;

        Ok(self.make_file(handle, full_path, is_root || dir_like))
    }

    async fn open_file(
        &self,
        path: &str,
        mode: OpenMode,
        perm: u32,
    ) -> VfsResult<Box<dyn RemoteFile>> {
        self.ensure_ready().await?;
        let full_path = self.resolve_path(path);
        let is_root = is_root_path(path, &self.root_dir);

        let (handle, dir_like) = self
            .with_reconnect(path, |sftp| {
                let full_path = full_path.clone();
                Box::pin(async move {
                    let handle = if mode.create {
                        let handle = sftp.create(full_path.clone()).await?;
                        let _ = sftp
                            .set_metadata(
                                full_path.clone(),
                                FileAttributes {
                                    permissions: Some(perm),
                                    ..Default::default()
                                },
                            )
                            .await;
                        handle
                    } else {
                        sftp.open_with_flags(full_path.clone(), to_open_flags(mode)).await?
                    };

                    let attrs = sftp.symlink_metadata(full_path).await?;
                    let bits = attrs.permissions.unwrap_or(0) & S_IFMT;
                    Ok((handle, bits == S_IFDIR))
                })
            })
            .await?;

        Ok(self.make_file(Some(handle), full_path, is_root || dir_like))
    }

    async fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        self.lookup_info(path).await
    }

    async fn lstat(&self, path: &str) -> VfsResult<FileInfo> {
        self.lookup_info(path).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.ensure_ready().await?;
        let full_path = self.resolve_path(path);
        let guard = self.conn.session.lock().await;
        guard
            .set_metadata(
                full_path,
                FileAttributes { permissions: Some(mode), ..Default::default() },
            )
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> VfsResult<()> {
        self.ensure_ready().await?;
        let full_path = self.resolve_path(path);
        let guard = self.conn.session.lock().await;
        guard
            .set_metadata(
                full_path,
                FileAttributes {
                    uid: Some(uid),
                    gid: Some(gid),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn symlink(&self, target: &str, link: &str) -> VfsResult<()> {
        self.ensure_ready().await?;
        let full_link = self.resolve_path(link);
        let guard = self.conn.session.lock().await;
        guard
            .symlink(full_link, target.to_string())
            .await
            .map_err(|e| map_err(link, e))
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        self.ensure_ready().await?;
        let full_path = self.resolve_path(path);
        let guard = self.conn.session.lock().await;
        guard
            .read_link(full_path)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn link(&self, oldpath: &str, newpath: &str) -> VfsResult<()> {
        // SFTP v3 has no hard-link operation; run `ln` over an exec session
        self.ensure_ready().await?;
        let full_old = self.resolve_path(oldpath);
        let full_new = self.resolve_path(newpath);
        let command = format!("ln -- {} {}", shell_quote(&full_old), shell_quote(&full_new));

        let (status, output) = self
            .conn
            .client
            .run_command(&command)
            .await
            .map_err(|e| VfsError::Remote(e.to_string()))?;
        if status != 0 {
            return Err(VfsError::Remote(format!(
                "ln exited with {status}: {}",
                String::from_utf8_lossy(&output).trim()
            )));
        }
        Ok(())
    }

    async fn rename(&self, oldpath: &str, newpath: &str) -> VfsResult<()> {
        self.ensure_ready().await?;
        let full_old = self.resolve_path(oldpath);
        let full_new = self.resolve_path(newpath);
        let guard = self.conn.session.lock().await;
        guard
            .rename(full_old, full_new)
            .await
            .map_err(|e| map_err(oldpath, e))
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        self.ensure_ready().await?;
        let full_path = self.resolve_path(path);
        let guard = self.conn.session.lock().await;
        let attrs = guard
            .symlink_metadata(full_path.clone())
            .await
            .map_err(|e| map_err(path, e))?;
        if attrs.permissions.unwrap_or(0) & S_IFMT == S_IFDIR {
            guard.remove_dir(full_path).await.map_err(|e| map_err(path, e))
        } else {
            guard.remove_file(full_path).await.map_err(|e| map_err(path, e))
        }
    }

    fn attributes(&self) -> Attributes {
        Attributes::default()
    }

    fn get_file_id(&self, info: &FileInfo) -> u64 {
        fnv1a64(&info.file_id_key())
    }

    fn get_root_handle(&self) -> Vec<u8> {
        encode_handle(&self.root_dir)
    }

    fn get_handle(&self, info: &FileInfo) -> VfsResult<Vec<u8>> {
        let path = info.nfs_path();
        if !path.is_empty() {
            return Ok(encode_handle(path));
        }
        Ok(encode_handle(info.name()))
    }

    fn resolve_handle(&self, handle: &[u8]) -> VfsResult<String> {
        let path = decode_handle(handle);
        if path.is_empty() || handle == b"/" {
            return Ok(self.root_dir.clone());
        }
        Ok(path)
    }

    async fn close(&self) -> VfsResult<()> {
        let guard = self.conn.session.lock().await;
        let _ = guard.close().await;
        Ok(())
    }
}

/// An open SFTP file plus the context needed to present it over NFS.
struct SftpFile {
    /// Remote handle; absent for directory-like nodes.
    handle: Option<RawFile>,
    full_path: String,
    dir_like: bool,
    conn: Arc<SftpConn>,
    cache: Arc<DirCache>,
    root_dir: String,
    owner: Creds,
}

impl SftpFile {
    fn handle_mut(&mut self) -> VfsResult<&mut RawFile> {
        self.handle
            .as_mut()
            .ok_or(VfsError::Unsupported("byte i/o on a directory"))
    }
}

#[async_trait]
impl RemoteFile for SftpFile {
    fn name(&self) -> &str {
        &self.full_path
    }

    async fn seek(&mut self, offset: u64) -> VfsResult<u64> {
        self.handle_mut()?
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| VfsError::Remote(e.to_string()))
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.handle_mut()?
            .read(buf)
            .await
            .map_err(|e| VfsError::Remote(e.to_string()))
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.handle_mut()?
            .write(data)
            .await
            .map_err(|e| VfsError::Remote(e.to_string()))
    }

    async fn stat(&self) -> VfsResult<FileInfo> {
        let nfs_path = nfs_visible(&self.full_path, &self.root_dir);
        let session = self.conn.session.lock().await;
        let attrs = session
            .symlink_metadata(self.full_path.clone())
            .await
            .map_err(|e| map_err(&self.full_path, e))?;
        Ok(build_info(
            &rpath::base(&self.full_path),
            &nfs_path,
            &self.root_dir,
            self.owner,
            &attrs,
        ))
    }

    async fn truncate(&mut self) -> VfsResult<()> {
        // size-preserving: re-assert the current size to force a flush
        let session = self.conn.session.lock().await;
        let attrs = session
            .symlink_metadata(self.full_path.clone())
            .await
            .map_err(|e| map_err(&self.full_path, e))?;
        session
            .set_metadata(
                self.full_path.clone(),
                FileAttributes { size: attrs.size, ..Default::default() },
            )
            .await
            .map_err(|e| map_err(&self.full_path, e))
    }

    async fn sync(&mut self) -> VfsResult<()> {
        if let Some(handle) = self.handle.as_mut() {
            handle.flush().await.map_err(|e| VfsError::Remote(e.to_string()))?;
        }
        Ok(())
    }

    async fn readdir(&mut self) -> VfsResult<Vec<FileInfo>> {
        if !self.dir_like {
            return Err(VfsError::NotADirectory(self.full_path.clone()));
        }

        let nfs_dir = nfs_visible(&self.full_path, &self.root_dir);
        let entries: Vec<FileInfo> = {
            let session = self.conn.session.lock().await;
            let listing = session
                .read_dir(self.full_path.clone())
                .await
                .map_err(|e| map_err(&self.full_path, e))?;
            listing
                .into_iter()
                .map(|entry| {
                    let name = entry.file_name();
                    let nfs_path = rpath::join(&nfs_dir, &name);
                    build_info(&name, &nfs_path, &self.root_dir, self.owner, &entry.metadata())
                })
                .collect()
        };

        self.cache.set(&nfs_dir, entries.clone());
        Ok(entries)
    }

    async fn close(&mut self) -> VfsResult<()> {
        if let Some(mut handle) = self.handle.take() {
            let _ = handle.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S_IFREG_TEST: u32 = 0o100644;

    #[test]
    fn test_resolve_root_spellings() {
        for p in ["", ".", "/", "~"] {
            assert_eq!(resolve_under_root("/home/me/src", p), "/home/me/src");
        }
    }

    #[test]
    fn test_resolve_tilde_relative() {
        assert_eq!(resolve_under_root("/home/me", "~/x"), "/home/me/x");
    }

    #[test]
    fn test_resolve_absolute_with_slash_root() {
        assert_eq!(resolve_under_root("/", "/etc/passwd"), "/etc/passwd");
        assert_eq!(resolve_under_root("/", "/a//b/./c"), "/a/b/c");
    }

    #[test]
    fn test_resolve_absolute_under_root() {
        assert_eq!(resolve_under_root("/srv", "/srv/a"), "/srv/a");
    }

    #[test]
    fn test_resolve_absolute_outside_root_is_chrooted() {
        assert_eq!(resolve_under_root("/srv", "/a/b"), "/srv/a/b");
    }

    #[test]
    fn test_resolve_relative() {
        assert_eq!(resolve_under_root("/srv", "a/b"), "/srv/a/b");
    }

    #[test]
    fn test_resolve_stays_under_root() {
        // `..`-free paths can never escape the cleaned root
        for p in ["a", "/x/y", "~/z", "a/./b"] {
            let resolved = resolve_under_root("/srv/data", p);
            assert!(
                resolved.starts_with("/srv/data"),
                "{p} resolved to {resolved}"
            );
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("o'brien"), r"'o'\''brien'");
    }

    #[test]
    fn test_dir_cache_negative_and_expiry() {
        let cache = DirCache::new(Duration::from_millis(20));
        let creds = Creds::FALLBACK;
        let entry = FileInfo::new("a", 1, S_IFREG_TEST, 0, None, "/x/a", "/srv", creds);
        cache.set("/x", vec![entry]);

        // hit
        assert!(matches!(cache.find("/x/a", "/x"), Some(Some(_))));
        // fresh listing without the name: negative result
        assert!(matches!(cache.find("/x/c", "/x"), Some(None)));
        // unknown directory: no decision
        assert!(cache.find("/y/a", "/y").is_none());
        // root paths never consult the cache
        assert!(cache.find("/", "/").is_none());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.find("/x/a", "/x").is_none());
    }

    #[test]
    fn test_dir_cache_clear() {
        let cache = DirCache::new(Duration::from_secs(5));
        cache.set("/x", vec![]);
        assert!(cache.get("/x").is_some());
        cache.clear();
        assert!(cache.get("/x").is_none());
    }
}
