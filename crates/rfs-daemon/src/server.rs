//! Per-mount NFS server host.
//!
//! [`NfsBridge`] adapts one shared [`RemoteFs`] instance to the NFS
//! library's fileid-oriented VFS trait. A handle table interns the opaque
//! handles produced by the backend and hands out sequential 64-bit file
//! ids; every operation resolves its id back to an NFS-visible path and
//! delegates.
//!
//! The library would want a fresh filesystem per connection if credentials
//! mattered; this backend discards them (all ownership is reported as the
//! invoking user), which is what makes the single shared instance safe.
//! Revisit if per-user authentication is ever added.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use zerofs_nfsserve::nfs::{
    fattr3, fileid3, filename3, ftype3, nfspath3, nfsstat3, nfstime3, sattr3, set_gid3, set_mode3,
    set_size3, set_uid3, specdata3,
};
use zerofs_nfsserve::tcp::{NFSTcp, NFSTcpListener};
use zerofs_nfsserve::vfs::{AuthContext, DirEntry, NFSFileSystem, ReadDirResult, VFSCapabilities};

use crate::rpath;
use crate::vfs::{
    encode_handle, Creds, FileInfo, OpenMode, RemoteFs, VfsError, S_IFLNK, S_IFMT,
};

/// File id of the export root.
const ROOT_ID: fileid3 = 0;

/// Find a free TCP port by binding `0.0.0.0:0` and releasing it.
///
/// The port can in principle be claimed by another process before the NFS
/// server binds it; the warm-up window in the mount pipeline masks the
/// common case.
pub fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("0.0.0.0:0")?;
    Ok(listener.local_addr()?.port())
}

/// Bind the loopback NFS listener for a bridge.
pub async fn bind_listener(
    bridge: NfsBridge,
    port: u16,
) -> std::io::Result<NFSTcpListener<NfsBridge>> {
    let addr = format!("127.0.0.1:{port}");
    NFSTcpListener::bind(&addr, bridge).await
}

/// Serve a bound listener until the task is aborted; errors are logged by
/// the caller through the returned result.
pub async fn serve(listener: NFSTcpListener<NfsBridge>) -> std::io::Result<()> {
    listener.handle_forever().await
}

/// Handle table: sequential file ids to backend handles.
struct HandleTable {
    id_to_handle: HashMap<fileid3, Vec<u8>>,
    path_to_id: HashMap<String, fileid3>,
    next_id: fileid3,
}

impl HandleTable {
    fn new(root_handle: Vec<u8>) -> Self {
        let mut table = Self {
            id_to_handle: HashMap::new(),
            path_to_id: HashMap::new(),
            next_id: ROOT_ID + 1,
        };
        table.id_to_handle.insert(ROOT_ID, root_handle);
        table.path_to_id.insert("/".to_string(), ROOT_ID);
        table
    }

    fn intern(&mut self, path: &str, handle: Vec<u8>) -> fileid3 {
        if let Some(id) = self.path_to_id.get(path) {
            return *id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.id_to_handle.insert(id, handle);
        self.path_to_id.insert(path.to_string(), id);
        id
    }

    fn forget(&mut self, path: &str) {
        if let Some(id) = self.path_to_id.remove(path) {
            self.id_to_handle.remove(&id);
        }
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(id) = self.path_to_id.remove(from) {
            self.id_to_handle.insert(id, encode_handle(to));
            self.path_to_id.remove(to);
            self.path_to_id.insert(to.to_string(), id);
        }
    }
}

/// Adapter between the backend contract and the NFS library VFS.
pub struct NfsBridge {
    fs: Arc<dyn RemoteFs>,
    table: Mutex<HandleTable>,
    fsid: u64,
}

impl NfsBridge {
    /// Build a bridge over a backend, reporting ownership as `owner`.
    pub async fn new(fs: Arc<dyn RemoteFs>, owner: Creds) -> Result<Self, VfsError> {
        fs.set_creds(owner);
        let root = fs.stat("/").await?;
        let fsid = fs.get_file_id(&root);
        let attrs = fs.attributes();
        debug!(
            fsid,
            link_support = attrs.link_support,
            symlink_support = attrs.symlink_support,
            max_read = attrs.max_read,
            "nfs bridge ready"
        );

        Ok(Self {
            fs: Arc::clone(&fs),
            table: Mutex::new(HandleTable::new(fs.get_root_handle())),
            fsid,
        })
    }

    fn path_for(&self, id: fileid3) -> Result<String, nfsstat3> {
        if id == ROOT_ID {
            return Ok("/".to_string());
        }
        let handle = {
            let table = self.table.lock();
            table
                .id_to_handle
                .get(&id)
                .cloned()
                .ok_or(nfsstat3::NFS3ERR_STALE)?
        };
        self.fs.resolve_handle(&handle).map_err(to_status)
    }

    fn intern(&self, info: &FileInfo) -> Result<fileid3, nfsstat3> {
        let handle = self.fs.get_handle(info).map_err(to_status)?;
        Ok(self.table.lock().intern(info.nfs_path(), handle))
    }

    fn to_fattr(&self, info: &FileInfo, fileid: fileid3) -> fattr3 {
        let mode = info.mode();
        fattr3 {
            ftype: to_ftype(mode, info.is_dir()),
            mode: mode & 0o7777,
            nlink: info.num_links(),
            uid: info.uid(),
            gid: info.gid(),
            size: info.size(),
            used: info.size(),
            rdev: specdata3 { specdata1: 0, specdata2: 0 },
            fsid: self.fsid,
            fileid,
            atime: to_time(info.atime()),
            mtime: to_time(info.mtime()),
            ctime: to_time(info.ctime()),
        }
    }

    async fn stat_with_id(&self, path: &str) -> Result<(FileInfo, fileid3), nfsstat3> {
        let info = self.fs.lstat(path).await.map_err(to_status)?;
        let id = self.intern(&info)?;
        Ok((info, id))
    }

    fn child_path(&self, dirid: fileid3, name: &filename3) -> Result<String, nfsstat3> {
        let dir = self.path_for(dirid)?;
        Ok(rpath::join(&dir, &to_name(name)))
    }
}

fn to_name(name: &filename3) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn to_time(seconds: i64) -> nfstime3 {
    nfstime3 {
        seconds: seconds.max(0) as u32,
        nseconds: 0,
    }
}

fn to_ftype(mode: u32, is_dir: bool) -> ftype3 {
    if is_dir {
        return ftype3::NF3DIR;
    }
    match mode & S_IFMT {
        S_IFLNK => ftype3::NF3LNK,
        0o020000 => ftype3::NF3CHR,
        0o060000 => ftype3::NF3BLK,
        0o010000 => ftype3::NF3FIFO,
        0o140000 => ftype3::NF3SOCK,
        _ => ftype3::NF3REG,
    }
}

fn to_status(err: VfsError) -> nfsstat3 {
    match err {
        VfsError::NotFound(_) => nfsstat3::NFS3ERR_NOENT,
        VfsError::NotADirectory(_) => nfsstat3::NFS3ERR_NOTDIR,
        VfsError::BadHandle => nfsstat3::NFS3ERR_BADHANDLE,
        VfsError::Unsupported(_) => nfsstat3::NFS3ERR_NOTSUPP,
        VfsError::Remote(_) => nfsstat3::NFS3ERR_IO,
    }
}

#[async_trait]
impl NFSFileSystem for NfsBridge {
    fn root_dir(&self) -> fileid3 {
        ROOT_ID
    }

    fn capabilities(&self) -> VFSCapabilities {
        VFSCapabilities::ReadWrite
    }

    async fn lookup(
        &self,
        _auth: &AuthContext,
        dirid: fileid3,
        filename: &filename3,
    ) -> Result<fileid3, nfsstat3> {
        let name = to_name(filename);
        if name == "." {
            return Ok(dirid);
        }
        if name == ".." {
            let dir = self.path_for(dirid)?;
            let parent = rpath::parent(&dir);
            let table = self.table.lock();
            return Ok(table.path_to_id.get(&parent).copied().unwrap_or(ROOT_ID));
        }

        let child = self.child_path(dirid, filename)?;
        let (_, id) = self.stat_with_id(&child).await?;
        Ok(id)
    }

    async fn getattr(&self, _auth: &AuthContext, id: fileid3) -> Result<fattr3, nfsstat3> {
        let path = self.path_for(id)?;
        let info = self.fs.lstat(&path).await.map_err(to_status)?;
        Ok(self.to_fattr(&info, id))
    }

    async fn setattr(
        &self,
        _auth: &AuthContext,
        id: fileid3,
        setattr: sattr3,
    ) -> Result<fattr3, nfsstat3> {
        let path = self.path_for(id)?;

        if let set_mode3::mode(mode) = setattr.mode {
            self.fs.chmod(&path, mode).await.map_err(to_status)?;
        }

        let new_uid = match setattr.uid {
            set_uid3::uid(uid) => Some(uid),
            _ => None,
        };
        let new_gid = match setattr.gid {
            set_gid3::gid(gid) => Some(gid),
            _ => None,
        };
        if new_uid.is_some() || new_gid.is_some() {
            let current = self.fs.lstat(&path).await.map_err(to_status)?;
            self.fs
                .chown(
                    &path,
                    new_uid.unwrap_or_else(|| current.uid()),
                    new_gid.unwrap_or_else(|| current.gid()),
                )
                .await
                .map_err(to_status)?;
        }

        if let set_size3::size(_) = setattr.size {
            // the backend truncate is size-preserving; it forces a flush
            // rather than changing length
            let mut file = self
                .fs
                .open_file(&path, OpenMode::write_only(), 0o644)
                .await
                .map_err(to_status)?;
            file.truncate().await.map_err(to_status)?;
            let _ = file.close().await;
        }

        let info = self.fs.lstat(&path).await.map_err(to_status)?;
        Ok(self.to_fattr(&info, id))
    }

    async fn read(
        &self,
        _auth: &AuthContext,
        id: fileid3,
        offset: u64,
        count: u32,
    ) -> Result<(Vec<u8>, bool), nfsstat3> {
        let path = self.path_for(id)?;
        let info = self.fs.lstat(&path).await.map_err(to_status)?;
        if info.is_dir() {
            return Err(nfsstat3::NFS3ERR_ISDIR);
        }

        let mut file = self.fs.open(&path).await.map_err(to_status)?;
        file.seek(offset).await.map_err(to_status)?;

        let want = count as usize;
        let mut data = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut data[filled..]).await.map_err(to_status)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        let _ = file.close().await;

        let eof = offset + filled as u64 >= info.size();
        Ok((data, eof))
    }

    async fn write(
        &self,
        _auth: &AuthContext,
        id: fileid3,
        offset: u64,
        data: &[u8],
    ) -> Result<fattr3, nfsstat3> {
        let path = self.path_for(id)?;

        let mut file = self
            .fs
            .open_file(&path, OpenMode::write_only(), 0o644)
            .await
            .map_err(to_status)?;
        file.seek(offset).await.map_err(to_status)?;
        let mut written = 0;
        while written < data.len() {
            let n = file.write(&data[written..]).await.map_err(to_status)?;
            if n == 0 {
                return Err(nfsstat3::NFS3ERR_IO);
            }
            written += n;
        }
        file.sync().await.map_err(to_status)?;
        let _ = file.close().await;

        let info = self.fs.lstat(&path).await.map_err(to_status)?;
        Ok(self.to_fattr(&info, id))
    }

    async fn create(
        &self,
        _auth: &AuthContext,
        dirid: fileid3,
        filename: &filename3,
        setattr: sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let child = self.child_path(dirid, filename)?;
        let perm = match setattr.mode {
            set_mode3::mode(mode) => mode,
            _ => 0o644,
        };

        let mut file = self
            .fs
            .open_file(&child, OpenMode::create(), perm)
            .await
            .map_err(to_status)?;
        let _ = file.close().await;

        let (info, id) = self.stat_with_id(&child).await?;
        Ok((id, self.to_fattr(&info, id)))
    }

    async fn create_exclusive(
        &self,
        _auth: &AuthContext,
        dirid: fileid3,
        filename: &filename3,
    ) -> Result<fileid3, nfsstat3> {
        let child = self.child_path(dirid, filename)?;
        if self.fs.lstat(&child).await.is_ok() {
            return Err(nfsstat3::NFS3ERR_EXIST);
        }

        let mut file = self
            .fs
            .open_file(&child, OpenMode::create(), 0o644)
            .await
            .map_err(to_status)?;
        let _ = file.close().await;

        let (_, id) = self.stat_with_id(&child).await?;
        Ok(id)
    }

    async fn mkdir(
        &self,
        _auth: &AuthContext,
        dirid: fileid3,
        dirname: &filename3,
        setattr: &sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let child = self.child_path(dirid, dirname)?;
        let perm = match setattr.mode {
            set_mode3::mode(mode) => mode,
            _ => 0o755,
        };

        self.fs.mkdir_all(&child, perm).await.map_err(to_status)?;
        let (info, id) = self.stat_with_id(&child).await?;
        Ok((id, self.to_fattr(&info, id)))
    }

    async fn remove(
        &self,
        _auth: &AuthContext,
        dirid: fileid3,
        filename: &filename3,
    ) -> Result<(), nfsstat3> {
        let child = self.child_path(dirid, filename)?;
        self.fs.remove(&child).await.map_err(to_status)?;
        self.table.lock().forget(&child);
        Ok(())
    }

    async fn rename(
        &self,
        _auth: &AuthContext,
        from_dirid: fileid3,
        from_filename: &filename3,
        to_dirid: fileid3,
        to_filename: &filename3,
    ) -> Result<(), nfsstat3> {
        let from = self.child_path(from_dirid, from_filename)?;
        let to = self.child_path(to_dirid, to_filename)?;
        self.fs.rename(&from, &to).await.map_err(to_status)?;
        self.table.lock().rename(&from, &to);
        Ok(())
    }

    async fn readdir(
        &self,
        _auth: &AuthContext,
        dirid: fileid3,
        start_after: fileid3,
        max_entries: usize,
    ) -> Result<ReadDirResult, nfsstat3> {
        let path = self.path_for(dirid)?;

        let mut dir = self.fs.open(&path).await.map_err(to_status)?;
        let listing = dir.readdir().await.map_err(|err| match err {
            VfsError::NotADirectory(_) => nfsstat3::NFS3ERR_NOTDIR,
            other => to_status(other),
        })?;
        let _ = dir.close().await;

        let mut entries = Vec::with_capacity(listing.len());
        for info in &listing {
            let id = self.intern(info)?;
            entries.push(DirEntry {
                fileid: id,
                name: info.name().as_bytes().into(),
                attr: self.to_fattr(info, id),
            });
        }
        // ids are assigned in discovery order and persist in the table, so
        // sorting by id gives a stable pagination cursor
        entries.sort_by_key(|e| e.fileid);

        let mut result = ReadDirResult { entries: Vec::new(), end: false };
        let remaining: Vec<DirEntry> = entries
            .into_iter()
            .filter(|e| start_after == 0 || e.fileid > start_after)
            .collect();
        let total = remaining.len();
        result.entries = remaining.into_iter().take(max_entries).collect();
        result.end = result.entries.len() == total;
        Ok(result)
    }

    async fn symlink(
        &self,
        _auth: &AuthContext,
        dirid: fileid3,
        linkname: &filename3,
        symlink: &nfspath3,
        _attr: &sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let link = self.child_path(dirid, linkname)?;
        let target = String::from_utf8_lossy(symlink).into_owned();

        self.fs.symlink(&target, &link).await.map_err(to_status)?;
        let (info, id) = self.stat_with_id(&link).await?;
        Ok((id, self.to_fattr(&info, id)))
    }

    async fn readlink(&self, _auth: &AuthContext, id: fileid3) -> Result<nfspath3, nfsstat3> {
        let path = self.path_for(id)?;
        let target = self.fs.readlink(&path).await.map_err(to_status)?;
        Ok(target.as_bytes().into())
    }

    async fn mknod(
        &self,
        _auth: &AuthContext,
        _dirid: fileid3,
        _filename: &filename3,
        _ftype: ftype3,
        _attr: &sattr3,
        _spec: Option<&specdata3>,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        Err(nfsstat3::NFS3ERR_NOTSUPP)
    }

    async fn link(
        &self,
        _auth: &AuthContext,
        fileid: fileid3,
        linkdirid: fileid3,
        linkname: &filename3,
    ) -> Result<(), nfsstat3> {
        let old = self.path_for(fileid)?;
        let new = self.child_path(linkdirid, linkname)?;
        self.fs.link(&old, &new).await.map_err(to_status)?;
        // the new name is the same file
        self.table.lock().path_to_id.insert(new, fileid);
        Ok(())
    }
}
