//! In-memory backend used by tests.
//!
//! A second implementation of [`RemoteFs`] with no network underneath: a
//! flat map of cleaned paths to nodes, plus an operation counter so tests
//! can assert how many stat round-trips an operation cost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::rpath;
use crate::vfs::{
    decode_handle, encode_handle, fnv1a64, Attributes, Creds, FileInfo, OpenMode, RemoteFile,
    RemoteFs, VfsError, VfsResult, S_IFDIR, S_IFLNK, S_IFREG,
};

#[derive(Clone, Debug)]
enum Node {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

type Nodes = Arc<Mutex<HashMap<String, Node>>>;

pub struct MemFs {
    nodes: Nodes,
    creds: Mutex<Option<Creds>>,
    lstat_calls: AtomicUsize,
}

impl MemFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            creds: Mutex::new(None),
            lstat_calls: AtomicUsize::new(0),
        })
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        self.nodes
            .lock()
            .insert(rpath::clean(path), Node::File(contents.to_vec()));
    }

    pub fn add_dir(&self, path: &str) {
        self.nodes.lock().insert(rpath::clean(path), Node::Dir);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(&rpath::clean(path))
    }

    /// Number of `stat`/`lstat` calls served so far.
    pub fn lstat_count(&self) -> usize {
        self.lstat_calls.load(Ordering::SeqCst)
    }

    fn reported_creds(&self) -> Creds {
        self.creds.lock().unwrap_or(Creds::FALLBACK)
    }

    fn info_for(&self, path: &str, node: &Node) -> FileInfo {
        let (mode, size) = match node {
            Node::File(data) => (S_IFREG | 0o644, data.len() as u64),
            Node::Dir => (S_IFDIR | 0o755, 0),
            Node::Symlink(target) => (S_IFLNK | 0o777, target.len() as u64),
        };
        FileInfo::new(
            rpath::base(path),
            size,
            mode,
            1_700_000_000,
            None,
            path,
            "/",
            self.reported_creds(),
        )
    }

    fn get_node(&self, path: &str) -> VfsResult<Node> {
        let clean = rpath::clean(path);
        if clean == "/" {
            return Ok(Node::Dir);
        }
        self.nodes
            .lock()
            .get(&clean)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(clean))
    }
}

#[async_trait]
impl RemoteFs for MemFs {
    fn set_creds(&self, creds: Creds) {
        *self.creds.lock() = Some(creds);
    }

    async fn create(&self, path: &str) -> VfsResult<Box<dyn RemoteFile>> {
        let clean = rpath::clean(path);
        self.nodes.lock().insert(clean.clone(), Node::File(Vec::new()));
        Ok(Box::new(MemFile::new(self, clean, false)))
    }

    async fn mkdir_all(&self, path: &str, _mode: u32) -> VfsResult<()> {
        let clean = rpath::clean(path);
        let mut nodes = self.nodes.lock();
        let mut prefix = String::new();
        for part in clean.split('/').filter(|p| !p.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            nodes.entry(prefix.clone()).or_insert(Node::Dir);
        }
        Ok(())
    }

    async fn open(&self, path: &str) -> VfsResult<Box<dyn RemoteFile>> {
        let node = self.get_node(path)?;
        let dir_like = matches!(node, Node::Dir);
        Ok(Box::new(MemFile::new(self, rpath::clean(path), dir_like)))
    }

    async fn open_file(
        &self,
        path: &str,
        mode: OpenMode,
        _perm: u32,
    ) -> VfsResult<Box<dyn RemoteFile>> {
        let clean = rpath::clean(path);
        {
            let mut nodes = self.nodes.lock();
            match nodes.get(&clean) {
                Some(Node::File(_)) if mode.truncate => {
                    nodes.insert(clean.clone(), Node::File(Vec::new()));
                }
                Some(_) => {}
                None if mode.create => {
                    nodes.insert(clean.clone(), Node::File(Vec::new()));
                }
                None => return Err(VfsError::NotFound(clean)),
            }
        }
        Ok(Box::new(MemFile::new(self, clean, false)))
    }

    async fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        self.lstat(path).await
    }

    async fn lstat(&self, path: &str) -> VfsResult<FileInfo> {
        self.lstat_calls.fetch_add(1, Ordering::SeqCst);
        let node = self.get_node(path)?;
        Ok(self.info_for(&rpath::clean(path), &node))
    }

    async fn chmod(&self, path: &str, _mode: u32) -> VfsResult<()> {
        self.get_node(path).map(|_| ())
    }

    async fn chown(&self, path: &str, _uid: u32, _gid: u32) -> VfsResult<()> {
        self.get_node(path).map(|_| ())
    }

    async fn symlink(&self, target: &str, link: &str) -> VfsResult<()> {
        self.nodes
            .lock()
            .insert(rpath::clean(link), Node::Symlink(target.to_string()));
        Ok(())
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        match self.get_node(path)? {
            Node::Symlink(target) => Ok(target),
            _ => Err(VfsError::Unsupported("readlink on a non-symlink")),
        }
    }

    async fn link(&self, oldpath: &str, newpath: &str) -> VfsResult<()> {
        let node = self.get_node(oldpath)?;
        self.nodes.lock().insert(rpath::clean(newpath), node);
        Ok(())
    }

    async fn rename(&self, oldpath: &str, newpath: &str) -> VfsResult<()> {
        let from = rpath::clean(oldpath);
        let to = rpath::clean(newpath);
        let mut nodes = self.nodes.lock();
        let node = nodes.remove(&from).ok_or(VfsError::NotFound(from))?;
        nodes.insert(to, node);
        Ok(())
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let clean = rpath::clean(path);
        self.nodes
            .lock()
            .remove(&clean)
            .map(|_| ())
            .ok_or(VfsError::NotFound(clean))
    }

    fn attributes(&self) -> Attributes {
        Attributes::default()
    }

    fn get_file_id(&self, info: &FileInfo) -> u64 {
        fnv1a64(&info.file_id_key())
    }

    fn get_root_handle(&self) -> Vec<u8> {
        encode_handle("/")
    }

    fn get_handle(&self, info: &FileInfo) -> VfsResult<Vec<u8>> {
        Ok(encode_handle(info.nfs_path()))
    }

    fn resolve_handle(&self, handle: &[u8]) -> VfsResult<String> {
        let path = decode_handle(handle);
        if path.is_empty() {
            return Ok("/".to_string());
        }
        Ok(path)
    }

    async fn close(&self) -> VfsResult<()> {
        Ok(())
    }
}

struct MemFile {
    nodes: Nodes,
    creds: Creds,
    path: String,
    pos: u64,
    dir_like: bool,
}

impl MemFile {
    fn new(fs: &MemFs, path: String, dir_like: bool) -> Self {
        Self {
            nodes: Arc::clone(&fs.nodes),
            creds: fs.reported_creds(),
            path,
            pos: 0,
            dir_like,
        }
    }
}

#[async_trait]
impl RemoteFile for MemFile {
    fn name(&self) -> &str {
        &self.path
    }

    async fn seek(&mut self, offset: u64) -> VfsResult<u64> {
        self.pos = offset;
        Ok(offset)
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let nodes = self.nodes.lock();
        let Some(Node::File(data)) = nodes.get(&self.path) else {
            return Err(VfsError::NotFound(self.path.clone()));
        };
        let start = (self.pos as usize).min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        drop(nodes);
        self.pos += n as u64;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        let mut nodes = self.nodes.lock();
        let Some(Node::File(contents)) = nodes.get_mut(&self.path) else {
            return Err(VfsError::NotFound(self.path.clone()));
        };
        let end = self.pos as usize + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[self.pos as usize..end].copy_from_slice(data);
        drop(nodes);
        self.pos += data.len() as u64;
        Ok(data.len())
    }

    async fn stat(&self) -> VfsResult<FileInfo> {
        let nodes = self.nodes.lock();
        let node = if self.path == "/" {
            Node::Dir
        } else {
            nodes
                .get(&self.path)
                .cloned()
                .ok_or_else(|| VfsError::NotFound(self.path.clone()))?
        };
        let (mode, size) = match &node {
            Node::File(data) => (S_IFREG | 0o644, data.len() as u64),
            Node::Dir => (S_IFDIR | 0o755, 0),
            Node::Symlink(t) => (S_IFLNK | 0o777, t.len() as u64),
        };
        Ok(FileInfo::new(
            rpath::base(&self.path),
            size,
            mode,
            1_700_000_000,
            None,
            self.path.clone(),
            "/",
            self.creds,
        ))
    }

    async fn truncate(&mut self) -> VfsResult<()> {
        Ok(())
    }

    async fn sync(&mut self) -> VfsResult<()> {
        Ok(())
    }

    async fn readdir(&mut self) -> VfsResult<Vec<FileInfo>> {
        if !self.dir_like {
            return Err(VfsError::NotADirectory(self.path.clone()));
        }
        let nodes = self.nodes.lock();
        let mut entries = Vec::new();
        for (path, node) in nodes.iter() {
            if rpath::parent(path) == self.path {
                let (mode, size) = match node {
                    Node::File(data) => (S_IFREG | 0o644, data.len() as u64),
                    Node::Dir => (S_IFDIR | 0o755, 0),
                    Node::Symlink(t) => (S_IFLNK | 0o777, t.len() as u64),
                };
                entries.push(FileInfo::new(
                    rpath::base(path),
                    size,
                    mode,
                    1_700_000_000,
                    None,
                    path.clone(),
                    "/",
                    self.creds,
                ));
            }
        }
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(entries)
    }

    async fn close(&mut self) -> VfsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lstat_counts_round_trips() {
        let fs = MemFs::new();
        fs.add_file("/a", b"1");
        assert_eq!(fs.lstat_count(), 0);
        fs.lstat("/a").await.unwrap();
        fs.lstat("/a").await.unwrap();
        assert_eq!(fs.lstat_count(), 2);
    }

    #[tokio::test]
    async fn test_file_id_stability() {
        let fs = MemFs::new();
        fs.add_file("/a", b"abc");
        let first = fs.lstat("/a").await.unwrap();
        let second = fs.lstat("/a").await.unwrap();
        assert_eq!(fs.get_file_id(&first), fs.get_file_id(&second));

        // changing the size changes the id
        fs.add_file("/a", b"abcdef");
        let third = fs.lstat("/a").await.unwrap();
        assert_ne!(fs.get_file_id(&first), fs.get_file_id(&third));
    }

    #[tokio::test]
    async fn test_handle_round_trip_through_backend() {
        let fs = MemFs::new();
        fs.add_dir("/x");
        fs.add_file("/x/a", b"1");
        let info = fs.lstat("/x/a").await.unwrap();
        let handle = fs.get_handle(&info).unwrap();
        assert_eq!(fs.resolve_handle(&handle).unwrap(), "/x/a");
        assert_eq!(fs.resolve_handle(&fs.get_root_handle()).unwrap(), "/");
        // malformed handles fall back to the root
        assert_eq!(fs.resolve_handle(&[1, 2]).unwrap(), "/");
    }

    #[tokio::test]
    async fn test_readdir_lists_direct_children() {
        let fs = MemFs::new();
        fs.add_dir("/x");
        fs.add_file("/x/a", b"1");
        fs.add_file("/x/b/nested", b"2");
        let mut dir = fs.open("/x").await.unwrap();
        let names: Vec<String> = dir
            .readdir()
            .await
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["a"]);
    }
}
