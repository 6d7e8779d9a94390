//! Backend filesystem contract consumed by the NFS server host.
//!
//! The NFS bridge in [`crate::server`] only ever talks to [`RemoteFs`] and
//! [`RemoteFile`]; [`crate::sftp_fs::SftpFs`] is the production
//! implementation and the in-memory `memfs` backs tests. Paths on this
//! interface are NFS-visible: `/` is the export root, and implementations
//! resolve them under their configured root directory.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::rpath;

/// Mode bits for the file-type field of a unix mode.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;

const FNV_OFFSET: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Errors surfaced by backend filesystem implementations.
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("file does not exist: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("malformed file handle")]
    BadHandle,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("remote operation failed: {0}")]
    Remote(String),
}

pub type VfsResult<T> = Result<T, VfsError>;

/// Uid/gid pair reported for every file.
///
/// Captured once at supervisor startup and passed into adapter
/// constructors; all remote ownership is masked with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Creds {
    pub uid: u32,
    pub gid: u32,
}

impl Creds {
    /// Used when the invoking user cannot be determined.
    pub const FALLBACK: Creds = Creds { uid: 501, gid: 20 };

    /// Snapshot the invoking user.
    pub fn invoking_user() -> Self {
        // getuid/getgid cannot fail on POSIX
        let uid = unsafe { libc::getuid() } as u32;
        let gid = unsafe { libc::getgid() } as u32;
        Creds { uid, gid }
    }
}

impl Default for Creds {
    fn default() -> Self {
        Self::FALLBACK
    }
}

/// Open disposition for [`RemoteFs::open_file`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenMode {
    pub fn read_only() -> Self {
        Self { read: true, ..Default::default() }
    }

    pub fn write_only() -> Self {
        Self { write: true, ..Default::default() }
    }

    pub fn create() -> Self {
        Self { read: true, write: true, create: true, ..Default::default() }
    }
}

/// Static capabilities advertised to the NFS server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub link_support: bool,
    pub symlink_support: bool,
    pub chown_restricted: bool,
    pub max_name: u32,
    pub max_read: u64,
    pub max_write: u64,
    pub no_trunc: bool,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            link_support: true,
            symlink_support: true,
            chown_restricted: false,
            max_name: 255,
            max_read: 1024 * 1024 * 1024,
            max_write: 1024 * 1024 * 1024,
            no_trunc: true,
        }
    }
}

/// Stat result carried across the backend contract.
///
/// `nfs_path` is the path the caller used to reach the node; the mode and
/// directory coercions below depend on it (the export root is always
/// presented as a directory, even when the remote root is a symlink).
#[derive(Clone, Debug)]
pub struct FileInfo {
    name: String,
    size: u64,
    raw_mode: u32,
    mtime: i64,
    atime: Option<i64>,
    nfs_path: String,
    root_dir: String,
    creds: Creds,
}

impl FileInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        size: u64,
        raw_mode: u32,
        mtime: i64,
        atime: Option<i64>,
        nfs_path: impl Into<String>,
        root_dir: impl Into<String>,
        creds: Creds,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            raw_mode,
            mtime,
            atime,
            nfs_path: nfs_path.into(),
            root_dir: root_dir.into(),
            creds,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn nfs_path(&self) -> &str {
        &self.nfs_path
    }

    pub fn uid(&self) -> u32 {
        self.creds.uid
    }

    pub fn gid(&self) -> u32 {
        self.creds.gid
    }

    fn is_symlink(&self) -> bool {
        self.raw_mode & S_IFMT == S_IFLNK
    }

    fn underlying_dir(&self) -> bool {
        self.raw_mode & S_IFMT == S_IFDIR
    }

    /// Directory flag as presented over NFS: the export root is always a
    /// directory, symlinks never are (pre-resolution), everything else
    /// follows the remote flag.
    pub fn is_dir(&self) -> bool {
        if is_root_path(&self.nfs_path, &self.root_dir) {
            return true;
        }
        if self.is_symlink() {
            return false;
        }
        self.underlying_dir()
    }

    /// Mode with the directory bit coerced where the node is presented as a
    /// directory but the remote mode lacks it. A symlink keeps its link
    /// type except when it is the export root itself: a bind-style remote
    /// root that is a symlink must still behave as the root directory.
    pub fn mode(&self) -> u32 {
        if self.is_symlink() {
            if is_root_path(&self.nfs_path, &self.root_dir) {
                return (self.raw_mode & !S_IFMT) | S_IFDIR;
            }
            return self.raw_mode;
        }
        if self.is_dir() && self.raw_mode & S_IFMT != S_IFDIR {
            return (self.raw_mode & !S_IFMT) | S_IFDIR;
        }
        self.raw_mode
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    /// Access time when the remote reported one, else the mod-time.
    pub fn atime(&self) -> i64 {
        self.atime.unwrap_or(self.mtime)
    }

    /// Change time is reported as the mod-time; SFTP has no ctime.
    pub fn ctime(&self) -> i64 {
        self.mtime
    }

    pub fn num_links(&self) -> u32 {
        if self.underlying_dir() {
            2
        } else {
            1
        }
    }

    /// FNV-1a key for this node, fed by [`RemoteFs::get_file_id`].
    pub fn file_id_key(&self) -> String {
        format!("{}:{}:{}:{}", self.name, self.creds.uid, self.creds.gid, self.size)
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:o}, {} bytes)", self.nfs_path, self.mode(), self.size)
    }
}

/// True for the spellings that all mean "the export root".
pub fn is_root_path(path: &str, root_dir: &str) -> bool {
    if path.is_empty() || path == "." || path == "/" || path == "~" {
        return true;
    }
    rpath::clean(path) == rpath::clean(root_dir)
}

/// Map a resolved full path back to its NFS-visible form; the root maps to
/// `/`.
pub fn nfs_visible(full_path: &str, root_dir: &str) -> String {
    let full = rpath::clean(full_path);
    let root = rpath::clean(root_dir);
    if full == root {
        return "/".to_string();
    }
    match full.strip_prefix(&root) {
        Some(rest) if root != "/" => rpath::clean(&format!("/{rest}")),
        _ => full,
    }
}

/// Encode a path as an opaque NFS handle: 4-byte big-endian length prefix
/// followed by the UTF-8 path.
pub fn encode_handle(path: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + path.len());
    buf.extend_from_slice(&(path.len() as u32).to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf
}

/// Decode a handle back into a path. Malformed buffers decode to the empty
/// string, which `resolve_handle` maps back to the export root.
pub fn decode_handle(handle: &[u8]) -> String {
    if handle.len() < 4 {
        return String::new();
    }
    let len = u32::from_be_bytes([handle[0], handle[1], handle[2], handle[3]]) as usize;
    if len > handle.len() - 4 {
        return String::new();
    }
    String::from_utf8_lossy(&handle[4..4 + len]).into_owned()
}

/// 64-bit FNV-1a.
pub fn fnv1a64(data: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// An open file or directory on the backend.
#[async_trait]
pub trait RemoteFile: Send {
    /// Resolved full path of the node.
    fn name(&self) -> &str;

    async fn seek(&mut self, offset: u64) -> VfsResult<u64>;
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;
    async fn write(&mut self, data: &[u8]) -> VfsResult<usize>;

    async fn stat(&self) -> VfsResult<FileInfo>;

    /// Force-flush by truncating to the current size; deliberately
    /// size-preserving.
    async fn truncate(&mut self) -> VfsResult<()>;

    async fn sync(&mut self) -> VfsResult<()>;

    /// List entries; only meaningful for directory-like nodes.
    async fn readdir(&mut self) -> VfsResult<Vec<FileInfo>>;

    async fn close(&mut self) -> VfsResult<()>;
}

/// The filesystem contract the NFS server host consumes.
///
/// All paths are NFS-visible (see module docs). Implementations must be
/// shareable across concurrent server connections; credentials passed to
/// `set_creds` may be discarded.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Record the caller's credentials. This backend ignores them: all
    /// ownership is reported as the invoking user.
    fn set_creds(&self, creds: Creds);

    async fn create(&self, path: &str) -> VfsResult<Box<dyn RemoteFile>>;
    async fn mkdir_all(&self, path: &str, mode: u32) -> VfsResult<()>;
    async fn open(&self, path: &str) -> VfsResult<Box<dyn RemoteFile>>;
    async fn open_file(&self, path: &str, mode: OpenMode, perm: u32) -> VfsResult<Box<dyn RemoteFile>>;

    async fn stat(&self, path: &str) -> VfsResult<FileInfo>;
    async fn lstat(&self, path: &str) -> VfsResult<FileInfo>;

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()>;
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> VfsResult<()>;

    async fn symlink(&self, target: &str, link: &str) -> VfsResult<()>;
    async fn readlink(&self, path: &str) -> VfsResult<String>;
    async fn link(&self, oldpath: &str, newpath: &str) -> VfsResult<()>;
    async fn rename(&self, oldpath: &str, newpath: &str) -> VfsResult<()>;
    async fn remove(&self, path: &str) -> VfsResult<()>;

    /// Static filesystem capabilities.
    fn attributes(&self) -> Attributes;

    /// Stable 64-bit id for a node: FNV-1a over `name:uid:gid:size`.
    fn get_file_id(&self, info: &FileInfo) -> u64;

    /// Handle for the export root (encodes the root directory itself).
    fn get_root_handle(&self) -> Vec<u8>;

    fn get_handle(&self, info: &FileInfo) -> VfsResult<Vec<u8>>;

    /// Decode a handle back to a path; empty or malformed handles resolve
    /// to the export root.
    fn resolve_handle(&self, handle: &[u8]) -> VfsResult<String>;

    /// Release the backend connection.
    async fn close(&self) -> VfsResult<()>;
}
