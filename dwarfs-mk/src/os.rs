//! The operating system access boundary.
//!
//! The scanner only touches the input through [`OsAccess`], so the whole
//! pipeline can run against [`RealOs`] (the actual filesystem) or
//! [`MemoryOs`] (an in-memory tree used by the test suite and useful for
//! building synthetic images).

use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::path::Path;

// File type bits of `st_mode`; stored platform-agnostically in the image.
const S_IFSOCK: u32 = 0o140_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFREG: u32 = 0o100_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFCHR: u32 = 0o020_000;
const S_IFIFO: u32 = 0o010_000;

/// The kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// The `S_IFMT` bits for this kind.
    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Directory => S_IFDIR,
            FileKind::File => S_IFREG,
            FileKind::Symlink => S_IFLNK,
            FileKind::BlockDevice => S_IFBLK,
            FileKind::CharDevice => S_IFCHR,
            FileKind::Fifo => S_IFIFO,
            FileKind::Socket => S_IFSOCK,
        }
    }

    /// Block or character device.
    pub fn is_device(self) -> bool {
        matches!(self, FileKind::BlockDevice | FileKind::CharDevice)
    }

    /// Pipe or socket.
    pub fn is_ipc(self) -> bool {
        matches!(self, FileKind::Fifo | FileKind::Socket)
    }
}

/// The `lstat`-like attributes of one entry.
#[derive(Debug, Clone)]
pub struct EntryStat {
    pub kind: FileKind,
    pub size: u64,
    /// Permission bits including setuid/setgid/sticky, without the type.
    pub mode_bits: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Device id of block/char device entries.
    pub rdev: u64,
    /// Identity of the underlying inode: entries sharing `(dev, ino)` are
    /// hardlinks of each other.
    pub dev: u64,
    pub ino: u64,
}

impl EntryStat {
    /// The full mode: type bits plus permission bits.
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | self.mode_bits
    }
}

/// Read-only access to an input tree.
pub trait OsAccess: Send + Sync {
    /// `lstat` the entry at `path` (symlinks are not followed).
    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryStat>;

    /// List the names in a directory, in no particular order and without
    /// `.`/`..`. The scanner sorts them itself.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Read a symlink target.
    fn read_link(&self, path: &Path) -> io::Result<String>;

    /// Open a regular file for sequential reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Whether the file at `path` is readable. Files failing this check are
    /// stored empty.
    fn access_ok(&self, path: &Path) -> bool {
        let _ = path;
        true
    }
}

/// [`OsAccess`] backed by the real filesystem.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RealOs;

#[cfg(unix)]
impl OsAccess for RealOs {
    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryStat> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let meta = std::fs::symlink_metadata(path)?;
        let ft = meta.file_type();
        let kind = if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_file() {
            FileKind::File
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported file type at {}", path.display()),
            ));
        };

        // Negative (pre-epoch) timestamps are clamped; the image format only
        // stores offsets from the minimum observed time.
        let cvt_time = |sec: i64| sec.max(0) as u64;

        Ok(EntryStat {
            kind,
            size: meta.len(),
            mode_bits: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            atime: cvt_time(meta.atime()),
            mtime: cvt_time(meta.mtime()),
            ctime: cvt_time(meta.ctime()),
            rdev: meta.rdev(),
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for ent in std::fs::read_dir(path)? {
            let name = ent?.file_name();
            names.push(name.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn read_link(&self, path: &Path) -> io::Result<String> {
        let target = std::fs::read_link(path)?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn access_ok(&self, path: &Path) -> bool {
        std::fs::File::open(path).is_ok()
    }
}

/// An in-memory input tree.
///
/// Entries must be added parents-first; the `add_*` helpers panic when the
/// parent directory is missing, which keeps test setup mistakes loud. The
/// tree is immutable once wrapped in an `Arc` and handed to the scanner.
#[derive(Debug, Default)]
pub struct MemoryOs {
    nodes: HashMap<String, MemNode>,
    access_fail: HashSet<String>,
    next_ino: u64,
}

#[derive(Debug)]
struct MemNode {
    stat: EntryStat,
    content: Vec<u8>,
    target: String,
    children: Vec<String>,
}

impl MemoryOs {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn put(&mut self, path: &str, kind: FileKind, mode_bits: u32) -> &mut MemNode {
        if let Some((parent, name)) = path.rsplit_once('/') {
            self.register_child(parent, name);
        } else if !path.is_empty() {
            self.register_child("", path);
        }
        self.next_ino += 1;
        let stat = EntryStat {
            kind,
            size: 0,
            mode_bits,
            uid: 1000,
            gid: 100,
            atime: 0,
            mtime: 0,
            ctime: 0,
            rdev: 0,
            dev: 1,
            ino: self.next_ino,
        };
        self.nodes.insert(
            path.to_owned(),
            MemNode {
                stat,
                content: Vec::new(),
                target: String::new(),
                children: Vec::new(),
            },
        );
        self.nodes.get_mut(path).expect("just inserted")
    }

    fn register_child(&mut self, parent: &str, name: &str) {
        let parent_node = self
            .nodes
            .get_mut(parent)
            .unwrap_or_else(|| panic!("parent directory {parent:?} must be added first"));
        assert_eq!(parent_node.stat.kind, FileKind::Directory);
        parent_node.children.push(name.to_owned());
    }

    pub fn add_dir(&mut self, path: &str) {
        self.put(path, FileKind::Directory, 0o755);
    }

    pub fn add_file(&mut self, path: &str, content: impl Into<Vec<u8>>) {
        let content = content.into();
        let node = self.put(path, FileKind::File, 0o644);
        node.stat.size = content.len() as u64;
        node.content = content;
    }

    /// Add a hard link to an existing regular file: same `(dev, ino)`, same
    /// content.
    pub fn add_hard_link(&mut self, path: &str, existing: &str) {
        let (stat, content) = {
            let node = &self.nodes[existing];
            (node.stat.clone(), node.content.clone())
        };
        let node = self.put(path, FileKind::File, 0);
        node.stat = stat;
        node.content = content;
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) {
        let node = self.put(path, FileKind::Symlink, 0o777);
        node.stat.size = target.len() as u64;
        node.target = target.to_owned();
    }

    pub fn add_block_device(&mut self, path: &str, rdev: u64) {
        self.put(path, FileKind::BlockDevice, 0o600).stat.rdev = rdev;
    }

    pub fn add_char_device(&mut self, path: &str, rdev: u64) {
        self.put(path, FileKind::CharDevice, 0o600).stat.rdev = rdev;
    }

    pub fn add_fifo(&mut self, path: &str) {
        self.put(path, FileKind::Fifo, 0o644);
    }

    pub fn add_socket(&mut self, path: &str) {
        self.put(path, FileKind::Socket, 0o644);
    }

    /// Make `open` and the access check fail for `path`.
    pub fn set_access_fail(&mut self, path: &str) {
        self.access_fail.insert(path.to_owned());
    }

    /// Tweak the stat of an existing entry.
    pub fn stat_mut(&mut self, path: &str) -> &mut EntryStat {
        &mut self.nodes.get_mut(path).expect("no such entry").stat
    }

    fn node(&self, path: &Path) -> io::Result<&MemNode> {
        let key = path
            .to_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-UTF-8 path"))?;
        self.nodes
            .get(key)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no entry {key:?}")))
    }
}

impl OsAccess for MemoryOs {
    fn symlink_metadata(&self, path: &Path) -> io::Result<EntryStat> {
        Ok(self.node(path)?.stat.clone())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let node = self.node(path)?;
        if node.stat.kind != FileKind::Directory {
            return Err(io::Error::other("not a directory"));
        }
        Ok(node.children.clone())
    }

    fn read_link(&self, path: &Path) -> io::Result<String> {
        let node = self.node(path)?;
        if node.stat.kind != FileKind::Symlink {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a symlink"));
        }
        Ok(node.target.clone())
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        if !self.access_ok(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("access denied: {}", path.display()),
            ));
        }
        Ok(Box::new(io::Cursor::new(self.node(path)?.content.clone())))
    }

    fn access_ok(&self, path: &Path) -> bool {
        path.to_str().is_none_or(|key| !self.access_fail.contains(key))
    }
}
