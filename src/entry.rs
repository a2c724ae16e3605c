//! Entries: one file's identity plus a metadata snapshot
//!
//! An [`Entry`] is built while scanning a tree or parsing a metadata record
//! and is never mutated afterwards except to attach a content digest. The
//! change-detection predicate of the whole crate is [`Entry::loose_eq`]: kind
//! and every attribute relevant to that kind match, content excluded.

use crate::error::Result;
use crate::index::Index;
use filetime::FileTime;
use nix::sys::stat::{self, Mode, SFlag};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::trace;

/// Kind of filesystem node an entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Nothing exists at this index
    Absent,
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Character device
    CharDevice,
    /// Block device
    BlockDevice,
    /// Named pipe
    Fifo,
    /// Unix domain socket
    Socket,
}

impl EntryKind {
    /// Short name used in metadata records
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Absent => "absent",
            EntryKind::Regular => "reg",
            EntryKind::Directory => "dir",
            EntryKind::Symlink => "sym",
            EntryKind::CharDevice => "chr",
            EntryKind::BlockDevice => "blk",
            EntryKind::Fifo => "fifo",
            EntryKind::Socket => "sock",
        }
    }

    /// Parse the short name
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "absent" => EntryKind::Absent,
            "reg" => EntryKind::Regular,
            "dir" => EntryKind::Directory,
            "sym" => EntryKind::Symlink,
            "chr" => EntryKind::CharDevice,
            "blk" => EntryKind::BlockDevice,
            "fifo" => EntryKind::Fifo,
            "sock" => EntryKind::Socket,
            _ => return None,
        })
    }

    /// Devices, fifos and sockets
    pub fn is_special(&self) -> bool {
        matches!(
            self,
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo | EntryKind::Socket
        )
    }
}

/// Identity of an inode shared by hard links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardlinkKey {
    /// Device holding the inode
    pub dev: u64,
    /// Inode number
    pub ino: u64,
}

/// One path's identity and metadata at a point of observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Position in the tree
    pub index: Index,
    /// Node kind
    pub kind: EntryKind,
    /// Size in bytes (regular files only)
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub mtime: i64,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Permission bits, including setuid/setgid/sticky
    pub permissions: u32,
    /// Symlink target
    pub link_target: Option<OsString>,
    /// Major and minor device numbers
    pub device: Option<(u64, u64)>,
    /// Hex SHA-256 of regular file content
    pub content_hash: Option<String>,
    /// Shared inode key when the file has more than one link
    pub hardlink: Option<HardlinkKey>,
    /// Link count as observed
    pub nlink: u64,
}

impl Entry {
    /// An entry saying nothing exists at `index`
    pub fn absent(index: Index) -> Self {
        Entry {
            index,
            kind: EntryKind::Absent,
            size: 0,
            mtime: 0,
            uid: 0,
            gid: 0,
            permissions: 0,
            link_target: None,
            device: None,
            content_hash: None,
            hardlink: None,
            nlink: 0,
        }
    }

    /// Read the entry at `path` without following symlinks
    ///
    /// A missing path yields an absent entry rather than an error.
    pub fn read(index: Index, path: &Path) -> Result<Self> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Self::from_metadata(index, path, &meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Entry::absent(index)),
            Err(e) => Err(e.into()),
        }
    }

    /// Build an entry from already-fetched `lstat` metadata
    pub fn from_metadata(index: Index, path: &Path, meta: &fs::Metadata) -> Result<Self> {
        let file_type = meta.file_type();
        let kind = if file_type.is_file() {
            EntryKind::Regular
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_char_device() {
            EntryKind::CharDevice
        } else if file_type.is_block_device() {
            EntryKind::BlockDevice
        } else if file_type.is_fifo() {
            EntryKind::Fifo
        } else {
            EntryKind::Socket
        };

        let link_target = if kind == EntryKind::Symlink {
            Some(fs::read_link(path)?.into_os_string())
        } else {
            None
        };

        let device = if matches!(kind, EntryKind::CharDevice | EntryKind::BlockDevice) {
            let rdev = meta.rdev();
            Some((stat::major(rdev) as u64, stat::minor(rdev) as u64))
        } else {
            None
        };

        let hardlink = if kind == EntryKind::Regular && meta.nlink() > 1 {
            Some(HardlinkKey {
                dev: meta.dev(),
                ino: meta.ino(),
            })
        } else {
            None
        };

        Ok(Entry {
            index,
            kind,
            size: if kind == EntryKind::Regular { meta.len() } else { 0 },
            mtime: meta.mtime(),
            uid: meta.uid(),
            gid: meta.gid(),
            permissions: meta.mode() & 0o7777,
            link_target,
            device,
            content_hash: None,
            hardlink,
            nlink: meta.nlink(),
        })
    }

    /// True unless the entry is absent
    pub fn exists(&self) -> bool {
        self.kind != EntryKind::Absent
    }

    /// Regular file
    pub fn is_reg(&self) -> bool {
        self.kind == EntryKind::Regular
    }

    /// Directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Symbolic link
    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    /// Metadata-only equivalence, ignoring content
    ///
    /// Directory modification times are ignored since they change whenever
    /// a child does; symlink permissions are ignored since they are
    /// meaningless on most systems.
    pub fn loose_eq(&self, other: &Entry) -> bool {
        if self.kind != other.kind {
            return false;
        }
        let owner = self.uid == other.uid && self.gid == other.gid;
        match self.kind {
            EntryKind::Absent => true,
            EntryKind::Regular => {
                owner
                    && self.size == other.size
                    && self.mtime == other.mtime
                    && self.permissions == other.permissions
            }
            EntryKind::Directory => owner && self.permissions == other.permissions,
            EntryKind::Symlink => owner && self.link_target == other.link_target,
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                owner && self.permissions == other.permissions && self.device == other.device
            }
            EntryKind::Fifo | EntryKind::Socket => owner && self.permissions == other.permissions,
        }
    }

    /// Same entry with a content digest attached
    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.content_hash = hash;
        self
    }

    /// Create the node this entry describes at `path`
    ///
    /// Regular files are written by callers that own their content; this
    /// handles every other kind. Absent entries create nothing.
    pub fn create_node(&self, path: &Path) -> Result<()> {
        match self.kind {
            EntryKind::Absent | EntryKind::Regular => {}
            EntryKind::Directory => fs::create_dir(path)?,
            EntryKind::Symlink => {
                let target = self.link_target.clone().unwrap_or_default();
                std::os::unix::fs::symlink(target, path)?;
            }
            EntryKind::Fifo => {
                nix::unistd::mkfifo(path, Mode::from_bits_truncate(self.permissions as _))?;
            }
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Socket => {
                let flag = match self.kind {
                    EntryKind::CharDevice => SFlag::S_IFCHR,
                    EntryKind::BlockDevice => SFlag::S_IFBLK,
                    _ => SFlag::S_IFSOCK,
                };
                let (major, minor) = self.device.unwrap_or((0, 0));
                stat::mknod(
                    path,
                    flag,
                    Mode::from_bits_truncate(self.permissions as _),
                    stat::makedev(major as _, minor as _),
                )?;
            }
        }
        trace!("Created {} node at {:?}", self.kind.as_str(), path);
        Ok(())
    }

    /// Copy ownership, permissions and modification time onto `path`
    ///
    /// Ownership changes that the process is not allowed to make are skipped.
    pub fn apply_to(&self, path: &Path) -> Result<()> {
        match self.kind {
            EntryKind::Absent => Ok(()),
            EntryKind::Symlink => {
                ignore_eperm(std::os::unix::fs::lchown(path, Some(self.uid), Some(self.gid)))?;
                let mtime = FileTime::from_unix_time(self.mtime, 0);
                filetime::set_symlink_file_times(path, mtime, mtime)?;
                Ok(())
            }
            _ => {
                ignore_eperm(std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid)))?;
                fs::set_permissions(path, fs::Permissions::from_mode(self.permissions))?;
                filetime::set_file_mtime(path, FileTime::from_unix_time(self.mtime, 0))?;
                Ok(())
            }
        }
    }
}

fn ignore_eperm(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.raw_os_error() == Some(nix::libc::EPERM) => Ok(()),
        other => other,
    }
}

/// Remove whatever node exists at `path`; missing paths are fine
pub fn remove_node(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Add owner read, write and execute bits to a directory if missing
pub fn make_dir_writable(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let mode = meta.permissions().mode() & 0o7777;
    if mode & 0o700 != 0o700 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
    }
    Ok(())
}
