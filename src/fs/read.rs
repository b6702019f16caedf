use std::fs::{self, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use nix::libc;

use crate::error::{Error, IoResultExt, Result};
use crate::types::Xattr;

/// kind of filesystem entry, as seen by lstat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl EntryType {
    fn of(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_dir() {
            EntryType::Directory
        } else if ft.is_symlink() {
            EntryType::Symlink
        } else if ft.is_block_device() {
            EntryType::BlockDevice
        } else if ft.is_char_device() {
            EntryType::CharDevice
        } else if ft.is_fifo() {
            EntryType::Fifo
        } else if ft.is_socket() {
            EntryType::Socket
        } else {
            EntryType::Regular
        }
    }
}

/// inode attributes of a path, symlinks not followed
#[derive(Debug, Clone)]
pub struct Inode {
    pub kind: EntryType,
    pub uid: u32,
    pub gid: u32,
    /// full st_mode including the type bits
    pub mode: u32,
    pub size: u64,
    /// (major, minor), device nodes only
    pub rdev: Option<(u32, u32)>,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
}

impl Inode {
    pub fn lstat(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path).with_path(path)?;
        Ok(Self::from_metadata(&meta))
    }

    pub fn from_metadata(meta: &Metadata) -> Self {
        let kind = EntryType::of(meta);
        let rdev = match kind {
            EntryType::BlockDevice | EntryType::CharDevice => {
                let rdev = meta.rdev();
                Some((
                    nix::sys::stat::major(rdev) as u32,
                    nix::sys::stat::minor(rdev) as u32,
                ))
            }
            _ => None,
        };

        Self {
            kind,
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
            size: meta.len(),
            rdev,
            dev: meta.dev(),
            ino: meta.ino(),
            nlink: meta.nlink(),
        }
    }

    /// permission bits only
    pub fn perms(&self) -> u32 {
        self.mode & 0o7777
    }

    /// non-directory with more than one name
    pub fn is_multiply_linked(&self) -> bool {
        self.kind != EntryType::Directory && self.nlink > 1
    }
}

fn unsupported(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTSUP) | Some(libc::ENODATA)
    )
}

/// read every extended attribute of `path` without following symlinks
///
/// a filesystem without xattr support yields an empty list. any other
/// failure, including a single unreadable attribute, is an error.
pub fn read_xattrs(path: &Path) -> Result<Vec<Xattr>> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if unsupported(&e) => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Xattr {
                path: path.to_path_buf(),
                message: format!("cannot list attributes: {}", e),
            })
        }
    };

    let mut xattrs = Vec::new();
    for name in names {
        let name = name.to_string_lossy().into_owned();
        match xattr::get(path, &name) {
            Ok(Some(value)) => xattrs.push(Xattr::new(name, value)),
            // removed between list and get
            Ok(None) => {}
            Err(e) => {
                return Err(Error::Xattr {
                    path: path.to_path_buf(),
                    message: format!("cannot read {}: {}", name, e),
                })
            }
        }
    }

    xattrs.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    Ok(xattrs)
}

/// symlink target as a string
pub fn read_link_target(path: &Path) -> Result<String> {
    let target = fs::read_link(path).with_path(path)?;
    Ok(target.to_string_lossy().into_owned())
}

/// true if `dir` accepts `user.*` attributes, checked with a scratch file
pub fn supports_user_xattrs(dir: &Path) -> Result<bool> {
    let scratch = tempfile::NamedTempFile::new_in(dir).with_path(dir)?;
    match xattr::set(scratch.path(), "user.rootdeploy.check", b"1") {
        Ok(()) => Ok(true),
        Err(e) if unsupported(&e) => Ok(false),
        Err(e) => Err(Error::Xattr {
            path: dir.to_path_buf(),
            message: format!("xattr check failed: {}", e),
        }),
    }
}
