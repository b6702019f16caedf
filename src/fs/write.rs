use std::fs::{self, File, Permissions};
use std::os::unix::fs::{lchown, symlink, MetadataExt, PermissionsExt};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use crate::error::{Error, IoResultExt, Result};
use crate::types::Xattr;

/// ownership and permission bits to stamp on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self { uid, gid, mode }
    }
}

/// device node type for [`make_device`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Block,
    Char,
}

fn errno_to_io(path: &Path, e: Errno) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source: std::io::Error::from_raw_os_error(e as i32),
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path).with_path(path),
        Err(_) => Ok(()),
    }
}

fn set_xattrs(path: &Path, xattrs: &[Xattr]) -> Result<()> {
    for xattr in xattrs {
        xattr::set(path, &xattr.name, &xattr.value).map_err(|e| Error::Xattr {
            path: path.to_path_buf(),
            message: format!("cannot set {}: {}", xattr.name, e),
        })?;
    }
    Ok(())
}

/// change owner only when it differs, so unprivileged runs work on own files
fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let meta = fs::symlink_metadata(path).with_path(path)?;
    if meta.uid() != uid || meta.gid() != gid {
        lchown(path, Some(uid), Some(gid)).with_path(path)?;
    }
    Ok(())
}

/// stamp owner, xattrs and mode on an existing non-symlink path
///
/// chown drops security.capability, so owner goes first. mode goes last
/// since it may drop the write bit.
pub fn apply_metadata(path: &Path, owner: Ownership, xattrs: &[Xattr]) -> Result<()> {
    set_owner(path, owner.uid, owner.gid)?;
    set_xattrs(path, xattrs)?;
    fs::set_permissions(path, Permissions::from_mode(owner.mode & 0o7777)).with_path(path)
}

/// create a directory, metadata is applied separately once contents exist
pub fn make_dir(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// create a symlink owned by uid/gid
pub fn make_symlink(
    path: &Path,
    target: &str,
    uid: u32,
    gid: u32,
    xattrs: &[Xattr],
) -> Result<()> {
    remove_existing(path)?;
    symlink(target, path).with_path(path)?;
    set_owner(path, uid, gid)?;
    // xattr::set does not dereference, so this lands on the link itself
    set_xattrs(path, xattrs)
}

/// create a block or character device node
///
/// fails with [`Error::DeviceNodePermission`] when unprivileged.
pub fn make_device(
    path: &Path,
    device: DeviceType,
    rdev: (u32, u32),
    owner: Ownership,
    xattrs: &[Xattr],
) -> Result<()> {
    remove_existing(path)?;
    let sflag = match device {
        DeviceType::Block => SFlag::S_IFBLK,
        DeviceType::Char => SFlag::S_IFCHR,
    };
    let dev = makedev(rdev.0 as u64, rdev.1 as u64);
    mknod(path, sflag, Mode::from_bits_truncate(owner.mode), dev).map_err(|e| match e {
        Errno::EPERM => Error::DeviceNodePermission(path.to_path_buf()),
        e => errno_to_io(path, e),
    })?;
    apply_metadata(path, owner, xattrs)
}

/// create a named pipe
pub fn make_fifo(path: &Path, owner: Ownership, xattrs: &[Xattr]) -> Result<()> {
    remove_existing(path)?;
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(owner.mode))
        .map_err(|e| errno_to_io(path, e))?;
    apply_metadata(path, owner, xattrs)
}

/// create a socket inode; nothing listens on it
pub fn make_socket(path: &Path, owner: Ownership, xattrs: &[Xattr]) -> Result<()> {
    remove_existing(path)?;
    mknod(
        path,
        SFlag::S_IFSOCK,
        Mode::from_bits_truncate(owner.mode),
        makedev(0, 0),
    )
    .map_err(|e| errno_to_io(path, e))?;
    apply_metadata(path, owner, xattrs)
}

/// link `path` to the existing inode at `existing`
pub fn make_hardlink(path: &Path, existing: &Path) -> Result<()> {
    remove_existing(path)?;
    fs::hard_link(existing, path).with_path(path)
}

/// write a regular file from a reader and stamp its metadata
pub fn make_file<R: std::io::Read>(
    path: &Path,
    content: &mut R,
    owner: Ownership,
    xattrs: &[Xattr],
) -> Result<u64> {
    remove_existing(path)?;
    let written = {
        let mut file = File::create(path).with_path(path)?;
        let n = std::io::copy(content, &mut file).with_path(path)?;
        file.sync_all().with_path(path)?;
        n
    };
    apply_metadata(path, owner, xattrs)?;
    Ok(written)
}

/// sync a directory so renames inside it are durable
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)
}

/// write `content` to `path` through a temp file in the same directory
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).with_path(parent)?;
    tmp.write_all(content).with_path(tmp.path())?;
    // scratch files start out 0600
    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o644))
        .with_path(tmp.path())?;
    tmp.as_file().sync_all().with_path(tmp.path())?;
    tmp.persist(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    fsync_dir(parent)
}
