//! carrying mutable state from one sysroot to the next

use std::fs::File;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{
    apply_metadata, make_device, make_dir, make_fifo, make_file, make_hardlink, make_socket,
    make_symlink, read_link_target, read_xattrs, DeviceType, EntryType, Inode, LinkTracker,
    Ownership,
};
use crate::sysroot::Sysroot;
use crate::types::Xattr;

/// subdirectory of `var` holding home and other persistent roots
pub const ROOTDIRS: &str = "rootdirs";

/// copy `var/rootdirs` of `src` into `dst`, metadata included
pub fn migrate_state(src: &Sysroot, dst: &Sysroot) -> Result<()> {
    let from = src.var_path().join(ROOTDIRS);
    let to = dst.var_path().join(ROOTDIRS);
    if !from.is_dir() {
        return Err(Error::StateMigration {
            path: from,
            message: "source state directory does not exist".to_string(),
        });
    }

    let copied = copy_tree(&from, &to)?;
    tracing::info!(from = %from.display(), to = %to.display(), entries = copied, "migrated state");
    Ok(())
}

fn failed(path: &Path) -> impl FnOnce(Error) -> Error + '_ {
    move |e| Error::StateMigration {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// mirror `from` at `to`; returns the number of entries copied
///
/// directories get their metadata after everything below them exists.
pub fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    let mut links: LinkTracker<PathBuf> = LinkTracker::new();
    let mut dirs: Vec<(PathBuf, Ownership, Vec<Xattr>)> = Vec::new();
    let mut count = 0;

    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .with_path(parent)
            .map_err(failed(parent))?;
    }

    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::StateMigration {
            path: e.path().unwrap_or(from).to_path_buf(),
            message: e.to_string(),
        })?;
        let src = entry.path();
        let rel = src.strip_prefix(from).unwrap_or(Path::new(""));
        let dst = to.join(rel);

        copy_entry(src, &dst, &mut links, &mut dirs).map_err(failed(src))?;
        count += 1;
    }

    // deepest first, so a read-only parent does not block its children
    for (dir, owner, xattrs) in dirs.iter().rev() {
        apply_metadata(dir, *owner, xattrs).map_err(failed(dir))?;
    }
    Ok(count)
}

fn copy_entry(
    src: &Path,
    dst: &Path,
    links: &mut LinkTracker<PathBuf>,
    dirs: &mut Vec<(PathBuf, Ownership, Vec<Xattr>)>,
) -> Result<()> {
    let inode = Inode::lstat(src)?;

    if let Some(first) = links.check(&inode, || dst.to_path_buf()) {
        return make_hardlink(dst, &first);
    }

    let xattrs = read_xattrs(src)?;
    let owner = Ownership::new(inode.uid, inode.gid, inode.mode);

    match inode.kind {
        EntryType::Directory => {
            make_dir(dst)?;
            dirs.push((dst.to_path_buf(), owner, xattrs));
            Ok(())
        }
        EntryType::Regular => {
            let mut file = File::open(src).with_path(src)?;
            make_file(dst, &mut file, owner, &xattrs).map(|_| ())
        }
        EntryType::Symlink => {
            let target = read_link_target(src)?;
            make_symlink(dst, &target, inode.uid, inode.gid, &xattrs)
        }
        EntryType::BlockDevice => make_device(
            dst,
            DeviceType::Block,
            inode.rdev.unwrap_or((0, 0)),
            owner,
            &xattrs,
        ),
        EntryType::CharDevice => make_device(
            dst,
            DeviceType::Char,
            inode.rdev.unwrap_or((0, 0)),
            owner,
            &xattrs,
        ),
        EntryType::Fifo => make_fifo(dst, owner, &xattrs),
        EntryType::Socket => make_socket(dst, owner, &xattrs),
    }
}
