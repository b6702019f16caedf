use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{
    apply_metadata, make_device, make_dir, make_fifo, make_hardlink, make_socket, make_symlink,
    DeviceType, Ownership,
};
use crate::hash::Hash;
use crate::object::{object_path, read_blob, read_commit, read_tree};
use crate::repo::{ObjectKind, Repo};
use crate::types::{EntryKind, Tree};

#[derive(Debug, Clone)]
pub struct CheckoutOptions {
    /// allow a non-empty target
    pub force: bool,
    /// hard link regular files from the store instead of copying
    pub hardlink: bool,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        Self {
            force: false,
            hardlink: true,
        }
    }
}

/// materialize commit `commit` at `target`
pub fn checkout(repo: &Repo, commit: &Hash, target: &Path, opts: &CheckoutOptions) -> Result<()> {
    let root = read_tree(repo, &read_commit(repo, commit)?.tree)?;

    if target.exists() {
        let empty = target.read_dir().with_path(target)?.next().is_none();
        if !empty && !opts.force {
            return Err(Error::TargetNotEmpty(target.to_path_buf()));
        }
    } else {
        fs::create_dir_all(target).with_path(target)?;
    }

    let mut writer = Writer {
        repo,
        opts,
        placed: HashMap::new(),
        skipped_devices: 0,
    };
    writer.tree(&root, target, "")?;

    if writer.skipped_devices > 0 {
        tracing::warn!(
            count = writer.skipped_devices,
            "device nodes skipped, checkout needs privileges to create them"
        );
    }
    tracing::debug!(checksum = %commit, target = %target.display(), "checked out");
    Ok(())
}

struct Writer<'a> {
    repo: &'a Repo,
    opts: &'a CheckoutOptions,
    /// tree-relative path -> where it landed, for hardlink entries
    placed: HashMap<String, PathBuf>,
    skipped_devices: usize,
}

impl Writer<'_> {
    fn tree(&mut self, tree: &Tree, dir: &Path, prefix: &str) -> Result<()> {
        make_dir(dir)?;

        // hardlinks wait for a second pass so their targets exist
        for entry in tree.entries() {
            let path = dir.join(&entry.name);
            let logical = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", prefix, entry.name)
            };

            match &entry.kind {
                EntryKind::Hardlink { .. } => continue,
                EntryKind::Directory {
                    hash,
                    uid,
                    gid,
                    mode,
                    xattrs,
                } => {
                    let subtree = read_tree(self.repo, hash)?;
                    self.tree(&subtree, &path, &logical)?;
                    apply_metadata(&path, Ownership::new(*uid, *gid, *mode), xattrs)?;
                    continue;
                }
                EntryKind::Regular { hash, .. } => self.regular(hash, &path)?,
                EntryKind::Symlink { hash } => self.symlink(hash, &path)?,
                EntryKind::BlockDevice { major, minor, uid, gid, mode, xattrs } => {
                    self.device(DeviceType::Block, (*major, *minor), Ownership::new(*uid, *gid, *mode), xattrs, &path)?
                }
                EntryKind::CharDevice { major, minor, uid, gid, mode, xattrs } => {
                    self.device(DeviceType::Char, (*major, *minor), Ownership::new(*uid, *gid, *mode), xattrs, &path)?
                }
                EntryKind::Fifo { uid, gid, mode, xattrs } => {
                    make_fifo(&path, Ownership::new(*uid, *gid, *mode), xattrs)?
                }
                EntryKind::Socket { uid, gid, mode, xattrs } => {
                    make_socket(&path, Ownership::new(*uid, *gid, *mode), xattrs)?
                }
            }
            self.placed.insert(logical, path);
        }

        for entry in tree.entries() {
            if let EntryKind::Hardlink { target_path } = &entry.kind {
                let existing = self
                    .placed
                    .get(target_path)
                    .ok_or_else(|| Error::HardlinkTargetNotFound(target_path.clone()))?;
                make_hardlink(&dir.join(&entry.name), existing)?;
            }
        }
        Ok(())
    }

    fn regular(&self, hash: &Hash, dest: &Path) -> Result<()> {
        let blob = object_path(self.repo, ObjectKind::Blob, hash);
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(dest).with_path(dest)?;
        }
        if self.opts.hardlink {
            // owner, mode and xattrs ride along on the shared inode
            return fs::hard_link(&blob, dest).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::ObjectNotFound(*hash),
                _ => Error::Io {
                    path: dest.to_path_buf(),
                    source: e,
                },
            });
        }

        let meta = fs::metadata(&blob).map_err(|_| Error::ObjectNotFound(*hash))?;
        let xattrs = crate::fs::read_xattrs(&blob)?;
        fs::copy(&blob, dest).with_path(dest)?;
        apply_metadata(dest, Ownership::new(meta.uid(), meta.gid(), meta.mode()), &xattrs)
    }

    fn symlink(&self, hash: &Hash, dest: &Path) -> Result<()> {
        let target = read_blob(self.repo, hash)?;
        let blob = object_path(self.repo, ObjectKind::Blob, hash);
        let meta = fs::metadata(&blob).with_path(&blob)?;
        let xattrs = crate::fs::read_xattrs(&blob)?;
        make_symlink(
            dest,
            &String::from_utf8_lossy(&target),
            meta.uid(),
            meta.gid(),
            &xattrs,
        )
    }

    fn device(
        &mut self,
        device: DeviceType,
        rdev: (u32, u32),
        owner: Ownership,
        xattrs: &[crate::types::Xattr],
        dest: &Path,
    ) -> Result<()> {
        match make_device(dest, device, rdev, owner, xattrs) {
            Err(Error::DeviceNodePermission(path)) => {
                tracing::debug!(path = %path.display(), "skipping device node");
                self.skipped_devices += 1;
                Ok(())
            }
            other => other,
        }
    }
}
