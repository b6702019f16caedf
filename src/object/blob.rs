use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{IoResultExt, Result};
use crate::fs::{apply_metadata, read_xattrs, Inode, Ownership};
use crate::hash::{BlobHasher, Hash, SYMLINK_MODE};
use crate::repo::{ObjectKind, Repo};
use crate::types::Xattr;

use super::{not_found_or_io, object_path, publish, scratch_path};

/// stamp a finished scratch file and move it into place
fn finish(repo: &Repo, tmp: &Path, hash: &Hash, owner: Ownership, xattrs: &[Xattr]) -> Result<()> {
    let dest = object_path(repo, ObjectKind::Blob, hash);
    if dest.exists() {
        fs::remove_file(tmp).with_path(tmp)?;
        return Ok(());
    }
    // symlink blobs are plain files on disk
    apply_metadata(tmp, Ownership { mode: owner.mode & 0o7777, ..owner }, xattrs)?;
    publish(tmp, &dest)
}

/// store an in-memory blob
///
/// `owner.mode` is the full st_mode; it is part of the hash.
pub fn write_blob(repo: &Repo, content: &[u8], owner: Ownership, xattrs: &[Xattr]) -> Result<Hash> {
    write_blob_from(repo, &mut &content[..], owner, xattrs)
}

/// store a blob streamed from `reader`, hashing while copying
pub fn write_blob_from<R: Read>(
    repo: &Repo,
    reader: &mut R,
    owner: Ownership,
    xattrs: &[Xattr],
) -> Result<Hash> {
    let tmp = scratch_path(repo);
    let mut hasher = BlobHasher::new(owner.uid, owner.gid, owner.mode, xattrs);
    {
        let mut file = File::create(&tmp).with_path(&tmp)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).with_path(&tmp)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).with_path(&tmp)?;
        }
        file.sync_all().with_path(&tmp)?;
    }

    let hash = hasher.finalize();
    finish(repo, &tmp, &hash, owner, xattrs)?;
    Ok(hash)
}

/// store a symlink: its target is the content, its mode is fixed
pub fn write_symlink_blob(
    repo: &Repo,
    target: &str,
    uid: u32,
    gid: u32,
    xattrs: &[Xattr],
) -> Result<Hash> {
    write_blob(repo, target.as_bytes(), Ownership::new(uid, gid, SYMLINK_MODE), xattrs)
}

pub fn read_blob(repo: &Repo, hash: &Hash) -> Result<Vec<u8>> {
    let path = object_path(repo, ObjectKind::Blob, hash);
    fs::read(&path).map_err(|e| not_found_or_io(e, hash, &path))
}

/// bring one blob from another store's file at `src` into `repo`
///
/// hard links when both stores share a filesystem, otherwise copies the
/// content and restamps owner, mode and xattrs from the source inode.
pub fn import_blob(repo: &Repo, hash: &Hash, src: &Path) -> Result<()> {
    let dest = object_path(repo, ObjectKind::Blob, hash);
    if dest.exists() {
        return Ok(());
    }
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_path(dir)?;

    match fs::hard_link(src, &dest) {
        Ok(()) => return crate::fs::fsync_dir(dir),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(not_found_or_io(e, hash, src))
        }
        // EXDEV and friends fall through to a copy
        Err(_) => {}
    }

    let inode = Inode::lstat(src)?;
    let xattrs = read_xattrs(src)?;
    let tmp = scratch_path(repo);
    fs::copy(src, &tmp).with_path(&tmp)?;
    finish(
        repo,
        &tmp,
        hash,
        Ownership::new(inode.uid, inode.gid, inode.mode),
        &xattrs,
    )
}
