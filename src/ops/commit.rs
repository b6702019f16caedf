use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;

use crate::error::{IoResultExt, Result};
use crate::fs::{read_link_target, read_xattrs, EntryType, Inode, LinkTracker, Ownership};
use crate::hash::Hash;
use crate::object::{write_blob_from, write_commit, write_symlink_blob, write_tree};
use crate::refs::{read_ref_opt, write_ref};
use crate::repo::Repo;
use crate::types::{Commit, EntryKind, Tree, TreeEntry};

/// commit message and metadata
#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub message: String,
    pub author: String,
    pub metadata: BTreeMap<String, String>,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            message: String::new(),
            author: "rootdeploy".to_string(),
            metadata: BTreeMap::new(),
        }
    }
}

/// snapshot `source` and point `ref_name` at the new commit
///
/// the previous value of the ref, if any, becomes the parent.
pub fn commit(repo: &Repo, source: &Path, ref_name: &str, opts: &CommitOptions) -> Result<Hash> {
    let _lock = repo.lock()?;

    let mut snapshot = Snapshot {
        repo,
        links: LinkTracker::new(),
        files: 0,
    };
    let tree = snapshot.dir(source, "")?;

    let parents = read_ref_opt(repo, ref_name)?.into_iter().collect();
    let mut commit = Commit::new(tree, parents, opts.author.clone(), opts.message.clone());
    commit.metadata = opts.metadata.clone();

    let hash = write_commit(repo, &commit)?;
    write_ref(repo, ref_name, &hash)?;

    tracing::info!(
        reference = ref_name,
        checksum = %hash,
        files = snapshot.files,
        "committed {}",
        source.display()
    );
    Ok(hash)
}

struct Snapshot<'a> {
    repo: &'a Repo,
    links: LinkTracker<String>,
    files: usize,
}

impl Snapshot<'_> {
    fn dir(&mut self, dir: &Path, prefix: &str) -> Result<Hash> {
        let mut children: Vec<_> = fs::read_dir(dir)
            .with_path(dir)?
            .collect::<std::io::Result<Vec<_>>>()
            .with_path(dir)?;
        // traversal order must match checkout so hardlink targets come first
        children.sort_by_key(|e| e.file_name());

        let mut entries = Vec::with_capacity(children.len());
        for child in children {
            let path = child.path();
            let name = child.file_name().to_string_lossy().into_owned();
            let logical = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            let kind = self.entry(&path, &logical)?;
            entries.push(TreeEntry::new(name, kind));
        }

        write_tree(self.repo, &Tree::new(entries)?)
    }

    fn entry(&mut self, path: &Path, logical: &str) -> Result<EntryKind> {
        let inode = Inode::lstat(path)?;

        if let Some(first) = self.links.check(&inode, || logical.to_string()) {
            return Ok(EntryKind::Hardlink { target_path: first });
        }

        let xattrs = read_xattrs(path)?;
        let (uid, gid, mode) = (inode.uid, inode.gid, inode.mode);

        let kind = match inode.kind {
            EntryType::Regular => {
                let mut file = File::open(path).with_path(path)?;
                let hash =
                    write_blob_from(self.repo, &mut file, Ownership::new(uid, gid, mode), &xattrs)?;
                self.files += 1;
                EntryKind::Regular {
                    hash,
                    size: inode.size,
                }
            }
            EntryType::Symlink => {
                let target = read_link_target(path)?;
                EntryKind::Symlink {
                    hash: write_symlink_blob(self.repo, &target, uid, gid, &xattrs)?,
                }
            }
            EntryType::Directory => EntryKind::Directory {
                hash: self.dir(path, logical)?,
                uid,
                gid,
                mode,
                xattrs,
            },
            EntryType::BlockDevice | EntryType::CharDevice => {
                let (major, minor) = inode.rdev.unwrap_or((0, 0));
                if inode.kind == EntryType::BlockDevice {
                    EntryKind::BlockDevice { major, minor, uid, gid, mode, xattrs }
                } else {
                    EntryKind::CharDevice { major, minor, uid, gid, mode, xattrs }
                }
            }
            EntryType::Fifo => EntryKind::Fifo { uid, gid, mode, xattrs },
            EntryType::Socket => EntryKind::Socket { uid, gid, mode, xattrs },
        };
        Ok(kind)
    }
}
