use std::collections::HashSet;

use crate::error::Result;
use crate::hash::Hash;
use crate::object::{import_blob, import_encoded, object_exists, object_path, read_commit, read_tree};
use crate::repo::{ObjectKind, Repo};
use crate::types::EntryKind;

/// objects copied by a pull
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PullStats {
    pub trees: usize,
    pub blobs: usize,
    /// already present in the destination
    pub skipped: usize,
}

/// copy commit `checksum` and everything its tree reaches from `src` into `dst`
///
/// parents are not followed. objects already in `dst` are left alone.
pub fn pull_commit(src: &Repo, dst: &Repo, checksum: &Hash) -> Result<PullStats> {
    let _lock = dst.lock()?;
    let mut stats = PullStats::default();

    let commit = read_commit(src, checksum)?;

    let mut seen = HashSet::new();
    let mut pending = vec![commit.tree];
    while let Some(tree_hash) = pending.pop() {
        if !seen.insert(tree_hash) {
            continue;
        }
        let tree = read_tree(src, &tree_hash)?;
        for entry in tree.entries() {
            match &entry.kind {
                EntryKind::Regular { hash, .. } | EntryKind::Symlink { hash } => {
                    if object_exists(dst, ObjectKind::Blob, hash) {
                        stats.skipped += 1;
                        continue;
                    }
                    import_blob(dst, hash, &object_path(src, ObjectKind::Blob, hash))?;
                    stats.blobs += 1;
                }
                EntryKind::Directory { hash, .. } => pending.push(*hash),
                _ => {}
            }
        }
        if object_exists(dst, ObjectKind::Tree, &tree_hash) {
            stats.skipped += 1;
        } else {
            let path = object_path(src, ObjectKind::Tree, &tree_hash);
            import_encoded(dst, ObjectKind::Tree, &tree_hash, &path)?;
            stats.trees += 1;
        }
    }

    // the commit lands last so a visible commit always has its contents
    let path = object_path(src, ObjectKind::Commit, checksum);
    import_encoded(dst, ObjectKind::Commit, checksum, &path)?;

    tracing::debug!(
        checksum = %checksum,
        trees = stats.trees,
        blobs = stats.blobs,
        skipped = stats.skipped,
        "pulled commit"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::checkout::{checkout, CheckoutOptions};
    use crate::ops::commit::{commit, CommitOptions};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_pull_then_checkout() {
        let dir = tempdir().unwrap();
        let src = Repo::init(&dir.path().join("archive")).unwrap();
        let dst = Repo::init(&dir.path().join("sysroot-repo")).unwrap();

        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/os-release"), "ID=torizon\n").unwrap();
        std::os::unix::fs::symlink("etc/os-release", rootfs.join("os-release")).unwrap();
        let hash = commit(&src, &rootfs, "base", &CommitOptions::default()).unwrap();

        let stats = pull_commit(&src, &dst, &hash).unwrap();
        assert_eq!(stats.trees, 2);
        assert_eq!(stats.blobs, 2);

        // second pull finds everything in place
        let again = pull_commit(&src, &dst, &hash).unwrap();
        assert_eq!(again.blobs + again.trees, 0);

        let target = dir.path().join("checkout");
        checkout(&dst, &hash, &target, &CheckoutOptions::default()).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("etc/os-release")).unwrap(),
            "ID=torizon\n"
        );
    }

    #[test]
    fn test_pull_ignores_parents() {
        let dir = tempdir().unwrap();
        let src = Repo::init(&dir.path().join("a")).unwrap();
        let dst = Repo::init(&dir.path().join("b")).unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();

        fs::write(rootfs.join("f"), "1").unwrap();
        let first = commit(&src, &rootfs, "base", &CommitOptions::default()).unwrap();
        fs::write(rootfs.join("f"), "2").unwrap();
        let second = commit(&src, &rootfs, "base", &CommitOptions::default()).unwrap();

        pull_commit(&src, &dst, &second).unwrap();

        assert!(object_exists(&dst, ObjectKind::Commit, &second));
        assert!(!object_exists(&dst, ObjectKind::Commit, &first));
    }

    #[test]
    fn test_pull_missing_commit() {
        let dir = tempdir().unwrap();
        let src = Repo::init(&dir.path().join("a")).unwrap();
        let dst = Repo::init(&dir.path().join("b")).unwrap();
        assert!(matches!(
            pull_commit(&src, &dst, &Hash::ZERO),
            Err(crate::Error::ObjectNotFound(_))
        ));
    }
}
