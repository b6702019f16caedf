use crate::error::Result;
use crate::hash::Hash;
use crate::repo::{ObjectKind, Repo};
use crate::types::Commit;

pub fn write_commit(repo: &Repo, commit: &Commit) -> Result<Hash> {
    super::write_encoded(repo, ObjectKind::Commit, commit)
}

/// read and verify a commit
pub fn read_commit(repo: &Repo, hash: &Hash) -> Result<Commit> {
    super::read_encoded(repo, ObjectKind::Commit, hash)
}
