use crate::error::Result;
use crate::hash::Hash;
use crate::repo::{ObjectKind, Repo};
use crate::types::Tree;

pub fn write_tree(repo: &Repo, tree: &Tree) -> Result<Hash> {
    super::write_encoded(repo, ObjectKind::Tree, tree)
}

/// read and verify a tree
pub fn read_tree(repo: &Repo, hash: &Hash) -> Result<Tree> {
    super::read_encoded(repo, ObjectKind::Tree, hash)
}
