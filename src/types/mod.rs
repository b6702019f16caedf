mod commit;
mod metadata;
mod tree;

pub use commit::{Commit, CommitMetadata, VERSION_KEY};
pub use metadata::Xattr;
pub use tree::{EntryKind, Tree, TreeEntry};
