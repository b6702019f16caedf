use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// metadata key holding the release version of a commit
pub const VERSION_KEY: &str = "version";

/// a commit object pointing to a tree with metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: Hash,
    /// empty for an initial commit
    pub parents: Vec<Hash>,
    pub author: String,
    /// seconds since epoch
    pub timestamp: i64,
    pub message: String,
    /// BTreeMap keeps the encoding deterministic
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Commit {
    pub fn new(
        tree: Hash,
        parents: Vec<Hash>,
        author: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::with_timestamp(tree, parents, author, timestamp, message)
    }

    pub fn with_timestamp(
        tree: Hash,
        parents: Vec<Hash>,
        author: impl Into<String>,
        timestamp: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            parents,
            author: author.into(),
            timestamp,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// descriptive metadata: version plus the message split into subject and body
    pub fn describe(&self) -> CommitMetadata {
        let (subject, body) = match self.message.split_once('\n') {
            Some((subject, rest)) => (subject.trim_end(), rest.trim()),
            None => (self.message.trim_end(), ""),
        };
        CommitMetadata {
            version: self.metadata.get(VERSION_KEY).cloned(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

/// human-facing description of a commit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitMetadata {
    pub version: Option<String>,
    pub subject: String,
    pub body: String,
}
