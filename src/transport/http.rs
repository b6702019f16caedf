//! pulling a commit from a store served over plain HTTP
//!
//! the server hands out store files verbatim. blob metadata lives on the
//! inode, so it travels in response headers and the client restamps it,
//! then checks the blob hash it recomputes against the one it asked for.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fs::{read_xattrs, Inode, Ownership};
use crate::hash::{Hash, SYMLINK_MODE};
use crate::object::{decode_verified, import_encoded_bytes, object_exists, write_blob_from};
use crate::ops::PullStats;
use crate::repo::{ObjectKind, Repo};
use crate::types::{Commit, EntryKind, Tree, Xattr};

pub const OWNER_HEADER: &str = "X-Rootdeploy-Owner";
pub const MODE_HEADER: &str = "X-Rootdeploy-Mode";
pub const XATTRS_HEADER: &str = "X-Rootdeploy-Xattrs";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const REGULAR_TYPE: u32 = 0o100000;

/// owner, permission bits and xattrs of a served file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeaders {
    pub uid: u32,
    pub gid: u32,
    /// permission bits only, type bits stripped
    pub mode: u32,
    pub xattrs: Vec<Xattr>,
}

impl FileHeaders {
    pub fn read(path: &Path) -> Result<Self> {
        let inode = Inode::lstat(path)?;
        Ok(Self {
            uid: inode.uid,
            gid: inode.gid,
            mode: inode.mode & 0o7777,
            xattrs: read_xattrs(path)?,
        })
    }

    /// header name and value pairs; xattrs are hex of their CBOR encoding
    pub fn to_pairs(&self) -> Result<Vec<(&'static str, String)>> {
        let mut pairs = vec![
            (OWNER_HEADER, format!("{}:{}", self.uid, self.gid)),
            (MODE_HEADER, format!("{:o}", self.mode)),
        ];
        if !self.xattrs.is_empty() {
            let mut cbor = Vec::new();
            ciborium::into_writer(&self.xattrs, &mut cbor)?;
            pairs.push((XATTRS_HEADER, hex::encode(cbor)));
        }
        Ok(pairs)
    }

    /// parse back from a header lookup; `None` when owner or mode is missing or malformed
    pub fn from_lookup<'a>(header: impl Fn(&str) -> Option<&'a str>) -> Option<Self> {
        let (uid, gid) = header(OWNER_HEADER)?.split_once(':')?;
        let mode = u32::from_str_radix(header(MODE_HEADER)?, 8).ok()?;
        let xattrs = match header(XATTRS_HEADER) {
            Some(value) => {
                let cbor = hex::decode(value).ok()?;
                ciborium::from_reader(&cbor[..]).ok()?
            }
            None => Vec::new(),
        };
        Some(Self {
            uid: uid.parse().ok()?,
            gid: gid.parse().ok()?,
            mode: mode & 0o7777,
            xattrs,
        })
    }
}

/// a store reachable at a base URL
pub struct HttpSource {
    agent: ureq::Agent,
    base: String,
}

impl HttpSource {
    pub fn new(url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Self {
            agent,
            base: url.trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.base
    }

    fn url_of(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    /// `Ok(None)` on 404
    fn get(&self, path: &str) -> Result<Option<ureq::Response>> {
        let url = self.url_of(path);
        match self.agent.get(&url).call() {
            Ok(response) => Ok(Some(response)),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(Error::Fetch {
                url,
                message: e.to_string(),
            }),
        }
    }

    fn get_bytes(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let Some(response) = self.get(path)? else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| Error::Fetch {
                url: self.url_of(path),
                message: e.to_string(),
            })?;
        Ok(Some(bytes))
    }

    /// a full checksum is taken as is, anything else is read from the remote's refs
    pub fn resolve(&self, rev: &str) -> Result<Hash> {
        if Hash::looks_like_hex(rev) {
            return Hash::from_hex(&rev.to_ascii_lowercase());
        }
        let bytes = self
            .get_bytes(&format!("refs/heads/{}", rev))?
            .ok_or_else(|| Error::RefNotFound(rev.to_string()))?;
        Hash::from_hex(String::from_utf8_lossy(&bytes).trim())
    }

    fn fetch_encoded(&self, kind: ObjectKind, hash: &Hash) -> Result<Vec<u8>> {
        self.get_bytes(&object_url_path(kind, hash))?
            .ok_or(Error::ObjectNotFound(*hash))
    }
}

/// `objects/<kind>/<xx>/<rest>`, relative to the store root
pub fn object_url_path(kind: ObjectKind, hash: &Hash) -> String {
    let (dir, file) = hash.to_path_components();
    format!("objects/{}/{}/{}", kind.dir_name(), dir, file)
}

/// fetch commit `checksum` and everything its tree reaches into `dst`
///
/// parents are not followed and no ref is written.
pub fn pull_http(source: &HttpSource, dst: &Repo, checksum: &Hash) -> Result<PullStats> {
    let _lock = dst.lock()?;
    let mut stats = PullStats::default();

    let commit_bytes = source.fetch_encoded(ObjectKind::Commit, checksum)?;
    let commit: Commit = decode_verified(checksum, &commit_bytes)?;

    let mut seen = HashSet::new();
    let mut pending = vec![commit.tree];
    while let Some(tree_hash) = pending.pop() {
        if !seen.insert(tree_hash) {
            continue;
        }
        let tree_bytes = source.fetch_encoded(ObjectKind::Tree, &tree_hash)?;
        let tree: Tree = decode_verified(&tree_hash, &tree_bytes)?;
        for entry in tree.entries() {
            match &entry.kind {
                EntryKind::Regular { hash, .. } => {
                    fetch_blob(source, dst, hash, false, &mut stats)?
                }
                EntryKind::Symlink { hash } => fetch_blob(source, dst, hash, true, &mut stats)?,
                EntryKind::Directory { hash, .. } => pending.push(*hash),
                _ => {}
            }
        }
        if object_exists(dst, ObjectKind::Tree, &tree_hash) {
            stats.skipped += 1;
        } else {
            import_encoded_bytes(dst, ObjectKind::Tree, &tree_hash, &tree_bytes)?;
            stats.trees += 1;
        }
    }

    // the commit lands last so a visible commit always has its contents
    import_encoded_bytes(dst, ObjectKind::Commit, checksum, &commit_bytes)?;

    info!(
        url = %source.url(),
        checksum = %checksum,
        trees = stats.trees,
        blobs = stats.blobs,
        skipped = stats.skipped,
        "pulled commit"
    );
    Ok(stats)
}

fn fetch_blob(
    source: &HttpSource,
    dst: &Repo,
    hash: &Hash,
    symlink: bool,
    stats: &mut PullStats,
) -> Result<()> {
    if object_exists(dst, ObjectKind::Blob, hash) {
        stats.skipped += 1;
        return Ok(());
    }
    let path = object_url_path(ObjectKind::Blob, hash);
    let response = source.get(&path)?.ok_or(Error::ObjectNotFound(*hash))?;
    let headers = FileHeaders::from_lookup(|name| response.header(name)).ok_or_else(|| {
        Error::Fetch {
            url: source.url_of(&path),
            message: "missing or malformed file metadata headers".to_string(),
        }
    })?;
    let mode = if symlink {
        SYMLINK_MODE
    } else {
        REGULAR_TYPE | headers.mode
    };

    let mut reader = response.into_reader();
    let written = write_blob_from(
        dst,
        &mut reader,
        Ownership::new(headers.uid, headers.gid, mode),
        &headers.xattrs,
    )?;
    if written != *hash {
        return Err(Error::CorruptObject(*hash));
    }
    debug!(blob = %hash, "fetched");
    stats.blobs += 1;
    Ok(())
}
