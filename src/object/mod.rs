//! hashed object files under `objects/`
//!
//! blobs are stored raw with their metadata on the inode. trees and
//! commits are CBOR, zstd compressed, and named by the hash of the
//! compressed bytes.

mod blob;
mod commit;
mod tree;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{compute_object_hash, Hash};
use crate::repo::{ObjectKind, Repo};

pub use blob::{import_blob, read_blob, write_blob, write_blob_from, write_symlink_blob};
pub use commit::{read_commit, write_commit};
pub use tree::{read_tree, write_tree};

const ZSTD_LEVEL: i32 = 3;

/// `objects/<kind>/<xx>/<rest>`
pub fn object_path(repo: &Repo, kind: ObjectKind, hash: &Hash) -> PathBuf {
    let (dir, file) = hash.to_path_components();
    repo.objects_path(kind).join(dir).join(file)
}

pub fn object_exists(repo: &Repo, kind: ObjectKind, hash: &Hash) -> bool {
    object_path(repo, kind, hash).exists()
}

/// a fresh scratch path inside the store's tmp dir
fn scratch_path(repo: &Repo) -> PathBuf {
    repo.tmp_path().join(uuid::Uuid::new_v4().to_string())
}

/// move a finished scratch file into its object slot and sync the slot dir
///
/// a concurrent writer may have published the same object first; identical
/// content means the scratch copy is simply dropped.
fn publish(tmp: &Path, dest: &Path) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_path(dir)?;
    if dest.exists() {
        fs::remove_file(tmp).with_path(tmp)?;
        return Ok(());
    }
    fs::rename(tmp, dest).with_path(dest)?;
    crate::fs::fsync_dir(dir)
}

/// copy an encoded tree or commit file from another store verbatim
pub fn import_encoded(repo: &Repo, kind: ObjectKind, hash: &Hash, src: &Path) -> Result<()> {
    if object_exists(repo, kind, hash) {
        return Ok(());
    }
    let bytes = fs::read(src).map_err(|e| not_found_or_io(e, hash, src))?;
    import_encoded_bytes(repo, kind, hash, &bytes)
}

/// store encoded tree or commit bytes fetched from elsewhere under `hash`
pub fn import_encoded_bytes(repo: &Repo, kind: ObjectKind, hash: &Hash, bytes: &[u8]) -> Result<()> {
    let dest = object_path(repo, kind, hash);
    if dest.exists() {
        return Ok(());
    }
    if compute_object_hash(bytes) != *hash {
        return Err(Error::CorruptObject(*hash));
    }

    let tmp = scratch_path(repo);
    {
        let mut file = File::create(&tmp).with_path(&tmp)?;
        file.write_all(bytes).with_path(&tmp)?;
        file.sync_all().with_path(&tmp)?;
    }
    publish(&tmp, &dest)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut cbor = Vec::new();
    ciborium::into_writer(value, &mut cbor)?;
    zstd::encode_all(&cbor[..], ZSTD_LEVEL).map_err(|e| Error::Io {
        path: PathBuf::from("<zstd>"),
        source: e,
    })
}

fn write_encoded<T: Serialize>(repo: &Repo, kind: ObjectKind, value: &T) -> Result<Hash> {
    let bytes = encode(value)?;
    let hash = compute_object_hash(&bytes);
    let dest = object_path(repo, kind, &hash);
    if dest.exists() {
        return Ok(hash);
    }

    let tmp = scratch_path(repo);
    {
        let mut file = File::create(&tmp).with_path(&tmp)?;
        file.write_all(&bytes).with_path(&tmp)?;
        file.sync_all().with_path(&tmp)?;
    }
    publish(&tmp, &dest)?;
    Ok(hash)
}

fn read_encoded<T: DeserializeOwned>(repo: &Repo, kind: ObjectKind, hash: &Hash) -> Result<T> {
    let path = object_path(repo, kind, hash);
    let bytes = fs::read(&path).map_err(|e| not_found_or_io(e, hash, &path))?;
    decode_verified(hash, &bytes).map_err(|e| match e {
        Error::Io { source, .. } => Error::Io { path, source },
        other => other,
    })
}

/// check `bytes` against `hash`, then decode them
pub fn decode_verified<T: DeserializeOwned>(hash: &Hash, bytes: &[u8]) -> Result<T> {
    if compute_object_hash(bytes) != *hash {
        return Err(Error::CorruptObject(*hash));
    }
    let cbor = zstd::decode_all(bytes).map_err(|e| Error::Io {
        path: PathBuf::from("<zstd>"),
        source: e,
    })?;
    Ok(ciborium::from_reader(&cbor[..])?)
}

fn not_found_or_io(e: std::io::Error, hash: &Hash, path: &Path) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::ObjectNotFound(*hash)
    } else {
        Error::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}
