use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

const STORE_FORMAT_VERSION: u32 = 1;
const CONFIG_FILE: &str = "config.toml";

/// on-disk store settings, `config.toml` at the store root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub version: u32,
    /// always "bare": blobs carry uid/gid/mode/xattrs on their inode
    pub mode: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            version: STORE_FORMAT_VERSION,
            mode: "bare".to_string(),
        }
    }
}

/// object classes held by a store, each under `objects/<dir>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub(crate) fn dir_name(self) -> &'static str {
        match self {
            ObjectKind::Blob => "blobs",
            ObjectKind::Tree => "trees",
            ObjectKind::Commit => "commits",
        }
    }
}

/// a content store rooted at a directory
#[derive(Debug)]
pub struct Repo {
    path: PathBuf,
    config: StoreConfig,
}

impl Repo {
    /// create a new store, failing if one exists
    pub fn init(path: &Path) -> Result<Self> {
        let config_path = path.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(Error::RepoExists(path.to_path_buf()));
        }

        for kind in [ObjectKind::Blob, ObjectKind::Tree, ObjectKind::Commit] {
            let dir = path.join("objects").join(kind.dir_name());
            std::fs::create_dir_all(&dir).with_path(&dir)?;
        }
        for sub in ["refs/heads", "tmp"] {
            let dir = path.join(sub);
            std::fs::create_dir_all(&dir).with_path(&dir)?;
        }

        let config = StoreConfig::default();
        let encoded = toml::to_string_pretty(&config)?;
        crate::fs::write_atomic(&config_path, encoded.as_bytes())?;

        tracing::debug!(path = %path.display(), "initialized store");
        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    /// open an existing store
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join(CONFIG_FILE);
        let content = match std::fs::read_to_string(&config_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoRepo(path.to_path_buf()))
            }
            Err(e) => {
                return Err(Error::Io {
                    path: config_path,
                    source: e,
                })
            }
        };
        let config: StoreConfig = toml::from_str(&content)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    /// open the store at `path`, creating it if absent
    pub fn open_or_init(path: &Path) -> Result<Self> {
        if path.join(CONFIG_FILE).exists() {
            Self::open(path)
        } else {
            Self::init(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn objects_path(&self, kind: ObjectKind) -> PathBuf {
        self.path.join("objects").join(kind.dir_name())
    }

    pub fn refs_path(&self) -> PathBuf {
        self.path.join("refs/heads")
    }

    /// scratch space for atomic writes, same filesystem as objects
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    /// take the exclusive writer lock, failing fast if held
    pub fn lock(&self) -> Result<RepoLock> {
        self.try_lock()?.ok_or(Error::LockContention)
    }

    /// take the writer lock if free
    pub fn try_lock(&self) -> Result<Option<RepoLock>> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(RepoLock { _flock: flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention),
        }
    }
}

/// released on drop
pub struct RepoLock {
    _flock: Flock<File>,
}
