use std::fmt;
use std::path::PathBuf;

use crate::Hash;

/// sysroot initialization phase, reported by [`Error::SysrootInit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    EnsureInitialized,
    InitOsname,
    Load,
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStep::EnsureInitialized => write!(f, "ensure-initialized"),
            InitStep::InitOsname => write!(f, "init-osname"),
            InitStep::Load => write!(f, "load"),
        }
    }
}

/// coarse error classes surfaced to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Precondition,
    Resolution,
    Sysroot,
    StateMigration,
    Packaging,
    ContentServer,
    RemoteConnection,
    RemoteCommand,
    Store,
}

/// error type for rootdeploy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    Configuration(String),

    #[error("{0}")]
    Precondition(String),

    #[error("error resolving {reference} in {store}")]
    Resolution { reference: String, store: PathBuf },

    #[error("sysroot initialization failed at {step} for {path}: {message}")]
    SysrootInit {
        step: InitStep,
        path: PathBuf,
        message: String,
    },

    #[error("error getting revision of reference {0} in sysroot repository")]
    RevisionResolution(String),

    #[error("error creating deployment of {checksum}: {message}")]
    DeploymentCreation { checksum: Hash, message: String },

    #[error("error writing deployment of {checksum}: {message}")]
    DeploymentWrite { checksum: Hash, message: String },

    #[error("no deployment found in sysroot {0}")]
    NoDeployment(PathBuf),

    #[error("cannot migrate state at {path}: {message}")]
    StateMigration { path: PathBuf, message: String },

    #[error("packaging failed ({stage}): {message}")]
    Packaging {
        stage: &'static str,
        message: String,
    },

    #[error("content server on {addr}: {message}")]
    ContentServer { addr: String, message: String },

    #[error("connection to {host} failed: {message}")]
    RemoteConnection { host: String, message: String },

    #[error("failed to run command on device: {command}")]
    RemoteCommand {
        command: String,
        exit_status: Option<i32>,
        stderr: String,
    },

    #[error("cannot {operation} while remote session is {state}")]
    InvalidRemoteState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("fetching {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("remote {0} already exists")]
    RemoteExists(String),

    #[error("no remote named {0}")]
    NoSuchRemote(String),

    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("object not found: {0}")]
    ObjectNotFound(Hash),

    #[error("corrupt object: hash mismatch for {0}")]
    CorruptObject(Hash),

    #[error("checkout target not empty: {0}")]
    TargetNotEmpty(PathBuf),

    #[error("lock contention on repository")]
    LockContention,

    #[error("invalid tree entry name: {0}")]
    InvalidEntryName(String),

    #[error("duplicate tree entry name: {0}")]
    DuplicateEntryName(String),

    #[error("hardlink target not found: {0}")]
    HardlinkTargetNotFound(String),

    #[error("cannot create device node without privileges: {0}")]
    DeviceNodePermission(PathBuf),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("xattr error on {path}: {message}")]
    Xattr { path: PathBuf, message: String },
}

impl Error {
    /// taxonomy class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::Config(_) | Error::ConfigSerialize(_) => {
                ErrorKind::Configuration
            }
            Error::Precondition(_) => ErrorKind::Precondition,
            Error::Resolution { .. } | Error::RevisionResolution(_) => ErrorKind::Resolution,
            Error::SysrootInit { .. }
            | Error::DeploymentCreation { .. }
            | Error::DeploymentWrite { .. }
            | Error::NoDeployment(_) => ErrorKind::Sysroot,
            Error::StateMigration { .. } => ErrorKind::StateMigration,
            Error::Packaging { .. } => ErrorKind::Packaging,
            Error::ContentServer { .. } => ErrorKind::ContentServer,
            Error::RemoteConnection { .. } | Error::InvalidRemoteState { .. } => {
                ErrorKind::RemoteConnection
            }
            Error::RemoteCommand { .. } => ErrorKind::RemoteCommand,
            _ => ErrorKind::Store,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
