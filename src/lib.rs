//! rootdeploy - deploy rootfs commits as installer images or onto live devices
//!
//! commits live in a content-addressed store; a sysroot holds deployments
//! (checkouts of commits) plus the boot entries selecting between them.
//!
//! # Modes
//!
//! - **installer image**: build a fresh sysroot from the archive store, carry
//!   over kernel arguments and `var/rootdirs` from the current one, then pack
//!   it into a copy of the installer template.
//! - **remote push**: serve the archive store over HTTP, tunnel it to the
//!   device over ssh and let the device pull and stage the commit. the
//!   device runs this same tool for its half (`remote add`, `pull`,
//!   `admin deploy`).
//!
//! # Hash format
//!
//! blob hash = SHA256(uid | gid | mode | xattr_count | xattrs... | content)
//!
//! trees and commits are hashed over their compressed CBOR encoding.
//!
//! # Example usage
//!
//! ```no_run
//! use rootdeploy::{deploy_image, Config, DeployRequest};
//! use std::path::PathBuf;
//!
//! let request = DeployRequest {
//!     output_dir: Some(PathBuf::from("/workdir/image")),
//!     ..Default::default()
//! };
//! deploy_image(&request, &Config::default()).unwrap();
//! ```

mod config;
mod error;
mod hash;
mod refs;
mod repo;

pub mod deploy;
pub mod device;
pub mod fs;
pub mod image;
pub mod migrate;
pub mod object;
pub mod ops;
pub mod remotes;
pub mod resolve;
pub mod sysroot;
pub mod transport;
pub mod types;

pub use config::{Config, DeviceConfig, ImageConfig, RemoteConfig, ServerConfig};
pub use deploy::{deploy_image, deploy_image_with, DeployOutcome, DeployRequest};
pub use error::{Error, ErrorKind, InitStep, IoResultExt, Result};
pub use hash::{compute_blob_hash, Hash};
pub use refs::{list_refs, read_ref, read_ref_opt, resolve_rev, write_ref};
pub use repo::{ObjectKind, Repo, RepoLock, StoreConfig};
pub use sysroot::{BootArguments, Deployment, Sysroot};
pub use types::{Commit, CommitMetadata, EntryKind, Tree, TreeEntry, Xattr};
