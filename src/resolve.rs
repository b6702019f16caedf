//! turning references into commits, and sysroots into their active commit

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::read_commit;
use crate::refs::resolve_rev;
use crate::repo::Repo;
use crate::sysroot::{BootArguments, Sysroot};
use crate::types::CommitMetadata;

/// reference deployed when none is given
pub const BASE_REF: &str = "base";

/// checksum of the commit `reference` names in `store`
///
/// a 64-hex string is a checksum, anything else a ref. the commit object
/// itself must be present.
pub fn resolve(store: &Repo, reference: &str) -> Result<Hash> {
    let failed = || Error::Resolution {
        reference: reference.to_string(),
        store: store.path().to_path_buf(),
    };
    let checksum = resolve_rev(store, reference).map_err(|_| failed())?;
    read_commit(store, &checksum).map_err(|_| failed())?;
    tracing::debug!(reference, checksum = %checksum, "resolved");
    Ok(checksum)
}

/// checksum and kernel arguments of the default deployment
///
/// the arguments include the root token exactly as written.
pub fn read_deployment_metadata(sysroot: &Sysroot) -> Result<(Hash, BootArguments)> {
    let deployment = sysroot
        .default_deployment()
        .ok_or_else(|| Error::NoDeployment(sysroot.path().to_path_buf()))?;
    Ok((deployment.checksum, deployment.boot_arguments.clone()))
}

/// version, subject and body of a commit
pub fn read_commit_metadata(store: &Repo, checksum: &Hash) -> Result<CommitMetadata> {
    Ok(read_commit(store, checksum)?.describe())
}
