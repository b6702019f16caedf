//! the device half of a remote deployment
//!
//! the build host drives these through its session: register the tunneled
//! store, pull one commit into the sysroot store, deploy it for the next boot.

use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::hash::Hash;
use crate::remotes;
use crate::repo::Repo;
use crate::resolve::resolve;
use crate::sysroot::{repo_path, BootArguments, Deployment, Sysroot, ROOT_KEY};
use crate::transport::{pull_http, HttpSource};

/// register `url` as update source `name` in the sysroot store
pub fn add_update_source(sysroot: &Path, name: &str, url: &str, force: bool) -> Result<()> {
    let repo = Repo::open(&repo_path(sysroot))?;
    remotes::add_remote(&repo, name, url, force)?;
    info!(remote = name, url, "update source registered");
    Ok(())
}

/// fetch `rev` from update source `remote` into the sysroot store
pub fn pull_update(sysroot: &Path, remote: &str, rev: &str) -> Result<Hash> {
    let repo = Repo::open(&repo_path(sysroot))?;
    let source = HttpSource::new(&remotes::remote_url(&repo, remote)?);
    let checksum = source.resolve(rev)?;
    pull_http(&source, &repo, &checksum)?;
    Ok(checksum)
}

/// deploy `rev` as the new default, keeping the kernel arguments of the current one
///
/// the origin records `origin`, or the checksum when none is given.
pub fn deploy_update(
    sysroot: &Path,
    osname: &str,
    rev: &str,
    origin: Option<&str>,
) -> Result<Deployment> {
    let mut sysroot = Sysroot::load(sysroot, osname)?;
    let checksum = resolve(sysroot.repo(), rev)?;
    let boot_arguments = sysroot
        .default_deployment()
        .map(|d| d.boot_arguments.without(ROOT_KEY))
        .unwrap_or_else(BootArguments::default);
    let refspec = origin.map_or_else(|| checksum.to_hex(), str::to_string);
    let deployment = sysroot.deploy(&checksum, &refspec, &boot_arguments)?;
    info!("deployment is active from the next boot");
    Ok(deployment)
}
