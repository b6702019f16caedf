//! sysroot layout, deployments and boot entries
//!
//! ```text
//! <sysroot>/
//!   ostree/repo/                         content store
//!   ostree/deploy/<os>/var/              state shared by deployments
//!   ostree/deploy/<os>/deploy/<csum>.<serial>/         checkout
//!   ostree/deploy/<os>/deploy/<csum>.<serial>.origin   refspec it came from
//!   boot/loader -> loader.1
//!   boot/loader.1/uEnv.txt               boot detection marker
//!   boot/loader.1/entries/ostree-<n>-<os>.conf
//! ```

pub mod bls;
pub mod kargs;

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, InitStep, IoResultExt, Result};
use crate::hash::Hash;
use crate::object::read_commit;
use crate::ops::{checkout, pull_commit, CheckoutOptions, PullStats};
use crate::repo::Repo;

use bls::BootEntry;
pub use kargs::{BootArguments, ROOT_KEY};

const LOADER_DIR: &str = "loader.1";
const BOOT_MARKER: &str = "uEnv.txt";

/// `<sysroot>/ostree/repo`
pub fn repo_path(sysroot: &Path) -> PathBuf {
    sysroot.join("ostree/repo")
}

/// one generation of the root filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub osname: String,
    pub checksum: Hash,
    /// distinguishes repeated deployments of one checksum
    pub serial: u32,
    pub boot_arguments: BootArguments,
    pub origin_refspec: Option<String>,
}

impl Deployment {
    /// `<csum>.<serial>`
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.checksum, self.serial)
    }

    /// absolute path as seen from the booted system
    pub fn boot_path(&self) -> String {
        format!("/ostree/deploy/{}/deploy/{}", self.osname, self.dir_name())
    }

    fn parse_dir_name(name: &str) -> Option<(Hash, u32)> {
        let (csum, serial) = name.rsplit_once('.')?;
        Some((Hash::from_hex(csum).ok()?, serial.parse().ok()?))
    }
}

/// a physical sysroot directory
#[derive(Debug)]
pub struct Sysroot {
    path: PathBuf,
    osname: String,
    repo: Repo,
    /// most recent first; the first is the default
    deployments: Vec<Deployment>,
}

fn init_err(step: InitStep, path: &Path) -> impl FnOnce(Error) -> Error + '_ {
    move |e| Error::SysrootInit {
        step,
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

impl Sysroot {
    /// initialize a sysroot at an existing, writable, xattr-capable `path`
    pub fn create(path: &Path, osname: &str) -> Result<Self> {
        Self::ensure_initialized(path).map_err(init_err(InitStep::EnsureInitialized, path))?;
        Self::init_osname(path, osname).map_err(init_err(InitStep::InitOsname, path))?;
        let sysroot = Self::load(path, osname)?;
        tracing::info!(path = %path.display(), osname, "created sysroot");
        Ok(sysroot)
    }

    fn ensure_initialized(path: &Path) -> Result<()> {
        let meta = fs::metadata(path).with_path(path)?;
        if !meta.is_dir() {
            return Err(Error::Precondition(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        if !crate::fs::supports_user_xattrs(path)? {
            return Err(Error::Xattr {
                path: path.to_path_buf(),
                message: "filesystem does not support user extended attributes".to_string(),
            });
        }
        Repo::open_or_init(&repo_path(path))?;
        for dir in ["ostree/deploy", "boot"] {
            let dir = path.join(dir);
            fs::create_dir_all(&dir).with_path(&dir)?;
        }
        Ok(())
    }

    fn init_osname(path: &Path, osname: &str) -> Result<()> {
        if osname.is_empty() || osname.contains('/') {
            return Err(Error::Configuration(format!("invalid osname {:?}", osname)));
        }
        let root = path.join("ostree/deploy").join(osname);
        for sub in ["deploy", "var"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).with_path(&dir)?;
        }
        Ok(())
    }

    /// open an existing sysroot and read its deployments
    pub fn load(path: &Path, osname: &str) -> Result<Self> {
        let load = || -> Result<Self> {
            let repo = Repo::open(&repo_path(path))?;
            let mut sysroot = Self {
                path: path.to_path_buf(),
                osname: osname.to_string(),
                repo,
                deployments: Vec::new(),
            };
            sysroot.deployments = sysroot.read_deployments()?;
            Ok(sysroot)
        };
        let sysroot = load().map_err(init_err(InitStep::Load, path))?;
        tracing::debug!(
            path = %path.display(),
            deployments = sysroot.deployments.len(),
            "loaded sysroot"
        );
        Ok(sysroot)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn osname(&self) -> &str {
        &self.osname
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn deployments(&self) -> &[Deployment] {
        &self.deployments
    }

    pub fn default_deployment(&self) -> Option<&Deployment> {
        self.deployments.first()
    }

    /// `ostree/deploy/<os>/var`
    pub fn var_path(&self) -> PathBuf {
        self.os_root().join("var")
    }

    fn os_root(&self) -> PathBuf {
        self.path.join("ostree/deploy").join(&self.osname)
    }

    pub fn deployment_path(&self, deployment: &Deployment) -> PathBuf {
        self.os_root().join("deploy").join(deployment.dir_name())
    }

    fn origin_path(&self, deployment: &Deployment) -> PathBuf {
        self.os_root()
            .join("deploy")
            .join(format!("{}.origin", deployment.dir_name()))
    }

    fn entries_path(&self) -> PathBuf {
        self.path.join("boot").join(LOADER_DIR).join("entries")
    }

    /// copy a commit from another store into this sysroot's store
    pub fn pull_local(&self, src: &Repo, checksum: &Hash) -> Result<PullStats> {
        let stats = pull_commit(src, &self.repo, checksum)?;
        tracing::info!(checksum = %checksum, blobs = stats.blobs, "pulled into sysroot");
        Ok(stats)
    }

    /// stage `checksum` as a new default deployment
    ///
    /// existing deployments and their files are kept.
    pub fn deploy(
        &mut self,
        checksum: &Hash,
        refspec: &str,
        boot_arguments: &BootArguments,
    ) -> Result<Deployment> {
        read_commit(&self.repo, checksum)
            .map_err(|_| Error::RevisionResolution(checksum.to_hex()))?;
        self.check_boot_layout()?;

        let creation = |e: Error| Error::DeploymentCreation {
            checksum: *checksum,
            message: e.to_string(),
        };
        let deployment = self.stage(checksum, refspec, boot_arguments).map_err(creation)?;

        let write = |e: Error| Error::DeploymentWrite {
            checksum: *checksum,
            message: e.to_string(),
        };
        self.ensure_boot_layout().map_err(write)?;

        let mut deployments = Vec::with_capacity(self.deployments.len() + 1);
        deployments.push(deployment.clone());
        deployments.extend(self.deployments.iter().cloned());
        self.write_entries(&deployments).map_err(write)?;
        self.deployments = deployments;

        tracing::info!(
            checksum = %checksum,
            serial = deployment.serial,
            refspec,
            "deployed {}",
            deployment.boot_path()
        );
        Ok(deployment)
    }

    fn stage(&self, checksum: &Hash, refspec: &str, args: &BootArguments) -> Result<Deployment> {
        let mut serial = self
            .deployments
            .iter()
            .filter(|d| d.checksum == *checksum)
            .count() as u32;

        let mut deployment = Deployment {
            osname: self.osname.clone(),
            checksum: *checksum,
            serial,
            boot_arguments: BootArguments::default(),
            origin_refspec: Some(refspec.to_string()),
        };
        // leftovers of an interrupted deploy occupy their serial
        while self.deployment_path(&deployment).exists() {
            serial += 1;
            deployment.serial = serial;
        }

        let mut boot_arguments = args.without(ROOT_KEY);
        boot_arguments.push(format!("{}={}", ROOT_KEY, deployment.boot_path()));
        deployment.boot_arguments = boot_arguments;

        let target = self.deployment_path(&deployment);
        checkout(&self.repo, checksum, &target, &CheckoutOptions::default())?;
        crate::fs::write_atomic(
            &self.origin_path(&deployment),
            format!("[origin]\nrefspec={}\n", refspec).as_bytes(),
        )?;
        Ok(deployment)
    }

    /// `boot/loader` may be absent or a symlink, anything else is not ours to replace
    fn check_boot_layout(&self) -> Result<()> {
        let link = self.path.join("boot/loader");
        match fs::symlink_metadata(&link) {
            Ok(meta) if !meta.file_type().is_symlink() => Err(Error::Precondition(format!(
                "{} exists and is not a symlink to {}",
                link.display(),
                LOADER_DIR
            ))),
            _ => Ok(()),
        }
    }

    /// `boot/loader.1`, `boot/loader -> loader.1` and the empty marker
    fn ensure_boot_layout(&self) -> Result<()> {
        let boot = self.path.join("boot");
        let loader_dir = boot.join(LOADER_DIR);
        fs::create_dir_all(loader_dir.join("entries")).with_path(&loader_dir)?;

        let link = boot.join("loader");
        match fs::read_link(&link) {
            Ok(target) if target == Path::new(LOADER_DIR) => {}
            Ok(_) => {
                fs::remove_file(&link).with_path(&link)?;
                std::os::unix::fs::symlink(LOADER_DIR, &link).with_path(&link)?;
            }
            Err(_) => std::os::unix::fs::symlink(LOADER_DIR, &link).with_path(&link)?,
        }

        let marker = link.join(BOOT_MARKER);
        if !marker.exists() {
            fs::File::create(&marker).with_path(&marker)?;
        }
        Ok(())
    }

    fn write_entries(&self, deployments: &[Deployment]) -> Result<()> {
        let entries = self.entries_path();
        let total = deployments.len() as u32;

        for (index, deployment) in deployments.iter().enumerate() {
            let label = read_commit(&self.repo, &deployment.checksum)
                .ok()
                .and_then(|c| c.describe().version)
                .unwrap_or_else(|| deployment.checksum.short());
            let entry = BootEntry {
                title: format!("{} {} (ostree:{})", self.osname, label, index),
                version: total - index as u32,
                options: deployment.boot_arguments.clone(),
                linux: None,
                initrd: None,
            };
            let entry = self.with_kernel(deployment, entry);
            let path = entries.join(entry.file_name(&self.osname));
            crate::fs::write_atomic(&path, entry.to_string().as_bytes())?;
        }
        Ok(())
    }

    /// point linux/initrd at `usr/lib/modules/<kver>` when the tree has one
    fn with_kernel(&self, deployment: &Deployment, mut entry: BootEntry) -> BootEntry {
        let modules = self.deployment_path(deployment).join("usr/lib/modules");
        let Ok(read) = fs::read_dir(&modules) else {
            return entry;
        };
        let mut kernels: Vec<_> = read
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|kver| modules.join(kver).join("vmlinuz").is_file())
            .collect();
        kernels.sort();
        if let Some(kver) = kernels.pop() {
            let base = format!("{}/usr/lib/modules/{}", deployment.boot_path(), kver);
            if modules.join(&kver).join("initramfs.img").is_file() {
                entry.initrd = Some(format!("{}/initramfs.img", base));
            }
            entry.linux = Some(format!("{}/vmlinuz", base));
        }
        entry
    }

    fn read_deployments(&self) -> Result<Vec<Deployment>> {
        let entries = self.entries_path();
        let Ok(read) = fs::read_dir(&entries) else {
            return Ok(Vec::new());
        };
        let suffix = format!("-{}.conf", self.osname);

        let mut found = Vec::new();
        for dirent in read {
            let dirent = dirent.with_path(&entries)?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if !name.starts_with("ostree-") || !name.ends_with(&suffix) {
                continue;
            }
            let path = dirent.path();
            let text = fs::read_to_string(&path).with_path(&path)?;
            let entry = BootEntry::parse(&text).map_err(|message| {
                Error::Precondition(format!("malformed boot entry {}: {}", path.display(), message))
            })?;
            let Some((checksum, serial)) = entry
                .options
                .value_of(ROOT_KEY)
                .and_then(|p| p.rsplit('/').next())
                .and_then(Deployment::parse_dir_name)
            else {
                tracing::warn!(path = %path.display(), "boot entry without deployment root");
                continue;
            };

            let mut deployment = Deployment {
                osname: self.osname.clone(),
                checksum,
                serial,
                boot_arguments: entry.options.clone(),
                origin_refspec: None,
            };
            deployment.origin_refspec = self.read_origin(&deployment)?;
            found.push((entry.version, deployment));
        }

        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, d)| d).collect())
    }

    fn read_origin(&self, deployment: &Deployment) -> Result<Option<String>> {
        let path = self.origin_path(deployment);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io { path, source: e }),
        };
        Ok(parse_origin(&text))
    }
}

/// `refspec` from the `[origin]` group of an origin keyfile
fn parse_origin(text: &str) -> Option<String> {
    let mut in_origin = false;
    for line in text.lines().map(str::trim) {
        if line.starts_with('[') {
            in_origin = line == "[origin]";
        } else if in_origin {
            if let Some(("refspec", value)) = line.split_once('=').map(|(k, v)| (k.trim(), v)) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ops::{commit, CommitOptions};
    use crate::types::VERSION_KEY;
    use tempfile::tempdir;

    /// false when the test filesystem cannot hold a sysroot
    pub(crate) fn xattrs_supported(dir: &Path) -> bool {
        crate::fs::supports_user_xattrs(dir).unwrap_or(false)
    }

    /// archive store with one committed rootfs under `base`
    pub(crate) fn archive_with_commit(root: &Path) -> (Repo, Hash) {
        let repo = Repo::init(&root.join("ostree-archive")).unwrap();
        let rootfs = root.join("rootfs");
        fs::create_dir_all(rootfs.join("usr/lib/modules/6.1.22")).unwrap();
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("usr/lib/modules/6.1.22/vmlinuz"), "kernel").unwrap();
        fs::write(rootfs.join("etc/os-release"), "ID=torizon\n").unwrap();
        let mut opts = CommitOptions {
            message: "TorizonCore 6.1.0".to_string(),
            ..Default::default()
        };
        opts.metadata.insert(VERSION_KEY.to_string(), "6.1.0".to_string());
        let hash = commit(&repo, &rootfs, "base", &opts).unwrap();
        (repo, hash)
    }

    #[test]
    fn test_deployment_names() {
        let d = Deployment {
            osname: "torizon".into(),
            checksum: Hash::ZERO,
            serial: 1,
            boot_arguments: BootArguments::default(),
            origin_refspec: None,
        };
        assert_eq!(d.dir_name(), format!("{}.1", Hash::ZERO));
        assert_eq!(
            d.boot_path(),
            format!("/ostree/deploy/torizon/deploy/{}.1", Hash::ZERO)
        );
        assert_eq!(
            Deployment::parse_dir_name(&d.dir_name()),
            Some((Hash::ZERO, 1))
        );
        assert_eq!(Deployment::parse_dir_name("nothex.0"), None);
    }

    #[test]
    fn test_parse_origin() {
        assert_eq!(
            parse_origin("[origin]\nrefspec=torizon\n").as_deref(),
            Some("torizon")
        );
        assert_eq!(parse_origin("[other]\nrefspec=x\n"), None);
    }

    #[test]
    fn test_create_missing_path() {
        let dir = tempdir().unwrap();
        let err = Sysroot::create(&dir.path().join("absent"), "torizon").unwrap_err();
        assert!(matches!(
            err,
            Error::SysrootInit {
                step: InitStep::EnsureInitialized,
                ..
            }
        ));
    }

    #[test]
    fn test_create_rejects_bad_osname() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let err = Sysroot::create(dir.path(), "a/b").unwrap_err();
        assert!(matches!(
            err,
            Error::SysrootInit {
                step: InitStep::InitOsname,
                ..
            }
        ));
    }

    #[test]
    fn test_load_without_store() {
        let dir = tempdir().unwrap();
        let err = Sysroot::load(dir.path(), "torizon").unwrap_err();
        assert!(matches!(err, Error::SysrootInit { step: InitStep::Load, .. }));
    }

    #[test]
    fn test_create_layout() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let sysroot = Sysroot::create(dir.path(), "torizon").unwrap();

        assert!(dir.path().join("ostree/repo/config.toml").is_file());
        assert!(dir.path().join("ostree/deploy/torizon/deploy").is_dir());
        assert_eq!(sysroot.var_path(), dir.path().join("ostree/deploy/torizon/var"));
        assert!(sysroot.var_path().is_dir());
        assert!(sysroot.deployments().is_empty());

        // creating again over an initialized sysroot is fine
        Sysroot::create(dir.path(), "torizon").unwrap();
    }

    #[test]
    fn test_deploy_writes_boot_artifacts() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let (archive, hash) = archive_with_commit(dir.path());
        let root = dir.path().join("sysroot");
        fs::create_dir(&root).unwrap();

        let mut sysroot = Sysroot::create(&root, "torizon").unwrap();
        sysroot.pull_local(&archive, &hash).unwrap();

        let args = BootArguments::parse("quiet ostree=/ostree/boot.1/torizon/old/0 root=LABEL=otaroot");
        let deployment = sysroot.deploy(&hash, "torizon", &args).unwrap();

        assert_eq!(deployment.serial, 0);
        assert_eq!(
            deployment.boot_arguments.to_string(),
            format!("quiet root=LABEL=otaroot ostree={}", deployment.boot_path())
        );
        assert!(sysroot.deployment_path(&deployment).join("etc/os-release").is_file());
        assert_eq!(
            fs::read_link(root.join("boot/loader")).unwrap(),
            Path::new("loader.1")
        );
        assert_eq!(fs::metadata(root.join("boot/loader/uEnv.txt")).unwrap().len(), 0);

        let entry = fs::read_to_string(root.join("boot/loader/entries/ostree-1-torizon.conf")).unwrap();
        assert!(entry.contains("title torizon 6.1.0 (ostree:0)"));
        assert!(entry.contains("/usr/lib/modules/6.1.22/vmlinuz"));

        let reloaded = Sysroot::load(&root, "torizon").unwrap();
        assert_eq!(reloaded.deployments(), &[deployment]);
        assert_eq!(
            reloaded.default_deployment().unwrap().origin_refspec.as_deref(),
            Some("torizon")
        );
    }

    #[test]
    fn test_redeploy_keeps_previous() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let (archive, hash) = archive_with_commit(dir.path());
        let root = dir.path().join("sysroot");
        fs::create_dir(&root).unwrap();
        let mut sysroot = Sysroot::create(&root, "torizon").unwrap();
        sysroot.pull_local(&archive, &hash).unwrap();

        let first = sysroot.deploy(&hash, "torizon", &BootArguments::default()).unwrap();
        let second = sysroot.deploy(&hash, "torizon", &BootArguments::default()).unwrap();

        assert_eq!(second.serial, 1);
        assert!(sysroot.deployment_path(&first).is_dir());
        let reloaded = Sysroot::load(&root, "torizon").unwrap();
        assert_eq!(reloaded.deployments(), &[second, first]);
        let older = fs::read_to_string(root.join("boot/loader/entries/ostree-1-torizon.conf")).unwrap();
        assert!(older.contains("(ostree:1)"));
    }

    #[test]
    fn test_deploy_unknown_checksum() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let mut sysroot = Sysroot::create(dir.path(), "torizon").unwrap();
        let err = sysroot
            .deploy(&Hash::ZERO, "torizon", &BootArguments::default())
            .unwrap_err();
        assert!(matches!(err, Error::RevisionResolution(_)));
        assert!(!dir.path().join("boot/loader").exists());
    }

    #[test]
    fn test_deploy_refuses_loader_directory() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let (archive, hash) = archive_with_commit(dir.path());
        let root = dir.path().join("sysroot");
        fs::create_dir(&root).unwrap();
        let mut sysroot = Sysroot::create(&root, "torizon").unwrap();
        sysroot.pull_local(&archive, &hash).unwrap();
        fs::create_dir_all(root.join("boot/loader/entries")).unwrap();

        let err = sysroot
            .deploy(&hash, "torizon", &BootArguments::default())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Precondition);
        assert!(err.to_string().contains("boot/loader"));
        // nothing staged
        assert!(fs::read_dir(root.join("ostree/deploy/torizon/deploy"))
            .unwrap()
            .next()
            .is_none());
    }
}
