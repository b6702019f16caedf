//! end-to-end deployment: installer image or live device

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::image::{copy_template, pack_root, PackOptions};
use crate::migrate::migrate_state;
use crate::repo::Repo;
use crate::resolve::{read_commit_metadata, read_deployment_metadata, resolve};
use crate::sysroot::{Sysroot, ROOT_KEY};
use crate::transport::{
    Connector, ContentServer, DeviceCommands, OpenSshConnector, RemoteExecutor, RemoteState,
    RemoteTarget, TunnelBinding,
};

/// what to deploy and where
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// ref or checksum in the archive store; the configured default when unset
    pub reference: Option<String>,
    pub storage_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub remote_host: Option<String>,
    pub remote_username: Option<String>,
    pub remote_password: Option<String>,
    pub mdns_source: Option<String>,
    pub reboot: bool,
    /// scratch sysroot the installer image is built from
    pub deploy_sysroot_dir: PathBuf,
}

impl Default for DeployRequest {
    fn default() -> Self {
        Self {
            reference: None,
            storage_dir: PathBuf::from("/storage"),
            output_dir: None,
            remote_host: None,
            remote_username: None,
            remote_password: None,
            mdns_source: None,
            reboot: false,
            deploy_sysroot_dir: PathBuf::from("/deploy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Image { checksum: Hash, archive: PathBuf },
    Remote { checksum: Hash, state: RemoteState },
}

/// `<storage>/{tezi,sysroot,ostree-archive}`
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub tezi: PathBuf,
    pub sysroot: PathBuf,
    pub archive: PathBuf,
}

impl StorageLayout {
    pub fn new(storage_dir: &Path) -> Self {
        Self {
            tezi: storage_dir.join("tezi"),
            sysroot: storage_dir.join("sysroot"),
            archive: storage_dir.join("ostree-archive"),
        }
    }

    fn require(dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Err(Error::Precondition(format!(
                "Storage directory {} does not exist.",
                dir.display()
            )));
        }
        Ok(())
    }
}

enum Mode<'a> {
    LocalImage(&'a Path),
    Remote(&'a str),
}

impl DeployRequest {
    fn mode(&self) -> Result<Mode<'_>> {
        match (&self.output_dir, &self.remote_host) {
            (Some(output), None) => Ok(Mode::LocalImage(output)),
            (None, Some(host)) => Ok(Mode::Remote(host)),
            (None, None) => Err(Error::Configuration(
                "One of the following arguments is required: --output-directory, --remote-host"
                    .to_string(),
            )),
            (Some(_), Some(_)) => Err(Error::Configuration(
                "--output-directory and --remote-host are mutually exclusive".to_string(),
            )),
        }
    }

    fn reference<'a>(&'a self, config: &'a Config) -> &'a str {
        self.reference.as_deref().unwrap_or(&config.default_ref)
    }
}

/// deploy over ssh with the configured client
pub fn deploy_image(request: &DeployRequest, config: &Config) -> Result<DeployOutcome> {
    let connector = OpenSshConnector::new(config.remote.ssh_program.clone());
    deploy_image_with(request, config, &connector)
}

/// deploy, opening remote sessions through `connector`
pub fn deploy_image_with(
    request: &DeployRequest,
    config: &Config,
    connector: &dyn Connector,
) -> Result<DeployOutcome> {
    match request.mode()? {
        Mode::LocalImage(output_dir) => deploy_local_image(request, config, output_dir),
        Mode::Remote(host) => deploy_remote(request, config, host, connector),
    }
}

/// build an installer image at `output_dir` from the storage directory
pub fn deploy_local_image(
    request: &DeployRequest,
    config: &Config,
    output_dir: &Path,
) -> Result<DeployOutcome> {
    if output_dir.symlink_metadata().is_ok() {
        return Err(Error::Precondition(format!(
            "Output directory {} must not exist.",
            output_dir.display()
        )));
    }
    if !request.deploy_sysroot_dir.is_dir() {
        return Err(Error::Precondition(format!(
            "Deploy sysroot directory {} does not exist.",
            request.deploy_sysroot_dir.display()
        )));
    }
    let layout = StorageLayout::new(&request.storage_dir);
    for dir in [&layout.tezi, &layout.sysroot, &layout.archive] {
        StorageLayout::require(dir)?;
    }

    let src = Sysroot::load(&layout.sysroot, &config.osname)?;
    let (current, boot_arguments) = read_deployment_metadata(&src)?;
    let metadata = read_commit_metadata(src.repo(), &current)?;
    info!(
        checksum = %current,
        version = metadata.version.as_deref().unwrap_or("unknown"),
        "current deployment"
    );

    let reference = request.reference(config);
    let mut dst = Sysroot::create(&request.deploy_sysroot_dir, &config.osname)?;
    let archive = Repo::open(&layout.archive)?;
    let checksum = resolve(&archive, reference)?;
    info!(reference, checksum = %checksum, "deploying to {}", dst.path().display());

    dst.pull_local(&archive, &checksum)?;
    let boot_arguments = boot_arguments.without(ROOT_KEY);
    dst.deploy(&checksum, &config.refspec, &boot_arguments)?;
    migrate_state(&src, &dst)?;

    info!(output = %output_dir.display(), "writing installer image");
    match copy_template(&layout.tezi, output_dir) {
        Ok(()) => {}
        // nothing of ours to undo
        Err(e @ Error::Precondition(_)) => return Err(e),
        Err(e) => return Err(rollback(output_dir, e)),
    }
    let opts = PackOptions {
        xz_level: config.image.xz_level,
        ..Default::default()
    };
    let archive_path = pack_root(dst.path(), output_dir, &opts)
        .map_err(|e| rollback(output_dir, e))?;

    info!(archive = %archive_path.display(), "installer image ready");
    Ok(DeployOutcome::Image {
        checksum,
        archive: archive_path,
    })
}

/// remove a partial output directory; the stage error stays the result
fn rollback(output_dir: &Path, error: Error) -> Error {
    warn!(output = %output_dir.display(), error = %error, "removing partial output");
    if let Err(e) = std::fs::remove_dir_all(output_dir) {
        warn!(output = %output_dir.display(), error = %e, "cannot remove partial output");
    }
    error
}

/// push a commit to `host` through a reverse tunnel and stage it there
pub fn deploy_remote(
    request: &DeployRequest,
    config: &Config,
    host: &str,
    connector: &dyn Connector,
) -> Result<DeployOutcome> {
    let layout = StorageLayout::new(&request.storage_dir);
    StorageLayout::require(&layout.archive)?;
    let archive = Repo::open(&layout.archive)?;
    let reference = request.reference(config);
    let checksum = resolve(&archive, reference)?;
    info!(reference, checksum = %checksum, host, "deploying to device");

    let mut server = ContentServer::start(archive.path(), &config.server.bind, config.server.port)?;
    let target = RemoteTarget {
        host: host.to_string(),
        username: request
            .remote_username
            .clone()
            .unwrap_or_else(|| config.remote.username.clone()),
        password: request.remote_password.clone(),
        mdns_source: request.mdns_source.clone(),
        trust_unknown_host_keys: config.remote.trust_unknown_host_keys,
    };
    let binding = TunnelBinding {
        local_port: server.addr().port(),
        local_host: server.addr().ip().to_string(),
        remote_port: config.remote.remote_port,
    };

    let result = RemoteExecutor::connect(
        connector,
        &target,
        DeviceCommands::from_config(config),
    )
    .and_then(|mut exec| {
        let outcome = drive(&mut exec, &binding, &checksum, request.reboot);
        let state = exec.state();
        let closed = exec.close();
        outcome.and(closed).map(|()| state)
    });
    server.stop();

    let state = result?;
    Ok(DeployOutcome::Remote { checksum, state })
}

fn drive(
    exec: &mut RemoteExecutor,
    binding: &TunnelBinding,
    checksum: &Hash,
    reboot: bool,
) -> Result<()> {
    exec.establish_tunnel(binding)?;
    exec.add_remote()?;
    exec.pull(checksum)?;
    exec.deploy(checksum)?;
    if reboot {
        exec.reboot()
    } else {
        exec.skip_reboot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysroot::tests::{archive_with_commit, xattrs_supported};
    use crate::sysroot::BootArguments;
    use crate::device;
    use crate::transport::remote::tests::FakeConnector;
    use crate::transport::{CommandOutput, RemoteSession};
    use std::sync::{Arc, Mutex};
    use std::fs;
    use std::net::TcpListener;
    use std::process::Command;
    use tempfile::tempdir;

    fn have(program: &str) -> bool {
        Command::new(program)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// storage with an archive, a booted sysroot and an installer template
    fn storage(root: &Path) -> (PathBuf, Hash) {
        let storage = root.join("storage");
        fs::create_dir(&storage).unwrap();
        let (archive, hash) = archive_with_commit(&storage);

        let sysroot_dir = storage.join("sysroot");
        fs::create_dir(&sysroot_dir).unwrap();
        let mut sysroot = Sysroot::create(&sysroot_dir, "torizon").unwrap();
        sysroot.pull_local(&archive, &hash).unwrap();
        sysroot
            .deploy(
                &hash,
                "torizon",
                &BootArguments::parse("quiet root=LABEL=otaroot fw_devlink=off"),
            )
            .unwrap();
        let home = sysroot.var_path().join("rootdirs/home/torizon");
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join(".profile"), "export A=1\n").unwrap();

        let tezi = storage.join("tezi");
        fs::create_dir(&tezi).unwrap();
        fs::write(tezi.join("image.json"), "{}").unwrap();
        fs::write(tezi.join("torizon-core.ota.tar.xz"), "").unwrap();
        (storage, hash)
    }

    fn local_request(root: &Path, storage: PathBuf) -> DeployRequest {
        let deploy = root.join("deploy");
        fs::create_dir_all(&deploy).unwrap();
        DeployRequest {
            storage_dir: storage,
            output_dir: Some(root.join("out")),
            deploy_sysroot_dir: deploy,
            ..Default::default()
        }
    }

    fn remote_request(storage: PathBuf, reboot: bool) -> DeployRequest {
        DeployRequest {
            storage_dir: storage,
            remote_host: Some("verdin.local".into()),
            reboot,
            ..Default::default()
        }
    }

    fn remote_config() -> Config {
        let mut config = Config::default();
        // ephemeral, so tests can run in parallel
        config.server.port = 0;
        config
    }

    #[test]
    fn test_exactly_one_mode() {
        let fake = FakeConnector::default();
        let neither = DeployRequest::default();
        let err = deploy_image_with(&neither, &Config::default(), &fake).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("One of the following arguments is required"));

        let both = DeployRequest {
            output_dir: Some("/tmp/out".into()),
            remote_host: Some("verdin.local".into()),
            ..Default::default()
        };
        let err = deploy_image_with(&both, &Config::default(), &fake).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
        assert_eq!(fake.recording().connects, 0);
    }

    #[test]
    fn test_existing_output_dir() {
        let dir = tempdir().unwrap();
        let request = local_request(dir.path(), dir.path().join("storage"));
        let output = dir.path().join("out");
        fs::create_dir(&output).unwrap();
        fs::write(output.join("keep"), "mine").unwrap();

        let err = deploy_local_image(&request, &Config::default(), &output).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.to_string().contains("must not exist"));
        assert_eq!(fs::read_to_string(output.join("keep")).unwrap(), "mine");
        assert_eq!(fs::read_dir(&request.deploy_sysroot_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_deploy_sysroot() {
        let dir = tempdir().unwrap();
        let request = DeployRequest {
            storage_dir: dir.path().join("storage"),
            output_dir: Some(dir.path().join("out")),
            deploy_sysroot_dir: dir.path().join("deploy"),
            ..Default::default()
        };
        let err = deploy_image_with(&request, &Config::default(), &FakeConnector::default())
            .unwrap_err();
        assert!(err.to_string().starts_with("Deploy sysroot directory"));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_missing_storage() {
        let dir = tempdir().unwrap();
        let request = local_request(dir.path(), dir.path().join("storage"));
        let err = deploy_image_with(&request, &Config::default(), &FakeConnector::default())
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.to_string().contains("tezi"));
    }

    #[test]
    fn test_local_image() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) || !have("tar") || !have("xz") {
            return;
        }
        let (storage, hash) = storage(dir.path());
        let request = local_request(dir.path(), storage);

        let outcome =
            deploy_image_with(&request, &Config::default(), &FakeConnector::default()).unwrap();
        let DeployOutcome::Image { checksum, archive } = outcome else {
            panic!("expected an image");
        };
        assert_eq!(checksum, hash);
        assert_eq!(archive, dir.path().join("out/torizon-core.ota.tar.xz"));
        assert!(fs::metadata(&archive).unwrap().len() > 0);
        assert!(dir.path().join("out/image.json").is_file());

        let deploy = &request.deploy_sysroot_dir;
        let entry =
            fs::read_to_string(deploy.join("boot/loader/entries/ostree-1-torizon.conf")).unwrap();
        let options = entry.lines().find(|l| l.starts_with("options ")).unwrap();
        assert_eq!(
            options,
            format!(
                "options quiet root=LABEL=otaroot fw_devlink=off ostree=/ostree/deploy/torizon/deploy/{}.0",
                hash
            )
        );
        assert_eq!(
            fs::read_to_string(deploy.join("ostree/deploy/torizon/var/rootdirs/home/torizon/.profile"))
                .unwrap(),
            "export A=1\n"
        );
    }

    #[test]
    fn test_local_image_rolls_back_output() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let (storage, _) = storage(dir.path());
        // no archive in the template: packing fails after the copy
        fs::remove_file(storage.join("tezi/torizon-core.ota.tar.xz")).unwrap();
        let request = local_request(dir.path(), storage);

        let err = deploy_image_with(&request, &Config::default(), &FakeConnector::default())
            .unwrap_err();
        assert!(matches!(err, Error::Packaging { .. }));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_local_image_unknown_ref() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let (storage, _) = storage(dir.path());
        let mut request = local_request(dir.path(), storage);
        request.reference = Some("nightly".into());

        let err = deploy_image_with(&request, &Config::default(), &FakeConnector::default())
            .unwrap_err();
        assert!(err.to_string().contains("nightly"));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_remote_deploy() {
        let dir = tempdir().unwrap();
        let (_, hash) = archive_with_commit(dir.path());
        let fake = FakeConnector::default();

        let outcome =
            deploy_image_with(&remote_request(dir.path().to_path_buf(), false), &remote_config(), &fake)
                .unwrap();
        assert_eq!(
            outcome,
            DeployOutcome::Remote {
                checksum: hash,
                state: RemoteState::AwaitingManualReboot
            }
        );

        let rec = fake.recording();
        assert_eq!(rec.forwards.len(), 1);
        assert_eq!(rec.forwards[0].remote_port, 8080);
        assert_eq!(rec.commands.len(), 3);
        assert!(rec.commands[1].ends_with(&format!("rootdeploy pull --sysroot / tcbuilder {}", hash)));
        assert!(rec.commands[2].contains(&format!("--origin tcbuilder:{} {}", hash, hash)));
        assert_eq!(rec.closed, 1);
        TcpListener::bind(("127.0.0.1", rec.forwards[0].local_port)).unwrap();
    }

    /// a session that runs the device half against a local sysroot
    ///
    /// the tunnel is emulated by pointing the registered url at the
    /// forwarded local address.
    #[derive(Clone, Default)]
    struct DeviceEmulator {
        forward: Arc<Mutex<Option<TunnelBinding>>>,
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl Connector for DeviceEmulator {
        fn connect(&self, _target: &RemoteTarget) -> Result<Box<dyn RemoteSession>> {
            Ok(Box::new(self.clone()))
        }
    }

    impl RemoteSession for DeviceEmulator {
        fn forward_remote(&mut self, binding: &TunnelBinding) -> Result<()> {
            *self.forward.lock().unwrap() = Some(binding.clone());
            Ok(())
        }

        fn exec(&mut self, command: &str, _stdin: Option<&[u8]>) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            let line = command.strip_prefix("sudo -n -- ").unwrap_or(command);
            let args: Vec<&str> = line.split_whitespace().collect();
            let result = match args.as_slice() {
                ["rootdeploy", "remote", "add", "--sysroot", sysroot, "--force", name, url] => {
                    let binding = self.forward.lock().unwrap().clone().unwrap();
                    let url = url.replace(
                        &format!("localhost:{}", binding.remote_port),
                        &format!("{}:{}", binding.local_host, binding.local_port),
                    );
                    device::add_update_source(Path::new(sysroot), name, &url, true)
                }
                ["rootdeploy", "pull", "--sysroot", sysroot, source, rev] => {
                    device::pull_update(Path::new(sysroot), source, rev).map(|_| ())
                }
                ["rootdeploy", "admin", "deploy", "--sysroot", sysroot, "--os", os, "--origin", origin, rev] => {
                    device::deploy_update(Path::new(sysroot), os, rev, Some(*origin)).map(|_| ())
                }
                _ => panic!("unexpected device command {}", command),
            };
            Ok(match result {
                Ok(()) => CommandOutput {
                    exit_status: Some(0),
                    ..Default::default()
                },
                Err(e) => CommandOutput {
                    exit_status: Some(1),
                    stdout: String::new(),
                    stderr: e.to_string(),
                },
            })
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_remote_deploy_reaches_device() {
        let dir = tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let (archive, old) = archive_with_commit(dir.path());

        // the device runs the old commit
        let device_root = dir.path().join("device");
        fs::create_dir(&device_root).unwrap();
        let mut device = Sysroot::create(&device_root, "torizon").unwrap();
        device.pull_local(&archive, &old).unwrap();
        device
            .deploy(&old, "torizon", &BootArguments::parse("quiet console=ttymxc0"))
            .unwrap();

        // the build host has a newer one under the default ref
        fs::write(dir.path().join("rootfs/etc/os-release"), "ID=torizon\nVERSION=7\n").unwrap();
        let new = crate::ops::commit(&archive, &dir.path().join("rootfs"), "base", &Default::default())
            .unwrap();

        let mut config = remote_config();
        config.remote.device.sysroot = device_root.to_string_lossy().into_owned();
        let emulator = DeviceEmulator::default();
        let outcome =
            deploy_image_with(&remote_request(dir.path().to_path_buf(), false), &config, &emulator)
                .unwrap();
        assert_eq!(
            outcome,
            DeployOutcome::Remote {
                checksum: new,
                state: RemoteState::AwaitingManualReboot
            }
        );
        assert_eq!(emulator.commands.lock().unwrap().len(), 3);

        let device = Sysroot::load(&device_root, "torizon").unwrap();
        let deployment = device.default_deployment().unwrap();
        assert_eq!(deployment.checksum, new);
        assert_eq!(
            deployment.origin_refspec.as_deref(),
            Some(format!("tcbuilder:{}", new).as_str())
        );
        assert_eq!(
            deployment.boot_arguments.to_string(),
            format!("quiet console=ttymxc0 ostree={}", deployment.boot_path())
        );
        assert_eq!(
            fs::read_to_string(device.deployment_path(deployment).join("etc/os-release")).unwrap(),
            "ID=torizon\nVERSION=7\n"
        );
        assert_eq!(device.deployments().len(), 2);

        // server gone once the deployment returns
        let binding = emulator.forward.lock().unwrap().clone().unwrap();
        TcpListener::bind(("127.0.0.1", binding.local_port)).unwrap();
    }

    #[test]
    fn test_remote_pull_failure_cleans_up() {
        let dir = tempdir().unwrap();
        archive_with_commit(dir.path());
        let fake = FakeConnector::scripted(&[Some(0), Some(1)]);

        let err =
            deploy_image_with(&remote_request(dir.path().to_path_buf(), true), &remote_config(), &fake)
                .unwrap_err();
        let Error::RemoteCommand { command, .. } = &err else {
            panic!("expected a command error, got {}", err);
        };
        assert!(command.starts_with("rootdeploy pull"));

        let rec = fake.recording();
        assert_eq!(rec.closed, 1);
        assert_eq!(rec.commands.len(), 2);
        TcpListener::bind(("127.0.0.1", rec.forwards[0].local_port)).unwrap();
    }

    #[test]
    fn test_remote_reboot_failure_tolerated() {
        let dir = tempdir().unwrap();
        archive_with_commit(dir.path());
        let fake = FakeConnector::scripted(&[Some(0), Some(0), Some(0), Some(255)]);

        deploy_image_with(&remote_request(dir.path().to_path_buf(), true), &remote_config(), &fake)
            .unwrap();
        assert_eq!(fake.recording().commands.len(), 4);
    }

    #[test]
    fn test_remote_deploy_failure_raises() {
        let dir = tempdir().unwrap();
        archive_with_commit(dir.path());
        let fake = FakeConnector::scripted(&[Some(0), Some(0), Some(1)]);

        let err =
            deploy_image_with(&remote_request(dir.path().to_path_buf(), true), &remote_config(), &fake)
                .unwrap_err();
        assert!(err.to_string().contains("rootdeploy admin deploy"));
        // no reboot after a failed deploy
        assert_eq!(fake.recording().commands.len(), 3);
        assert_eq!(fake.recording().closed, 1);
    }

    #[test]
    fn test_remote_connect_failure() {
        let dir = tempdir().unwrap();
        archive_with_commit(dir.path());
        let fake = FakeConnector {
            refuse: Some("Connection refused".into()),
            ..Default::default()
        };

        let err =
            deploy_image_with(&remote_request(dir.path().to_path_buf(), false), &remote_config(), &fake)
                .unwrap_err();
        assert!(matches!(err, Error::RemoteConnection { .. }));
        assert!(err.to_string().contains("verdin.local"));
    }
}
