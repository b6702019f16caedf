//! driving a device through one authenticated session
//!
//! the session carries a reverse tunnel back to the local content server;
//! every device command runs with elevated privileges and strictly in order.

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::config::{Config, DeviceConfig};
use crate::error::{Error, Result};
use crate::hash::Hash;

/// where and as whom to connect
#[derive(Clone, Default)]
pub struct RemoteTarget {
    pub host: String,
    pub username: String,
    pub password: Option<String>,
    /// local source address to connect from
    pub mdns_source: Option<String>,
    pub trust_unknown_host_keys: bool,
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("mdns_source", &self.mdns_source)
            .field("trust_unknown_host_keys", &self.trust_unknown_host_keys)
            .finish()
    }
}

/// device loopback `remote_port` forwarded to `local_host:local_port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelBinding {
    pub local_port: u16,
    pub local_host: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the command ended without one (signal, lost connection)
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// opens sessions; the seam tests replace
pub trait Connector {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>>;
}

/// one open connection to a device
pub trait RemoteSession {
    fn forward_remote(&mut self, binding: &TunnelBinding) -> Result<()>;

    /// run `command` through the device's shell, feeding `stdin` when given
    fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput>;

    fn close(&mut self) -> Result<()>;
}

/// device command lines, expanded from the configured templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommands {
    pub update_source: String,
    pub remote_port: u16,
    pub osname: String,
    pub templates: DeviceConfig,
}

impl DeviceCommands {
    pub fn from_config(config: &Config) -> Self {
        Self {
            update_source: config.remote.update_source.clone(),
            remote_port: config.remote.remote_port,
            osname: config.osname.clone(),
            templates: config.remote.device.clone(),
        }
    }

    /// the content server as the device sees it through the tunnel
    pub fn url(&self) -> String {
        format!("http://localhost:{}/", self.remote_port)
    }

    fn expand(&self, template: &str, checksum: Option<&Hash>) -> String {
        let line = template
            .replace("{source}", &self.update_source)
            .replace("{url}", &self.url())
            .replace("{sysroot}", &self.templates.sysroot)
            .replace("{os}", &self.osname);
        match checksum {
            Some(checksum) => line.replace("{checksum}", &checksum.to_hex()),
            None => line,
        }
    }

    pub fn add_remote(&self) -> String {
        self.expand(&self.templates.add_remote, None)
    }

    pub fn pull(&self, checksum: &Hash) -> String {
        self.expand(&self.templates.pull, Some(checksum))
    }

    pub fn deploy(&self, checksum: &Hash) -> String {
        self.expand(&self.templates.deploy, Some(checksum))
    }

    pub fn reboot(&self) -> String {
        self.expand(&self.templates.reboot, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Connecting,
    TunnelEstablished,
    RemoteAdded,
    Pulled,
    Deployed,
    StagedForReboot,
    AwaitingManualReboot,
    Closed,
    Aborted,
}

impl RemoteState {
    pub fn name(self) -> &'static str {
        match self {
            RemoteState::Connecting => "connecting",
            RemoteState::TunnelEstablished => "tunnel-established",
            RemoteState::RemoteAdded => "remote-added",
            RemoteState::Pulled => "pulled",
            RemoteState::Deployed => "deployed",
            RemoteState::StagedForReboot => "staged-for-reboot",
            RemoteState::AwaitingManualReboot => "awaiting-manual-reboot",
            RemoteState::Closed => "closed",
            RemoteState::Aborted => "aborted",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, RemoteState::Closed | RemoteState::Aborted)
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// transport failures surface as connection errors naming the host
fn connection_error(host: &str) -> impl FnOnce(Error) -> Error + '_ {
    move |e| match e {
        e @ Error::RemoteConnection { .. } => e,
        other => Error::RemoteConnection {
            host: host.to_string(),
            message: other.to_string(),
        },
    }
}

/// state machine over a [`RemoteSession`]
pub struct RemoteExecutor {
    session: Option<Box<dyn RemoteSession>>,
    state: RemoteState,
    host: String,
    password: Option<String>,
    commands: DeviceCommands,
}

impl RemoteExecutor {
    /// open a session; one attempt only
    pub fn connect(
        connector: &dyn Connector,
        target: &RemoteTarget,
        commands: DeviceCommands,
    ) -> Result<Self> {
        if target.trust_unknown_host_keys {
            warn!(host = %target.host, "accepting unknown host keys for this connection");
        }
        let session = connector
            .connect(target)
            .map_err(connection_error(&target.host))?;
        info!(host = %target.host, user = %target.username, "connected");
        Ok(Self {
            session: Some(session),
            state: RemoteState::Connecting,
            host: target.host.clone(),
            password: target.password.clone(),
            commands,
        })
    }

    pub fn state(&self) -> RemoteState {
        self.state
    }

    fn require_state(&self, operation: &'static str, expected: RemoteState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidRemoteState {
                operation,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    fn session(&mut self, operation: &'static str) -> Result<&mut Box<dyn RemoteSession>> {
        let state = self.state.name();
        self.session
            .as_mut()
            .ok_or(Error::InvalidRemoteState { operation, state })
    }

    /// record the outcome of a step: advance on success, abort on failure
    fn advance<T>(&mut self, result: Result<T>, next: RemoteState) -> Result<T> {
        self.state = if result.is_ok() { next } else { RemoteState::Aborted };
        result
    }

    pub fn establish_tunnel(&mut self, binding: &TunnelBinding) -> Result<()> {
        self.require_state("establish tunnel", RemoteState::Connecting)?;
        let host = self.host.clone();
        let result = self
            .session("establish tunnel")?
            .forward_remote(binding)
            .map_err(connection_error(&host));
        if result.is_ok() {
            info!(
                remote_port = binding.remote_port,
                local = %format!("{}:{}", binding.local_host, binding.local_port),
                "reverse tunnel established"
            );
        }
        self.advance(result, RemoteState::TunnelEstablished)
    }

    /// run `command` through sudo, password on stdin when configured
    pub fn run_privileged(&mut self, command: &str) -> Result<CommandOutput> {
        let output = self.exec_privileged(command)?;
        if !output.success() {
            error!(command, status = ?output.exit_status, "device command failed");
            error!(command, stdout = %output.stdout.trim_end(), "stdout");
            error!(command, stderr = %output.stderr.trim_end(), "stderr");
            return Err(Error::RemoteCommand {
                command: command.to_string(),
                exit_status: output.exit_status,
                stderr: output.stderr,
            });
        }
        debug!(command, stdout = %output.stdout.trim_end(), "stdout");
        debug!(command, stderr = %output.stderr.trim_end(), "stderr");
        Ok(output)
    }

    /// sudo-wrapped exec; the exit status is left to the caller
    fn exec_privileged(&mut self, command: &str) -> Result<CommandOutput> {
        if self.state.is_terminal() {
            return Err(Error::InvalidRemoteState {
                operation: "run command",
                state: self.state.name(),
            });
        }
        let (wrapped, stdin) = match &self.password {
            Some(password) => (
                format!("sudo -S -- {}", command),
                Some(format!("{}\n", password).into_bytes()),
            ),
            None => (format!("sudo -n -- {}", command), None),
        };

        debug!(command, "running on device");
        self.session("run command")?
            .exec(&wrapped, stdin.as_deref())
    }

    fn step(
        &mut self,
        operation: &'static str,
        from: RemoteState,
        to: RemoteState,
        command: String,
    ) -> Result<()> {
        self.require_state(operation, from)?;
        let result = self.run_privileged(&command).map(|_| ());
        self.advance(result, to)
    }

    /// register the tunneled store as the update source
    pub fn add_remote(&mut self) -> Result<()> {
        let command = self.commands.add_remote();
        self.step(
            "add remote",
            RemoteState::TunnelEstablished,
            RemoteState::RemoteAdded,
            command,
        )
    }

    pub fn pull(&mut self, checksum: &Hash) -> Result<()> {
        let command = self.commands.pull(checksum);
        self.step("pull", RemoteState::RemoteAdded, RemoteState::Pulled, command)?;
        info!(checksum = %checksum, "device pulled commit");
        Ok(())
    }

    /// stage `checksum` for the next boot
    pub fn deploy(&mut self, checksum: &Hash) -> Result<()> {
        let command = self.commands.deploy(checksum);
        self.step("deploy", RemoteState::Pulled, RemoteState::Deployed, command)?;
        info!(checksum = %checksum, "deployment staged on device");
        Ok(())
    }

    /// ask the device to reboot; failure is only a warning
    pub fn reboot(&mut self) -> Result<()> {
        self.require_state("reboot", RemoteState::Deployed)?;
        let command = self.commands.reboot();
        match self.exec_privileged(&command) {
            Ok(output) if output.success() => info!(host = %self.host, "device is rebooting"),
            Ok(output) => warn!(
                host = %self.host,
                status = ?output.exit_status,
                stderr = %output.stderr.trim_end(),
                "reboot request did not complete"
            ),
            Err(e) => warn!(host = %self.host, error = %e, "reboot request did not complete"),
        }
        self.state = RemoteState::StagedForReboot;
        Ok(())
    }

    pub fn skip_reboot(&mut self) -> Result<()> {
        self.require_state("skip reboot", RemoteState::Deployed)?;
        info!("Please reboot the device to boot into the new deployment.");
        self.state = RemoteState::AwaitingManualReboot;
        Ok(())
    }

    /// close the session; valid from every state, repeated calls are no-ops
    pub fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        self.state = RemoteState::Closed;
        let result = session.close().map_err(connection_error(&self.host));
        debug!(host = %self.host, "session closed");
        result
    }
}

impl Drop for RemoteExecutor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(host = %self.host, error = %e, "closing session on drop");
        }
    }
}
