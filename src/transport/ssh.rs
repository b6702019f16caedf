//! [`Connector`] on top of the OpenSSH client in ControlMaster mode
//!
//! one master process per session owns the connection and the reverse
//! forward; commands multiplex over its control socket. passwords reach ssh
//! through an askpass helper reading an environment variable, never argv.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, warn};

use super::remote::{CommandOutput, Connector, RemoteSession, RemoteTarget, TunnelBinding};
use crate::error::{Error, IoResultExt, Result};

const PASSWORD_ENV: &str = "ROOTDEPLOY_SSH_PASSWORD";
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$ROOTDEPLOY_SSH_PASSWORD\"\n";
const READY_POLL: Duration = Duration::from_millis(100);
const EXIT_GRACE: Duration = Duration::from_secs(5);
const MASTER_LOG: &str = "master.log";

#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    pub program: String,
}

impl OpenSshConnector {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn master_command(&self, target: &RemoteTarget, dir: &Path) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(dir.join("ctl"))
            .args(["-o", "ControlPersist=no"])
            .args(["-o", "NumberOfPasswordPrompts=1"])
            .args(["-o", "ServerAliveInterval=15"]);
        if target.trust_unknown_host_keys {
            cmd.args(["-o", "StrictHostKeyChecking=no"])
                .args(["-o", "UserKnownHostsFile=/dev/null"]);
        }
        if let Some(source) = &target.mdns_source {
            cmd.arg("-b").arg(source);
        }

        match &target.password {
            Some(password) => {
                let askpass = dir.join("askpass");
                fs::write(&askpass, ASKPASS_SCRIPT).with_path(&askpass)?;
                fs::set_permissions(&askpass, fs::Permissions::from_mode(0o700))
                    .with_path(&askpass)?;
                // SSH_ASKPASS_REQUIRE needs OpenSSH 8.4
                cmd.env("SSH_ASKPASS", &askpass)
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env(PASSWORD_ENV, password);
            }
            None => {
                cmd.args(["-o", "BatchMode=yes"]);
            }
        }

        // a file never fills up and stalls the master the way a pipe would
        let log_path = dir.join(MASTER_LOG);
        let log = File::create(&log_path).with_path(&log_path)?;
        cmd.arg("-l")
            .arg(&target.username)
            .arg(&target.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        Ok(cmd)
    }
}

impl Connector for OpenSshConnector {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>> {
        let failed = |message: String| Error::RemoteConnection {
            host: target.host.clone(),
            message,
        };

        let dir = tempfile::Builder::new()
            .prefix("rootdeploy-ssh-")
            .tempdir()
            .map_err(|e| failed(format!("cannot create control directory: {}", e)))?;
        let master = self
            .master_command(target, dir.path())?
            .spawn()
            .map_err(|e| failed(format!("cannot run {}: {}", self.program, e)))?;

        let mut session = OpenSshSession {
            program: self.program.clone(),
            control: dir.path().join("ctl"),
            username: target.username.clone(),
            host: target.host.clone(),
            master,
            closed: false,
            _dir: dir,
        };
        session.wait_ready().map_err(failed)?;
        debug!(host = %target.host, "ssh master ready");
        Ok(Box::new(session))
    }
}

pub struct OpenSshSession {
    program: String,
    control: PathBuf,
    username: String,
    host: String,
    master: Child,
    closed: bool,
    // removed with the session, taking the socket and askpass helper along
    _dir: TempDir,
}

impl OpenSshSession {
    /// a client talking to the master over the control socket
    fn client(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-S").arg(&self.control);
        cmd
    }

    fn control(&self, op: &str, extra: &[&str]) -> Command {
        let mut cmd = self.client();
        cmd.arg("-O")
            .arg(op)
            .args(extra)
            .arg("-l")
            .arg(&self.username)
            .arg(&self.host);
        cmd
    }

    /// until the master answers `-O check` or exits
    fn wait_ready(&mut self) -> std::result::Result<(), String> {
        loop {
            match self.master.try_wait() {
                Ok(Some(status)) => {
                    self.closed = true;
                    let stderr = self.master_log();
                    return Err(if stderr.is_empty() {
                        format!("ssh exited with {}", status)
                    } else {
                        stderr
                    });
                }
                Ok(None) => {}
                Err(e) => return Err(e.to_string()),
            }

            let ready = self
                .control("check", &[])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if ready {
                return Ok(());
            }
            thread::sleep(READY_POLL);
        }
    }

    /// what the master wrote to stderr so far, trimmed
    fn master_log(&self) -> String {
        fs::read_to_string(self.control.with_file_name(MASTER_LOG))
            .map(|log| log.trim().to_string())
            .unwrap_or_default()
    }

    fn reap(&mut self) {
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.master.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(READY_POLL),
                _ => break,
            }
        }
        warn!(host = %self.host, "ssh master did not exit, killing it");
        let _ = self.master.kill();
        let _ = self.master.wait();
    }
}

impl RemoteSession for OpenSshSession {
    fn forward_remote(&mut self, binding: &TunnelBinding) -> Result<()> {
        let spec = format!(
            "{}:{}:{}",
            binding.remote_port, binding.local_host, binding.local_port
        );
        let output = self
            .control("forward", &["-R", spec.as_str()])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::RemoteConnection {
                host: self.host.clone(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::RemoteConnection {
                host: self.host.clone(),
                message: format!(
                    "remote forward {} refused: {}",
                    spec,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    fn exec(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let transport = |e: std::io::Error| Error::RemoteConnection {
            host: self.host.clone(),
            message: format!("running {:?}: {}", command, e),
        };

        let mut child = self
            .client()
            .arg("-l")
            .arg(&self.username)
            .arg(&self.host)
            .arg("--")
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(transport)?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // sudo may exit before reading; a broken pipe shows up in the status
            let _ = pipe.write_all(bytes);
        }
        let output = child.wait_with_output().map_err(transport)?;

        Ok(CommandOutput {
            exit_status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let exit = self
            .control("exit", &[])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = exit {
            warn!(host = %self.host, error = %e, "cannot ask ssh master to exit");
        }
        self.reap();
        let log = self.master_log();
        if !log.is_empty() {
            debug!(host = %self.host, log = %log, "ssh master output");
        }
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.master.kill();
            let _ = self.master.wait();
        }
    }
}
