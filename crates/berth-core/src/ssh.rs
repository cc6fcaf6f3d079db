//! Production transport driving the system `ssh` client.
//!
//! Each session owns a ControlMaster socket: `connect` starts a background
//! master connection, every `exec` multiplexes over it, and `close` asks the
//! master to exit.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use berth_stage::{AuthMethod, Endpoint, ExecutionTarget, RuntimeConfig};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::transport::{CommandOutput, Session, Transport};

/// Exit status the ssh client reserves for its own errors.
const SSH_ERROR_STATUS: i32 = 255;

/// Which ssh invocation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshInvocation<'a> {
    /// Start the background master connection.
    Master,
    /// Run a command over the master.
    Exec(&'a str),
    /// Ask the master to exit.
    Exit,
}

/// Arguments passed to `ssh` (not including the program itself).
pub fn ssh_args(endpoint: &Endpoint, control_path: &Path, invocation: SshInvocation<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let mut opt = |value: String| {
        args.push("-o".into());
        args.push(value.into());
    };

    opt(format!("ControlPath={}", control_path.display()));
    match invocation {
        SshInvocation::Master => {
            opt("ControlMaster=yes".to_string());
            opt("ControlPersist=yes".to_string());
            opt(format!(
                "ConnectTimeout={}",
                endpoint.connect_timeout.as_secs().max(1)
            ));
            match &endpoint.auth {
                AuthMethod::Password(_) => {
                    opt("PreferredAuthentications=password,keyboard-interactive".to_string());
                    opt("PubkeyAuthentication=no".to_string());
                }
                AuthMethod::KeyFile(_) => {
                    opt("BatchMode=yes".to_string());
                    opt("IdentitiesOnly=yes".to_string());
                }
                AuthMethod::Agent => opt("BatchMode=yes".to_string()),
            }
        }
        SshInvocation::Exec(_) | SshInvocation::Exit => opt("ControlMaster=no".to_string()),
    }

    args.push("-p".into());
    args.push(endpoint.port.to_string().into());

    if invocation == SshInvocation::Master {
        if matches!(endpoint.auth, AuthMethod::KeyFile(_)) {
            for identity in &endpoint.identities {
                args.push("-i".into());
                args.push(identity.clone().into_os_string());
            }
        }
        if endpoint.forward_agent {
            args.push("-A".into());
        }
        args.push("-N".into());
        args.push("-f".into());
        // The backgrounded master keeps its stdio; send diagnostics to a file.
        args.push("-E".into());
        args.push(master_log_path(control_path).into_os_string());
    }
    if invocation == SshInvocation::Exit {
        args.push("-O".into());
        args.push("exit".into());
    }

    args.push(endpoint.destination().into());
    if let SshInvocation::Exec(command) = invocation {
        args.push("--".into());
        args.push(command.into());
    }
    args
}

/// Where the master for `control_path` writes its diagnostics.
pub fn master_log_path(control_path: &Path) -> PathBuf {
    control_path.with_extension("log")
}

/// Opens ControlMaster sessions through the local `ssh` binary.
#[derive(Debug)]
pub struct SshTransport {
    ssh_program: PathBuf,
    sshpass_program: PathBuf,
    control_dir: PathBuf,
    sequence: AtomicU64,
}

impl SshTransport {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            ssh_program: config.ssh_program.clone(),
            sshpass_program: config.sshpass_program.clone(),
            control_dir: config.control_dir.clone(),
            sequence: AtomicU64::new(0),
        }
    }

    fn control_path(&self) -> PathBuf {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.control_dir
            .join(format!("berth-{}-{n}.sock", std::process::id()))
    }

    fn master_command(&self, endpoint: &Endpoint, control_path: &Path) -> Command {
        let args = ssh_args(endpoint, control_path, SshInvocation::Master);
        let mut cmd = match &endpoint.auth {
            AuthMethod::Password(secret) => {
                let mut cmd = Command::new(&self.sshpass_program);
                cmd.arg("-e").arg(&self.ssh_program).env("SSHPASS", secret.expose());
                cmd
            }
            _ => Command::new(&self.ssh_program),
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, target: &ExecutionTarget) -> Result<Box<dyn Session>, ConnectionError> {
        let endpoint = &target.endpoint;
        let control_path = self.control_path();
        debug!(
            target = %target,
            auth = endpoint.auth.kind(),
            control_path = %control_path.display(),
            "opening ssh master"
        );

        let status = self
            .master_command(endpoint, &control_path)
            .status()
            .await
            .map_err(|e| ConnectionError::Failed {
                host: endpoint.hostname.clone(),
                reason: format!("could not start ssh: {e}"),
            })?;

        let log_path = master_log_path(&control_path);
        let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        let _ = tokio::fs::remove_file(&log_path).await;

        if !status.success() {
            return Err(ConnectionError::Failed {
                host: endpoint.hostname.clone(),
                reason: match status.code() {
                    Some(code) => format!("ssh exited with status {code}: {}", log.trim()),
                    None => "ssh was terminated by a signal".to_string(),
                },
            });
        }

        Ok(Box::new(SshSession {
            ssh_program: self.ssh_program.clone(),
            endpoint: endpoint.clone(),
            control_path,
            closed: false,
        }))
    }
}

/// One ControlMaster connection.
#[derive(Debug)]
pub struct SshSession {
    ssh_program: PathBuf,
    endpoint: Endpoint,
    control_path: PathBuf,
    closed: bool,
}

impl SshSession {
    fn exit_args(&self) -> Vec<OsString> {
        ssh_args(&self.endpoint, &self.control_path, SshInvocation::Exit)
    }
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Lost {
                host: self.endpoint.hostname.clone(),
                reason: "session already closed".to_string(),
            });
        }
        let output = Command::new(&self.ssh_program)
            .args(ssh_args(
                &self.endpoint,
                &self.control_path,
                SshInvocation::Exec(command),
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConnectionError::Lost {
                host: self.endpoint.hostname.clone(),
                reason: format!("could not start ssh: {e}"),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.code() == Some(SSH_ERROR_STATUS) {
            return Err(ConnectionError::Lost {
                host: self.endpoint.hostname.clone(),
                reason: stderr.trim().to_string(),
            });
        }
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout,
            stderr,
        })
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let status = Command::new(&self.ssh_program)
            .args(self.exit_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => debug!(host = %self.endpoint.hostname, "ssh master closed"),
            Ok(s) => warn!(host = %self.endpoint.hostname, status = ?s.code(), "ssh master exit request failed"),
            Err(e) => warn!(host = %self.endpoint.hostname, error = %e, "could not request ssh master exit"),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best effort; the master would otherwise persist.
        let spawned = std::process::Command::new(&self.ssh_program)
            .args(self.exit_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!(host = %self.endpoint.hostname, error = %e, "could not release dropped ssh session");
        }
    }
}
