use super::{quote, CommandOutput, RemoteError, RemotePort};
use crate::config::ClusterConfig;
use parking_lot::Mutex;
use std::{
    io::Read,
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// exit status OpenSSH reserves for its own failures
const SSH_FAILURE: i32 = 255;

/// Where commands end up running
#[derive(Debug, Clone)]
pub enum Target {
    /// `sh -c` on this machine, e.g. when running on the login node itself
    Local,
    /// `ssh` to a login node, non-interactive
    Ssh {
        host: String,
        user: Option<String>,
        port: Option<u16>,
        identity: Option<PathBuf>,
    },
}

/// Production port spawning `sh` or `ssh` for every command
#[derive(Debug)]
pub struct ShellPort {
    target: Target,
    connect_timeout: Duration,
    command_timeout: Duration,
    // one command in flight at a time
    channel: Mutex<()>,
}

impl ShellPort {
    pub fn new(target: Target, connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            command_timeout,
            channel: Mutex::new(()),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        let target = match &config.host {
            Some(host) => Target::Ssh {
                host: host.clone(),
                user: config.user.clone(),
                port: config.port,
                identity: config.identity.clone(),
            },
            None => Target::Local,
        };

        Self::new(
            target,
            Duration::from_secs(config.connect_timeout),
            Duration::from_secs(config.command_timeout),
        )
    }

    /// Build a port from `config` and verify the channel actually works
    #[instrument(skip(config), level = "info")]
    pub fn connect(config: &ClusterConfig) -> Result<Self, RemoteError> {
        let port = Self::from_config(config);
        let output = port.execute("true")?;

        if !output.success() {
            return Err(RemoteError::Disconnected(output.diagnostic()));
        }

        match &port.target {
            Target::Local => info!("Using the local shell as cluster channel"),
            Target::Ssh { host, .. } => info!(host = %host, "Connected to cluster"),
        }

        Ok(port)
    }

    fn command(&self, remote_command: &str) -> Command {
        match &self.target {
            Target::Local => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(remote_command);
                command
            }
            Target::Ssh {
                host,
                user,
                port,
                identity,
            } => {
                let mut command = Command::new("ssh");
                command
                    .arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-o")
                    .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));

                if let Some(port) = port {
                    command.arg("-p").arg(port.to_string());
                }
                if let Some(identity) = identity {
                    command.arg("-i").arg(identity);
                }

                match user {
                    Some(user) => command.arg(format!("{user}@{host}")),
                    None => command.arg(host),
                };
                command.arg("--").arg(remote_command);
                command
            }
        }
    }

    /// Run `remote_command`, returning raw stdout and stderr bytes
    fn run(&self, remote_command: &str) -> Result<(Vec<u8>, Vec<u8>, i32), RemoteError> {
        let _channel = self.channel.lock();

        trace!(command = remote_command, "Executing remote command");
        let mut child = self
            .command(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // drain both pipes while waiting, large outputs would block the child otherwise
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait_timeout(self.command_timeout)? {
            Some(status) => status,
            None => {
                kill(&mut child);
                return Err(RemoteError::Timeout(self.command_timeout));
            }
        };

        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;
        let exit_code = match status.code() {
            Some(code) => code,
            None => {
                return Err(RemoteError::Transport(format!(
                    "remote shell was terminated by a signal ({status})"
                )))
            }
        };

        if exit_code == SSH_FAILURE && matches!(self.target, Target::Ssh { .. }) {
            return Err(RemoteError::Disconnected(
                String::from_utf8_lossy(&stderr).trim().to_owned(),
            ));
        }

        debug!(exit_code, "Remote command finished");

        Ok((stdout, stderr, exit_code))
    }
}

impl RemotePort for ShellPort {
    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let (stdout, stderr, exit_code) = self.run(command)?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let (stdout, stderr, exit_code) = self.run(&format!("cat -- {}", quote(path)))?;

        if exit_code == 0 {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&stderr);
        if stderr.contains("No such file") {
            Err(RemoteError::NotFound(path.to_owned()))
        } else {
            Err(RemoteError::Transport(stderr.trim().to_owned()))
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<std::io::Result<Vec<u8>>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            pipe.read_to_end(&mut buffer)?;
            Ok(buffer)
        })
    })
}

fn collect(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>, RemoteError> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| RemoteError::Transport("output reader panicked".to_owned()))?
            .map_err(RemoteError::from),
        None => Ok(Vec::new()),
    }
}

fn kill(child: &mut Child) {
    if let Err(error) = child.kill() {
        warn!(error = ?error, "Failed to kill timed out remote shell");
    }
    // reap, otherwise the process lingers as a zombie
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> ShellPort {
        ShellPort::new(Target::Local, Duration::from_secs(1), Duration::from_secs(10))
    }

    #[test]
    fn captures_output_and_exit_code() {
        let output = local().execute("echo out; echo err >&2; exit 3").unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 3);
    }

    #[test]
    fn missing_file_is_not_found() {
        let port = local();

        assert!(!port.file_exists("/nonexistent/hplsweep/file").unwrap());
        assert!(matches!(
            port.read_file("/nonexistent/hplsweep/file"),
            Err(RemoteError::NotFound(_))
        ));
    }

    #[test]
    fn times_out() {
        let port = ShellPort::new(
            Target::Local,
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        assert!(matches!(port.execute("sleep 5"), Err(RemoteError::Timeout(_))));
    }

    #[test]
    fn builds_ssh_invocation() {
        let port = ShellPort::new(
            Target::Ssh {
                host: "login.cluster".into(),
                user: Some("alice".into()),
                port: Some(2222),
                identity: None,
            },
            Duration::from_secs(7),
            Duration::from_secs(10),
        );
        let command = port.command("squeue -h");
        let args: Vec<_> = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        assert_eq!(command.get_program(), "ssh");
        assert_eq!(
            args,
            [
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=7",
                "-p",
                "2222",
                "alice@login.cluster",
                "--",
                "squeue -h"
            ]
        );
    }
}
