//! The channel to the cluster.
//!
//! Everything the engine does on the cluster goes through a `RemotePort`: a
//! shell command returning captured output, plus file existence checks and
//! content retrieval. The port is an owned handle passed to each component, so
//! several cluster sessions can coexist and tests can swap in `FakePort`.

pub mod fake;
mod shell;

pub use fake::FakePort;
pub use shell::{ShellPort, Target};

use std::time::Duration;
use thiserror::Error;

/// delimiter used for staging files through a quoted here-document
pub const HEREDOC_DELIMITER: &str = "HPLSWEEP_EOF";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Remote channel unavailable: {0}")]
    Disconnected(String),
    #[error("Remote file not found: {0}")]
    NotFound(String),
    #[error("Remote command failed in transport: {0}")]
    Transport(String),
    #[error("Remote command did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Failed to spawn remote shell")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Connectivity failures are fatal to whatever operation ran into them
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if it says anything, stdout otherwise
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();

        if stderr.is_empty() {
            self.stdout.trim().to_owned()
        } else {
            stderr.to_owned()
        }
    }
}

/// A single logical channel to one remote host
///
/// Implementations serialize concurrent invocations themselves.
pub trait RemotePort: Send + Sync {
    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError>;

    fn file_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let output = self.execute(&format!("test -f {} && echo EXISTS", quote(path)))?;

        Ok(output.stdout.contains("EXISTS"))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let output = self.execute(&format!("cat -- {}", quote(path)))?;

        if output.success() {
            Ok(output.stdout.into_bytes())
        } else if output.stderr.contains("No such file") {
            Err(RemoteError::NotFound(path.to_owned()))
        } else {
            Err(RemoteError::Transport(output.diagnostic()))
        }
    }
}

impl<P: RemotePort + ?Sized> RemotePort for &P {
    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        (**self).execute(command)
    }

    fn file_exists(&self, path: &str) -> Result<bool, RemoteError> {
        (**self).file_exists(path)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        (**self).read_file(path)
    }
}

impl<P: RemotePort + ?Sized> RemotePort for Box<P> {
    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        (**self).execute(command)
    }

    fn file_exists(&self, path: &str) -> Result<bool, RemoteError> {
        (**self).file_exists(path)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        (**self).read_file(path)
    }
}

/// Quote `value` for a POSIX shell
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');

    for character in value.chars() {
        if character == '\'' {
            quoted.push_str(r"'\''");
        } else {
            quoted.push(character);
        }
    }

    quoted.push('\'');
    quoted
}

/// Join a remote directory and a file name
pub fn join(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", directory.trim_end_matches('/'), name)
    }
}

/// Command writing `contents` to `path`, creating `directories` first
///
/// `contents` must not contain a line equal to `HEREDOC_DELIMITER`.
pub fn write_file_command(path: &str, contents: &str, directories: &[&str]) -> String {
    let mut command = String::new();

    if !directories.is_empty() {
        command.push_str("mkdir -p");
        for directory in directories {
            command.push(' ');
            command.push_str(&quote(directory));
        }
        command.push_str(" && ");
    }

    command.push_str(&format!(
        "cat > {} << '{HEREDOC_DELIMITER}'\n{contents}",
        quote(path)
    ));
    if !contents.ends_with('\n') {
        command.push('\n');
    }
    command.push_str(HEREDOC_DELIMITER);

    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_single_quotes() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn joins_paths() {
        assert_eq!(join("/tmp/", "HPL.dat"), "/tmp/HPL.dat");
        assert_eq!(join("hpl_results", "sweep_1"), "hpl_results/sweep_1");
        assert_eq!(join("", "job.sh"), "job.sh");
    }

    #[test]
    fn write_command_uses_quoted_heredoc() {
        let command = write_file_command("/tmp/a b/HPL.dat", "line 1\nline 2\n", &["/tmp/a b"]);

        assert_eq!(
            command,
            "mkdir -p '/tmp/a b' && cat > '/tmp/a b/HPL.dat' << 'HPLSWEEP_EOF'\nline 1\nline 2\nHPLSWEEP_EOF"
        );
    }

    #[test]
    fn diagnostic_prefers_stderr() {
        let output = CommandOutput {
            stdout: "out\n".into(),
            stderr: " sbatch: error: invalid partition\n".into(),
            exit_code: 1,
        };
        assert_eq!(output.diagnostic(), "sbatch: error: invalid partition");

        let output = CommandOutput {
            stdout: "only stdout\n".into(),
            ..CommandOutput::default()
        };
        assert_eq!(output.diagnostic(), "only stdout");
    }
}
