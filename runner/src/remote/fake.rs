//! In-process stand-in for a cluster.
//!
//! `FakePort` answers commands from scripted responses matched by prefix,
//! keeps a virtual file system that here-document writes land in, and records
//! every command so tests can count round trips.

use super::{CommandOutput, RemoteError, RemotePort, HEREDOC_DELIMITER};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Default)]
struct Rule {
    prefix: String,
    // the last response is repeated once the queue would run empty
    responses: VecDeque<CommandOutput>,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    files: BTreeMap<String, Vec<u8>>,
    unreadable: BTreeSet<String>,
    log: Vec<String>,
    disconnected: bool,
    // drop the link right after answering a command with this prefix
    disconnect_after: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakePort {
    state: Mutex<State>,
}

impl FakePort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`
    ///
    /// Several responses for the same prefix are served in order.
    pub fn respond(&self, prefix: &str, output: CommandOutput) -> &Self {
        let mut state = self.state.lock();

        match state.rules.iter_mut().find(|rule| rule.prefix == prefix) {
            Some(rule) => rule.responses.push_back(output),
            None => state.rules.push(Rule {
                prefix: prefix.to_owned(),
                responses: VecDeque::from([output]),
            }),
        }

        self
    }

    /// Shorthand for a successful response printing `stdout`
    pub fn respond_ok(&self, prefix: &str, stdout: &str) -> &Self {
        self.respond(
            prefix,
            CommandOutput {
                stdout: stdout.to_owned(),
                ..CommandOutput::default()
            },
        )
    }

    /// Shorthand for a failing response printing `stderr`
    pub fn respond_err(&self, prefix: &str, exit_code: i32, stderr: &str) -> &Self {
        self.respond(
            prefix,
            CommandOutput {
                stderr: stderr.to_owned(),
                exit_code,
                ..CommandOutput::default()
            },
        )
    }

    pub fn add_file(&self, path: &str, contents: impl Into<Vec<u8>>) -> &Self {
        self.state
            .lock()
            .files
            .insert(path.to_owned(), contents.into());
        self
    }

    /// Reads of `path` fail in transport although the file exists
    pub fn unreadable(&self, path: &str) -> &Self {
        let mut state = self.state.lock();
        state.files.entry(path.to_owned()).or_default();
        state.unreadable.insert(path.to_owned());

        self
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state
            .lock()
            .files
            .get(path)
            .map(|contents| String::from_utf8_lossy(contents).into_owned())
    }

    /// Make every following call fail with a connectivity error
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    /// Answer the next command starting with `prefix`, then disconnect
    pub fn disconnect_after(&self, prefix: &str) -> &Self {
        self.state.lock().disconnect_after = Some(prefix.to_owned());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// number of recorded commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }
}

impl State {
    fn check_connected(&self) -> Result<(), RemoteError> {
        if self.disconnected {
            Err(RemoteError::Disconnected("fake port disconnected".to_owned()))
        } else {
            Ok(())
        }
    }

    fn scripted(&mut self, command: &str) -> Option<CommandOutput> {
        let rule = self
            .rules
            .iter_mut()
            .find(|rule| command.starts_with(&rule.prefix))?;

        if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        }
    }

    /// Apply a write produced by `write_file_command`
    fn apply_write(&mut self, command: &str) -> bool {
        let Some((header, body)) = command.split_once('\n') else {
            return false;
        };
        let Some(start) = header.find("cat > ") else {
            return false;
        };
        let Some(target) = header[start + 6..].split(" << ").next() else {
            return false;
        };
        let Some(contents) = body.strip_suffix(HEREDOC_DELIMITER) else {
            return false;
        };

        let path = target.trim_matches('\'').replace(r"'\''", "'");
        self.files.insert(path, contents.as_bytes().to_vec());

        true
    }
}

impl RemotePort for FakePort {
    fn execute(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.log.push(command.to_owned());

        let drops = state
            .disconnect_after
            .as_deref()
            .is_some_and(|prefix| command.starts_with(prefix));
        if drops {
            state.disconnect_after = None;
            state.disconnected = true;
        }

        if let Some(output) = state.scripted(command) {
            return Ok(output);
        }

        state.apply_write(command);

        Ok(CommandOutput::default())
    }

    fn file_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.log.push(format!("test -f {path}"));

        Ok(state.files.contains_key(path))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.log.push(format!("cat -- {path}"));

        if state.unreadable.contains(path) {
            return Err(RemoteError::Transport(format!(
                "cat: {path}: Permission denied"
            )));
        }

        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_owned()))
    }
}
