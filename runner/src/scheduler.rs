//! Slurm's command line text protocol.
//!
//! Everything that knows what `sbatch`, `squeue`, `sacct` and `sinfo` print
//! lives here, the submodules only decide what to run and when.

pub mod cluster;
pub mod status;
pub mod submit;

use crate::remote::{quote, RemoteError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;

/// `%A|%T|%r|%M|%L`: job id, state, reason, time used, time left
pub const QUEUE_FORMAT: &str = "%A|%T|%r|%M|%L";
pub const ACCOUNTING_FIELDS: &str = "JobID,State,ExitCode,Elapsed";

/// what squeue prints when none of the requested ids is known anymore
const INVALID_JOB_ID: &str = "Invalid job id specified";

static ACKNOWLEDGEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Submitted batch job (\d+)").expect("acknowledgement pattern is valid")
});

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("`{command}` exited with {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("Unrecognized scheduler acknowledgement: {0:?}")]
    Acknowledgement(String),
}

impl SchedulerError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Remote(error) if error.is_connectivity())
    }
}

/// Lifecycle of one submitted job, as far as the engine knows it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobStatus {
    Submitted,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NotFound,
    /// a scheduler state word without a mapping, kept verbatim
    Unknown(String),
}

impl JobStatus {
    /// Map a scheduler state word (`%T` of squeue, `State` of sacct)
    pub fn from_scheduler(word: &str) -> Self {
        let word = word.trim();
        // sacct appends the actor, e.g. "CANCELLED by 1000"
        let head = word.split_whitespace().next().unwrap_or_default();

        match head.trim_end_matches('+') {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD"
            | "RESV_DEL_HOLD" | "SUSPENDED" | "STOPPED" | "RESIZING" => Self::Queued,
            "RUNNING" | "COMPLETING" | "SIGNALING" | "STAGE_OUT" => Self::Running,
            "COMPLETED" => Self::Completed,
            "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
            | "REVOKED" | "SPECIAL_EXIT" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            "TIMEOUT" | "DEADLINE" => Self::Timeout,
            _ => Self::Unknown(word.to_owned()),
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::NotFound => "NOT_FOUND",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobStatus {
    fn from(value: &str) -> Self {
        match value {
            "SUBMITTED" => Self::Submitted,
            "NOT_FOUND" => Self::NotFound,
            "QUEUED" => Self::Queued,
            other => Self::from_scheduler(other),
        }
    }
}

impl From<String> for JobStatus {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_owned()
    }
}

/// The scheduler's answer for one job
///
/// The live queue and the accounting database report different fields, so
/// the two views are kept apart instead of flattened into optional fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum JobObservation {
    /// still known to the live queue
    InQueue {
        state: JobStatus,
        raw_state: String,
        reason: String,
        time_used: String,
        time_left: String,
    },
    /// left the queue, answered by accounting
    Finished {
        state: JobStatus,
        raw_state: String,
        exit_code: String,
        elapsed: String,
    },
    NotFound,
}

impl JobObservation {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::InQueue { state, .. } | Self::Finished { state, .. } => state.clone(),
            Self::NotFound => JobStatus::NotFound,
        }
    }

    pub fn in_queue(&self) -> bool {
        matches!(self, Self::InQueue { .. })
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// time the job ran so far, if the scheduler reported a parsable value
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Self::InQueue { time_used, .. } => parse_elapsed(time_used),
            Self::Finished { elapsed, .. } => parse_elapsed(elapsed),
            Self::NotFound => None,
        }
    }
}

pub fn submit_command(script: &str) -> String {
    format!("sbatch {}", quote(script))
}

pub fn queue_command(ids: &[String]) -> String {
    format!("squeue -j {} -h -o '{QUEUE_FORMAT}'", ids.join(","))
}

pub fn accounting_command(ids: &[String]) -> String {
    format!(
        "sacct -j {} -n -X -o {ACCOUNTING_FIELDS} --parsable2",
        ids.join(",")
    )
}

/// Job id from sbatch's `Submitted batch job <id>`
pub fn parse_ack(stdout: &str) -> Option<String> {
    ACKNOWLEDGEMENT
        .captures(stdout)
        .map(|captures| captures[1].to_owned())
}

/// squeue answering with an error because every requested id has left the queue
pub(crate) fn is_drained_queue(stderr: &str) -> bool {
    stderr.contains(INVALID_JOB_ID)
}

fn field<'a>(fields: &[&'a str], index: usize, default: &'a str) -> &'a str {
    fields
        .get(index)
        .copied()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
}

/// One line of `squeue -o QUEUE_FORMAT`, `None` for lines without id and state
pub fn parse_queue_line(line: &str) -> Option<(String, JobObservation)> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 2 || fields[0].trim().is_empty() {
        return None;
    }

    let raw_state = fields[1].trim().to_owned();
    let observation = JobObservation::InQueue {
        state: JobStatus::from_scheduler(&raw_state),
        reason: field(&fields, 2, "").to_owned(),
        time_used: field(&fields, 3, "0:00").to_owned(),
        time_left: field(&fields, 4, "0:00").to_owned(),
        raw_state,
    };

    Some((fields[0].trim().to_owned(), observation))
}

/// One line of `sacct --parsable2 -o ACCOUNTING_FIELDS`
pub fn parse_accounting_line(line: &str) -> Option<(String, JobObservation)> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 2 || fields[0].trim().is_empty() {
        return None;
    }

    let raw_state = fields[1].trim().to_owned();
    let observation = JobObservation::Finished {
        state: JobStatus::from_scheduler(&raw_state),
        exit_code: field(&fields, 2, "0:0").to_owned(),
        elapsed: field(&fields, 3, "0:00:00").to_owned(),
        raw_state,
    };

    Some((fields[0].trim().to_owned(), observation))
}

/// Parse a Slurm time value
///
/// Accepts `M`, `M:S`, `H:M:S`, `D-H`, `D-H:M` and `D-H:M:S`. Values like
/// `UNLIMITED`, `INVALID` or `NOT_SET` have no duration.
pub fn parse_elapsed(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (days, clock) = match value.split_once('-') {
        Some((days, clock)) => (Some(days.parse::<u64>().ok()?), clock),
        None => (None, value),
    };

    let parts = clock
        .split(':')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    let (hours, minutes, seconds) = match (days.is_some(), parts.as_slice()) {
        (false, [minutes]) => (0, *minutes, 0),
        (false, [minutes, seconds]) => (0, *minutes, *seconds),
        (_, [hours, minutes, seconds]) => (*hours, *minutes, *seconds),
        (true, [hours]) => (*hours, 0, 0),
        (true, [hours, minutes]) => (*hours, *minutes, 0),
        _ => return None,
    };

    let seconds = days
        .unwrap_or(0)
        .checked_mul(86_400)?
        .checked_add(hours.checked_mul(3_600)?)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)?;

    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_scheduler_words() {
        assert_eq!(JobStatus::from_scheduler("PENDING"), JobStatus::Queued);
        assert_eq!(JobStatus::from_scheduler("COMPLETING"), JobStatus::Running);
        assert_eq!(JobStatus::from_scheduler("NODE_FAIL"), JobStatus::Failed);
        assert_eq!(
            JobStatus::from_scheduler("CANCELLED by 1000"),
            JobStatus::Cancelled
        );
        assert_eq!(JobStatus::from_scheduler("CANCELLED+"), JobStatus::Cancelled);
        assert_eq!(JobStatus::from_scheduler("DEADLINE"), JobStatus::Timeout);
        assert_eq!(
            JobStatus::from_scheduler("WEIRD"),
            JobStatus::Unknown("WEIRD".into())
        );
    }

    #[test]
    fn status_names_survive_serialization() {
        for status in [
            JobStatus::Submitted,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Timeout,
            JobStatus::NotFound,
            JobStatus::Unknown("WEIRD".into()),
        ] {
            assert_eq!(JobStatus::from(status.to_string()), status);
        }

        assert_eq!(
            serde_yaml::to_string(&JobStatus::NotFound).unwrap(),
            "NOT_FOUND\n"
        );
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::NotFound.is_terminal());
        assert!(!JobStatus::Unknown("X".into()).is_terminal());
    }

    #[test]
    fn parses_acknowledgement() {
        assert_eq!(
            parse_ack("Submitted batch job 123456\n").as_deref(),
            Some("123456")
        );
        assert_eq!(
            parse_ack("sbatch: note: x\nSubmitted batch job 9 on cluster c\n").as_deref(),
            Some("9")
        );
        assert_eq!(parse_ack("sbatch: error: invalid partition"), None);
    }

    #[test]
    fn parses_queue_lines() {
        let (id, observation) = parse_queue_line("4242|PENDING|Priority|0:00|1:00:00").unwrap();
        assert_eq!(id, "4242");
        assert_eq!(
            observation,
            JobObservation::InQueue {
                state: JobStatus::Queued,
                raw_state: "PENDING".into(),
                reason: "Priority".into(),
                time_used: "0:00".into(),
                time_left: "1:00:00".into(),
            }
        );

        let (_, observation) = parse_queue_line("7|RUNNING").unwrap();
        assert_eq!(observation.elapsed(), Some(Duration::ZERO));
        assert!(observation.in_queue());
        assert!(parse_queue_line("").is_none());
        assert!(parse_queue_line("garbage").is_none());
    }

    #[test]
    fn parses_accounting_lines() {
        let (id, observation) = parse_accounting_line("4243|COMPLETED|0:0|00:01:02").unwrap();
        assert_eq!(id, "4243");
        assert_eq!(observation.status(), JobStatus::Completed);
        assert_eq!(observation.elapsed(), Some(Duration::from_secs(62)));
        assert!(observation.is_terminal());
        assert!(!observation.in_queue());

        let (_, observation) = parse_accounting_line("4244|FAILED").unwrap();
        assert_eq!(
            observation,
            JobObservation::Finished {
                state: JobStatus::Failed,
                raw_state: "FAILED".into(),
                exit_code: "0:0".into(),
                elapsed: "0:00:00".into(),
            }
        );
    }

    #[test]
    fn builds_commands() {
        let ids = vec!["1".to_owned(), "2".to_owned()];

        assert_eq!(queue_command(&ids), "squeue -j 1,2 -h -o '%A|%T|%r|%M|%L'");
        assert_eq!(
            accounting_command(&ids),
            "sacct -j 1,2 -n -X -o JobID,State,ExitCode,Elapsed --parsable2"
        );
        assert_eq!(
            submit_command("/tmp/hplsweep_1_1/job.sh"),
            "sbatch '/tmp/hplsweep_1_1/job.sh'"
        );
    }

    #[test]
    fn parses_time_values() {
        let secs = |s| Some(Duration::from_secs(s));

        assert_eq!(parse_elapsed("5"), secs(300));
        assert_eq!(parse_elapsed("1:30"), secs(90));
        assert_eq!(parse_elapsed("01:00:00"), secs(3600));
        assert_eq!(parse_elapsed("2-00:00:01"), secs(2 * 86_400 + 1));
        assert_eq!(parse_elapsed("1-12"), secs(86_400 + 12 * 3600));
        assert_eq!(parse_elapsed("1-0:30"), secs(86_400 + 1800));
        assert_eq!(parse_elapsed("UNLIMITED"), None);
        assert_eq!(parse_elapsed(""), None);
        assert_eq!(parse_elapsed("1:2:3:4"), None);
        assert_eq!(parse_elapsed("300000000000000-00:00:00"), None);
        assert_eq!(parse_elapsed("18446744073709551615:00:00"), None);
    }
}
