use super::{
    accounting_command, is_drained_queue, parse_accounting_line, parse_queue_line,
    queue_command, JobObservation, SchedulerError,
};
use crate::remote::{CommandOutput, RemotePort};
use itertools::Itertools;
use std::{
    collections::{BTreeMap, BTreeSet},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// How often and how long to poll a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Merges the live queue and the accounting view of a batch of jobs
pub struct Reconciler<'a, P: RemotePort + ?Sized> {
    port: &'a P,
}

impl<'a, P: RemotePort + ?Sized> Reconciler<'a, P> {
    pub fn new(port: &'a P) -> Self {
        Self { port }
    }

    /// Observe every job in `ids`
    ///
    /// Asks the live queue about the whole batch first and accounting only
    /// about the ids the queue no longer knows, so the call costs at most two
    /// round trips. Ids neither view knows are `NotFound`.
    #[instrument(skip(self, ids), fields(jobs = ids.len()), level = "debug")]
    pub fn reconcile(
        &self,
        ids: &[String],
    ) -> Result<BTreeMap<String, JobObservation>, SchedulerError> {
        let mut observations = BTreeMap::new();
        let ids = ids.iter().unique().cloned().collect_vec();

        if ids.is_empty() {
            return Ok(observations);
        }

        let requested: BTreeSet<&str> = ids.iter().map(String::as_str).collect();

        let command = queue_command(&ids);
        let output = self.port.execute(&command)?;
        if output.success() {
            for (id, observation) in output.stdout.lines().filter_map(parse_queue_line) {
                if requested.contains(id.as_str()) {
                    observations.entry(id).or_insert(observation);
                }
            }
        } else if is_drained_queue(&output.stderr) {
            trace!("None of the requested jobs is still queued");
        } else {
            return Err(command_error(command, output));
        }

        let remaining = ids
            .iter()
            .filter(|id| !observations.contains_key(*id))
            .cloned()
            .collect_vec();
        debug!(
            in_queue = observations.len(),
            remaining = remaining.len(),
            "Queried live queue"
        );

        if !remaining.is_empty() {
            let command = accounting_command(&remaining);
            let output = self.port.execute(&command)?;
            if !output.success() {
                return Err(command_error(command, output));
            }

            for (id, observation) in output.stdout.lines().filter_map(parse_accounting_line) {
                if remaining.contains(&id) {
                    // allocations only, the first line of a job is the authoritative one
                    observations.entry(id).or_insert(observation);
                }
            }

            for id in remaining {
                observations.entry(id).or_insert(JobObservation::NotFound);
            }
        }

        Ok(observations)
    }

    /// Observe a single job
    pub fn observe(&self, id: &str) -> Result<JobObservation, SchedulerError> {
        let mut observations = self.reconcile(&[id.to_owned()])?;

        Ok(observations.remove(id).unwrap_or(JobObservation::NotFound))
    }

    /// Poll `id` until it left the queue or `policy.timeout` passed
    ///
    /// Returns the last observation either way, callers check `in_queue()`.
    #[instrument(skip(self), level = "info")]
    pub fn wait_for(&self, id: &str, policy: PollPolicy) -> Result<JobObservation, SchedulerError> {
        let start = Instant::now();

        loop {
            let observation = self.observe(id)?;

            if !observation.in_queue() {
                info!(job_id = id, status = %observation.status(), "Job left the queue");
                return Ok(observation);
            }

            if start.elapsed() + policy.interval > policy.timeout {
                warn!(
                    job_id = id,
                    status = %observation.status(),
                    "Gave up waiting after {:?}",
                    start.elapsed()
                );
                return Ok(observation);
            }

            trace!(job_id = id, status = %observation.status(), "Still queued");
            thread::sleep(policy.interval);
        }
    }
}

fn command_error(command: String, output: CommandOutput) -> SchedulerError {
    SchedulerError::Command {
        command,
        code: output.exit_code,
        stderr: output.diagnostic(),
    }
}
