use super::{parse_ack, submit_command, SchedulerError};
use crate::{
    config::{DeploymentConfig, LayoutConfig},
    grid::Configuration,
    remote::{write_file_command, RemoteError, RemotePort},
    template::{render_deck, render_script},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Why a single configuration did not make it into the queue
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionFailure {
    #[error("Failed to stage {file}: {reason}")]
    Staging { file: String, reason: String },
    #[error("sbatch failed: {0}")]
    Submission(String),
    #[error("sbatch answered without a job id: {0:?}")]
    UnparseableAck(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionOutcome {
    pub ordinal: u32,
    /// scheduler job id on success
    pub result: Result<String, SubmissionFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmissionReport {
    pub submitted: usize,
    pub failed: usize,
    /// one per configuration, in submission order
    pub outcomes: Vec<SubmissionOutcome>,
}

impl SubmissionReport {
    /// (ordinal, job id) of every accepted configuration
    pub fn job_ids(&self) -> impl Iterator<Item = (u32, &str)> {
        self.outcomes.iter().filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .ok()
                .map(|id| (outcome.ordinal, id.as_str()))
        })
    }
}

/// Channel loss in the middle of a batch
///
/// `report` holds the outcomes up to the configuration that ran into the
/// lost channel, so the jobs already queued can still be recorded.
#[derive(Error, Debug)]
#[error("Submission aborted after {} accepted configurations", .report.submitted)]
pub struct SubmissionAborted {
    pub report: SubmissionReport,
    #[source]
    pub error: SchedulerError,
}

/// Stages and submits the configurations of one sweep
pub struct Submitter<'a, P: RemotePort + ?Sized> {
    port: &'a P,
    deployment: &'a DeploymentConfig,
    layout: &'a LayoutConfig,
}

impl<'a, P: RemotePort + ?Sized> Submitter<'a, P> {
    pub fn new(port: &'a P, deployment: &'a DeploymentConfig, layout: &'a LayoutConfig) -> Self {
        Self {
            port,
            deployment,
            layout,
        }
    }

    /// Submit `configurations` strictly in order
    ///
    /// A failure of one configuration is recorded in the report and the rest
    /// is still processed. Only losing the channel aborts the call.
    #[instrument(skip(self, configurations), fields(configurations = configurations.len()), level = "info")]
    pub fn submit(
        &self,
        sweep: u64,
        configurations: &[Configuration],
    ) -> Result<SubmissionReport, SubmissionAborted> {
        let mut report = SubmissionReport::default();

        for configuration in configurations {
            let ordinal = configuration.ordinal;
            let result = match self.submit_one(sweep, configuration) {
                Ok(result) => result,
                Err(error) => {
                    warn!(
                        sweep,
                        ordinal,
                        submitted = report.submitted,
                        "Lost the cluster while submitting: {error}"
                    );
                    return Err(SubmissionAborted { report, error });
                }
            };

            match &result {
                Ok(job_id) => {
                    info!(sweep, ordinal, job_id = %job_id, "Submitted configuration");
                    report.submitted += 1;
                }
                Err(failure) => {
                    warn!(sweep, ordinal, "Failed to submit configuration: {failure}");
                    report.failed += 1;
                }
            }

            report.outcomes.push(SubmissionOutcome { ordinal, result });
        }

        info!(
            submitted = report.submitted,
            failed = report.failed,
            "Done with submission"
        );

        Ok(report)
    }

    fn submit_one(
        &self,
        sweep: u64,
        configuration: &Configuration,
    ) -> Result<Result<String, SubmissionFailure>, SchedulerError> {
        let ordinal = configuration.ordinal;
        let work_dir = self.layout.work_dir(sweep, ordinal);
        let results_dir = self.layout.sweep_results_dir(sweep);

        let deck_path = self.layout.deck_path(sweep, ordinal);
        let deck = render_deck(configuration);
        if let Err(failure) = self.stage(&deck_path, &deck, &[&work_dir, &results_dir])? {
            return Ok(Err(failure));
        }

        let script_path = self.layout.script_path(sweep, ordinal);
        let script = render_script(configuration, self.deployment, self.layout, sweep);
        if let Err(failure) = self.stage(&script_path, &script, &[])? {
            return Ok(Err(failure));
        }
        debug!(sweep, ordinal, "Staged deck and script");

        let output = match self.port.execute(&submit_command(&script_path)) {
            Ok(output) => output,
            Err(error) => return transient(error, SubmissionFailure::Submission),
        };

        if !output.success() {
            return Ok(Err(SubmissionFailure::Submission(output.diagnostic())));
        }

        Ok(parse_ack(&output.stdout)
            .ok_or_else(|| SubmissionFailure::UnparseableAck(output.stdout.trim().to_owned())))
    }

    fn stage(
        &self,
        path: &str,
        contents: &str,
        directories: &[&str],
    ) -> Result<Result<(), SubmissionFailure>, SchedulerError> {
        let staging = |reason| SubmissionFailure::Staging {
            file: path.to_owned(),
            reason,
        };

        match self
            .port
            .execute(&write_file_command(path, contents, directories))
        {
            Ok(output) if output.success() => Ok(Ok(())),
            Ok(output) => Ok(Err(staging(output.diagnostic()))),
            Err(error) => transient(error, staging),
        }
    }
}

/// Connectivity errors abort, everything else only fails the current item
fn transient<T>(
    error: RemoteError,
    failure: impl FnOnce(String) -> SubmissionFailure,
) -> Result<Result<T, SubmissionFailure>, SchedulerError> {
    if error.is_connectivity() {
        Err(error.into())
    } else {
        Ok(Err(failure(error.to_string())))
    }
}
