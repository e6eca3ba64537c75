//! Persistence of sweeps, submitted jobs and parsed results.

#[cfg(feature = "rusqlite")]
mod sqlite;

#[cfg(feature = "rusqlite")]
pub use sqlite::SqliteStore;

use crate::{
    config::DeploymentConfig,
    grid::Configuration,
    scheduler::{submit::SubmissionReport, JobObservation, JobStatus},
};
use hplsweep_analysis::{summarize, SweepEntry, SweepSummary};
use hplsweep_ingest::ParsedResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type SweepId = u64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unknown sweep {0}")]
    UnknownSweep(SweepId),
    #[error("Sweep {sweep} has no job for configuration {ordinal}")]
    UnknownJob { sweep: SweepId, ordinal: u32 },
    #[cfg(feature = "rusqlite")]
    #[error("SQLite operation failed")]
    SQLite(rusqlite::Error),
    #[error("Failed to (de)serialize a stored value")]
    Serialize(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sweep {
    pub id: SweepId,
    pub name: String,
    pub nodes: u32,
    pub cores_per_node: u32,
    pub partition: String,
    /// jobs accepted by the scheduler
    pub total_jobs: u64,
    /// jobs with a stored result
    pub completed_jobs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub ordinal: u32,
    pub job_id: String,
    pub status: JobStatus,
}

/// The record store behind the engine
///
/// Terminal job states are sticky: once a job is stored as completed, failed,
/// cancelled or timed out, `update_status` leaves it alone.
pub trait SweepStore {
    fn create_sweep(
        &mut self,
        name: &str,
        deployment: &DeploymentConfig,
        configurations: &[Configuration],
    ) -> Result<Sweep, StoreError>;

    fn sweep(&self, sweep: SweepId) -> Result<Sweep, StoreError>;

    fn sweeps(&self) -> Result<Vec<Sweep>, StoreError>;

    /// ordered by ordinal
    fn configurations(&self, sweep: SweepId) -> Result<Vec<Configuration>, StoreError>;

    /// Record that `ordinal` was accepted as `job_id`
    ///
    /// Recording an ordinal again replaces its job and resets it to submitted.
    fn record_job(&mut self, sweep: SweepId, ordinal: u32, job_id: &str)
        -> Result<(), StoreError>;

    /// ordered by ordinal
    fn jobs(&self, sweep: SweepId) -> Result<Vec<SubmittedJob>, StoreError>;

    /// Returns whether the stored status changed
    fn update_status(
        &mut self,
        sweep: SweepId,
        ordinal: u32,
        status: &JobStatus,
    ) -> Result<bool, StoreError>;

    /// Store or overwrite the parsed result of `ordinal`
    fn store_result(
        &mut self,
        sweep: SweepId,
        ordinal: u32,
        result: &ParsedResult,
    ) -> Result<(), StoreError>;

    fn results(&self, sweep: SweepId) -> Result<BTreeMap<u32, ParsedResult>, StoreError>;
}

/// Record every accepted configuration of `report`
pub fn record_submissions<S: SweepStore + ?Sized>(
    store: &mut S,
    sweep: SweepId,
    report: &SubmissionReport,
) -> Result<usize, StoreError> {
    let mut recorded = 0;

    for (ordinal, job_id) in report.job_ids() {
        store.record_job(sweep, ordinal, job_id)?;
        recorded += 1;
    }

    debug!(sweep, recorded, "Recorded submitted jobs");

    Ok(recorded)
}

/// Write reconciled states back, returns how many jobs changed
pub fn apply_observations<S: SweepStore + ?Sized>(
    store: &mut S,
    sweep: SweepId,
    observations: &BTreeMap<String, JobObservation>,
) -> Result<usize, StoreError> {
    let mut changed = 0;

    for job in store.jobs(sweep)? {
        let Some(observation) = observations.get(&job.job_id) else {
            continue;
        };

        if store.update_status(sweep, job.ordinal, &observation.status())? {
            changed += 1;
        }
    }

    info!(sweep, changed, "Applied job states");

    Ok(changed)
}

/// Everything stored about one sweep
#[derive(Debug, Clone)]
pub struct SweepSnapshot {
    pub sweep: Sweep,
    pub configurations: Vec<Configuration>,
    pub jobs: Vec<SubmittedJob>,
    pub results: BTreeMap<u32, ParsedResult>,
}

impl SweepSnapshot {
    pub fn load<S: SweepStore + ?Sized>(store: &S, sweep: SweepId) -> Result<Self, StoreError> {
        Ok(Self {
            sweep: store.sweep(sweep)?,
            configurations: store.configurations(sweep)?,
            jobs: store.jobs(sweep)?,
            results: store.results(sweep)?,
        })
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.job_id.clone()).collect()
    }

    /// Summarize the submitted jobs, preferring `reconciled` states
    ///
    /// A terminal stored status is final and is never replaced by a fresher
    /// observation.
    pub fn summarize<'a>(
        &'a self,
        reconciled: &BTreeMap<String, JobObservation>,
    ) -> SweepSummary<'a, Configuration, JobStatus> {
        let entries = self.jobs.iter().filter_map(|job| {
            let Some(configuration) = self
                .configurations
                .iter()
                .find(|configuration| configuration.ordinal == job.ordinal)
            else {
                warn!(ordinal = job.ordinal, "Job without configuration");
                return None;
            };

            Some(SweepEntry {
                configuration,
                persisted: job.status.clone(),
                reconciled: reconciled
                    .get(&job.job_id)
                    .filter(|_| !job.status.is_terminal())
                    .map(JobObservation::status),
                result: self.results.get(&job.ordinal),
            })
        });

        summarize(entries)
    }
}

#[derive(Debug)]
struct SweepRecord {
    sweep: Sweep,
    configurations: Vec<Configuration>,
    jobs: BTreeMap<u32, SubmittedJob>,
    results: BTreeMap<u32, ParsedResult>,
}

/// Store living only as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    sweeps: BTreeMap<SweepId, SweepRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, sweep: SweepId) -> Result<&SweepRecord, StoreError> {
        self.sweeps
            .get(&sweep)
            .ok_or(StoreError::UnknownSweep(sweep))
    }

    fn record_mut(&mut self, sweep: SweepId) -> Result<&mut SweepRecord, StoreError> {
        self.sweeps
            .get_mut(&sweep)
            .ok_or(StoreError::UnknownSweep(sweep))
    }
}

impl SweepStore for MemoryStore {
    fn create_sweep(
        &mut self,
        name: &str,
        deployment: &DeploymentConfig,
        configurations: &[Configuration],
    ) -> Result<Sweep, StoreError> {
        let id = self.sweeps.keys().next_back().map_or(1, |last| last + 1);
        let sweep = Sweep {
            id,
            name: name.to_owned(),
            nodes: deployment.nodes,
            cores_per_node: deployment.cores_per_node,
            partition: deployment.partition.clone(),
            total_jobs: 0,
            completed_jobs: 0,
        };

        let mut configurations = configurations.to_vec();
        configurations.sort_by_key(|configuration| configuration.ordinal);

        self.sweeps.insert(
            id,
            SweepRecord {
                sweep: sweep.clone(),
                configurations,
                jobs: BTreeMap::new(),
                results: BTreeMap::new(),
            },
        );

        Ok(sweep)
    }

    fn sweep(&self, sweep: SweepId) -> Result<Sweep, StoreError> {
        Ok(self.record(sweep)?.sweep.clone())
    }

    fn sweeps(&self) -> Result<Vec<Sweep>, StoreError> {
        Ok(self
            .sweeps
            .values()
            .map(|record| record.sweep.clone())
            .collect())
    }

    fn configurations(&self, sweep: SweepId) -> Result<Vec<Configuration>, StoreError> {
        Ok(self.record(sweep)?.configurations.clone())
    }

    fn record_job(
        &mut self,
        sweep: SweepId,
        ordinal: u32,
        job_id: &str,
    ) -> Result<(), StoreError> {
        let record = self.record_mut(sweep)?;
        let job = SubmittedJob {
            ordinal,
            job_id: job_id.to_owned(),
            status: JobStatus::Submitted,
        };

        if record.jobs.insert(ordinal, job).is_none() {
            record.sweep.total_jobs += 1;
        }

        Ok(())
    }

    fn jobs(&self, sweep: SweepId) -> Result<Vec<SubmittedJob>, StoreError> {
        Ok(self.record(sweep)?.jobs.values().cloned().collect())
    }

    fn update_status(
        &mut self,
        sweep: SweepId,
        ordinal: u32,
        status: &JobStatus,
    ) -> Result<bool, StoreError> {
        let job = self
            .record_mut(sweep)?
            .jobs
            .get_mut(&ordinal)
            .ok_or(StoreError::UnknownJob { sweep, ordinal })?;

        if job.status.is_terminal() || &job.status == status {
            return Ok(false);
        }

        job.status = status.clone();

        Ok(true)
    }

    fn store_result(
        &mut self,
        sweep: SweepId,
        ordinal: u32,
        result: &ParsedResult,
    ) -> Result<(), StoreError> {
        let record = self.record_mut(sweep)?;

        if record.results.insert(ordinal, result.clone()).is_none() {
            record.sweep.completed_jobs += 1;
        }

        Ok(())
    }

    fn results(&self, sweep: SweepId) -> Result<BTreeMap<u32, ParsedResult>, StoreError> {
        Ok(self.record(sweep)?.results.clone())
    }
}
