use super::{StoreError, SubmittedJob, Sweep, SweepId, SweepStore};
use crate::{
    config::DeploymentConfig,
    grid::{Configuration, TuningKnobs},
    scheduler::JobStatus,
};
use hplsweep_ingest::{JobInfo, ParsedResult, Verdict};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{collections::BTreeMap, path::Path};
use tracing::{debug, error, info};

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::SQLite(error)
    }
}

/// Record store in a single SQLite file
#[derive(Debug)]
pub struct SqliteStore {
    connection: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!(path = ?path, "Opening SQLite database");

        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> Result<Self, StoreError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(StoreError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(Self { connection })
    }

    fn ensure_sweep(&self, sweep: SweepId) -> Result<(), StoreError> {
        let found = self
            .connection
            .prepare_cached("select 1 from sweeps where id = ?")?
            .query_row(params![sweep as i64], |_| Ok(()))
            .optional()?;

        found.ok_or(StoreError::UnknownSweep(sweep))
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                return Err(StoreError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }
}

fn sweep_from_row(row: &Row) -> rusqlite::Result<Sweep> {
    Ok(Sweep {
        id: row.get::<_, i64>(0)? as u64,
        name: row.get(1)?,
        nodes: row.get(2)?,
        cores_per_node: row.get(3)?,
        partition: row.get(4)?,
        total_jobs: row.get::<_, i64>(5)? as u64,
        completed_jobs: row.get::<_, i64>(6)? as u64,
    })
}

fn verdict_name(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Passed => "PASSED",
        Verdict::Failed => "FAILED",
    }
}

fn verdict_from_name(name: &str) -> Option<Verdict> {
    match name {
        "PASSED" => Some(Verdict::Passed),
        "FAILED" => Some(Verdict::Failed),
        _ => None,
    }
}

fn optional_u64(value: Option<i64>) -> Option<u64> {
    value.map(|value| value as u64)
}

impl SweepStore for SqliteStore {
    fn create_sweep(
        &mut self,
        name: &str,
        deployment: &DeploymentConfig,
        configurations: &[Configuration],
    ) -> Result<Sweep, StoreError> {
        let tx = self.connection.transaction()?;

        tx.prepare_cached(
            "insert into sweeps
             (name, nodes, cores_per_node, partition, total_jobs, completed_jobs)
             values (?, ?, ?, ?, 0, 0)",
        )?
        .execute(params![
            name,
            deployment.nodes,
            deployment.cores_per_node,
            deployment.partition
        ])?;
        let id = tx.last_insert_rowid();

        for configuration in configurations {
            tx.prepare_cached(
                "insert into configurations
                 (sweep, ordinal, n, nb, p, q, knobs)
                 values (?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                id,
                configuration.ordinal,
                configuration.n as i64,
                configuration.nb as i64,
                configuration.p as i64,
                configuration.q as i64,
                serde_yaml::to_string(&configuration.knobs)?
            ])?;
        }
        tx.commit()?;

        info!(id, name, configurations = configurations.len(), "Created sweep");

        self.sweep(id as SweepId)
    }

    fn sweep(&self, sweep: SweepId) -> Result<Sweep, StoreError> {
        self.connection
            .prepare_cached(
                "select id, name, nodes, cores_per_node, partition, total_jobs, completed_jobs
                 from sweeps where id = ?",
            )?
            .query_row(params![sweep as i64], sweep_from_row)
            .optional()?
            .ok_or(StoreError::UnknownSweep(sweep))
    }

    fn sweeps(&self) -> Result<Vec<Sweep>, StoreError> {
        self.connection
            .prepare_cached(
                "select id, name, nodes, cores_per_node, partition, total_jobs, completed_jobs
                 from sweeps order by id",
            )?
            .query_map([], sweep_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok(init)
            })
    }

    fn configurations(&self, sweep: SweepId) -> Result<Vec<Configuration>, StoreError> {
        self.ensure_sweep(sweep)?;

        let rows = self
            .connection
            .prepare_cached(
                "select ordinal, n, nb, p, q, knobs from configurations
                 where sweep = ? order by ordinal",
            )?
            .query_map(params![sweep as i64], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<_, StoreError>(init)
            })?;

        rows.into_iter()
            .map(|(ordinal, n, nb, p, q, knobs)| {
                Ok::<_, StoreError>(Configuration {
                    ordinal,
                    n: n as u64,
                    nb: nb as u64,
                    p: p as u64,
                    q: q as u64,
                    knobs: serde_yaml::from_str::<TuningKnobs>(&knobs)?,
                })
            })
            .collect()
    }

    fn record_job(
        &mut self,
        sweep: SweepId,
        ordinal: u32,
        job_id: &str,
    ) -> Result<(), StoreError> {
        self.ensure_sweep(sweep)?;

        let tx = self.connection.transaction()?;
        let existing = tx
            .prepare_cached("select 1 from jobs where sweep = ? and ordinal = ?")?
            .query_row(params![sweep as i64, ordinal], |_| Ok(()))
            .optional()?;

        tx.prepare_cached(
            "insert into jobs (sweep, ordinal, job_id, status) values (?, ?, ?, ?)
             on conflict (sweep, ordinal) do update set
             job_id = excluded.job_id, status = excluded.status",
        )?
        .execute(params![
            sweep as i64,
            ordinal,
            job_id,
            JobStatus::Submitted.as_str()
        ])?;

        if existing.is_none() {
            tx.prepare_cached("update sweeps set total_jobs = total_jobs + 1 where id = ?")?
                .execute(params![sweep as i64])?;
        }
        tx.commit()?;

        debug!(sweep, ordinal, job_id, "Recorded job");

        Ok(())
    }

    fn jobs(&self, sweep: SweepId) -> Result<Vec<SubmittedJob>, StoreError> {
        self.ensure_sweep(sweep)?;

        self.connection
            .prepare_cached(
                "select ordinal, job_id, status from jobs where sweep = ? order by ordinal",
            )?
            .query_map(params![sweep as i64], |row| {
                Ok(SubmittedJob {
                    ordinal: row.get(0)?,
                    job_id: row.get(1)?,
                    status: JobStatus::from(row.get::<_, String>(2)?),
                })
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok(init)
            })
    }

    fn update_status(
        &mut self,
        sweep: SweepId,
        ordinal: u32,
        status: &JobStatus,
    ) -> Result<bool, StoreError> {
        let current = self
            .connection
            .prepare_cached("select status from jobs where sweep = ? and ordinal = ?")?
            .query_row(params![sweep as i64, ordinal], |row| row.get::<_, String>(0))
            .optional()?
            .map(JobStatus::from)
            .ok_or(StoreError::UnknownJob { sweep, ordinal })?;

        if current.is_terminal() || &current == status {
            return Ok(false);
        }

        self.connection
            .prepare_cached("update jobs set status = ? where sweep = ? and ordinal = ?")?
            .execute(params![status.as_str(), sweep as i64, ordinal])?;

        debug!(sweep, ordinal, from = %current, to = %status, "Updated job status");

        Ok(true)
    }

    fn store_result(
        &mut self,
        sweep: SweepId,
        ordinal: u32,
        result: &ParsedResult,
    ) -> Result<(), StoreError> {
        self.ensure_sweep(sweep)?;

        let tx = self.connection.transaction()?;
        let existing = tx
            .prepare_cached("select 1 from results where sweep = ? and ordinal = ?")?
            .query_row(params![sweep as i64, ordinal], |_| Ok(()))
            .optional()?;

        tx.prepare_cached(
            "insert into results
             (sweep, ordinal, n, nb, p, q, time, gflops, residual_check, passed,
              error_message, job_info)
             values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             on conflict (sweep, ordinal) do update set
             n = excluded.n, nb = excluded.nb, p = excluded.p, q = excluded.q,
             time = excluded.time, gflops = excluded.gflops,
             residual_check = excluded.residual_check, passed = excluded.passed,
             error_message = excluded.error_message, job_info = excluded.job_info",
        )?
        .execute(params![
            sweep as i64,
            ordinal,
            result.n.map(|n| n as i64),
            result.nb.map(|nb| nb as i64),
            result.p.map(|p| p as i64),
            result.q.map(|q| q as i64),
            result.time,
            result.gflops,
            result.residual_check.map(verdict_name),
            result.passed,
            result.error_message,
            serde_yaml::to_string(&result.job_info)?
        ])?;

        if existing.is_none() {
            tx.prepare_cached("update sweeps set completed_jobs = completed_jobs + 1 where id = ?")?
                .execute(params![sweep as i64])?;
        }
        tx.commit()?;

        debug!(sweep, ordinal, "Stored result");

        Ok(())
    }

    fn results(&self, sweep: SweepId) -> Result<BTreeMap<u32, ParsedResult>, StoreError> {
        self.ensure_sweep(sweep)?;

        let rows = self
            .connection
            .prepare_cached(
                "select ordinal, n, nb, p, q, time, gflops, residual_check, passed,
                        error_message, job_info
                 from results where sweep = ? order by ordinal",
            )?
            .query_map(params![sweep as i64], |row| {
                let result = ParsedResult {
                    n: optional_u64(row.get(1)?),
                    nb: optional_u64(row.get(2)?),
                    p: optional_u64(row.get(3)?),
                    q: optional_u64(row.get(4)?),
                    time: row.get(5)?,
                    gflops: row.get(6)?,
                    residual_check: row
                        .get::<_, Option<String>>(7)?
                        .as_deref()
                        .and_then(verdict_from_name),
                    passed: row.get(8)?,
                    error_message: row.get(9)?,
                    job_info: JobInfo::default(),
                };

                Ok((row.get::<_, u32>(0)?, result, row.get::<_, String>(10)?))
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<_, StoreError>(init)
            })?;

        rows.into_iter()
            .map(|(ordinal, mut result, job_info)| {
                result.job_info = serde_yaml::from_str(&job_info)?;

                Ok::<_, StoreError>((ordinal, result))
            })
            .collect()
    }
}

pub const SQL_SCHEMA: [&str; 4] = [
    "create table if not exists sweeps (
    id integer primary key,
    name text not null,
    nodes integer not null,
    cores_per_node integer not null,
    partition text not null,
    total_jobs integer not null default 0,
    completed_jobs integer not null default 0
);",
    "create table if not exists configurations (
    sweep integer not null references sweeps (id),
    ordinal integer not null,
    n integer not null,
    nb integer not null,
    p integer not null,
    q integer not null,
    knobs text not null,
    primary key (sweep, ordinal)
);",
    "create table if not exists jobs (
    sweep integer not null references sweeps (id),
    ordinal integer not null,
    job_id text not null,
    status text not null,
    primary key (sweep, ordinal)
);",
    "create table if not exists results (
    sweep integer not null references sweeps (id),
    ordinal integer not null,
    n integer,
    nb integer,
    p integer,
    q integer,
    time real,
    gflops real,
    residual_check text,
    passed integer not null,
    error_message text,
    job_info text not null,
    primary key (sweep, ordinal)
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
