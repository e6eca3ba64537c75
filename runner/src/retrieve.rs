//! Fetching and parsing the captured output of finished jobs.

use crate::{
    config::{LayoutConfig, Stream},
    remote::{quote, RemoteError, RemotePort},
};
use hplsweep_ingest::{parse_output, ParsedResult};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Outcome of looking for one job's output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Retrieval {
    /// the job hasn't written its output file yet
    NotYetAvailable,
    Available {
        result: ParsedResult,
        stderr: Option<String>,
    },
}

impl Retrieval {
    pub fn result(&self) -> Option<&ParsedResult> {
        match self {
            Self::Available { result, .. } => Some(result),
            Self::NotYetAvailable => None,
        }
    }
}

pub struct Retriever<'a, P: RemotePort + ?Sized> {
    port: &'a P,
    layout: &'a LayoutConfig,
}

impl<'a, P: RemotePort + ?Sized> Retriever<'a, P> {
    pub fn new(port: &'a P, layout: &'a LayoutConfig) -> Self {
        Self { port, layout }
    }

    /// Fetch and parse the output of one configuration
    pub fn retrieve(&self, sweep: u64, ordinal: u32) -> Result<Retrieval, RemoteError> {
        let output_path = self.layout.output_path(sweep, ordinal, Stream::Output);

        if !self.port.file_exists(&output_path)? {
            debug!(sweep, ordinal, "No output yet");
            return Ok(Retrieval::NotYetAvailable);
        }

        let contents = match self.port.read_file(&output_path) {
            Ok(contents) => contents,
            Err(RemoteError::NotFound(_)) => return Ok(Retrieval::NotYetAvailable),
            Err(error) => return Err(error),
        };
        let result = parse_output(&String::from_utf8_lossy(&contents));

        let error_path = self.layout.output_path(sweep, ordinal, Stream::Error);
        let stderr = if self.port.file_exists(&error_path)? {
            match self.port.read_file(&error_path) {
                Ok(contents) => Some(String::from_utf8_lossy(&contents).into_owned())
                    .filter(|stderr| !stderr.trim().is_empty()),
                Err(error) if error.is_connectivity() => return Err(error),
                Err(error) => {
                    warn!(sweep, ordinal, "Failed to read error stream: {error}");
                    None
                }
            }
        } else {
            None
        };

        debug!(sweep, ordinal, gflops = ?result.gflops, passed = result.passed, "Parsed output");

        Ok(Retrieval::Available { result, stderr })
    }

    /// Retrieve several configurations on the rayon pool
    ///
    /// Results keep the order of `ordinals`. A single failed retrieval stays
    /// in its slot, losing the channel fails the whole call.
    #[instrument(skip(self, ordinals), fields(jobs = ordinals.len()), level = "info")]
    pub fn retrieve_all(
        &self,
        sweep: u64,
        ordinals: &[u32],
    ) -> Result<Vec<(u32, Result<Retrieval, RemoteError>)>, RemoteError> {
        let results: Vec<_> = ordinals
            .par_iter()
            .map(|&ordinal| (ordinal, self.retrieve(sweep, ordinal)))
            .collect();

        let mut retrievals = Vec::with_capacity(results.len());
        for (ordinal, result) in results {
            match result {
                Err(error) if error.is_connectivity() => return Err(error),
                result => retrievals.push((ordinal, result)),
            }
        }

        let available = retrievals
            .iter()
            .filter(|(_, result)| matches!(result, Ok(Retrieval::Available { .. })))
            .count();
        info!(available, total = retrievals.len(), "Retrieved results");

        Ok(retrievals)
    }

    /// File names in the results directory of `sweep`, empty if there is none
    pub fn list_result_files(&self, sweep: u64) -> Result<Vec<String>, RemoteError> {
        let directory = self.layout.sweep_results_dir(sweep);
        let output = self.port.execute(&format!("ls -1 {}", quote(&directory)))?;

        if !output.success() {
            debug!(directory, "Results directory not readable: {}", output.diagnostic());
            return Ok(Vec::new());
        }

        let mut files: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        files.sort();

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FakePort;

    const OUTPUT: &str = "\
Job ID: 900
Hostname: node001
================================================================================
T/V                N    NB     P     Q               Time                 Gflops
--------------------------------------------------------------------------------
WR00L2L2       20000   192     2     4              98.12              5.437e+01
||Ax-b||_oo/(eps*(||A||_oo*||x||_oo+||b||_oo)*N)=   0.0031 ...... PASSED
";

    #[test]
    fn missing_output_is_not_yet_available() {
        let port = FakePort::new();
        let layout = LayoutConfig::default();

        assert_eq!(
            Retriever::new(&port, &layout).retrieve(1, 1).unwrap(),
            Retrieval::NotYetAvailable
        );
    }

    #[test]
    fn parses_available_output() {
        let port = FakePort::new();
        port.add_file("hpl_results/sweep_1/config_2.out", OUTPUT)
            .add_file("hpl_results/sweep_1/config_2.err", "warning: slow interconnect\n");
        let layout = LayoutConfig::default();

        let Retrieval::Available { result, stderr } =
            Retriever::new(&port, &layout).retrieve(1, 2).unwrap()
        else {
            panic!("output should be available");
        };

        assert_eq!(result.n, Some(20000));
        assert_eq!(result.gflops, Some(54.37));
        assert!(result.passed);
        assert_eq!(result.job_info.job_id.as_deref(), Some("900"));
        assert_eq!(stderr.as_deref(), Some("warning: slow interconnect\n"));
    }

    #[test]
    fn empty_error_stream_is_dropped() {
        let port = FakePort::new();
        port.add_file("hpl_results/sweep_1/config_1.out", OUTPUT)
            .add_file("hpl_results/sweep_1/config_1.err", "\n");
        let layout = LayoutConfig::default();

        let retrieval = Retriever::new(&port, &layout).retrieve(1, 1).unwrap();

        assert!(matches!(retrieval, Retrieval::Available { stderr: None, .. }));
    }

    #[test]
    fn missing_error_stream_is_not_read() {
        let port = FakePort::new();
        port.add_file("hpl_results/sweep_1/config_4.out", OUTPUT);
        let layout = LayoutConfig::default();

        let retrieval = Retriever::new(&port, &layout).retrieve(1, 4).unwrap();

        assert!(matches!(retrieval, Retrieval::Available { stderr: None, .. }));
        assert_eq!(port.count("test -f hpl_results/sweep_1/config_4.err"), 1);
        assert_eq!(port.count("cat -- hpl_results/sweep_1/config_4.err"), 0);
    }

    #[test]
    fn unreadable_error_stream_is_skipped() {
        let port = FakePort::new();
        port.add_file("hpl_results/sweep_1/config_5.out", OUTPUT)
            .unreadable("hpl_results/sweep_1/config_5.err");
        let layout = LayoutConfig::default();

        let retrieval = Retriever::new(&port, &layout).retrieve(1, 5).unwrap();

        assert_eq!(retrieval.result().unwrap().gflops, Some(54.37));
        assert!(matches!(retrieval, Retrieval::Available { stderr: None, .. }));
    }

    #[test]
    fn retrieves_in_order() {
        let port = FakePort::new();
        port.add_file("hpl_results/sweep_3/config_1.out", OUTPUT)
            .add_file("hpl_results/sweep_3/config_3.out", "Job ID: 1\nerror: MPI_Init failed\n");
        let layout = LayoutConfig::default();

        let retrievals = Retriever::new(&port, &layout)
            .retrieve_all(3, &[1, 2, 3])
            .unwrap();

        let ordinals: Vec<_> = retrievals.iter().map(|(ordinal, _)| *ordinal).collect();
        assert_eq!(ordinals, [1, 2, 3]);
        assert!(retrievals[0].1.as_ref().unwrap().result().unwrap().passed);
        assert_eq!(retrievals[1].1.as_ref().unwrap(), &Retrieval::NotYetAvailable);

        let failed = retrievals[2].1.as_ref().unwrap().result().unwrap();
        assert!(failed.is_failed());
        assert_eq!(failed.error_message.as_deref(), Some("error: MPI_Init failed"));
    }

    #[test]
    fn connectivity_loss_fails_collection() {
        let port = FakePort::new();
        port.disconnect();
        let layout = LayoutConfig::default();

        assert!(Retriever::new(&port, &layout)
            .retrieve_all(1, &[1, 2])
            .unwrap_err()
            .is_connectivity());
    }

    #[test]
    fn lists_files() {
        let port = FakePort::new();
        port.respond_ok(
            "ls -1 'hpl_results/sweep_4'",
            "config_2.out\nconfig_1.out\nconfig_1.err\n",
        )
        .respond_err("ls -1 'hpl_results/sweep_5'", 2, "ls: cannot access");
        let layout = LayoutConfig::default();
        let retriever = Retriever::new(&port, &layout);

        assert_eq!(
            retriever.list_result_files(4).unwrap(),
            ["config_1.err", "config_1.out", "config_2.out"]
        );
        assert!(retriever.list_result_files(5).unwrap().is_empty());
    }
}
