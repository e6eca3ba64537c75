use crate::{
    grid::{ParameterRange, DEFAULT_MAX_COMBINATIONS},
    remote::join,
    scheduler::{parse_elapsed, status::PollPolicy},
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config contains errors, see the log for details")]
    Invalid,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    // how to reach the cluster, omitted means the local shell
    #[serde(default)]
    pub cluster: ClusterConfig,
    // resources every job of the sweep asks for
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    pub sweep: SweepSection,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub collect: CollectConfig,

    #[serde(alias = "db", default)]
    pub database: DatabaseConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    /// seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// seconds, applies to every single remote command
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            port: None,
            identity: None,
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    pub nodes: u32,
    pub cores_per_node: u32,
    pub partition: String,
    #[serde(default = "default_time_limit")]
    pub time_limit: String,
    // path to the benchmark binary on the cluster
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default = "default_launcher")]
    pub launcher: String,
}

impl DeploymentConfig {
    pub fn total_processes(&self) -> u64 {
        u64::from(self.nodes) * u64::from(self.cores_per_node)
    }
}

/// Which of the two captured streams of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Output,
    Error,
}

impl Stream {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Output => "out",
            Self::Error => "err",
        }
    }
}

/// Remote file system layout
///
/// Relative paths are resolved against the directory remote commands start
/// in, which is the home directory for ssh.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LayoutConfig {
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            results_dir: default_results_dir(),
        }
    }
}

impl LayoutConfig {
    /// directory holding the staged input deck and script of one configuration
    pub fn work_dir(&self, sweep: u64, ordinal: u32) -> String {
        join(&self.staging_dir, &format!("hplsweep_{sweep}_{ordinal}"))
    }

    pub fn deck_path(&self, sweep: u64, ordinal: u32) -> String {
        join(&self.work_dir(sweep, ordinal), "HPL.dat")
    }

    pub fn script_path(&self, sweep: u64, ordinal: u32) -> String {
        join(&self.work_dir(sweep, ordinal), "job.sh")
    }

    pub fn sweep_results_dir(&self, sweep: u64) -> String {
        join(&self.results_dir, &format!("sweep_{sweep}"))
    }

    pub fn output_path(&self, sweep: u64, ordinal: u32, stream: Stream) -> String {
        join(
            &self.sweep_results_dir(sweep),
            &format!("config_{ordinal}.{}", stream.extension()),
        )
    }

    pub fn probe_script_path(&self) -> String {
        join(&self.staging_dir, "hplsweep_probe.sh")
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SweepSection {
    pub name: String,
    #[serde(default = "default_max_combinations")]
    pub max_combinations: usize,
    pub range: ParameterRange,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    /// seconds between two status queries
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    /// seconds until waiting gives up
    #[serde(default = "default_poll_timeout")]
    pub timeout: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            timeout: default_poll_timeout(),
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.interval),
            timeout: Duration::from_secs(self.timeout),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct CollectConfig {
    // size of the retrieval thread pool, defaults to rayon's choice
    pub threads: Option<usize>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let contents = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Check the whole config, logging every problem found
    ///
    /// Returns true if at least one error was found.
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.cluster.host.is_none() {
            warn!("cluster.host is not set, scheduler commands will run in the local shell");
        }
        if self.cluster.command_timeout == 0 {
            error!("cluster.command_timeout cannot be 0, every remote command would time out");
            contains_error = true;
        }

        let deployment = &self.deployment;
        if deployment.nodes == 0 || deployment.cores_per_node == 0 {
            error!(
                "deployment.nodes ({}) and deployment.cores_per_node ({}) must both be positive",
                deployment.nodes, deployment.cores_per_node
            );
            contains_error = true;
        }
        if deployment.partition.trim().is_empty() {
            error!("deployment.partition must name a scheduler partition");
            contains_error = true;
        }
        if parse_elapsed(&deployment.time_limit).is_none() {
            error!(
                "deployment.time_limit '{}' is not a scheduler time specification",
                deployment.time_limit
            );
            contains_error = true;
        }
        if deployment.executable.trim().is_empty() {
            error!("deployment.executable must point to the benchmark binary");
            contains_error = true;
        }

        for problem in self.sweep.range.check() {
            error!("sweep.range: {problem}");
            contains_error = true;
        }
        if self.sweep.max_combinations == 0 {
            warn!("sweep.max_combinations is 0, no configuration will be generated");
        }

        if self.poll.interval > self.poll.timeout {
            warn!(
                "poll.interval ({}s) exceeds poll.timeout ({}s), waiting will query only once",
                self.poll.interval, self.poll.timeout
            );
        }
        if self.collect.threads == Some(0) {
            error!("collect.threads cannot be 0");
            contains_error = true;
        }

        contains_error
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    120
}

fn default_time_limit() -> String {
    "01:00:00".to_owned()
}

fn default_executable() -> String {
    "xhpl".to_owned()
}

fn default_launcher() -> String {
    "mpirun".to_owned()
}

fn default_staging_dir() -> String {
    "/tmp".to_owned()
}

fn default_results_dir() -> String {
    "hpl_results".to_owned()
}

fn default_max_combinations() -> usize {
    DEFAULT_MAX_COMBINATIONS
}

fn default_poll_interval() -> u64 {
    2
}

fn default_poll_timeout() -> u64 {
    60
}

fn default_database_path() -> PathBuf {
    PathBuf::from("hplsweep.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
deployment:
  nodes: 2
  cores_per_node: 2
  partition: compute
sweep:
  name: smoke
  range:
    n_start: 10000
    n_end: 20000
    n_step: 10000
    nb_values: [128, 256]
    p_values: [2]
    q_values: [2]
";

    #[test]
    fn fills_defaults() {
        let config: SweepConfig = serde_yaml::from_str(MINIMAL).unwrap();

        assert_eq!(config.deployment.time_limit, "01:00:00");
        assert_eq!(config.deployment.executable, "xhpl");
        assert_eq!(config.deployment.total_processes(), 4);
        assert_eq!(config.sweep.max_combinations, 100);
        assert_eq!(config.layout.staging_dir, "/tmp");
        assert_eq!(config.database.path, PathBuf::from("hplsweep.db"));
        assert!(config.cluster.host.is_none());
        assert!(!config.preflight_checks());
    }

    #[test]
    fn rejects_unknown_fields() {
        let config = format!("{MINIMAL}bogus: 1\n");

        assert!(serde_yaml::from_str::<SweepConfig>(&config).is_err());
    }

    #[test]
    fn preflight_flags_errors() {
        let mut config: SweepConfig = serde_yaml::from_str(MINIMAL).unwrap();
        config.deployment.nodes = 0;
        config.deployment.time_limit = "soon".into();

        assert!(config.preflight_checks());
    }

    #[test]
    fn layout_paths() {
        let layout = LayoutConfig::default();

        assert_eq!(layout.deck_path(7, 3), "/tmp/hplsweep_7_3/HPL.dat");
        assert_eq!(layout.script_path(7, 3), "/tmp/hplsweep_7_3/job.sh");
        assert_eq!(
            layout.output_path(7, 3, Stream::Output),
            "hpl_results/sweep_7/config_3.out"
        );
        assert_eq!(
            layout.output_path(7, 3, Stream::Error),
            "hpl_results/sweep_7/config_3.err"
        );
    }
}
