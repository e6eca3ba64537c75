use super::{
    parse_ack, status::{PollPolicy, Reconciler}, submit_command, JobStatus, SchedulerError,
};
use crate::{
    config::{DeploymentConfig, LayoutConfig},
    remote::{quote, write_file_command, CommandOutput, RemoteError, RemotePort},
    template::{probe_output_path, render_probe_script, PROBE_DONE_MARKER, PROBE_HOSTS_MARKER},
};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

const PARTITIONS: &str = "sinfo -h -o '%P'";
const VERSION: &str = "sinfo --version";
const NODE_COUNTS: &str = "sinfo -h -o '%D'";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub slurm_version: Option<String>,
    pub total_nodes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub job_id: String,
    /// last state seen before the output was checked
    pub state: JobStatus,
    pub passed: bool,
    pub output: String,
}

fn checked(command: &str, output: CommandOutput) -> Result<CommandOutput, SchedulerError> {
    if output.success() {
        Ok(output)
    } else {
        Err(SchedulerError::Command {
            command: command.to_owned(),
            code: output.exit_code,
            stderr: output.diagnostic(),
        })
    }
}

/// Partition names, default marker stripped, first occurrence kept
pub fn partitions<P: RemotePort + ?Sized>(port: &P) -> Result<Vec<String>, SchedulerError> {
    let output = checked(PARTITIONS, port.execute(PARTITIONS)?)?;

    Ok(output
        .stdout
        .lines()
        .map(|line| line.trim().replace('*', ""))
        .filter(|partition| !partition.is_empty())
        .unique()
        .collect())
}

/// Best effort summary, fields the cluster doesn't answer stay empty
pub fn cluster_info<P: RemotePort + ?Sized>(port: &P) -> Result<ClusterInfo, SchedulerError> {
    let mut info = ClusterInfo::default();

    let output = port.execute(VERSION)?;
    if output.success() {
        info.slurm_version = Some(output.stdout.trim().to_owned());
    }

    let output = port.execute(NODE_COUNTS)?;
    if output.success() {
        info.total_nodes = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.parse::<u64>().ok())
            .sum();
    }

    debug!(?info, "Queried cluster");

    Ok(info)
}

/// Submit a short `hostname` job with the sweep's allocation and check it ran
///
/// Script and output are removed afterwards, whatever the outcome.
#[instrument(skip_all, level = "info")]
pub fn probe<P: RemotePort + ?Sized>(
    port: &P,
    deployment: &DeploymentConfig,
    layout: &LayoutConfig,
    policy: PollPolicy,
) -> Result<ProbeReport, SchedulerError> {
    let script_path = layout.probe_script_path();
    let write = write_file_command(
        &script_path,
        &render_probe_script(deployment),
        &[&layout.staging_dir],
    );
    checked(&write, port.execute(&write)?)?;

    let submit = submit_command(&script_path);
    let output = checked(&submit, port.execute(&submit)?)?;
    let job_id = parse_ack(&output.stdout)
        .ok_or_else(|| SchedulerError::Acknowledgement(output.stdout.trim().to_owned()))?;
    info!(job_id = %job_id, "Submitted probe job");

    let state = Reconciler::new(port).wait_for(&job_id, policy)?.status();

    let output_path = probe_output_path(&job_id);
    let output = match port.read_file(&output_path) {
        Ok(contents) => String::from_utf8_lossy(&contents).into_owned(),
        Err(RemoteError::NotFound(_)) => {
            warn!(job_id = %job_id, "Probe job left no output");
            String::new()
        }
        Err(error) if error.is_connectivity() => return Err(error.into()),
        Err(error) => {
            warn!(job_id = %job_id, "Failed to read probe output: {error}");
            String::new()
        }
    };

    let passed = output.contains(PROBE_HOSTS_MARKER) && output.contains(PROBE_DONE_MARKER);

    let cleanup = format!("rm -f {} {}", quote(&script_path), quote(&output_path));
    let result = port.execute(&cleanup)?;
    if !result.success() {
        warn!("Failed to clean up after probe job: {}", result.diagnostic());
    }

    info!(job_id = %job_id, state = %state, passed, "Probe job done");

    Ok(ProbeReport {
        job_id,
        state,
        passed,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deployment() -> DeploymentConfig {
        DeploymentConfig {
            nodes: 2,
            cores_per_node: 8,
            partition: "debug".into(),
            time_limit: "00:10:00".into(),
            executable: "xhpl".into(),
            launcher: "mpirun".into(),
        }
    }

    fn policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::ZERO,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn lists_partitions() {
        let port = crate::remote::FakePort::new();
        port.respond_ok(PARTITIONS, "compute*\ndebug\ncompute\ngpu\n\n");

        assert_eq!(partitions(&port).unwrap(), ["compute", "debug", "gpu"]);
    }

    #[test]
    fn partitions_fail_on_error() {
        let port = crate::remote::FakePort::new();
        port.respond_err(PARTITIONS, 1, "sinfo: error: cannot contact controller");

        assert!(matches!(
            partitions(&port),
            Err(SchedulerError::Command { code: 1, .. })
        ));
    }

    #[test]
    fn summarizes_cluster() {
        let port = crate::remote::FakePort::new();
        port.respond_ok(VERSION, "slurm 23.02.7\n")
            .respond_ok(NODE_COUNTS, "4\n12\n");

        assert_eq!(
            cluster_info(&port).unwrap(),
            ClusterInfo {
                slurm_version: Some("slurm 23.02.7".into()),
                total_nodes: Some(16),
            }
        );
    }

    #[test]
    fn garbled_node_counts_are_unknown() {
        let port = crate::remote::FakePort::new();
        port.respond_err(VERSION, 127, "sinfo: command not found")
            .respond_ok(NODE_COUNTS, "4\nn/a\n");

        assert_eq!(cluster_info(&port).unwrap(), ClusterInfo::default());
    }

    #[test]
    fn probe_checks_output_and_cleans_up() {
        let port = crate::remote::FakePort::new();
        port.respond_ok("sbatch", "Submitted batch job 77\n")
            .respond_ok("squeue", "")
            .respond_ok("sacct", "77|COMPLETED|0:0|00:00:04\n")
            .add_file(
                "hplsweep_probe_77.out",
                format!("=== HPL-Sweep Test Job ===\n{PROBE_HOSTS_MARKER}\nnode1\nnode2\n\n{PROBE_DONE_MARKER}\n"),
            );

        let report = probe(&port, &deployment(), &LayoutConfig::default(), policy()).unwrap();

        assert_eq!(report.job_id, "77");
        assert_eq!(report.state, JobStatus::Completed);
        assert!(report.passed);
        assert!(port
            .file("/tmp/hplsweep_probe.sh")
            .unwrap()
            .contains("#SBATCH --partition=debug"));
        assert_eq!(
            port.commands().last().unwrap(),
            "rm -f '/tmp/hplsweep_probe.sh' 'hplsweep_probe_77.out'"
        );
    }

    #[test]
    fn probe_without_output_fails() {
        let port = crate::remote::FakePort::new();
        port.respond_ok("sbatch", "Submitted batch job 78\n")
            .respond_ok("squeue", "")
            .respond_ok("sacct", "78|FAILED|1:0|00:00:01\n");

        let report = probe(&port, &deployment(), &LayoutConfig::default(), policy()).unwrap();

        assert_eq!(report.state, JobStatus::Failed);
        assert!(!report.passed);
        assert!(report.output.is_empty());
    }

    #[test]
    fn unreadable_output_still_cleans_up() {
        let port = crate::remote::FakePort::new();
        port.respond_ok("sbatch", "Submitted batch job 79\n")
            .respond_ok("squeue", "")
            .respond_ok("sacct", "79|COMPLETED|0:0|00:00:02\n")
            .unreadable("hplsweep_probe_79.out");

        let report = probe(&port, &deployment(), &LayoutConfig::default(), policy()).unwrap();

        assert_eq!(report.state, JobStatus::Completed);
        assert!(!report.passed);
        assert_eq!(
            port.commands().last().unwrap(),
            "rm -f '/tmp/hplsweep_probe.sh' 'hplsweep_probe_79.out'"
        );
    }

    #[test]
    fn probe_rejects_unparseable_acknowledgement() {
        let port = crate::remote::FakePort::new();
        port.respond_ok("sbatch", "queued\n");

        assert!(matches!(
            probe(&port, &deployment(), &LayoutConfig::default(), policy()),
            Err(SchedulerError::Acknowledgement(_))
        ));
    }
}
