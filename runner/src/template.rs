//! Rendering of the two artifacts staged for every job.
//!
//! The input deck is positional: the benchmark reads it line by line, so the
//! order and presence of every line below matters. The first column is the
//! value, everything after it is ignored by the benchmark.

use crate::{
    config::{DeploymentConfig, LayoutConfig, Stream},
    grid::Configuration,
    remote::quote,
};
use std::fmt::{Display, Write};

/// marker lines the probe job prints, checked after it ran
pub const PROBE_HOSTS_MARKER: &str = "Running hostname on all nodes:";
pub const PROBE_DONE_MARKER: &str = "=== Test Complete ===";

fn line(deck: &mut String, value: impl Display, label: &str) {
    // writing into a String cannot fail
    let _ = writeln!(deck, "{:<12} {label}", value.to_string());
}

/// Input deck (`HPL.dat`) for one configuration
pub fn render_deck(configuration: &Configuration) -> String {
    let knobs = &configuration.knobs;
    let mut deck = String::with_capacity(1536);

    deck.push_str("HPLinpack benchmark input file\n");
    deck.push_str("Innovative Computing Laboratory, University of Tennessee\n");
    line(&mut deck, "HPL.out", "output file name (if any)");
    line(&mut deck, 6, "device out (6=stdout,7=stderr,file)");
    line(&mut deck, 1, "# of problems sizes (N)");
    line(&mut deck, configuration.n, "Ns");
    line(&mut deck, 1, "# of NBs");
    line(&mut deck, configuration.nb, "NBs");
    line(&mut deck, 0, "PMAP process mapping (0=Row-,1=Column-major)");
    line(&mut deck, 1, "# of process grids (P x Q)");
    line(&mut deck, configuration.p, "Ps");
    line(&mut deck, configuration.q, "Qs");
    line(&mut deck, "16.0", "threshold");
    line(&mut deck, 1, "# of panel fact");
    line(&mut deck, knobs.pfact as u8, "PFACTs (0=left, 1=Crout, 2=Right)");
    line(&mut deck, 1, "# of recursive stopping criterium");
    line(&mut deck, knobs.nbmin, "NBMINs (>= 1)");
    line(&mut deck, 1, "# of panels in recursion");
    line(&mut deck, knobs.ndiv, "NDIVs");
    line(&mut deck, 1, "# of recursive panel fact.");
    line(&mut deck, knobs.rfact as u8, "RFACTs (0=left, 1=Crout, 2=Right)");
    line(&mut deck, 1, "# of broadcast");
    line(
        &mut deck,
        knobs.bcast as u8,
        "BCASTs (0=1rg,1=1rM,2=2rg,3=2rM,4=Lng,5=LnM)",
    );
    line(&mut deck, 1, "# of lookahead depth");
    line(&mut deck, knobs.depth, "DEPTHs (>=0)");
    line(&mut deck, knobs.swap as u8, "SWAP (0=bin-exch,1=long,2=mix)");
    line(&mut deck, knobs.swap_threshold, "swapping threshold");
    line(
        &mut deck,
        knobs.l1 as u8,
        "L1 in (0=transposed,1=no-transposed) form",
    );
    line(
        &mut deck,
        knobs.u as u8,
        "U  in (0=transposed,1=no-transposed) form",
    );
    line(&mut deck, u8::from(knobs.equil), "Equilibration (0=no,1=yes)");
    line(&mut deck, knobs.align, "memory alignment in double (> 0)");

    deck
}

pub fn job_name(sweep: u64, ordinal: u32) -> String {
    format!("hpl_sweep_{sweep}_{ordinal}")
}

/// Batch script running one configuration from its staged work directory
pub fn render_script(
    configuration: &Configuration,
    deployment: &DeploymentConfig,
    layout: &LayoutConfig,
    sweep: u64,
) -> String {
    let ordinal = configuration.ordinal;
    let nodes = deployment.nodes;
    let tasks = deployment.cores_per_node;
    let partition = &deployment.partition;

    format!(
        r#"#!/bin/bash
#SBATCH --job-name={job_name}
#SBATCH --nodes={nodes}
#SBATCH --ntasks-per-node={tasks}
#SBATCH --partition={partition}
#SBATCH --time={time_limit}
#SBATCH --output={output}
#SBATCH --error={error}

# HPL parameter sweep {sweep}, configuration {ordinal}
# N={n}, NB={nb}, P={p}, Q={q}

echo "=== HPL Benchmark Job ==="
echo "Job ID: $SLURM_JOB_ID"
echo "Hostname: $(hostname)"
echo "Date: $(date)"
echo "Nodes: {nodes}"
echo "Tasks per node: {tasks}"
echo "Total MPI processes: {processes}"
echo "Partition: {partition}"
echo ""
echo "HPL Configuration:"
echo "  N  = {n}"
echo "  NB = {nb}"
echo "  P  = {p}"
echo "  Q  = {q}"
echo ""

cd {work_dir} || exit 1
echo "Starting HPL benchmark..."
{launcher} -np {processes} {executable}
rc=$?

echo ""
echo "Exit code: $rc"
echo "=== HPL Job Complete ==="
echo "Completed at: $(date)"
exit $rc
"#,
        job_name = job_name(sweep, ordinal),
        time_limit = deployment.time_limit,
        output = layout.output_path(sweep, ordinal, Stream::Output),
        error = layout.output_path(sweep, ordinal, Stream::Error),
        n = configuration.n,
        nb = configuration.nb,
        p = configuration.p,
        q = configuration.q,
        processes = deployment.total_processes(),
        work_dir = quote(&layout.work_dir(sweep, ordinal)),
        launcher = deployment.launcher,
        executable = deployment.executable,
    )
}

/// Short job checking that the allocation works at all
pub fn render_probe_script(deployment: &DeploymentConfig) -> String {
    let tasks = deployment.cores_per_node;
    let partition = &deployment.partition;

    format!(
        r#"#!/bin/bash
#SBATCH --job-name=hpl_test
#SBATCH --nodes={nodes}
#SBATCH --ntasks-per-node={tasks}
#SBATCH --partition={partition}
#SBATCH --time=00:02:00
#SBATCH --output=hplsweep_probe_%j.out

echo "=== HPL-Sweep Test Job ==="
echo "Hostname: $(hostname)"
echo "Date: $(date)"
echo "Nodes allocated: $SLURM_JOB_NUM_NODES"
echo "Tasks per node: {tasks}"
echo "Partition: {partition}"
echo ""
echo "{PROBE_HOSTS_MARKER}"
srun hostname
echo ""
echo "{PROBE_DONE_MARKER}"
"#,
        nodes = deployment.nodes,
    )
}

/// Output file of a probe job, relative to the submission directory
pub fn probe_output_path(job_id: &str) -> String {
    format!("hplsweep_probe_{job_id}.out")
}
