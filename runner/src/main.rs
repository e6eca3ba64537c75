use clap::{Parser, Subcommand};
use hplsweep_runner::{
    config::{ConfigErrors, SweepConfig},
    database::{
        apply_observations, record_submissions, StoreError, SweepId, SweepSnapshot, SweepStore,
    },
    grid::{generate, recommended_block_sizes, recommended_grids, validate, GridError},
    remote::{RemoteError, ShellPort},
    retrieve::{Retrieval, Retriever},
    scheduler::{
        cluster::{cluster_info, partitions, probe},
        status::Reconciler,
        submit::{SubmissionAborted, Submitter},
        SchedulerError,
    },
    template::{render_deck, render_script},
};
#[cfg(feature = "rusqlite")]
use hplsweep_runner::database::SqliteStore;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::exit,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(author, version, about = "Parameter sweeps of HPL on a Slurm cluster")]
struct Cli {
    /// sweep configuration file
    #[arg(short, long, default_value = "hplsweep.yaml")]
    config: PathBuf,

    /// -v for debug, -vv for trace output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the configurations the sweep section expands to
    Generate,
    /// Check every generated configuration against the deployment
    Validate,
    /// Process grids and block sizes worth trying
    Recommend {
        /// defaults to nodes * cores_per_node of the deployment
        processes: Option<u64>,
    },
    /// Print input deck and batch script of one configuration
    Render {
        ordinal: u32,
        #[arg(long, default_value_t = 0)]
        sweep: SweepId,
    },
    /// Partitions, Slurm version and node count of the cluster
    Cluster,
    /// Run a short hostname job with the configured allocation
    Probe,
    /// Create a sweep and submit all of its configurations
    Submit,
    /// Reconcile the jobs of a sweep with the scheduler
    Status { sweep: SweepId },
    /// Poll a single job until it left the queue
    Wait { job: String },
    /// Fetch and store the results of a sweep
    Collect { sweep: SweepId },
    /// Status histogram and best result of a sweep
    Summary {
        sweep: SweepId,
        /// reconcile with the scheduler before summarizing
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Aborted(#[from] SubmissionAborted),
    #[error("Failed to write output")]
    Output(#[from] serde_yaml::Error),
    #[error("No configuration with ordinal {0}")]
    UnknownOrdinal(u32),
}

#[derive(Serialize)]
struct Validation {
    ordinal: u32,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    problem: Option<String>,
}

#[derive(Serialize)]
struct Recommendation<'a> {
    processes: u64,
    grids: Vec<(u64, u64)>,
    block_sizes: &'a [u64],
}

#[derive(Serialize)]
struct Rendered {
    deck: String,
    script: String,
}

#[derive(Serialize)]
struct Collected {
    ordinal: u32,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    gflops: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn emit<T: Serialize>(value: &T) -> Result<(), CliError> {
    print!("{}", serde_yaml::to_string(value)?);

    Ok(())
}

fn load_config(path: &Path) -> Result<SweepConfig, CliError> {
    let config = SweepConfig::load(path)?;

    if config.preflight_checks() {
        return Err(ConfigErrors::Invalid.into());
    }

    Ok(config)
}

#[cfg(feature = "rusqlite")]
fn open_store(config: &SweepConfig) -> Result<Box<dyn SweepStore>, CliError> {
    Ok(Box::new(SqliteStore::open(&config.database.path)?))
}

#[cfg(not(feature = "rusqlite"))]
fn open_store(config: &SweepConfig) -> Result<Box<dyn SweepStore>, CliError> {
    warn!(
        path = ?config.database.path,
        "Built without SQLite support, nothing will be persisted"
    );

    Ok(Box::new(hplsweep_runner::database::MemoryStore::new()))
}

fn run(cli: Cli) -> Result<(), CliError> {
    if let Command::Recommend {
        processes: Some(processes),
    } = cli.command
    {
        return emit(&Recommendation {
            processes,
            grids: recommended_grids(processes),
            block_sizes: recommended_block_sizes(),
        });
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Generate => {
            emit(&generate(&config.sweep.range, config.sweep.max_combinations)?)
        }
        Command::Validate => {
            let deployment = &config.deployment;
            let validations: Vec<Validation> =
                generate(&config.sweep.range, config.sweep.max_combinations)?
                    .iter()
                    .map(|configuration| {
                        let problem =
                            validate(configuration, deployment.nodes, deployment.cores_per_node)
                                .err()
                                .map(|problem| problem.to_string());

                        Validation {
                            ordinal: configuration.ordinal,
                            valid: problem.is_none(),
                            problem,
                        }
                    })
                    .collect();

            emit(&validations)
        }
        Command::Recommend { .. } => {
            let processes = config.deployment.total_processes();

            emit(&Recommendation {
                processes,
                grids: recommended_grids(processes),
                block_sizes: recommended_block_sizes(),
            })
        }
        Command::Render { ordinal, sweep } => {
            let configurations = generate(&config.sweep.range, config.sweep.max_combinations)?;
            let configuration = configurations
                .iter()
                .find(|configuration| configuration.ordinal == ordinal)
                .ok_or(CliError::UnknownOrdinal(ordinal))?;

            emit(&Rendered {
                deck: render_deck(configuration),
                script: render_script(configuration, &config.deployment, &config.layout, sweep),
            })
        }
        Command::Cluster => {
            let port = ShellPort::connect(&config.cluster)?;
            let info = cluster_info(&port)?;

            emit(&BTreeMap::from([
                ("partitions", serde_yaml::to_value(partitions(&port)?)?),
                ("slurm_version", serde_yaml::to_value(info.slurm_version)?),
                ("total_nodes", serde_yaml::to_value(info.total_nodes)?),
            ]))
        }
        Command::Probe => {
            let port = ShellPort::connect(&config.cluster)?;
            let report = probe(
                &port,
                &config.deployment,
                &config.layout,
                config.poll.policy(),
            )?;

            if !report.passed {
                warn!(job_id = %report.job_id, "Probe job did not complete as expected");
            }

            emit(&report)
        }
        Command::Submit => {
            let configurations = generate(&config.sweep.range, config.sweep.max_combinations)?;
            for configuration in &configurations {
                if let Err(problem) = validate(
                    configuration,
                    config.deployment.nodes,
                    config.deployment.cores_per_node,
                ) {
                    warn!(ordinal = configuration.ordinal, "Questionable configuration: {problem}");
                }
            }

            let port = ShellPort::connect(&config.cluster)?;
            let mut store = open_store(&config)?;
            let sweep =
                store.create_sweep(&config.sweep.name, &config.deployment, &configurations)?;

            let report = match Submitter::new(&port, &config.deployment, &config.layout)
                .submit(sweep.id, &configurations)
            {
                Ok(report) => report,
                Err(aborted) => {
                    // keep what made it into the queue
                    record_submissions(&mut *store, sweep.id, &aborted.report)?;
                    warn!(
                        sweep = sweep.id,
                        recorded = aborted.report.submitted,
                        "Recorded the jobs submitted before the abort"
                    );
                    return Err(aborted.into());
                }
            };
            record_submissions(&mut *store, sweep.id, &report)?;

            info!(sweep = sweep.id, "Submitted sweep");

            emit(&BTreeMap::from([
                ("sweep", serde_yaml::to_value(sweep.id)?),
                ("report", serde_yaml::to_value(&report)?),
            ]))
        }
        Command::Status { sweep } => {
            let port = ShellPort::connect(&config.cluster)?;
            let mut store = open_store(&config)?;
            let ids = SweepSnapshot::load(&*store, sweep)?.job_ids();

            let observations = Reconciler::new(&port).reconcile(&ids)?;
            apply_observations(&mut *store, sweep, &observations)?;

            emit(&observations)
        }
        Command::Wait { job } => {
            let port = ShellPort::connect(&config.cluster)?;
            let observation = Reconciler::new(&port).wait_for(&job, config.poll.policy())?;

            emit(&observation)
        }
        Command::Collect { sweep } => {
            if let Some(threads) = config.collect.threads {
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build_global()
                    .unwrap_or_log();
            }

            let port = ShellPort::connect(&config.cluster)?;
            let mut store = open_store(&config)?;
            let ordinals: Vec<u32> = store.jobs(sweep)?.iter().map(|job| job.ordinal).collect();

            let mut collected = Vec::with_capacity(ordinals.len());
            for (ordinal, retrieval) in
                Retriever::new(&port, &config.layout).retrieve_all(sweep, &ordinals)?
            {
                let row = match retrieval {
                    Ok(Retrieval::Available { result, stderr }) => {
                        store.store_result(sweep, ordinal, &result)?;

                        let outcome = if result.passed {
                            "passed"
                        } else if result.is_incomplete() {
                            "incomplete"
                        } else {
                            "failed"
                        };

                        Collected {
                            ordinal,
                            outcome,
                            gflops: result.gflops,
                            detail: result.error_message.or(stderr),
                        }
                    }
                    Ok(Retrieval::NotYetAvailable) => Collected {
                        ordinal,
                        outcome: "not yet available",
                        gflops: None,
                        detail: None,
                    },
                    Err(error) => {
                        warn!(ordinal, "Failed to retrieve result: {error}");

                        Collected {
                            ordinal,
                            outcome: "error",
                            gflops: None,
                            detail: Some(error.to_string()),
                        }
                    }
                };

                collected.push(row);
            }

            emit(&collected)
        }
        Command::Summary { sweep, refresh } => {
            let mut store = open_store(&config)?;
            let mut observations = BTreeMap::new();

            if refresh {
                let port = ShellPort::connect(&config.cluster)?;
                let ids = SweepSnapshot::load(&*store, sweep)?.job_ids();
                observations = Reconciler::new(&port).reconcile(&ids)?;
                apply_observations(&mut *store, sweep, &observations)?;
            }

            let snapshot = SweepSnapshot::load(&*store, sweep)?;
            let summary = snapshot.summarize(&observations);

            emit(&BTreeMap::from([
                ("sweep", serde_yaml::to_value(&snapshot.sweep)?),
                ("summary", serde_yaml::to_value(&summary)?),
            ]))
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run(cli) {
        error!(error = ?error, "{error}");

        exit(1);
    }
}
