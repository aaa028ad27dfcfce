use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use jobdb::config::JobDbConfig;
use jobdb::database::InMemoryJobRepository;
use jobdb::jobdb::JobDb;
use jobdb::replay::{job_state, load_fixture, JobReport, ReplayBatch};
use jobdb::shutdown::install_shutdown_handler;
use jobdb::sync::{run_sync_loop, CycleOutcome, SyncCycle, TransitionCounts};

#[derive(Parser, Debug)]
#[command(name = "jobdb")]
#[command(version)]
#[command(about = "In-memory scheduler job database and repository reconciliation")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Replay a fixture of repository changes and print the resulting transitions
    Replay(ReplayArgs),
    /// Feed a fixture to the sync loop one batch per cycle, at the configured interval
    Follow(ReplayArgs),
}

#[derive(Parser, Debug)]
struct ReplayArgs {
    /// JSON list of batches, each with `jobs` and `runs`
    fixture: PathBuf,

    /// Job database config (JSON). Defaults are used when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct BatchOutput {
    batch: usize,
    counts: TransitionCounts,
    deleted: usize,
    jobs: Vec<JobReport>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Replay(args) => run_replay(args).await,
        Commands::Follow(args) => run_follow(args).await,
    }
}

fn load_config(args: &ReplayArgs) -> Result<JobDbConfig, Box<dyn std::error::Error>> {
    Ok(match &args.config {
        Some(path) => JobDbConfig::from_json_file(path)?,
        None => JobDbConfig::default(),
    })
}

async fn run_replay(args: ReplayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let batches = load_fixture(&args.fixture)?;
    tracing::info!(batches = batches.len(), fixture = %args.fixture.display(), "Replaying fixture");

    let shutdown = install_shutdown_handler();
    let job_db = Arc::new(JobDb::new(&config)?);
    let repository = Arc::new(InMemoryJobRepository::new());
    let mut cycle = SyncCycle::new(Arc::clone(&job_db), repository.clone());

    let mut outputs = Vec::with_capacity(batches.len());
    for (i, batch) in batches.into_iter().enumerate() {
        if shutdown.is_cancelled() {
            tracing::warn!(applied = i, "Replay interrupted");
            break;
        }
        let (jobs, runs) = batch.into_records();
        repository.upsert_jobs(jobs);
        repository.upsert_runs(runs);

        let outcome = cycle.run_once()?;
        let output = batch_output(i + 1, outcome);
        match args.output {
            OutputFormat::Table => print_batch_table(&output),
            OutputFormat::Json => outputs.push(output),
        }
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outputs)?),
        OutputFormat::Table => {
            let txn = job_db.read_txn();
            println!("Jobs remaining in database: {}", txn.len());
        }
    }
    Ok(())
}

async fn run_follow(args: ReplayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let mut batches = load_fixture(&args.fixture)?.into_iter();
    let interval = config.sync.interval();
    tracing::info!(
        batches = batches.len(),
        interval_ms = config.sync.interval_ms,
        fixture = %args.fixture.display(),
        "Following fixture"
    );

    let shutdown = install_shutdown_handler();
    let job_db = Arc::new(JobDb::new(&config)?);
    let repository = Arc::new(InMemoryJobRepository::new());
    let cycle = SyncCycle::new(Arc::clone(&job_db), repository.clone());

    let feed = |batch: ReplayBatch| {
        let (jobs, runs) = batch.into_records();
        repository.upsert_jobs(jobs);
        repository.upsert_runs(runs);
    };
    if let Some(batch) = batches.next() {
        feed(batch);
    }

    let (tx, mut rx) = mpsc::channel(16);
    let handle = tokio::spawn(run_sync_loop(cycle, interval, shutdown.clone(), tx));

    let mut cycles = 0;
    let mut outputs = Vec::new();
    while let Some(outcome) = rx.recv().await {
        cycles += 1;
        if !outcome.transitions.is_empty() {
            let output = batch_output(cycles, outcome);
            match args.output {
                OutputFormat::Table => print_batch_table(&output),
                OutputFormat::Json => outputs.push(output),
            }
        }
        match batches.next() {
            Some(batch) => feed(batch),
            None => {
                shutdown.cancel();
                break;
            }
        }
    }
    drop(rx);
    handle.await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outputs)?),
        OutputFormat::Table => {
            println!("Jobs remaining in database: {}", job_db.read_txn().len());
        }
    }
    Ok(())
}

fn batch_output(batch: usize, outcome: CycleOutcome) -> BatchOutput {
    let jobs = outcome
        .transitions
        .iter()
        .map(|jst| JobReport {
            job_id: jst.job.id().to_string(),
            queue: jst.job.queue().to_string(),
            state: job_state(&jst.job),
            transitions: jst.kinds(),
            latest_run: jst.job.latest_run().map(|run| run.id().to_string()),
        })
        .collect();
    BatchOutput {
        batch,
        counts: outcome.counts,
        deleted: outcome.deleted,
        jobs,
    }
}

fn print_batch_table(output: &BatchOutput) {
    println!("Batch {}", output.batch);
    println!("{}", "=".repeat(40));
    if output.jobs.is_empty() {
        println!("No changes.");
        println!();
        return;
    }
    println!("{:<28} {:<14} {:<10} TRANSITIONS", "JOB ID", "QUEUE", "STATE");
    println!("{}", "-".repeat(78));
    for job in &output.jobs {
        let transitions = if job.transitions.is_empty() {
            "-".to_string()
        } else {
            job.transitions.join(",")
        };
        println!(
            "{:<28} {:<14} {:<10} {}",
            job.job_id, job.queue, job.state, transitions
        );
    }
    println!();
    println!(
        "{} jobs updated, {} transitions, {} removed",
        output.jobs.len(),
        output.counts.total(),
        output.deleted
    );
    println!();
}
