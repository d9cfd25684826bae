//! codebook CLI - classify texts with an LLM and measure agreement.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use codebook::batch::{BatchManager, JobState};
use codebook::classify::build_requests;
use codebook::client::LLMClient;
use codebook::dataset::{
    SampleSize, dataset_name, load_labeled, load_labels, load_texts, sample_file, write_json,
    write_report, write_results,
};
use codebook::models::{ClassificationRequest, Config, LabelMode, LabelSet};
use codebook::pool::{CancelFlag, LiveEngine, LiveProgress, LiveSettings};
use codebook::reliability::{Normalize, compute_reliability};
use codebook::store::{JobRecord, JobStore};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "codebook")]
#[command(version)]
#[command(about = "Classify texts against a label vocabulary with an LLM, live or in batch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Inputs shared by the live and batch submission commands.
#[derive(clap::Args)]
struct ClassifyArgs {
    /// Label vocabulary: one label per line, or a JSON array
    #[arg(short, long)]
    labels: Option<PathBuf>,

    /// Texts: JSONL (`text`, optional `id`) or plain text, one per line
    #[arg(short, long)]
    texts: PathBuf,

    /// Label mode: single, multi or open (keyword extraction)
    #[arg(short, long, default_value = "single")]
    mode: LabelMode,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify texts synchronously with a bounded worker pool
    Live {
        #[command(flatten)]
        input: ClassifyArgs,

        /// Path to output JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// Override `live.concurrency`
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Manage asynchronous batch jobs
    Batch {
        #[command(subcommand)]
        action: BatchCommand,
    },

    /// Compare two labeled datasets: percent agreement and Cohen's kappa
    Reliability {
        /// First labeled JSONL dataset (e.g. model output)
        dataset_a: PathBuf,

        /// Second labeled JSONL dataset (e.g. human coding)
        dataset_b: PathBuf,

        /// Write the full report (matrix and joined rows) as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the matrix as a grid scaled per row, per column or overall
        #[arg(long, default_value = "none")]
        normalize: Normalize,

        /// Clear cells where both datasets agree before scaling
        #[arg(long)]
        zero_diag: bool,
    },

    /// Draw a random subset of a texts file, e.g. for a pilot run
    Sample {
        /// Texts file (JSONL or plain text)
        input: PathBuf,

        /// Path to output file
        #[arg(short, long)]
        output: PathBuf,

        /// Number of items to keep
        #[arg(long, conflicts_with = "percent", required_unless_present = "percent")]
        rows: Option<usize>,

        /// Share of items to keep, 0-100
        #[arg(long)]
        percent: Option<f64>,

        /// Seed for a reproducible draw
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Upload a manifest and create a batch job
    Submit {
        #[command(flatten)]
        input: ClassifyArgs,
    },

    /// Refresh one job, or every job the local store still considers ongoing
    Status { job_id: Option<String> },

    /// Download results of a completed job
    Retrieve {
        job_id: String,

        /// Path to output JSONL file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Request cancellation of a job
    Cancel { job_id: String },

    /// Explain why a job failed: job errors and the per-request error file
    Failures {
        job_id: String,

        /// Write the report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Save the error file exactly as downloaded
        #[arg(long)]
        raw: Option<PathBuf>,
    },

    /// List recent jobs on the account
    List {
        /// Override `batch.list_limit`
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

fn print_example_config() {
    let example = r#"# codebook configuration file

[service]
# API key (can also use the env var named by api_key_env)
# api_key = "${OPENAI_API_KEY}"
api_key_env = "OPENAI_API_KEY"
base_url = "https://api.openai.com/v1"
timeout_secs = 60
# organization = "org-..."

[model]
id = "gpt-4o-mini"
temperature = 0.0
max_tokens = 512

[live]
concurrency = 8
max_retries = 3
base_backoff_ms = 500
max_backoff_secs = 30

[batch]
completion_window = "24h"
# Suggested delay between `codebook batch status` polls
poll_interval_secs = 60
list_limit = 20
store_dir = ".codebook"
"#;
    println!("{example}");
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!(path = %path.display(), "No config file, using defaults");
        return Ok(Config::default());
    }
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn load_requests(input: &ClassifyArgs) -> Result<Vec<ClassificationRequest>> {
    let label_set = match (input.mode, &input.labels) {
        (LabelMode::Open, _) => LabelSet::open(),
        (mode, Some(path)) => LabelSet::new(mode, load_labels(path)?)?,
        (mode, None) => bail!("--labels is required for {mode} mode"),
    };
    let items = load_texts(&input.texts)?;
    Ok(build_requests(Arc::new(label_set), &items)?)
}

fn progress_bar(total: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")?
            .progress_chars("##-"),
    );
    Ok(pb)
}

async fn run_live(
    config: Config,
    input: ClassifyArgs,
    output: PathBuf,
    concurrency: Option<usize>,
) -> Result<()> {
    let requests = load_requests(&input)?;
    let client = Arc::new(LLMClient::from_config(&config).context("Failed to create client")?);

    let mut settings = LiveSettings::from(&config.live);
    if let Some(n) = concurrency {
        settings.concurrency = n.max(1);
    }
    let engine = LiveEngine::new(client.clone(), settings);

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted: finishing in-flight requests, dispatching no more");
            on_interrupt.cancel();
        }
    });

    let pb = progress_bar(requests.len())?;
    let (tx, mut rx) = mpsc::unbounded_channel::<LiveProgress>();
    let watcher = {
        let pb = pb.clone();
        tokio::spawn(async move {
            let mut errors = 0usize;
            while let Some(event) = rx.recv().await {
                if !event.ok {
                    errors += 1;
                    pb.set_message(format!("{errors} failed"));
                }
                pb.set_position(event.completed as u64);
            }
        })
    };

    let run = engine.run(requests, &cancel, Some(tx)).await;
    let _ = watcher.await;
    pb.finish_and_clear();

    write_results(&output, &run.results)?;

    let usage = client.usage();
    println!("\n=== Live Classification {} ===", if run.cancelled { "Cancelled" } else { "Complete" });
    println!("Run:         {}", run.run_id);
    println!("Items:       {}", run.total);
    println!("Dispatched:  {}", run.dispatched);
    println!("Succeeded:   {}", run.succeeded);
    println!("Failed:      {}", run.failed);
    println!("Tokens:      {} in / {} out", usage.prompt_tokens, usage.completion_tokens);
    println!("Runtime:     {:.1}s", run.runtime_secs);
    println!("Output:      {output:?}");
    Ok(())
}

async fn run_batch(config: Config, action: BatchCommand) -> Result<()> {
    let client = Arc::new(LLMClient::from_config(&config).context("Failed to create client")?);
    let manager = BatchManager::from_config(client, &config);
    let mut store = JobStore::open(&config.batch.store_dir)
        .with_context(|| format!("Failed to open job store in {:?}", config.batch.store_dir))?;

    match action {
        BatchCommand::Submit { input } => {
            let requests = load_requests(&input)?;
            let job = manager.submit(requests).await?;
            store.upsert(JobRecord::for_job(
                &job,
                &config.model.id,
                Some(dataset_name(&input.texts)),
            ))?;

            println!("\n=== Batch Submitted ===");
            println!("Job:         {}", job.job_id);
            println!("Items:       {}", job.manifest.len());
            println!("State:       {}", job.state);
            println!(
                "Check progress with `codebook batch status {}` (suggested interval: {}s)",
                job.job_id, config.batch.poll_interval_secs
            );
        }

        BatchCommand::Status { job_id } => {
            let ids: Vec<String> = match job_id {
                Some(id) => vec![id],
                None => store.ongoing().iter().map(|r| r.job_id.clone()).collect(),
            };
            if ids.is_empty() {
                println!("No ongoing jobs in {:?}", config.batch.store_dir);
            }
            for id in ids {
                let job = manager.reconnect(&id).await?;
                store.update_state(&job.job_id, job.state)?;

                let counts = job
                    .request_counts
                    .map(|c| format!("{}/{} done, {} failed", c.completed, c.total, c.failed))
                    .unwrap_or_default();
                println!("{:<40} {:<12} {counts}", job.job_id, job.state.to_string());
                if job.state == JobState::Failed {
                    if let Some(reason) = job.errors.first() {
                        println!("  {reason}");
                    }
                    println!("  See `codebook batch failures {}`", job.job_id);
                }
            }
        }

        BatchCommand::Retrieve { job_id, output } => {
            let mut job = manager.reconnect(&job_id).await?;
            store.update_state(&job.job_id, job.state)?;
            let results = manager.retrieve(&mut job).await?;
            write_results(&output, &results)?;

            let succeeded = results.iter().filter(|r| r.is_success()).count();
            println!("\n=== Batch Results ===");
            println!("Job:         {}", job.job_id);
            println!("Items:       {}", results.len());
            println!("Succeeded:   {succeeded}");
            println!("Failed:      {}", results.len() - succeeded);
            println!("Output:      {output:?}");
        }

        BatchCommand::Cancel { job_id } => {
            let mut job = manager.reconnect(&job_id).await?;
            let state = manager.cancel(&mut job).await?;
            store.update_state(&job.job_id, state)?;
            println!("{}: {state}", job.job_id);
        }

        BatchCommand::Failures {
            job_id,
            output,
            raw,
        } => {
            let job = manager.reconnect(&job_id).await?;
            store.update_state(&job.job_id, job.state)?;
            let report = manager.failure_report(&job).await?;

            println!("\n=== Batch Failure ===");
            println!("Job:         {}", report.job_id);
            println!("Status:      {}", report.remote_status.as_deref().unwrap_or("unknown"));
            for error in &report.errors {
                println!("  {error}");
            }
            println!("Failed requests: {}", report.failed_requests.len());
            for failed in report.failed_requests.iter().take(10) {
                let status = failed
                    .status_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("  {:<16} {status:<4} {}", failed.custom_id, failed.message);
            }
            if report.failed_requests.len() > 10 {
                println!("  ... {} more", report.failed_requests.len() - 10);
            }

            if let Some(path) = output {
                write_json(&path, &report)?;
                println!("Report:      {path:?}");
            }
            match (raw, &report.raw_error_file) {
                (Some(path), Some(content)) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {path:?}"))?;
                    println!("Error file:  {path:?}");
                }
                (Some(_), None) => println!("Job has no error file"),
                _ => {}
            }
        }

        BatchCommand::List { limit } => {
            let limit = limit.unwrap_or(config.batch.list_limit);
            let jobs = manager.list(limit).await?;
            if jobs.is_empty() {
                println!("No batch jobs found");
            }
            for job in jobs {
                let created = job
                    .created_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let marker = if job.ongoing { "ongoing" } else { "done" };
                println!("{:<40} {:<12} {:<8} {created}", job.job_id, job.status, marker);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            info!("Configuration is valid");
            info!("  Endpoint: {}", config.service.base_url);
            info!("  Model: {}", config.model.id);
            info!(
                "  Live: {} workers, {} retries",
                config.live.concurrency, config.live.max_retries
            );
            info!("  Batch store: {:?}", config.batch.store_dir);
        }

        Commands::Live {
            input,
            output,
            concurrency,
        } => {
            let config = load_config(&cli.config)?;
            run_live(config, input, output, concurrency).await?;
        }

        Commands::Batch { action } => {
            let config = load_config(&cli.config)?;
            run_batch(config, action).await?;
        }

        Commands::Sample {
            input,
            output,
            rows,
            percent,
            seed,
        } => {
            let size = match (rows, percent) {
                (Some(n), _) => SampleSize::Rows(n),
                (None, Some(pct)) => SampleSize::Percent(pct),
                (None, None) => bail!("one of --rows or --percent is required"),
            };
            let kept = sample_file(&input, &output, size, seed)?;
            println!("Sampled {kept} items into {output:?}");
        }

        Commands::Reliability {
            dataset_a,
            dataset_b,
            output,
            normalize,
            zero_diag,
        } => {
            let a = load_labeled(&dataset_a)?;
            let b = load_labeled(&dataset_b)?;
            let report = compute_reliability(&a, &b)?;

            println!("\n=== Inter-rater Reliability ===");
            println!("Datasets:    {} vs {}", report.dataset_a_name, report.dataset_b_name);
            println!("Matched:     {}", report.joined_row_count);
            println!("Agreement:   {:.2}%", report.percent_agreement);
            println!("Kappa:       {:.4}", report.cohens_kappa);
            println!("\nConfusion matrix (a → b):");
            if normalize == Normalize::None && !zero_diag {
                for (label_a, label_b, count) in report.confusion_matrix.iter() {
                    println!("  {label_a:<20} {label_b:<20} {count}");
                }
            } else {
                let view = report.confusion_matrix.normalized(normalize, zero_diag);
                print!("  {:<20}", "");
                for col in &view.cols {
                    print!(" {col:>12.12}");
                }
                println!();
                for (label, row) in view.rows.iter().zip(&view.values) {
                    print!("  {label:<20.20}");
                    for value in row {
                        print!(" {value:>12.3}");
                    }
                    println!();
                }
            }

            if let Some(path) = output {
                write_report(&path, &report)?;
                println!("Report:      {path:?}");
            }
        }
    }

    Ok(())
}
