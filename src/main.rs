//! barrage - submit, track and reconcile LLM provider batch jobs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use barrage::builder::{self, responses_file_name};
use barrage::credentials::{self, mask};
use barrage::lifecycle::{self, LifecycleManager};
use barrage::reconcile::write_outcomes;
use barrage::{
    AnyAdapter, BarrageConfig, BarrageError, FileStore, LifecycleRecord, OutcomeSummary, Provider,
    ProviderAdapter, ReqwestHttpClient, RequestSet, RunId, RunReport,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "barrage", version, about = "Submit, track and reconcile LLM batch jobs")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "BARRAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the lifecycle state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// HTTP timeout for provider calls, in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a request file from a directory of JSON request bodies
    Make {
        #[arg(long)]
        in_dir: PathBuf,
        #[arg(long, default_value = ".")]
        out: PathBuf,
        #[arg(long, default_value = "batch")]
        batch: String,
    },
    /// Partition and submit a request file
    Submit {
        provider: Provider,
        file: PathBuf,
        /// Description attached to the batches (OpenAI)
        #[arg(long)]
        desc: Option<String>,
    },
    /// Show lifecycle records
    Status {
        #[arg(long)]
        run: Option<RunId>,
        /// Poll every unfinished batch once before printing
        #[arg(long)]
        refresh: bool,
    },
    /// Resume a run until every batch is finished, then write its outcomes
    Fetch {
        provider: Provider,
        #[arg(long)]
        run: RunId,
        file: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        batch: Option<String>,
    },
    /// Submit a request file, wait for it, and write its outcomes
    Run {
        provider: Provider,
        file: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        batch: Option<String>,
        #[arg(long)]
        desc: Option<String>,
    },
    /// List recent batches of the provider account
    List {
        provider: Provider,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Success,
    /// Some outcome is missing or a provider error
    Incomplete,
    /// Some chunk was rejected at submission
    Rejected,
    /// Credentials or configuration are unusable
    Configuration,
    Fatal,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(match exit {
            Exit::Success => 0,
            Exit::Incomplete => 1,
            Exit::Rejected => 2,
            Exit::Configuration => 3,
            Exit::Fatal => 4,
        })
    }
}

fn exit_for_error(error: &anyhow::Error) -> Exit {
    match error.downcast_ref::<BarrageError>() {
        Some(BarrageError::Authentication(_)) => Exit::Configuration,
        _ => Exit::Fatal,
    }
}

fn exit_for_run(summary: &OutcomeSummary, has_rejections: bool) -> Exit {
    if has_rejections {
        Exit::Rejected
    } else if summary.is_complete() {
        Exit::Success
    } else {
        Exit::Incomplete
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("barrage=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = match BarrageConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Exit::Configuration.into();
        }
    };
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.set_timeout_ms(timeout_ms);
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, finishing in-flight polls");
                shutdown.cancel();
            }
        });
    }

    match execute(cli.command, config, shutdown).await {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_for_error(&e).into()
        }
    }
}

async fn execute(
    command: Command,
    config: BarrageConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<Exit> {
    match command {
        Command::Make { in_dir, out, batch } => {
            let report = builder::make(&in_dir, &out, &batch).await?;
            for (file, reason) in &report.skipped {
                eprintln!("Skipped {}: {}", file.display(), reason);
            }
            println!(
                "Request file created: {} ({} requests)",
                report.path.display(),
                report.written
            );
            Ok(Exit::Success)
        }

        Command::Submit {
            provider,
            file,
            desc,
        } => {
            let requests = read_requests(&file).await?;
            let manager = manager(provider, &config, desc, shutdown).await?;
            let report = manager.submit(&requests).await?;

            println!("run {}", report.run_id);
            for batch in &report.batches {
                println!(
                    "{}\t{}\t{} requests",
                    batch.batch_id,
                    batch.state,
                    batch.request_ids.len()
                );
            }
            if report.has_rejections() {
                Ok(Exit::Rejected)
            } else {
                Ok(Exit::Success)
            }
        }

        Command::Status { run, refresh } => {
            let store = FileStore::in_dir(&config.state_dir).await?;
            let mut records = lifecycle::status(&store, run).await?;
            if refresh {
                records = refresh_records(records, &config, shutdown).await?;
            }
            print_records(&records);
            Ok(Exit::Success)
        }

        Command::Fetch {
            provider,
            run,
            file,
            out,
            batch,
        } => {
            let requests = read_requests(&file).await?;
            let manager = manager(provider, &config, None, shutdown).await?;
            let report = manager.resume(run, &requests).await?;
            finish(&report, &config, &file, out, batch).await
        }

        Command::Run {
            provider,
            file,
            out,
            batch,
            desc,
        } => {
            let requests = read_requests(&file).await?;
            let manager = manager(provider, &config, desc, shutdown).await?;
            let report = manager.run(&requests).await?;
            finish(&report, &config, &file, out, batch).await
        }

        Command::List { provider, limit } => {
            let adapter = AnyAdapter::from_config(provider, ReqwestHttpClient::new(), &config)?;
            for summary in adapter.list(limit).await? {
                let created = summary
                    .created_at
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{}\t{}", summary.batch_id, summary.status, created);
            }
            Ok(Exit::Success)
        }

        Command::Config => {
            print!("{}", config.to_yaml()?);
            for provider in Provider::ALL {
                let env_var = config.api_key_env(provider);
                let key = credentials::api_key(provider, env_var)
                    .map(|key| mask(&key))
                    .unwrap_or_else(|_| "not set".to_string());
                println!("{}: {}", env_var, key);
            }
            Ok(Exit::Success)
        }
    }
}

async fn read_requests(file: &Path) -> anyhow::Result<RequestSet> {
    RequestSet::read(file)
        .await
        .with_context(|| format!("reading requests from {}", file.display()))
}

async fn manager(
    provider: Provider,
    config: &BarrageConfig,
    description: Option<String>,
    shutdown: CancellationToken,
) -> anyhow::Result<LifecycleManager<AnyAdapter<ReqwestHttpClient>, FileStore>> {
    let adapter = AnyAdapter::from_config(provider, ReqwestHttpClient::new(), config)?
        .with_description(description);
    let store = FileStore::in_dir(&config.state_dir)
        .await
        .with_context(|| format!("opening state directory {}", config.state_dir.display()))?;
    Ok(
        LifecycleManager::new(Arc::new(adapter), Arc::new(store), config.manager.clone())
            .with_shutdown(shutdown),
    )
}

/// Observe each unfinished record once, with the adapter of its provider.
///
/// Refreshing never spends a batch's retry budget.
async fn refresh_records(
    records: Vec<LifecycleRecord>,
    config: &BarrageConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<Vec<LifecycleRecord>> {
    let mut by_provider: BTreeMap<Provider, Vec<usize>> = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        if !record.batch.is_terminal() {
            by_provider
                .entry(record.batch.provider)
                .or_default()
                .push(index);
        }
    }

    let mut records = records;
    for (provider, indices) in by_provider {
        let manager = manager(provider, config, None, shutdown.clone()).await?;
        for index in indices {
            records[index] = manager.refresh(records[index].clone()).await?;
        }
    }
    Ok(records)
}

fn print_records(records: &[LifecycleRecord]) {
    if records.is_empty() {
        println!("No batches recorded");
        return;
    }
    for record in records {
        let batch = &record.batch;
        let error = batch
            .error
            .as_ref()
            .or(record.last_error.as_ref())
            .map(|e| e.to_string())
            .unwrap_or_default();
        println!(
            "{}\t{}\t{}\tchunk {}\t{} requests\t{} polls\t{} retries\t{}\t{}",
            batch.run_id,
            batch.batch_id,
            batch.provider,
            batch.chunk_index,
            batch.request_ids.len(),
            record.polls,
            record.retry_count,
            batch.state,
            error
        );
    }
}

/// Batch name derived from a request file name (`demo-requests.jsonl` -> `demo`).
fn default_batch_name(file: &Path) -> String {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "batch".to_string());
    stem.strip_suffix("-requests")
        .map(str::to_string)
        .unwrap_or(stem)
}

async fn finish(
    report: &RunReport,
    config: &BarrageConfig,
    file: &Path,
    out: Option<PathBuf>,
    batch: Option<String>,
) -> anyhow::Result<Exit> {
    let out_dir = out.unwrap_or_else(|| config.output_dir.clone());
    let batch_name = batch.unwrap_or_else(|| default_batch_name(file));
    let path = out_dir.join(responses_file_name(&batch_name));
    write_outcomes(&path, &report.outcomes)
        .await
        .with_context(|| format!("writing outcomes to {}", path.display()))?;

    let summary = report.summary();
    println!("run {}", report.run_id);
    println!(
        "{} requests: {} succeeded, {} provider errors, {} missing",
        summary.total, summary.succeeded, summary.provider_errors, summary.missing
    );
    println!("Outcomes written to {}", path.display());
    Ok(exit_for_run(&summary, report.has_rejections()))
}
