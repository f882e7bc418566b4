//! batchq CLI: administrative interface to a task store.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use batchq::codec::Registry;
use batchq::command::{CommandRunner, CommandTask, RunnerConfig};
use batchq::config::Config;
use batchq::model::{Files, TaskId};
use batchq::pool::run_pool;
use batchq::storage::Store;
use batchq::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "batchq", about = "Durable batch work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue tasks from a JSON lines file (`-` for stdin)
    Enqueue {
        /// Each line: {"args": [...], "files": {"name": "contents"}}
        input: PathBuf,
    },
    /// Show store counts, or the state of one task
    Status {
        /// Task id
        id: Option<i64>,
    },
    /// Return tasks stuck in the claimed state to pending
    Sweep,
    /// Return every finished task to pending so it runs again
    Reset,
    /// Run a worker pool until the store is drained
    Run {
        /// Runner TOML config
        #[arg(long)]
        runner: PathBuf,
        /// Number of workers (overrides BATCHQ_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Tasks claimed per batch (overrides BATCHQ_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Print finished tasks and their outputs as JSON lines
    Results,
}

/// One line of an enqueue file.
#[derive(Deserialize)]
struct EnqueueLine {
    #[serde(flatten)]
    task: CommandTask,
    #[serde(default)]
    files: Files,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let telemetry = init_telemetry(TelemetryConfig::from(&config))?;
    tracing::debug!(
        exporting = telemetry.is_exporting(),
        db = %config.database_path.display(),
        "batchq starting"
    );

    let store = Store::open(&config.database_path, Registry::<CommandTask>::for_type())?;

    match cli.command {
        Command::Enqueue { input } => cmd_enqueue(&store, &input),
        Command::Status { id } => cmd_status(&store, id),
        Command::Sweep => {
            let n = store.sweep_stuck()?;
            println!("Swept: {n} task(s) returned to pending");
            Ok(())
        }
        Command::Reset => {
            let n = store.reset_all()?;
            println!("Reset: {n} task(s) returned to pending");
            Ok(())
        }
        Command::Run {
            runner,
            workers,
            batch_size,
        } => {
            let mut pool_config = config.pool_config();
            if let Some(n) = workers {
                pool_config.workers = n;
            }
            if let Some(n) = batch_size {
                pool_config.batch_size = n;
            }
            cmd_run(store, &runner, pool_config).await
        }
        Command::Results => cmd_results(&store),
    }
}

fn cmd_enqueue(store: &Store<CommandTask>, input: &Path) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = if input == Path::new("-") {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        Box::new(BufReader::new(std::fs::File::open(input)?))
    };

    let mut lines = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: EnqueueLine = serde_json::from_str(&line)
            .map_err(|e| anyhow::anyhow!("{}:{}: {e}", input.display(), n + 1))?;
        lines.push(parsed);
    }

    let ids = store
        .enqueue_with_files(lines.iter().map(|line| (&line.task, Some(&line.files))))?;

    match (ids.first(), ids.last()) {
        (Some(first), Some(last)) => println!("Enqueued: {} task(s), {first}..{last}", ids.len()),
        _ => println!("Nothing to enqueue."),
    }
    Ok(())
}

fn cmd_status(store: &Store<CommandTask>, id: Option<i64>) -> anyhow::Result<()> {
    if let Some(id) = id {
        let status = store.status(TaskId(id))?;
        match status.claimant {
            Some(worker) => println!("{}: {} by worker {worker}", status.id, status.state),
            None => println!("{}: {}", status.id, status.state),
        }
        return Ok(());
    }

    let counts = store.counts()?;
    println!("Total:    {}", counts.total);
    println!("Pending:  {}", counts.pending());
    println!("Claimed:  {}", counts.claimed);
    println!("Done:     {}", counts.done);
    Ok(())
}

async fn cmd_run(
    store: Store<CommandTask>,
    runner: &Path,
    pool_config: batchq::pool::PoolConfig,
) -> anyhow::Result<()> {
    let runner = CommandRunner::new(RunnerConfig::load(runner)?)?;
    let report = run_pool(Arc::new(store), |_| runner.clone(), pool_config).await?;

    println!(
        "Completed: {}  Failed: {}  Workers: {}",
        report.completed,
        report.failed,
        report.workers.len()
    );
    if report.failed > 0 {
        println!("Failed tasks stay claimed; run `batchq sweep` before retrying them.");
    }
    Ok(())
}

fn cmd_results(store: &Store<CommandTask>) -> anyhow::Result<()> {
    for item in store.iter_results::<serde_json::Value>()? {
        let (task, output) = item?;
        println!(
            "{}",
            serde_json::json!({"task": task, "output": output})
        );
    }
    Ok(())
}
