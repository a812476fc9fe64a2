use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use snapcrab_core::store::{CheckpointRecoveryStore, FsRecoveryStore};
use snapcrab_core::types::CheckpointId;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod simulation;

use simulation::{OFFSET_HOOK_TYPE, SimulationConfig};

#[derive(Parser, Debug)]
#[command(name = "snapcrab")]
#[command(about = "SnapCrab checkpoint coordinator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a simulated job under a checkpoint coordinator.
    Run {
        /// TOML file with the job and checkpoint settings.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        tasks: Option<usize>,
        #[arg(long)]
        ack_delay_ms: Option<u64>,
        /// Stop after this many checkpoints completed or were discarded.
        #[arg(long)]
        checkpoints: Option<usize>,
        /// Subtask index of a task that never acknowledges.
        #[arg(long)]
        stuck_task: Option<usize>,
        /// Persist checkpoints in this directory instead of memory.
        #[arg(long)]
        store_dir: Option<PathBuf>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Shows the checkpoints kept in a checkpoint directory.
    Inspect {
        #[arg(long)]
        store_dir: PathBuf,
        /// Checkpoint to show instead of the latest one.
        #[arg(long)]
        checkpoint: Option<CheckpointId>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            tasks,
            ack_delay_ms,
            checkpoints,
            stuck_task,
            store_dir,
            interval_ms,
            timeout_ms,
        } => {
            let mut sim = match config {
                Some(path) => SimulationConfig::load(&path)?,
                None => SimulationConfig::default(),
            };
            if let Some(tasks) = tasks {
                sim.tasks = tasks;
            }
            if let Some(delay) = ack_delay_ms {
                sim.ack_delay_ms = delay;
            }
            if let Some(checkpoints) = checkpoints {
                sim.checkpoints = checkpoints;
            }
            if stuck_task.is_some() {
                sim.stuck_task = stuck_task;
            }
            if store_dir.is_some() {
                sim.store = simulation::store_for_dir(store_dir);
            }
            if let Some(interval) = interval_ms {
                sim.checkpoint.interval_ms = interval;
            }
            if let Some(timeout) = timeout_ms {
                sim.checkpoint.timeout_ms = timeout;
            }
            sim.validate()?;

            let summary = simulation::run(sim).await?;
            println!(
                "run finished: completed={} discarded={} last_completed={}",
                summary.completed,
                summary.discarded,
                summary
                    .last_completed
                    .map_or_else(|| "none".to_string(), |id| id.to_string())
            );
        }
        Commands::Inspect {
            store_dir,
            checkpoint,
        } => inspect(store_dir, checkpoint)?,
    }
    Ok(())
}

fn inspect(store_dir: PathBuf, checkpoint: Option<CheckpointId>) -> anyhow::Result<()> {
    if !store_dir.is_dir() {
        bail!("checkpoint directory {} does not exist", store_dir.display());
    }
    let store = FsRecoveryStore::new(&store_dir)?;
    let ids = store.list_checkpoints()?;
    println!("checkpoints={:?}", ids);

    let metadata = match checkpoint {
        Some(id) => store
            .load(id)?
            .with_context(|| format!("checkpoint {} not found in {}", id, store_dir.display()))?,
        None => match store.recover_latest()? {
            Some(metadata) => metadata,
            None => {
                println!("no recoverable checkpoint");
                return Ok(());
            }
        },
    };

    println!(
        "checkpoint_id={} triggered_ms={} completed_ms={}",
        metadata.checkpoint_id, metadata.trigger_timestamp, metadata.completion_timestamp
    );
    for (task_id, handle) in &metadata.task_snapshots {
        println!(
            "task={} handle={}",
            task_id,
            String::from_utf8_lossy(handle.as_bytes())
        );
    }
    for (identifier, state) in &metadata.hook_states {
        if identifier == OFFSET_HOOK_TYPE {
            println!(
                "hook={} offsets={:?}",
                identifier,
                simulation::decode_offsets(state)?
            );
        } else {
            println!("hook={} state_bytes={}", identifier, state.len());
        }
    }
    Ok(())
}
