//! Operator tool for Workhorse queues stored in Redis.
//!
//! Usage:
//!   workhorse info
//!   workhorse requeue --all
//!   workhorse scheduler --interval 5s
//!   workhorse suspend --duration 10m
//!   workhorse --config workhorse.toml orphans
//!
//! Workers are not started from here: job handlers have to be compiled into
//! the binary that runs them.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use workhorse::{
    Registry, Workhorse, WorkhorseConfig,
    config::{StoreBackend, duration_secs},
    logging,
};

#[derive(Parser)]
#[command(name = "workhorse")]
#[command(about = "Inspect and manage Workhorse job queues")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Path to a TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Redis URL, overrides the configuration")]
    url: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Show queue lengths and registries")]
    Info {
        #[arg(help = "Queues to show, all known queues when omitted")]
        queues: Vec<String>,
    },

    #[command(about = "Remove every job from a queue")]
    Empty {
        #[arg(help = "Queue name")]
        queue: String,
    },

    #[command(about = "Requeue failed or orphaned jobs")]
    Requeue {
        #[arg(long, help = "Requeue every failed job")]
        all: bool,

        #[arg(help = "Job ids to requeue", conflicts_with = "all")]
        ids: Vec<String>,
    },

    #[command(about = "Cancel jobs that have not started")]
    Cancel {
        #[arg(required = true, help = "Job ids to cancel")]
        ids: Vec<String>,
    },

    #[command(about = "Show a job record")]
    Job {
        #[arg(help = "Job id")]
        id: String,
    },

    #[command(about = "Run the scheduler")]
    Scheduler {
        #[arg(long, help = "Tick interval, for example 30s or 1m")]
        interval: Option<String>,

        #[arg(long, help = "Promote due jobs once and exit")]
        burst: bool,
    },

    #[command(about = "List running jobs whose worker stopped heartbeating")]
    Orphans,

    #[command(about = "Stop workers from taking new jobs")]
    Suspend {
        #[arg(long, help = "Resume automatically after this long, for example 10m")]
        duration: Option<String>,
    },

    #[command(about = "Let suspended workers take jobs again")]
    Resume,

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    #[command(about = "Write a default configuration file")]
    Init {
        #[arg(default_value = "workhorse.toml")]
        path: PathBuf,

        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },

    #[command(about = "Print the effective configuration")]
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    let mut logging_config = config.logging.clone();
    if cli.verbose {
        logging_config.level = "debug".to_string();
    }
    logging::init_logging(&logging_config)?;

    if let Err(e) = execute_command(&cli.command, config).await {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<WorkhorseConfig> {
    let mut config = match &cli.config {
        Some(path) => WorkhorseConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?
            .with_env_overrides()?,
        None => WorkhorseConfig::from_env()?,
    };
    config.store.backend = StoreBackend::Redis;
    if let Some(url) = &cli.url {
        config.store.url = url.clone();
    }
    Ok(config)
}

async fn execute_command(command: &Commands, config: WorkhorseConfig) -> Result<()> {
    if let Commands::Config { command } = command {
        return execute_config_command(command, &config);
    }

    let workhorse = Workhorse::from_config(config, Registry::new()).await?;

    match command {
        Commands::Info { queues } => {
            let stats = workhorse.queue_stats(queues).await?;
            if stats.is_empty() {
                println!("No queues");
            }
            for (name, queue) in &stats {
                let age = queue
                    .oldest_age
                    .map(|age| duration_secs::format_duration(&age))
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<24} {:>8} jobs   oldest {}", name, queue.length, age);
            }
            println!();
            println!("failed:     {}", workhorse.failed_jobs().await?.len());
            println!("scheduled:  {}", workhorse.get_scheduler().count().await?);
            println!("orphaned:   {}", workhorse.orphaned_jobs().await?.len());
            if let Some(suspension) = workhorse.suspension().await? {
                match suspension.until {
                    Some(until) => println!("suspended until {}", until.to_rfc3339()),
                    None => println!("suspended"),
                }
            }
        }
        Commands::Empty { queue } => {
            let removed = workhorse.empty_queue(queue).await?;
            println!("Removed {} jobs from {}", removed, queue);
        }
        Commands::Requeue { all, ids } => {
            if *all {
                let requeued = workhorse.requeue_all_failed().await?;
                println!("Requeued {} failed jobs", requeued.len());
            } else if ids.is_empty() {
                bail!("pass job ids or --all");
            } else {
                for id in ids {
                    let job = workhorse.requeue_job(id).await?;
                    println!("Requeued {} on {}", job.id, job.origin);
                }
            }
        }
        Commands::Cancel { ids } => {
            for id in ids {
                if workhorse.cancel_job(id).await? {
                    println!("Canceled {}", id);
                } else {
                    println!("{} already started or finished", id);
                }
            }
        }
        Commands::Job { id } => {
            let job = workhorse.get_job(id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Scheduler { interval, burst } => {
            let interval = interval
                .as_deref()
                .map(duration_secs::parse_duration)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            info!("Starting scheduler");
            workhorse.scheduler_loop(interval, *burst).await?;
        }
        Commands::Orphans => {
            let orphans = workhorse.orphaned_jobs().await?;
            if orphans.is_empty() {
                println!("No orphaned jobs");
            }
            for lease in orphans {
                println!(
                    "{}  worker={}  last heartbeat {}",
                    lease.job_id,
                    lease.worker,
                    lease.heartbeat_at.to_rfc3339()
                );
            }
        }
        Commands::Suspend { duration } => {
            let duration = duration
                .as_deref()
                .map(duration_secs::parse_duration)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            if duration.is_some_and(|d| d.is_zero()) {
                bail!("duration must be greater than zero");
            }
            let suspension = workhorse.suspend(duration).await?;
            match suspension.until {
                Some(until) => println!("Workers suspended until {}", until.to_rfc3339()),
                None => println!("Workers suspended. Run `workhorse resume` to resume"),
            }
        }
        Commands::Resume => {
            if workhorse.resume().await? {
                println!("Workers resumed");
            } else {
                println!("Workers were not suspended");
            }
        }
        Commands::Config { command } => execute_config_command(command, workhorse.config())?,
    }
    Ok(())
}

fn execute_config_command(command: &ConfigCommand, config: &WorkhorseConfig) -> Result<()> {
    match command {
        ConfigCommand::Init { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists, pass --force to overwrite", path.display());
            }
            WorkhorseConfig::default().save_to_file(path)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::Show => {
            println!("{}", toml::to_string_pretty(config)?);
        }
    }
    Ok(())
}
