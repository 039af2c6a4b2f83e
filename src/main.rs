use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fleet_dispatch::classify::RetryPolicy;
use fleet_dispatch::config::{self, ConfigError, DaemonConfig};
use fleet_dispatch::daemon::Daemon;
use fleet_dispatch::persistence::StateStore;
use fleet_dispatch::queue::EnqueueOutcome;
use fleet_dispatch::types::{IssueNumber, QueueEntry, RepoSlug};

#[derive(Debug, Parser)]
#[command(name = "fleet-dispatch", version, about = "Runs queued issues through isolated pipeline workers")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "FLEET_DISPATCH_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct Settings {
    /// Directory holding the state document, event log and rate-limit deadline.
    #[arg(long, global = true, env = "FLEET_DISPATCH_STATE_DIR", default_value = ".fleet-dispatch")]
    state_dir: PathBuf,

    /// Per-issue worker logs [default: <state-dir>/logs]
    #[arg(long, global = true, env = "FLEET_DISPATCH_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Fleet clones and per-job worktrees [default: <state-dir>/workspaces]
    #[arg(long, global = true, env = "FLEET_DISPATCH_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Checkout used for issues without a repository.
    #[arg(long, global = true, env = "FLEET_DISPATCH_REPO_ROOT", default_value = ".")]
    repo_root: PathBuf,

    #[arg(long, global = true, env = "FLEET_DISPATCH_MAX_PARALLEL", default_value_t = config::DEFAULT_MAX_PARALLEL)]
    max_parallel: usize,

    #[arg(long, global = true, env = "FLEET_DISPATCH_MIN_FREE_BYTES", default_value_t = config::DEFAULT_MIN_FREE_BYTES)]
    min_free_bytes: u64,

    #[arg(long, global = true, env = "FLEET_DISPATCH_POLL_INTERVAL_SECS", default_value_t = config::DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval_secs: u64,

    #[arg(long, global = true, env = "FLEET_DISPATCH_LOG_TAIL_BYTES", default_value_t = config::DEFAULT_LOG_TAIL_BYTES)]
    log_tail_bytes: u64,

    /// Worker executable, run as `<pipeline> <issue> <worktree>`.
    #[arg(long, global = true, env = "FLEET_DISPATCH_PIPELINE", default_value = config::DEFAULT_PIPELINE)]
    pipeline: PathBuf,

    /// Tracker hook, run as `<command> <event> <issue> <detail>`.
    #[arg(long, global = true, env = "FLEET_DISPATCH_NOTIFY_COMMAND")]
    notify_command: Option<PathBuf>,

    /// Retry ceilings per failure class, e.g. `build_failure=3,api_error=5`.
    #[arg(long, global = true, env = "FLEET_DISPATCH_MAX_RETRIES", default_value = "")]
    max_retries: String,

    #[arg(long, global = true, env = "FLEET_DISPATCH_RATE_LIMIT_BACKOFF_SECS", default_value_t = config::DEFAULT_RATE_LIMIT_BACKOFF_SECS)]
    rate_limit_backoff_secs: u64,

    #[arg(long, global = true, env = "FLEET_DISPATCH_CLONE_URL_TEMPLATE", default_value = config::DEFAULT_CLONE_URL_TEMPLATE)]
    clone_url_template: String,

    #[arg(long, global = true, env = "FLEET_DISPATCH_WORKSPACE_MAX_AGE_SECS", default_value_t = config::DEFAULT_WORKSPACE_MAX_AGE_SECS)]
    workspace_max_age_secs: u64,

    /// Keep at most this many completion and failure records.
    #[arg(long, global = true, env = "FLEET_DISPATCH_HISTORY_LIMIT")]
    history_limit: Option<usize>,
}

impl Settings {
    fn into_config(self) -> Result<DaemonConfig, ConfigError> {
        let mut config = DaemonConfig::new(self.state_dir);
        if let Some(log_dir) = self.log_dir {
            config.log_dir = log_dir;
        }
        if let Some(root) = self.workspace_root {
            config.workspace_root = root;
        }
        config.repo_root = self.repo_root;
        config.max_parallel = self.max_parallel;
        config.min_free_bytes = self.min_free_bytes;
        config.poll_interval = Duration::from_secs(self.poll_interval_secs);
        config.log_tail_bytes = self.log_tail_bytes;
        config.pipeline = self.pipeline;
        config.notify_command = self.notify_command;
        config.retry_policy = RetryPolicy::parse_overrides(&self.max_retries)?;
        config.rate_limit_backoff = Duration::from_secs(self.rate_limit_backoff_secs);
        config.clone_url_template = self.clone_url_template;
        config.workspace_max_age = Duration::from_secs(self.workspace_max_age_secs);
        config.history_limit = self.history_limit;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover, then tick every poll interval until Ctrl-C.
    Run,

    /// Run one reap-then-dispatch cycle.
    Tick,

    /// Create the state document if it does not exist.
    Init,

    /// Add an issue to the queue.
    Enqueue {
        issue: IssueNumber,

        #[arg(long)]
        title: Option<String>,

        /// Target repository as `org/repo`.
        #[arg(long)]
        repo: Option<RepoSlug>,

        /// Put the issue in the priority lane.
        #[arg(long)]
        priority: bool,

        /// Display-only score carried on the queue entry.
        #[arg(long)]
        score: Option<i64>,
    },

    /// Move a queued issue into the priority lane.
    Promote { issue: IssueNumber },

    /// Print the state document.
    Status,

    /// Stop spawning new workers. Running workers are left alone.
    Pause,

    Resume,

    /// Set or clear the tracker rate-limit deadline.
    RateLimit {
        #[arg(long, conflicts_with = "clear", required_unless_present = "clear")]
        for_secs: Option<u64>,

        #[arg(long)]
        clear: bool,
    },

    /// Drop malformed active-job entries and unparsable set-aside entries.
    Repair,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "fleet_dispatch=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = cli.settings.into_config().context("invalid configuration")?;
    let daemon = Daemon::open(config);

    match cli.command {
        Command::Run => {
            daemon.recover()?;
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "cannot listen for Ctrl-C");
                    return;
                }
                trigger.cancel();
            });
            daemon.run(shutdown).await;
        }
        Command::Tick => {
            let summary = daemon.tick()?;
            println!(
                "reaped {}, still running {}, spawned {:?}",
                summary.reaped.reaped(),
                summary.reaped.still_running,
                summary.spawned().iter().map(|i| i.0).collect::<Vec<_>>()
            );
        }
        Command::Init => {
            if daemon.services().store.initialize()? {
                println!("created state document");
            } else {
                println!("state document already exists");
            }
        }
        Command::Enqueue {
            issue,
            title,
            repo,
            priority,
            score,
        } => {
            let entry = QueueEntry::new(issue).with_repo(repo).with_score(score);
            match daemon.enqueue(entry, title.as_deref(), priority)? {
                EnqueueOutcome::Queued => println!("queued {issue}"),
                EnqueueOutcome::AlreadyQueued => println!("{issue} is already queued; skipping"),
                EnqueueOutcome::AlreadyActive => println!("{issue} is already running; skipping"),
            }
        }
        Command::Promote { issue } => {
            if daemon.promote(issue)? {
                println!("{issue} moved to the priority lane");
            } else {
                println!("{issue} is not queued");
            }
        }
        Command::Status => {
            let state = daemon.services().store.read()?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            if let Some(until) = daemon.services().rate_limiter.backoff_until() {
                println!("rate limited until {until}");
            }
        }
        Command::Pause => daemon.set_paused(true)?,
        Command::Resume => daemon.set_paused(false)?,
        Command::RateLimit { for_secs, clear } => {
            let limiter = &daemon.services().rate_limiter;
            if clear {
                limiter.clear()?;
                println!("rate limit cleared");
            } else if let Some(secs) = for_secs {
                let until = limiter.back_off_for(Duration::from_secs(secs))?;
                println!("rate limited until {until}");
            }
        }
        Command::Repair => {
            let removed = daemon.repair()?;
            println!("removed {removed} malformed entries");
        }
    }
    Ok(())
}
