use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use slotwatch_core::{
    slots_from_hint, ChildLauncher, Config, LoadOutcome, MarkerMode, StateStore, Supervisor,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "slotwatch",
    version,
    about = "Relaunch a rebuilt executable, handing its state to the new instance"
)]
struct Cli {
    /// Log filter, e.g. `info` or `slotwatch_core=debug`. Falls back to RUST_LOG, then `info`.
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch an artifact and keep one copy of it running
    Watch(WatchArgs),

    /// Inspect or reset a state record
    State {
        #[command(subcommand)]
        cmd: StateCommand,
    },
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Build output to watch, e.g. target/debug/app
    artifact: PathBuf,

    /// Base name for the copy slots; `target/app_copy` gives app_copy-1, app_copy-2, ...
    copy_hint: PathBuf,

    /// Mode word passed to relaunched instances, e.g. `communicate`
    resume_verb: String,

    /// State record handed to every instance
    state_path: PathBuf,

    /// TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Artifact poll period in milliseconds.
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Grace period after a stop request (and again after a kill) in milliseconds.
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Number of copy slots (at least 2).
    #[arg(long)]
    slots: Option<usize>,

    /// Identify builds by content hash instead of modification time.
    #[arg(long, default_value_t = false)]
    content_hash: bool,

    /// Start the first instance in resume mode too.
    #[arg(long, default_value_t = false)]
    resume_on_start: bool,
}

#[derive(Debug, Subcommand)]
enum StateCommand {
    /// Print the record as JSON
    Show { state_path: PathBuf },
    /// Delete the record
    Clear { state_path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    match cli.cmd {
        Command::Watch(args) => watch(args).await,
        Command::State {
            cmd: StateCommand::Show { state_path },
        } => show_state(&state_path),
        Command::State {
            cmd: StateCommand::Clear { state_path },
        } => {
            StateStore::new(&state_path)
                .clear()
                .with_context(|| format!("clear {}", state_path.display()))?;
            println!("cleared {}", state_path.display());
            Ok(())
        }
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn build_config(args: &WatchArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            Config::load_from(path).with_context(|| format!("load config {}", path.display()))?
        }
        None => Config::default(),
    };

    config.launch.resume_verb = args.resume_verb.clone();
    if let Some(ms) = args.poll_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(ms) = args.grace_ms {
        config.grace_period_ms = ms;
    }
    if let Some(n) = args.slots {
        config.slot_count = n;
    }
    if args.content_hash {
        config.marker = MarkerMode::Content;
    }
    if args.resume_on_start {
        config.launch.resume_on_start = true;
    }

    config.validate()?;
    Ok(config)
}

async fn watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let slots = slots_from_hint(&args.copy_hint, config.slot_count);

    info!(
        artifact = %args.artifact.display(),
        state = %args.state_path.display(),
        slots = slots.len(),
        "starting supervisor with config: {:?}",
        config
    );

    let mut supervisor = Supervisor::new(
        &args.artifact,
        slots,
        &args.state_path,
        config,
        ChildLauncher,
    )?;
    let summary = supervisor
        .run(shutdown_signal())
        .await
        .with_context(|| format!("supervising {}", args.artifact.display()))?;

    info!(
        launches = summary.launches,
        rotations = summary.rotations,
        coalesced = summary.coalesced,
        "done"
    );
    Ok(())
}

fn show_state(path: &Path) -> anyhow::Result<()> {
    match StateStore::new(path).load_outcome::<Value>() {
        LoadOutcome::Loaded(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        LoadOutcome::Missing => println!("no prior state"),
        LoadOutcome::Corrupt(reason) => {
            warn!(path = %path.display(), %reason, "state record is corrupt");
            println!("no prior state");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
    info!("shutdown requested");
}
