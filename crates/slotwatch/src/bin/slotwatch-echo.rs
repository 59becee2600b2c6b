//! Demo target for `slotwatch`.
//!
//! Counts its own starts in the state record: `{"turn": N, "started_by": ...}`.
//! A fresh start writes turn 1, a resumed start writes the previous turn + 1.
//! Then it idles until terminated.

use anyhow::Context;
use serde_json::{json, Value};
use slotwatch_core::{TargetInvocation, TargetMode};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let invocation = TargetInvocation::from_args(std::env::args().skip(1))
        .context("usage: slotwatch-echo <initialize|communicate> <state_path>")?;

    let previous: Option<Value> = invocation.initial_state();
    let turn = previous
        .as_ref()
        .and_then(|v| v.get("turn"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
        + 1;

    let generation = std::env::var("SLOTWATCH_GENERATION").unwrap_or_default();
    invocation
        .store()
        .save(&json!({ "turn": turn, "started_by": generation }))
        .with_context(|| format!("write {}", invocation.state_path.display()))?;

    let resumed = invocation.mode == TargetMode::Resume && previous.is_some();
    info!(turn, resumed, pid = std::process::id(), "echo target up");

    wait_for_termination().await;
    info!(turn, "echo target exiting");
    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};
        if let Ok(mut term) = unix_signal(SignalKind::terminate()) {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    let _ = signal::ctrl_c().await;
}
