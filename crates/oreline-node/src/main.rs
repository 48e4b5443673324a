//! oreline-node — the Oreline mining backend binary.
//!
//! Startup sequence:
//!   1. Open (or initialise) the state database
//!   2. Build the mining engine over it
//!   3. Spawn the periodic reconciliation sweep
//!   4. Start the JSON-RPC 2.0 server
//!   5. Wait for Ctrl-C, then flush and exit

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use oreline_core::constants::DEFAULT_SWEEP_INTERVAL_SECS;
use oreline_rpc::server::RpcServerState;
use oreline_rpc::RpcServer;
use oreline_state::{MiningEngine, StateDb};
use oreline_sweep::{run_sweep, spawn_sweep_task, SweepConfig};

#[derive(Parser, Debug)]
#[command(
    name = "oreline-node",
    version,
    about = "Oreline mining backend — sessions, rewards, and referral settlement"
)]
struct Args {
    /// Directory for the persistent state database.
    #[arg(long, default_value = "~/.oreline/data")]
    data_dir: PathBuf,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8545")]
    rpc_addr: SocketAddr,

    /// Seconds between reconciliation sweep passes.
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval_secs: u64,

    /// Skip the catch-up sweep normally run at startup.
    #[arg(long)]
    no_startup_sweep: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,oreline=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("Oreline node starting");

    // ── State database ────────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let db = Arc::new(StateDb::open(&data_dir).context("opening state database")?);
    let engine = Arc::new(MiningEngine::new(Arc::clone(&db)));

    // ── Catch-up sweep ────────────────────────────────────────────────────────
    // Sessions left Active across a restart are past their heartbeats; expire
    // the stale ones and settle commissions before accepting traffic.
    if !args.no_startup_sweep {
        let report = run_sweep(&engine, chrono::Utc::now().timestamp());
        if report.expired_sessions > 0 || report.settled > 0 {
            info!(
                expired = report.expired_sessions,
                settled = report.settled,
                "startup sweep reconciled state"
            );
        }
    }

    // ── Periodic sweep ────────────────────────────────────────────────────────
    spawn_sweep_task(
        Arc::clone(&engine),
        SweepConfig {
            interval: std::time::Duration::from_secs(args.sweep_interval_secs.max(1)),
        },
    );

    // ── RPC server ────────────────────────────────────────────────────────────
    let rpc_state = Arc::new(RpcServerState {
        engine: Arc::clone(&engine),
    });
    let rpc_handle = RpcServer::new(rpc_state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    info!("node ready");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    info!("shutting down");
    let _ = rpc_handle.stop();
    if let Err(e) = db.flush() {
        warn!(error = %e, "final flush failed");
    }
    Ok(())
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
