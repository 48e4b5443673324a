//! oreline-miner
//!
//! CLI mining client for Oreline. Opens a session against a running node and
//! keeps it alive with heartbeats; the node owns the clock and the reward
//! math, so this binary never computes rewards — it displays whatever totals
//! the server returns.
//!
//! Usage:
//!   oreline-miner register  --user <id|handle> [--referrer <id|handle>] [--rpc <url>]
//!   oreline-miner mine      --user <id|handle> [--hash-power <1-10>] [--background] [--rpc <url>]
//!   oreline-miner stop      --user <id|handle> [--rpc <url>]
//!   oreline-miner balance   --user <id|handle> [--rpc <url>]
//!   oreline-miner ledger    --user <id|handle> [--limit <n>] [--rpc <url>]
//!   oreline-miner referrals --user <id|handle> [--rpc <url>]
//!   oreline-miner info      [--rpc <url>]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use oreline_core::constants::{
    BACKGROUND_HEARTBEAT_INTERVAL_SECS, GRAINS_PER_ORE, HEARTBEAT_INTERVAL_SECS,
};
use oreline_core::types::UserId;

mod rpc_client;
use rpc_client::MinerRpcClient;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "oreline-miner",
    version,
    about = "Oreline miner — session client for a running node"
)]
struct Args {
    /// Node RPC endpoint.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8545")]
    rpc: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a user, optionally with a referrer.
    Register {
        /// User id (64-char hex) or handle to derive one from.
        #[arg(long)]
        user: String,
        /// Referrer id or handle. Permanent once bound.
        #[arg(long)]
        referrer: Option<String>,
    },

    /// Start (or resume) a session and heartbeat until Ctrl-C.
    Mine {
        #[arg(long)]
        user: String,
        /// Reward multiplier, 1-10.
        #[arg(long, default_value_t = 1)]
        hash_power: u32,
        /// Use the reduced background cadence.
        #[arg(long)]
        background: bool,
    },

    /// Stop the user's active session, if any.
    Stop {
        #[arg(long)]
        user: String,
    },

    /// Print the user's balance.
    Balance {
        #[arg(long)]
        user: String,
    },

    /// Print the user's recent ledger entries.
    Ledger {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Print referral relations and commission totals.
    Referrals {
        #[arg(long)]
        user: String,
    },

    /// Print protocol constants from the node.
    Info,
}

/// Accept a 64-char hex id verbatim, or derive one from a handle. The site's
/// account layer does the same derivation, so handles line up across clients.
fn resolve_user(s: &str) -> String {
    match UserId::from_hex(s) {
        Ok(id) => id.to_hex(),
        Err(_) => UserId::from_handle(s).to_hex(),
    }
}

fn fmt_ore(grains: u128) -> String {
    format!("{}.{:06} ORE", grains / GRAINS_PER_ORE, grains % GRAINS_PER_ORE)
}

// ── Heartbeat guard ───────────────────────────────────────────────────────────

/// Guards against overlapping heartbeat loops: each call to `begin` bumps a
/// generation counter and invalidates every loop started earlier. The
/// browser client needs this when visibility changes re-arm its timer; here
/// it lets Ctrl-C cut the loop off before the stop call races a beat.
struct HeartbeatGuard {
    generation: AtomicU64,
}

impl HeartbeatGuard {
    fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, token: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == token
    }

    fn cancel_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let client = MinerRpcClient::new(&args.rpc);

    match args.command {
        Command::Register { user, referrer } => {
            let user_id = resolve_user(&user);
            let referrer_id = referrer.as_deref().map(resolve_user);
            if let Some(r) = &referrer_id {
                // The referrer row must exist before it can be referenced.
                client.register_user(r, None).await?;
            }
            client
                .register_user(&user_id, referrer_id.as_deref())
                .await?;
            println!("registered {user_id}");
        }

        Command::Mine {
            user,
            hash_power,
            background,
        } => {
            let user_id = resolve_user(&user);
            mine(&client, &user_id, hash_power, background).await?;
        }

        Command::Stop { user } => {
            let user_id = resolve_user(&user);
            match client.get_active_session(&user_id).await? {
                Some(session_id) => {
                    let (status, seconds, total) = client.stop_mining(&session_id).await?;
                    println!("session {status}: {seconds}s mined, {}", fmt_ore(total));
                }
                None => println!("no active session"),
            }
        }

        Command::Balance { user } => {
            let user_id = resolve_user(&user);
            let grains = client.get_balance(&user_id).await?;
            println!("{user_id}");
            println!("  balance: {} ({} Grains)", fmt_ore(grains), grains);
        }

        Command::Ledger { user, limit } => {
            let user_id = resolve_user(&user);
            let entries = client.get_ledger(&user_id, limit).await?;
            if entries.is_empty() {
                println!("no ledger entries");
            }
            for e in entries {
                println!(
                    "{}  {:<20}  +{:>14}  balance {}",
                    e["created_at"], e["kind"].as_str().unwrap_or("?"),
                    e["amount_grains"].as_str().unwrap_or("?"),
                    e["balance_after"].as_str().unwrap_or("?"),
                );
            }
        }

        Command::Referrals { user } => {
            let user_id = resolve_user(&user);
            let stats = client.get_referral_stats(&user_id).await?;
            println!(
                "{} referrals, total commission {}",
                stats["referral_count"],
                stats["total_commission_ore"].as_str().unwrap_or("?"),
            );
            for r in stats["relations"].as_array().cloned().unwrap_or_default() {
                println!(
                    "  {}  rate {}bps  paid {} Grains",
                    r["referred_id"].as_str().unwrap_or("?"),
                    r["commission_rate_bps"],
                    r["total_commission_paid_grains"].as_str().unwrap_or("?"),
                );
            }
        }

        Command::Info => {
            let info = client.get_engine_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

/// The mining loop: start or resume a session, beat on a fixed cadence, and
/// stop cleanly on Ctrl-C. Missed beats cost nothing — the server recomputes
/// the total from the session start every time.
async fn mine(
    client: &MinerRpcClient,
    user_id: &str,
    hash_power: u32,
    background: bool,
) -> anyhow::Result<()> {
    client
        .register_user(user_id, None)
        .await
        .context("registering user")?;

    let session_id = match client.get_active_session(user_id).await? {
        Some(id) => {
            info!(session = %id, "resuming active session");
            id
        }
        None => {
            let fingerprint = format!("oreline-miner/{}", env!("CARGO_PKG_VERSION"));
            let id = client
                .start_mining(user_id, hash_power, &fingerprint)
                .await
                .context("starting session")?;
            info!(session = %id, hash_power, "session started");
            id
        }
    };

    let cadence = if background {
        BACKGROUND_HEARTBEAT_INTERVAL_SECS
    } else {
        HEARTBEAT_INTERVAL_SECS
    };

    let guard = HeartbeatGuard::new();
    let token = guard.begin();
    let mut ticker = tokio::time::interval(Duration::from_secs(cadence));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    println!("mining as {user_id} (session {session_id}, every {cadence}s; Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                guard.cancel_all();
                break;
            }
            _ = ticker.tick() => {
                if !guard.is_current(token) {
                    break;
                }
                match client.heartbeat(&session_id).await {
                    Ok((elapsed, total)) => {
                        println!("  {elapsed:>6}s  {}", fmt_ore(total));
                    }
                    Err(e) => {
                        // "not active" means the server expired the session
                        // under us; anything else is transient — keep beating.
                        let msg = e.to_string();
                        if msg.contains("not active") {
                            warn!("session ended server-side");
                            guard.cancel_all();
                            break;
                        }
                        warn!(error = %msg, "heartbeat failed; will retry");
                    }
                }
            }
        }
    }

    match client.stop_mining(&session_id).await {
        Ok((status, seconds, total)) => {
            println!("session {status}: {seconds}s mined, {}", fmt_ore(total));
        }
        Err(e) => warn!(error = %e, "stop failed; the sweep will finalize the session"),
    }
    Ok(())
}
