//! oreline-rpc
//!
//! JSON-RPC 2.0 server for the Oreline mining backend.
//!
//! Namespace: "oreline"
//! Methods:
//!   oreline_registerUser       — create a user, optionally bound to a referrer
//!   oreline_startMining        — open a mining session
//!   oreline_heartbeat          — liveness beat; returns authoritative totals
//!   oreline_stopMining         — finalize a session and credit the final reward
//!   oreline_getSession         — the caller's active session (lazy expiry applies)
//!   oreline_getBalance         — available/locked balance in Grains
//!   oreline_getLedger          — recent ledger entries, newest first
//!   oreline_getReferralStats   — referral relations and commission totals
//!   oreline_runSettlementSweep — trigger one reconciliation pass
//!   oreline_getEngineInfo      — protocol constants

pub mod api;
pub mod server;
pub mod types;

pub use server::{RpcServer, RpcServerState};
pub use types::{
    RpcBalance, RpcEngineInfo, RpcHeartbeatResult, RpcLedgerEntry, RpcReferralRelation,
    RpcReferralStats, RpcSession, RpcStartResult, RpcStopResult, RpcSweepReport,
};
