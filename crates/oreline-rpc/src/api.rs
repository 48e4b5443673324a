use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::types::{
    RpcBalance, RpcEngineInfo, RpcHeartbeatResult, RpcLedgerEntry, RpcReferralStats, RpcSession,
    RpcStartResult, RpcStopResult, RpcSweepReport,
};

/// Oreline JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "oreline_" via `namespace = "oreline"`.
/// User and session ids are 64-char hex strings.
#[rpc(server, namespace = "oreline")]
pub trait OrelineApi {
    /// Register a user, optionally bound to a referrer. Idempotent; the
    /// referrer binding is permanent once set.
    #[method(name = "registerUser")]
    async fn register_user(&self, user_id: String, referred_by: Option<String>) -> RpcResult<bool>;

    /// Open a mining session. Fails if the user already has one active.
    /// `efficiency_pct` defaults to 100; `device_fingerprint` is stored
    /// as-is for audit.
    #[method(name = "startMining")]
    async fn start_mining(
        &self,
        user_id: String,
        hash_power: u32,
        efficiency_pct: Option<u32>,
        device_fingerprint: Option<String>,
    ) -> RpcResult<RpcStartResult>;

    /// Report liveness for a session. The server recomputes elapsed time and
    /// the reward total from its own clock; the response carries the
    /// authoritative figures the client must display.
    #[method(name = "heartbeat")]
    async fn heartbeat(&self, session_id: String) -> RpcResult<RpcHeartbeatResult>;

    /// Stop a session and credit its final reward. Repeating the call
    /// returns the stored result without paying again.
    #[method(name = "stopMining")]
    async fn stop_mining(&self, session_id: String) -> RpcResult<RpcStopResult>;

    /// The user's active session, or null. A session past the hard wall is
    /// expired by this call and reported as null.
    #[method(name = "getSession")]
    async fn get_session(&self, user_id: String) -> RpcResult<Option<RpcSession>>;

    /// Available and locked balance.
    #[method(name = "getBalance")]
    async fn get_balance(&self, user_id: String) -> RpcResult<RpcBalance>;

    /// The user's most recent ledger entries, newest first (`limit` capped
    /// at 200).
    #[method(name = "getLedger")]
    async fn get_ledger(&self, user_id: String, limit: Option<u32>) -> RpcResult<Vec<RpcLedgerEntry>>;

    /// Referral relations where `user_id` is the referrer, with commission
    /// totals.
    #[method(name = "getReferralStats")]
    async fn get_referral_stats(&self, user_id: String) -> RpcResult<RpcReferralStats>;

    /// Run one reconciliation pass now (admin/ops; the node also runs this
    /// on a timer).
    #[method(name = "runSettlementSweep")]
    async fn run_settlement_sweep(&self) -> RpcResult<RpcSweepReport>;

    /// Protocol constants.
    #[method(name = "getEngineInfo")]
    async fn get_engine_info(&self) -> RpcResult<RpcEngineInfo>;
}
