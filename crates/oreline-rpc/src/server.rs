use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::CorsLayer;
use tracing::info;

use oreline_core::constants::MAX_LEDGER_PAGE;
use oreline_core::error::OrelineError;
use oreline_core::types::{SessionId, UserId};
use oreline_state::{MiningEngine, StartContext};
use oreline_sweep::run_sweep;

use crate::api::OrelineApiServer;
use crate::types::{
    format_ore, RpcBalance, RpcEngineInfo, RpcHeartbeatResult, RpcLedgerEntry,
    RpcReferralRelation, RpcReferralStats, RpcSession, RpcStartResult, RpcStopResult,
    RpcSweepReport,
};

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

/// Map an engine error onto JSON-RPC error codes: -32602 for malformed
/// parameters, -32000 for domain rejections the client should handle
/// (already active, not found, skew…), -32603 for internal faults.
fn engine_err(e: OrelineError) -> ErrorObject<'static> {
    use OrelineError::*;
    let code = match &e {
        InvalidHashPower { .. } | InvalidEfficiency { .. } | FingerprintTooLong { .. } => -32602,
        SessionAlreadyActive(_) | SessionNotFound(_) | SessionNotActive(_)
        | ClockSkewDetected { .. } | UnknownUser(_) | ReferralSelfReference
        | ReferrerImmutable => -32000,
        LedgerWriteFailed(_) | Serialization(_) | Storage(_) | Other(_) => -32603,
    };
    rpc_err(code, e.to_string())
}

fn parse_user_id(s: &str) -> Result<UserId, ErrorObject<'static>> {
    UserId::from_hex(s).map_err(|e| rpc_err(-32602, format!("invalid user id: {e}")))
}

fn parse_session_id(s: &str) -> Result<SessionId, ErrorObject<'static>> {
    SessionId::from_hex(s).map_err(|e| rpc_err(-32602, format!("invalid session id: {e}")))
}

fn server_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Shared state passed to the RPC server.
pub struct RpcServerState {
    pub engine: Arc<MiningEngine>,
}

/// The RPC server implementation.
pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr`. Returns a handle to stop it.
    /// CORS is permissive: the mining UI runs in browsers on another origin.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let middleware = tower::ServiceBuilder::new().layer(CorsLayer::permissive());
        let server = Server::builder()
            .set_http_middleware(middleware)
            .build(addr)
            .await?;
        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }
}

#[async_trait]
impl OrelineApiServer for RpcServer {
    async fn register_user(
        &self,
        user_id: String,
        referred_by: Option<String>,
    ) -> RpcResult<bool> {
        let id = parse_user_id(&user_id)?;
        let referrer = referred_by.as_deref().map(parse_user_id).transpose()?;
        self.state
            .engine
            .register_user(id, referrer, server_now())
            .map_err(engine_err)?;
        Ok(true)
    }

    async fn start_mining(
        &self,
        user_id: String,
        hash_power: u32,
        efficiency_pct: Option<u32>,
        device_fingerprint: Option<String>,
    ) -> RpcResult<RpcStartResult> {
        let id = parse_user_id(&user_id)?;
        let ctx = StartContext {
            efficiency_pct,
            device_fingerprint,
            source_ip: None,
        };
        let receipt = self
            .state
            .engine
            .start_session(id, hash_power, ctx, server_now())
            .map_err(engine_err)?;
        Ok(RpcStartResult {
            session_id: receipt.session_id.to_hex(),
            start_time: receipt.start_time,
        })
    }

    async fn heartbeat(&self, session_id: String) -> RpcResult<RpcHeartbeatResult> {
        let id = parse_session_id(&session_id)?;
        let receipt = self
            .state
            .engine
            .heartbeat(&id, server_now())
            .map_err(engine_err)?;
        Ok(RpcHeartbeatResult {
            session_id: receipt.session_id.to_hex(),
            elapsed_seconds: receipt.elapsed_seconds,
            added_grains: receipt.added_grains.to_string(),
            total_grains: receipt.total_grains.to_string(),
            total_ore: format_ore(receipt.total_grains),
        })
    }

    async fn stop_mining(&self, session_id: String) -> RpcResult<RpcStopResult> {
        let id = parse_session_id(&session_id)?;
        let receipt = self
            .state
            .engine
            .stop_session(&id, server_now())
            .map_err(engine_err)?;
        Ok(RpcStopResult {
            session_id: receipt.session_id.to_hex(),
            status: receipt.status.into(),
            total_seconds: receipt.total_seconds,
            total_grains: receipt.total_grains.to_string(),
            total_ore: format_ore(receipt.total_grains),
        })
    }

    async fn get_session(&self, user_id: String) -> RpcResult<Option<RpcSession>> {
        let id = parse_user_id(&user_id)?;
        let session = self
            .state
            .engine
            .get_active_session(&id, server_now())
            .map_err(engine_err)?;
        Ok(session.as_ref().map(RpcSession::from))
    }

    async fn get_balance(&self, user_id: String) -> RpcResult<RpcBalance> {
        let id = parse_user_id(&user_id)?;
        let (available, locked) = self.state.engine.get_balance(&id).map_err(engine_err)?;
        Ok(RpcBalance {
            user_id,
            available_grains: available.to_string(),
            available_ore: format_ore(available),
            locked_grains: locked.to_string(),
        })
    }

    async fn get_ledger(
        &self,
        user_id: String,
        limit: Option<u32>,
    ) -> RpcResult<Vec<RpcLedgerEntry>> {
        let id = parse_user_id(&user_id)?;
        let limit = limit.unwrap_or(50).min(MAX_LEDGER_PAGE) as usize;
        let entries = self
            .state
            .engine
            .db
            .iter_ledger_for_user(&id, limit)
            .map_err(engine_err)?;
        Ok(entries.iter().map(RpcLedgerEntry::from).collect())
    }

    async fn get_referral_stats(&self, user_id: String) -> RpcResult<RpcReferralStats> {
        let id = parse_user_id(&user_id)?;
        let relations = self
            .state
            .engine
            .db
            .iter_referrals_for_referrer(&id)
            .map_err(engine_err)?;
        let total: u128 = relations.iter().map(|r| r.total_commission_paid).sum();
        Ok(RpcReferralStats {
            user_id,
            referral_count: relations.len() as u32,
            total_commission_grains: total.to_string(),
            total_commission_ore: format_ore(total),
            relations: relations.iter().map(RpcReferralRelation::from).collect(),
        })
    }

    async fn run_settlement_sweep(&self) -> RpcResult<RpcSweepReport> {
        let engine = Arc::clone(&self.state.engine);
        let now = server_now();
        // Synchronous sled I/O; keep it off the RPC workers.
        let report = tokio::task::spawn_blocking(move || run_sweep(&engine, now))
            .await
            .map_err(|e| rpc_err(-32603, format!("sweep task failed: {e}")))?;
        Ok(RpcSweepReport {
            scanned: report.scanned,
            expired_sessions: report.expired_sessions,
            settled: report.settled,
            skipped: report.skipped,
            errors: report.errors,
            total_commission_grains: report.total_commission_grains.to_string(),
        })
    }

    async fn get_engine_info(&self) -> RpcResult<RpcEngineInfo> {
        Ok(RpcEngineInfo::current())
    }
}
