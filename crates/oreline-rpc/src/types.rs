use serde::{Deserialize, Serialize};

use oreline_core::constants::GRAINS_PER_ORE;
use oreline_core::ledger::LedgerEntry;
use oreline_core::referral::{ReferralRelation, ReferralStatus};
use oreline_core::session::MiningSession;
use oreline_core::types::Grains;

/// Render a Grain amount as a decimal ORE string ("3.312500").
pub fn format_ore(grains: Grains) -> String {
    format!("{}.{:06}", grains / GRAINS_PER_ORE, grains % GRAINS_PER_ORE)
}

/// Result of `oreline_startMining`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStartResult {
    pub session_id: String,
    pub start_time: i64,
}

/// Result of `oreline_heartbeat`. Amounts are u128 Grains as strings; the
/// `*_ore` fields are the same value formatted for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcHeartbeatResult {
    pub session_id: String,
    pub elapsed_seconds: i64,
    pub added_grains: String,
    pub total_grains: String,
    pub total_ore: String,
}

/// Result of `oreline_stopMining`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStopResult {
    pub session_id: String,
    /// "completed" or "expired".
    pub status: String,
    pub total_seconds: i64,
    pub total_grains: String,
    pub total_ore: String,
}

/// JSON view of a mining session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSession {
    pub session_id: String,
    pub user_id: String,
    pub status: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub last_heartbeat_at: i64,
    pub hash_power: u32,
    pub efficiency_pct: u32,
    pub accumulated_grains: String,
    pub accumulated_ore: String,
    pub heartbeat_count: u64,
}

impl From<&MiningSession> for RpcSession {
    fn from(s: &MiningSession) -> Self {
        Self {
            session_id: s.id.to_hex(),
            user_id: s.user_id.to_hex(),
            status: s.status.label().into(),
            start_time: s.start_time,
            end_time: s.end_time,
            last_heartbeat_at: s.last_heartbeat_at,
            hash_power: s.hash_power,
            efficiency_pct: s.efficiency_pct,
            accumulated_grains: s.accumulated_grains.to_string(),
            accumulated_ore: format_ore(s.accumulated_grains),
            heartbeat_count: s.heartbeat_count,
        }
    }
}

/// Result of `oreline_getBalance`. `locked_grains` is reserved for the
/// staking surface and currently always "0".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcBalance {
    pub user_id: String,
    pub available_grains: String,
    pub available_ore: String,
    pub locked_grains: String,
}

/// One ledger entry as returned by `oreline_getLedger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcLedgerEntry {
    pub entry_id: String,
    /// "mining_reward" or "referral_commission".
    pub kind: String,
    pub amount_grains: String,
    pub amount_ore: String,
    pub balance_before: String,
    pub balance_after: String,
    /// Session id (mining rewards) or referred user id (commissions).
    pub reference_id: Option<String>,
    pub created_at: i64,
    pub description: String,
    pub metadata: serde_json::Value,
}

impl From<&LedgerEntry> for RpcLedgerEntry {
    fn from(e: &LedgerEntry) -> Self {
        Self {
            entry_id: e.id.to_hex(),
            kind: e.kind.label().into(),
            amount_grains: e.amount.to_string(),
            amount_ore: format_ore(e.amount),
            balance_before: e.balance_before.to_string(),
            balance_after: e.balance_after.to_string(),
            reference_id: e.reference_id.map(hex::encode),
            created_at: e.created_at,
            description: e.description.clone(),
            metadata: e.metadata_value(),
        }
    }
}

/// One referral relation, from the referrer's side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReferralRelation {
    pub referred_id: String,
    pub commission_rate_bps: u32,
    pub status: String,
    pub total_commission_paid_grains: String,
    pub created_at: i64,
}

impl From<&ReferralRelation> for RpcReferralRelation {
    fn from(r: &ReferralRelation) -> Self {
        Self {
            referred_id: r.referred_id.to_hex(),
            commission_rate_bps: r.commission_rate_bps,
            status: match r.status {
                ReferralStatus::Active => "active".into(),
                ReferralStatus::Suspended => "suspended".into(),
            },
            total_commission_paid_grains: r.total_commission_paid.to_string(),
            created_at: r.created_at,
        }
    }
}

/// Result of `oreline_getReferralStats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReferralStats {
    pub user_id: String,
    pub referral_count: u32,
    pub total_commission_grains: String,
    pub total_commission_ore: String,
    pub relations: Vec<RpcReferralRelation>,
}

/// Result of `oreline_runSettlementSweep`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSweepReport {
    pub scanned: u64,
    pub expired_sessions: u64,
    pub settled: u64,
    pub skipped: u64,
    pub errors: u64,
    pub total_commission_grains: String,
}

/// Protocol constants returned by `oreline_getEngineInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEngineInfo {
    pub protocol: String,
    pub ticker: String,
    pub base_unit: String,
    pub grains_per_ore: u64,
    pub base_rate_grains_per_sec: u64,
    pub min_hash_power: u32,
    pub max_hash_power: u32,
    pub reward_cap_hours: i64,
    pub max_session_secs: i64,
    pub heartbeat_interval_secs: u64,
    pub background_heartbeat_interval_secs: u64,
    pub default_commission_rate_bps: u32,
    pub version: String,
}

impl RpcEngineInfo {
    pub fn current() -> Self {
        use oreline_core::constants::*;
        Self {
            protocol: "Oreline".into(),
            ticker: "ORE".into(),
            base_unit: "Grain".into(),
            grains_per_ore: GRAINS_PER_ORE as u64,
            base_rate_grains_per_sec: BASE_RATE_GRAINS_PER_SEC as u64,
            min_hash_power: MIN_HASH_POWER,
            max_hash_power: MAX_HASH_POWER,
            reward_cap_hours: REWARD_CAP_HOURS,
            max_session_secs: MAX_SESSION_SECS,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            background_heartbeat_interval_secs: BACKGROUND_HEARTBEAT_INTERVAL_SECS,
            default_commission_rate_bps: DEFAULT_COMMISSION_RATE_BPS,
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ore_formatting_pads_fraction() {
        assert_eq!(format_ore(0), "0.000000");
        assert_eq!(format_ore(312), "0.000312");
        assert_eq!(format_ore(1_000_000), "1.000000");
        assert_eq!(format_ore(20_736_000_000), "20736.000000");
    }
}
