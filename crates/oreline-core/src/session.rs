use serde::{Deserialize, Serialize};

use crate::constants::MAX_SESSION_SECS;
use crate::types::{Grains, SessionId, Timestamp, UserId};

// ── SessionStatus ────────────────────────────────────────────────────────────

/// Lifecycle of a mining session.
///
/// `Active → Completed` on explicit stop; `Active → Expired` once the session
/// passes the hard wall without being stopped. Both terminal transitions
/// perform a final reward settlement; terminal sessions are never mutated
/// again.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SessionStatus {
    Active,
    Completed { ended_at: Timestamp },
    Expired { ended_at: Timestamp },
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active)
    }

    /// Short label for RPC responses and logs.
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed { .. } => "completed",
            SessionStatus::Expired { .. } => "expired",
        }
    }
}

// ── MiningSession ────────────────────────────────────────────────────────────

/// One mining session as stored in the state DB.
///
/// `accumulated_grains` is the server's recomputation of the reward formula
/// at the last heartbeat — never a sum of client-supplied deltas — and is
/// monotone non-decreasing while the session is Active.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MiningSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub status: SessionStatus,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
    pub last_heartbeat_at: Timestamp,
    /// Linear reward multiplier, 1–10.
    pub hash_power: u32,
    /// Percentage, 0–100.
    pub efficiency_pct: u32,
    pub accumulated_grains: Grains,
    pub heartbeat_count: u64,
    /// Client User-Agent captured at start. Informational only.
    pub device_fingerprint: Option<String>,
    /// Forwarded client address captured at start. Informational only.
    pub source_ip: Option<String>,
}

impl MiningSession {
    /// Seconds of wall-clock life at `now`, floored at zero.
    pub fn elapsed_secs(&self, now: Timestamp) -> i64 {
        (now - self.start_time).max(0)
    }

    /// Whether the session has outlived the hard wall and must be expired.
    pub fn past_wall(&self, now: Timestamp) -> bool {
        self.status.is_active() && self.elapsed_secs(now) > MAX_SESSION_SECS
    }
}
