use serde::{Deserialize, Serialize};

use crate::types::{EntryId, Grains, Timestamp, UserId};

// ── EntryKind ────────────────────────────────────────────────────────────────

/// The two balance-affecting events the engine produces.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    /// Elapsed-time reward credited to a miner by the heartbeat authority.
    MiningReward,
    /// Commission credited to a referrer by the settlement engine.
    ReferralCommission,
}

impl EntryKind {
    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::MiningReward => "mining_reward",
            EntryKind::ReferralCommission => "referral_commission",
        }
    }
}

// ── LedgerEntry ──────────────────────────────────────────────────────────────

/// One append-only row of the balance ledger.
///
/// Entries are never mutated or deleted after commit; the sum of a user's
/// entry amounts equals their cached balance (both are written in the same
/// storage transaction). `balance_after = balance_before + amount` holds for
/// every entry by construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub kind: EntryKind,
    pub amount: Grains,
    pub balance_before: Grains,
    pub balance_after: Grains,
    /// Session id for rewards; referred user id for commissions.
    pub reference_id: Option<[u8; 32]>,
    pub created_at: Timestamp,
    pub description: String,
    /// Free-form audit payload (rates, running totals, automation flags),
    /// stored as serialized JSON text. Bincode cannot decode
    /// `serde_json::Value` (it needs `deserialize_any`), so the structured
    /// form only exists at the RPC boundary via [`metadata_value`].
    ///
    /// [`metadata_value`]: LedgerEntry::metadata_value
    pub metadata: String,
}

impl LedgerEntry {
    /// Sanity check of the per-entry balance identity.
    pub fn balanced(&self) -> bool {
        self.balance_after == self.balance_before + self.amount
    }

    /// The audit payload parsed back into JSON. Entries written before a
    /// payload format change still return something renderable: unparsable
    /// text degrades to Null rather than erroring a whole ledger page.
    pub fn metadata_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.metadata).unwrap_or(serde_json::Value::Null)
    }
}
