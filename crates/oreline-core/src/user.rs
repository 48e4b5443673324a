use serde::{Deserialize, Serialize};

use crate::types::{Grains, Timestamp, UserId};

/// Balance projection for one user.
///
/// `balance` is a cache of the ledger sum, kept in sync transactionally with
/// every entry append; the ledger remains the source of truth. `referred_by`
/// is set once at registration and immutable thereafter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub balance: Grains,
    pub referred_by: Option<UserId>,
    /// Monotone counter used to derive unique `EntryId`s for this user.
    pub ledger_seq: u64,
    pub created_at: Timestamp,
}

impl User {
    pub fn new(id: UserId, referred_by: Option<UserId>, now: Timestamp) -> Self {
        Self {
            id,
            balance: 0,
            referred_by,
            ledger_seq: 0,
            created_at: now,
        }
    }
}
