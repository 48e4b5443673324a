use serde::{Deserialize, Serialize};

use crate::constants::{
    BPS_DENOMINATOR, DEFAULT_COMMISSION_RATE_BPS, PROMO_COMMISSION_RATE_BPS, PROMO_WINDOW_END,
    PROMO_WINDOW_START,
};
use crate::types::{Grains, Timestamp, UserId};

// ── ReferralStatus ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReferralStatus {
    Active,
    /// Kept for admin tooling; suspended relations are skipped by settlement.
    Suspended,
}

// ── ReferralRelation ─────────────────────────────────────────────────────────

/// One referrer → referred pair.
///
/// Created at most once per pair; re-creation attempts keep the stored
/// `commission_rate_bps` (the rate is sampled at creation and locked).
/// Invariant: `total_commission_paid ≤ total_mined_by_referred × rate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferralRelation {
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub commission_rate_bps: u32,
    pub status: ReferralStatus,
    pub total_commission_paid: Grains,
    pub created_at: Timestamp,
}

impl ReferralRelation {
    /// Build a fresh relation with the rate effective at `now`.
    pub fn new(referrer_id: UserId, referred_id: UserId, now: Timestamp) -> Self {
        Self {
            referrer_id,
            referred_id,
            commission_rate_bps: commission_rate_at(now),
            status: ReferralStatus::Active,
            total_commission_paid: 0,
            created_at: now,
        }
    }

    /// Total commission owed for `total_mined` Grains at this relation's rate.
    pub fn owed_for(&self, total_mined: Grains) -> Grains {
        total_mined * self.commission_rate_bps as u128 / BPS_DENOMINATOR
    }
}

/// The commission rate in force at `now`: the promotional rate inside the
/// promotional window, the default otherwise. Consulted only when a relation
/// is created — existing relations never change rate.
pub fn commission_rate_at(now: Timestamp) -> u32 {
    if (PROMO_WINDOW_START..=PROMO_WINDOW_END).contains(&now) {
        PROMO_COMMISSION_RATE_BPS
    } else {
        DEFAULT_COMMISSION_RATE_BPS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rate_outside_window() {
        assert_eq!(commission_rate_at(PROMO_WINDOW_START - 1), DEFAULT_COMMISSION_RATE_BPS);
        assert_eq!(commission_rate_at(PROMO_WINDOW_END + 1), DEFAULT_COMMISSION_RATE_BPS);
    }

    #[test]
    fn promo_rate_inside_window() {
        assert_eq!(commission_rate_at(PROMO_WINDOW_START), PROMO_COMMISSION_RATE_BPS);
        assert_eq!(commission_rate_at(PROMO_WINDOW_END), PROMO_COMMISSION_RATE_BPS);
    }

    #[test]
    fn owed_uses_locked_rate() {
        let a = UserId::from_handle("a");
        let b = UserId::from_handle("b");
        let rel = ReferralRelation::new(a, b, 0);
        assert_eq!(rel.commission_rate_bps, DEFAULT_COMMISSION_RATE_BPS);
        // 10% of 1 ORE.
        assert_eq!(rel.owed_for(1_000_000), 100_000);
    }
}
