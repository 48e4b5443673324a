//! Reward formula: (elapsed time, hash power, efficiency) → Grains.
//!
//! Formula:  grains = baseRate × hashPower/ref × timeMult × elapsed × eff/100
//!
//! where timeMult = min(elapsed/3600, REWARD_CAP_HOURS) — the accrual *rate*
//! grows with session age until it saturates at the cap, after which accrual
//! continues linearly.
//!
//! Pure integer u128 arithmetic: the full numerator is multiplied out before
//! the single division, so rounding is deterministic and the function is
//! exactly reproducible on every heartbeat. Monotone non-decreasing in
//! elapsed time for fixed other inputs — the property the ledger's
//! delta-based settlement relies on.

use oreline_core::constants::{
    BASE_RATE_GRAINS_PER_SEC, REFERENCE_HASH_POWER, REWARD_CAP_HOURS,
};
use oreline_core::types::Grains;

/// Total Grains earned by a session that has been alive `elapsed_secs`.
///
/// This is a *total*, not a delta: the heartbeat authority computes
/// `reward_grains(now - start) - accumulated` to get the increment, which
/// monotonicity guarantees is non-negative.
pub fn reward_grains(elapsed_secs: i64, hash_power: u32, efficiency_pct: u32) -> Grains {
    if elapsed_secs <= 0 {
        return 0;
    }
    let elapsed = elapsed_secs as u128;

    // Time-multiplier numerator, saturating at the cap:
    //   min(elapsed, cap_hours * 3600) / 3600
    // kept as t_eff with the /3600 folded into the final denominator.
    let t_eff = elapsed.min((REWARD_CAP_HOURS as u128) * 3600);

    let numerator = BASE_RATE_GRAINS_PER_SEC
        * hash_power as u128
        * t_eff
        * elapsed
        * efficiency_pct as u128;
    let denominator = REFERENCE_HASH_POWER as u128 * 3600 * 100;

    numerator / denominator
}
