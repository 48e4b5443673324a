//! oreline-sweep — the reconciliation sweep.
//!
//! The inline path (heartbeat / stop → opportunistic commission settlement)
//! is best-effort; this crate provides the catch-up job that makes the
//! system converge: expire sessions past the wall, then walk every referral
//! relation and settle whatever commission is still owed. The sweep is safe
//! to run at any cadence and concurrently with live traffic — settlement is
//! delta-based, so a pass over an already-consistent state pays nothing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use oreline_core::constants::DEFAULT_SWEEP_INTERVAL_SECS;
use oreline_core::types::{Grains, Timestamp};
use oreline_state::MiningEngine;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Summary of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Referral relations examined.
    pub scanned: u64,
    /// Active sessions finalized as Expired.
    pub expired_sessions: u64,
    /// Relations with an outstanding balance that got paid.
    pub settled: u64,
    /// Relations already fully paid (nothing owed).
    pub skipped: u64,
    /// Relations whose settlement failed; logged and left for the next pass.
    pub errors: u64,
    /// Total commission credited across the pass.
    pub total_commission_grains: Grains,
}

/// One full reconciliation pass at server time `now`.
///
/// Per-relation failures are counted, not propagated: a bad row must never
/// stop the sweep from reaching the rows behind it.
pub fn run_sweep(engine: &MiningEngine, now: Timestamp) -> SweepReport {
    let mut report = SweepReport::default();

    // Phase 1: expire sessions past the wall (credits their capped final
    // reward, which the settlement phase then picks up).
    match engine.expire_stale_sessions(now) {
        Ok(n) => report.expired_sessions = n as u64,
        Err(e) => {
            error!(error = %e, "sweep: expiry phase failed");
            report.errors += 1;
        }
    }

    // Phase 2: settle every referral relation.
    let relations = match engine.db.iter_referrals() {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "sweep: could not enumerate referral relations");
            report.errors += 1;
            return report;
        }
    };

    for relation in relations {
        report.scanned += 1;
        match engine.settle_commission(&relation.referred_id, now) {
            Ok(0) => report.skipped += 1,
            Ok(paid) => {
                report.settled += 1;
                report.total_commission_grains += paid;
            }
            Err(e) => {
                warn!(
                    referred = %relation.referred_id,
                    error = %e,
                    "sweep: settlement failed, will retry next pass"
                );
                report.errors += 1;
            }
        }
    }

    if report.settled > 0 || report.expired_sessions > 0 || report.errors > 0 {
        info!(
            scanned = report.scanned,
            expired = report.expired_sessions,
            settled = report.settled,
            skipped = report.skipped,
            errors = report.errors,
            grains = report.total_commission_grains,
            "sweep pass complete"
        );
    }
    report
}

/// Spawn the periodic sweep. Runs until the process exits.
pub fn spawn_sweep_task(engine: Arc<MiningEngine>, config: SweepConfig) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();
            let engine = Arc::clone(&engine);
            // The sweep is synchronous sled I/O; keep it off the async workers.
            if let Err(e) = tokio::task::spawn_blocking(move || run_sweep(&engine, now)).await {
                error!(error = %e, "sweep task panicked; next tick retries");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use oreline_core::constants::MAX_SESSION_SECS;
    use oreline_core::types::UserId;
    use oreline_reward::reward_grains;
    use oreline_state::{StartContext, StateDb};

    const T0: Timestamp = 1_700_000_000;

    fn temp_engine(name: &str) -> MiningEngine {
        let dir = std::env::temp_dir().join(format!("oreline_sweep_test_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        MiningEngine::new(Arc::new(StateDb::open(&dir).expect("open temp db")))
    }

    fn referred_miner(engine: &MiningEngine, handle: &str, referrer: &UserId) -> UserId {
        let user = UserId::from_handle(handle);
        engine.register_user(user, Some(*referrer), T0).unwrap();
        user
    }

    #[test]
    fn sweep_on_empty_state_is_a_noop() {
        let engine = temp_engine("empty");
        let report = run_sweep(&engine, T0);
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn sweep_expires_stale_sessions() {
        let engine = temp_engine("expires");
        let user = UserId::from_handle("stale-miner");
        engine
            .start_session(user, 5, StartContext::default(), T0)
            .unwrap();

        let report = run_sweep(&engine, T0 + MAX_SESSION_SECS + 60);
        assert_eq!(report.expired_sessions, 1);
        assert!(engine
            .get_active_session(&user, T0 + MAX_SESSION_SECS + 60)
            .unwrap()
            .is_none());
    }

    #[test]
    fn sweep_settles_outstanding_commission() {
        let engine = temp_engine("settles");
        let referrer = UserId::from_handle("sweep-referrer");
        engine.register_user(referrer, None, T0).unwrap();
        let miner = referred_miner(&engine, "sweep-miner", &referrer);

        let receipt = engine
            .start_session(miner, 5, StartContext::default(), T0)
            .unwrap();
        engine.heartbeat(&receipt.session_id, T0 + 3600).unwrap();

        // Simulate a missed inline settlement by rolling the relation back.
        let mut relation = engine.db.get_referral(&miner).unwrap().unwrap();
        let owed = relation.total_commission_paid;
        assert!(owed > 0);
        relation.total_commission_paid = 0;
        engine.db.put_referral(&relation).unwrap();

        // One pass pays exactly the shortfall; the referrer's ledger already
        // holds the earlier credit, so the pass must not re-pay past `owed`…
        let report = run_sweep(&engine, T0 + 3700);
        assert_eq!(report.scanned, 1);
        assert_eq!(report.settled, 1);
        assert_eq!(report.total_commission_grains, owed);

        let relation = engine.db.get_referral(&miner).unwrap().unwrap();
        assert_eq!(relation.total_commission_paid, owed);

        // …and a second pass converges: nothing more to pay.
        let report = run_sweep(&engine, T0 + 3800);
        assert_eq!(report.settled, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.total_commission_grains, 0);
    }

    #[test]
    fn sweep_pays_commission_on_expired_sessions_in_same_pass() {
        let engine = temp_engine("expire_then_settle");
        let referrer = UserId::from_handle("exp-referrer");
        engine.register_user(referrer, None, T0).unwrap();
        let miner = referred_miner(&engine, "exp-miner", &referrer);

        engine
            .start_session(miner, 3, StartContext::default(), T0)
            .unwrap();

        // Session runs past the wall with no heartbeat and no stop. One sweep
        // pass expires it and pays the commission on the capped reward.
        let now = T0 + MAX_SESSION_SECS + 10;
        let report = run_sweep(&engine, now);
        assert_eq!(report.expired_sessions, 1);

        let mined = reward_grains(MAX_SESSION_SECS, 3, 100);
        assert_eq!(engine.db.total_mined_grains(&miner).unwrap(), mined);

        let relation = engine.db.get_referral(&miner).unwrap().unwrap();
        assert_eq!(relation.total_commission_paid, relation.owed_for(mined));
    }

    #[test]
    fn repeated_sweeps_never_overpay() {
        let engine = temp_engine("idempotent");
        let referrer = UserId::from_handle("rep-referrer");
        engine.register_user(referrer, None, T0).unwrap();
        let miner = referred_miner(&engine, "rep-miner", &referrer);

        let receipt = engine
            .start_session(miner, 8, StartContext::default(), T0)
            .unwrap();
        engine.heartbeat(&receipt.session_id, T0 + 900).unwrap();
        engine.stop_session(&receipt.session_id, T0 + 1800).unwrap();

        let mined = engine.db.total_mined_grains(&miner).unwrap();
        for pass in 0..5 {
            let report = run_sweep(&engine, T0 + 2000 + pass);
            assert_eq!(report.settled, 0);
            assert_eq!(report.total_commission_grains, 0);
        }
        let relation = engine.db.get_referral(&miner).unwrap().unwrap();
        assert_eq!(relation.total_commission_paid, relation.owed_for(mined));
        let (referrer_balance, _) = engine.get_balance(&referrer).unwrap();
        assert_eq!(referrer_balance, relation.total_commission_paid);
    }
}
