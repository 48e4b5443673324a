use std::sync::Arc;

use sled::transaction::{
    ConflictableTransactionError, TransactionError, Transactional, TransactionalTree,
};
use tracing::{info, warn};

use oreline_core::constants::{
    DEFAULT_EFFICIENCY_PCT, MAX_EFFICIENCY_PCT, MAX_FINGERPRINT_BYTES, MAX_HASH_POWER,
    MAX_SESSION_SECS, MIN_HASH_POWER,
};
use oreline_core::error::OrelineError;
use oreline_core::ledger::{EntryKind, LedgerEntry};
use oreline_core::referral::{ReferralRelation, ReferralStatus};
use oreline_core::session::{MiningSession, SessionStatus};
use oreline_core::types::{EntryId, Grains, SessionId, Timestamp, UserId};
use oreline_core::user::User;
use oreline_reward::reward_grains;

use crate::db::{dec, enc, ledger_key, StateDb, META_SESSION_SEQ};

// ── Receipts ─────────────────────────────────────────────────────────────────

/// Result of a successful StartMining.
#[derive(Debug, Clone)]
pub struct StartReceipt {
    pub session_id: SessionId,
    pub start_time: Timestamp,
}

/// Result of a processed heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatReceipt {
    pub session_id: SessionId,
    pub elapsed_seconds: i64,
    pub added_grains: Grains,
    pub total_grains: Grains,
}

/// Result of a session finalization (explicit stop, or expiry).
#[derive(Debug, Clone)]
pub struct StopReceipt {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub status: &'static str,
    pub total_seconds: i64,
    pub total_grains: Grains,
}

/// Optional caller context captured when a session starts.
#[derive(Debug, Clone, Default)]
pub struct StartContext {
    pub efficiency_pct: Option<u32>,
    pub device_fingerprint: Option<String>,
    pub source_ip: Option<String>,
}

/// Outcome of the heartbeat transaction before error mapping.
enum HeartbeatOutcome {
    Applied(HeartbeatReceipt),
    /// The session was past the wall; it has been finalized as Expired.
    Expired(StopReceipt),
}

// ── MiningEngine ─────────────────────────────────────────────────────────────

/// The server-side mining authority.
///
/// Every operation is a short atomic read-modify-write over the state DB.
/// Elapsed time is always recomputed from the *stored* start time and the
/// caller-supplied server clock `now` — no client-reported total is ever
/// trusted or applied. Cross-tree mutations (session + ledger + balance
/// cache) commit through sled transactions, so concurrent heartbeats on the
/// same session serialize and a failed ledger write leaves no partial state.
pub struct MiningEngine {
    pub db: Arc<StateDb>,
}

fn commit_err(e: TransactionError<OrelineError>) -> OrelineError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => OrelineError::LedgerWriteFailed(e.to_string()),
    }
}

fn abort<T>(e: OrelineError) -> Result<T, ConflictableTransactionError<OrelineError>> {
    Err(ConflictableTransactionError::Abort(e))
}

impl MiningEngine {
    pub fn new(db: Arc<StateDb>) -> Self {
        Self { db }
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a user, optionally with a referrer. Idempotent: re-registering
    /// with the same referrer is a no-op; `referred_by` may be bound while
    /// unset but never changed once set.
    ///
    /// The upsert runs inside a sled transaction on the `users` tree so it
    /// serializes against concurrent reward credits for the same user — a
    /// plain read-then-put could write back a stale `balance`/`ledger_seq`
    /// and reuse a ledger key.
    pub fn register_user(
        &self,
        user_id: UserId,
        referred_by: Option<UserId>,
        now: Timestamp,
    ) -> Result<(), OrelineError> {
        if referred_by == Some(user_id) {
            return Err(OrelineError::ReferralSelfReference);
        }

        self.db
            .users
            .transaction(|users| {
                if let Some(referrer) = &referred_by {
                    if users.get(referrer.as_bytes())?.is_none() {
                        return abort(OrelineError::UnknownUser(referrer.to_hex()));
                    }
                }

                let existing = match users.get(user_id.as_bytes())? {
                    Some(bytes) => {
                        Some(dec::<User>(&bytes).map_err(ConflictableTransactionError::Abort)?)
                    }
                    None => None,
                };

                let row = match existing {
                    None => User::new(user_id, referred_by, now),
                    Some(user) => match (user.referred_by, referred_by) {
                        (prev, new) if prev == new => return Ok(()),
                        (Some(_), _) => return abort(OrelineError::ReferrerImmutable),
                        (None, new) => User {
                            referred_by: new,
                            ..user
                        },
                    },
                };
                users.insert(
                    user_id.as_bytes().as_slice(),
                    enc(&row).map_err(ConflictableTransactionError::Abort)?,
                )?;
                Ok(())
            })
            .map_err(commit_err)?;

        info!(user = %user_id, referred = referred_by.is_some(), "user registered");
        Ok(())
    }

    // ── Session lifecycle ────────────────────────────────────────────────────

    /// Start a mining session. Fails with `SessionAlreadyActive` if the user
    /// already has one; unknown users are auto-registered without a referrer.
    pub fn start_session(
        &self,
        user_id: UserId,
        hash_power: u32,
        ctx: StartContext,
        now: Timestamp,
    ) -> Result<StartReceipt, OrelineError> {
        if !(MIN_HASH_POWER..=MAX_HASH_POWER).contains(&hash_power) {
            return Err(OrelineError::InvalidHashPower {
                got: hash_power,
                min: MIN_HASH_POWER,
                max: MAX_HASH_POWER,
            });
        }
        let efficiency_pct = ctx.efficiency_pct.unwrap_or(DEFAULT_EFFICIENCY_PCT);
        if efficiency_pct > MAX_EFFICIENCY_PCT {
            return Err(OrelineError::InvalidEfficiency {
                got: efficiency_pct,
                max: MAX_EFFICIENCY_PCT,
            });
        }
        if let Some(fp) = &ctx.device_fingerprint {
            if fp.len() > MAX_FINGERPRINT_BYTES {
                return Err(OrelineError::FingerprintTooLong {
                    max: MAX_FINGERPRINT_BYTES,
                });
            }
        }

        let receipt = (
            &self.db.meta,
            &self.db.sessions,
            &self.db.active_by_user,
            &self.db.users,
        )
            .transaction(|(meta, sessions, active, users)| {
                if active.get(user_id.as_bytes())?.is_some() {
                    return abort(OrelineError::SessionAlreadyActive(user_id.to_hex()));
                }

                // Auto-register on first contact (the site creates profiles
                // lazily when a visitor first presses "start mining").
                if users.get(user_id.as_bytes())?.is_none() {
                    let user = User::new(user_id, None, now);
                    users.insert(
                        user_id.as_bytes().as_slice(),
                        enc(&user).map_err(ConflictableTransactionError::Abort)?,
                    )?;
                }

                let seq = match meta.get(META_SESSION_SEQ)? {
                    Some(bytes) => {
                        let mut arr = [0u8; 8];
                        arr.copy_from_slice(&bytes);
                        u64::from_be_bytes(arr)
                    }
                    None => 0,
                };
                meta.insert(META_SESSION_SEQ, (seq + 1).to_be_bytes().to_vec())?;

                let session_id = SessionId::derive(&user_id, now, seq);
                let session = MiningSession {
                    id: session_id,
                    user_id,
                    status: SessionStatus::Active,
                    start_time: now,
                    end_time: None,
                    last_heartbeat_at: now,
                    hash_power,
                    efficiency_pct,
                    accumulated_grains: 0,
                    heartbeat_count: 0,
                    device_fingerprint: ctx.device_fingerprint.clone(),
                    source_ip: ctx.source_ip.clone(),
                };
                sessions.insert(
                    session_id.as_bytes().as_slice(),
                    enc(&session).map_err(ConflictableTransactionError::Abort)?,
                )?;
                active.insert(user_id.as_bytes().as_slice(), session_id.as_bytes().as_slice())?;

                Ok(StartReceipt {
                    session_id,
                    start_time: now,
                })
            })
            .map_err(commit_err)?;

        info!(user = %user_id, session = %receipt.session_id, hash_power, "mining session started");
        Ok(receipt)
    }

    /// Process one heartbeat: recompute elapsed time from the stored start,
    /// apply the reward formula, credit the delta, and return the
    /// authoritative totals.
    pub fn heartbeat(
        &self,
        session_id: &SessionId,
        now: Timestamp,
    ) -> Result<HeartbeatReceipt, OrelineError> {
        let outcome = (
            &self.db.sessions,
            &self.db.active_by_user,
            &self.db.ledger,
            &self.db.users,
        )
            .transaction(|(sessions, active, ledger, users)| {
                let bytes = match sessions.get(session_id.as_bytes())? {
                    Some(b) => b,
                    None => return abort(OrelineError::SessionNotFound(session_id.to_hex())),
                };
                let mut session: MiningSession =
                    dec(&bytes).map_err(ConflictableTransactionError::Abort)?;

                if !session.status.is_active() {
                    return abort(OrelineError::SessionNotActive(session_id.to_hex()));
                }

                // Past the wall: finalize as Expired instead of accruing.
                if session.past_wall(now) {
                    let receipt =
                        finalize_session_tx(sessions, active, ledger, users, session, now)?;
                    return Ok(HeartbeatOutcome::Expired(receipt));
                }

                // Heartbeats must observe non-decreasing server time; going
                // backwards would produce a negative delta.
                if now < session.last_heartbeat_at {
                    return abort(OrelineError::ClockSkewDetected {
                        now,
                        last: session.last_heartbeat_at,
                    });
                }

                let elapsed = session.elapsed_secs(now);
                let new_total = reward_grains(elapsed, session.hash_power, session.efficiency_pct);
                // Monotonicity of the formula makes this non-negative; a
                // negative delta means stored state disagrees with the formula
                // (e.g. constants changed under a live DB) and is clamped, not
                // applied.
                let added = if new_total < session.accumulated_grains {
                    warn!(
                        session = %session_id,
                        stored = session.accumulated_grains,
                        recomputed = new_total,
                        "reward recomputation below stored total; clamping delta to zero"
                    );
                    0
                } else {
                    new_total - session.accumulated_grains
                };

                if added > 0 {
                    credit_tx(
                        users,
                        ledger,
                        &session.user_id,
                        EntryKind::MiningReward,
                        added,
                        Some(*session_id.as_bytes()),
                        format!("mining reward ({} Grains)", added),
                        serde_json::json!({
                            "session_id": session_id.to_hex(),
                            "elapsed_seconds": elapsed,
                            "hash_power": session.hash_power,
                        }),
                        now,
                    )?;
                    session.accumulated_grains = new_total;
                }
                session.last_heartbeat_at = now;
                session.heartbeat_count += 1;
                sessions.insert(
                    session_id.as_bytes().as_slice(),
                    enc(&session).map_err(ConflictableTransactionError::Abort)?,
                )?;

                Ok(HeartbeatOutcome::Applied(HeartbeatReceipt {
                    session_id: *session_id,
                    elapsed_seconds: elapsed,
                    added_grains: added,
                    total_grains: new_total,
                }))
            })
            .map_err(commit_err)?;

        match outcome {
            HeartbeatOutcome::Applied(receipt) => {
                if receipt.added_grains > 0 {
                    if let Some(user_id) = self.session_user(session_id)? {
                        self.settle_best_effort(&user_id, now);
                    }
                }
                Ok(receipt)
            }
            HeartbeatOutcome::Expired(receipt) => {
                info!(session = %session_id, "heartbeat on expired session; finalized");
                self.settle_best_effort(&receipt.user_id, now);
                Err(OrelineError::SessionNotActive(session_id.to_hex()))
            }
        }
    }

    /// Stop a session, crediting the final reward. Idempotent: stopping an
    /// already-terminal session returns the stored final result without
    /// re-crediting.
    pub fn stop_session(
        &self,
        session_id: &SessionId,
        now: Timestamp,
    ) -> Result<StopReceipt, OrelineError> {
        let receipt = self.finalize_session(session_id, now)?;
        self.settle_best_effort(&receipt.user_id, now);
        Ok(receipt)
    }

    /// The user's active session, if any. Performs the lazy expiry check: a
    /// stored session past the wall is finalized as Expired here and not
    /// returned.
    pub fn get_active_session(
        &self,
        user_id: &UserId,
        now: Timestamp,
    ) -> Result<Option<MiningSession>, OrelineError> {
        let Some(session_id) = self.db.active_session_id(user_id)? else {
            return Ok(None);
        };
        let Some(session) = self.db.get_session(&session_id)? else {
            return Ok(None);
        };
        if session.past_wall(now) {
            let receipt = self.finalize_session(&session_id, now)?;
            self.settle_best_effort(&receipt.user_id, now);
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Finalize a session (terminal state + final reward credit) atomically.
    fn finalize_session(
        &self,
        session_id: &SessionId,
        now: Timestamp,
    ) -> Result<StopReceipt, OrelineError> {
        let receipt = (
            &self.db.sessions,
            &self.db.active_by_user,
            &self.db.ledger,
            &self.db.users,
        )
            .transaction(|(sessions, active, ledger, users)| {
                let bytes = match sessions.get(session_id.as_bytes())? {
                    Some(b) => b,
                    None => return abort(OrelineError::SessionNotFound(session_id.to_hex())),
                };
                let session: MiningSession =
                    dec(&bytes).map_err(ConflictableTransactionError::Abort)?;
                finalize_session_tx(sessions, active, ledger, users, session, now)
            })
            .map_err(commit_err)?;

        info!(
            session = %session_id,
            status = receipt.status,
            total_grains = receipt.total_grains,
            "session finalized"
        );
        Ok(receipt)
    }

    /// Expire every active session past the wall. Returns the number expired.
    pub fn expire_stale_sessions(&self, now: Timestamp) -> Result<u32, OrelineError> {
        let mut expired = 0;
        for session_id in self.db.iter_active_session_ids()? {
            let Some(session) = self.db.get_session(&session_id)? else {
                continue;
            };
            if session.past_wall(now) {
                let receipt = self.finalize_session(&session_id, now)?;
                self.settle_best_effort(&receipt.user_id, now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    // ── Balances ─────────────────────────────────────────────────────────────

    /// `(available, locked)` in Grains. Unknown users have a zero balance.
    /// `locked` is reserved for the staking surface, which lives outside the
    /// engine; it is always 0 here.
    pub fn get_balance(&self, user_id: &UserId) -> Result<(Grains, Grains), OrelineError> {
        let available = self
            .db
            .get_user(user_id)?
            .map(|u| u.balance)
            .unwrap_or(0);
        Ok((available, 0))
    }

    // ── Referral commissions ─────────────────────────────────────────────────

    /// Settle the commission owed to the referrer of `referred_user_id`.
    ///
    /// Delta-based and idempotent: computes what is owed on the referred
    /// user's total mined-to-date (from the ledger, the source of truth) and
    /// pays only the shortfall over what has already been paid. A user
    /// without a referrer settles to 0 — a no-op, not an error. Safe to call
    /// from every reward event and from the sweep concurrently.
    pub fn settle_commission(
        &self,
        referred_user_id: &UserId,
        now: Timestamp,
    ) -> Result<Grains, OrelineError> {
        let Some(referred) = self.db.get_user(referred_user_id)? else {
            return Ok(0);
        };
        let Some(referrer_id) = referred.referred_by else {
            return Ok(0);
        };

        // Computed outside the transaction: concurrent mining can only grow
        // this total, so a stale read under-pays (the next settlement or the
        // sweep catches the remainder) and can never over-pay.
        let total_mined = self.db.total_mined_grains(referred_user_id)?;

        let paid = (&self.db.referrals, &self.db.ledger, &self.db.users)
            .transaction(|(referrals, ledger, users)| {
                let mut relation = match referrals.get(referred_user_id.as_bytes())? {
                    Some(bytes) => dec::<ReferralRelation>(&bytes)
                        .map_err(ConflictableTransactionError::Abort)?,
                    // Create-if-absent, rate sampled now and locked.
                    None => ReferralRelation::new(referrer_id, *referred_user_id, now),
                };

                if relation.status == ReferralStatus::Suspended {
                    return Ok(0);
                }

                let owed = relation.owed_for(total_mined);
                let pending = owed.saturating_sub(relation.total_commission_paid);
                if pending > 0 {
                    credit_tx(
                        users,
                        ledger,
                        &relation.referrer_id,
                        EntryKind::ReferralCommission,
                        pending,
                        Some(*referred_user_id.as_bytes()),
                        format!("referral commission ({} Grains)", pending),
                        serde_json::json!({
                            "referred_user_id": referred_user_id.to_hex(),
                            "commission_rate_bps": relation.commission_rate_bps,
                            "total_mined": total_mined.to_string(),
                            "paid_before": relation.total_commission_paid.to_string(),
                        }),
                        now,
                    )?;
                    relation.total_commission_paid += pending;
                }
                // Persist even when nothing was owed so the pair exists for
                // stats and future sweeps.
                referrals.insert(
                    referred_user_id.as_bytes().as_slice(),
                    enc(&relation).map_err(ConflictableTransactionError::Abort)?,
                )?;
                Ok(pending)
            })
            .map_err(commit_err)?;

        if paid > 0 {
            info!(
                referred = %referred_user_id,
                referrer = %referrer_id,
                grains = paid,
                "referral commission settled"
            );
        }
        Ok(paid)
    }

    /// Opportunistic settlement after a reward credit. Failures are logged
    /// and left for the reconciliation sweep; the triggering heartbeat/stop
    /// must not fail because a commission write did.
    fn settle_best_effort(&self, referred_user_id: &UserId, now: Timestamp) {
        if let Err(e) = self.settle_commission(referred_user_id, now) {
            warn!(
                referred = %referred_user_id,
                error = %e,
                "commission settlement deferred to sweep"
            );
        }
    }

    fn session_user(&self, session_id: &SessionId) -> Result<Option<UserId>, OrelineError> {
        Ok(self.db.get_session(session_id)?.map(|s| s.user_id))
    }
}

// ── Transactional helpers ────────────────────────────────────────────────────

/// Append a ledger entry and update the user's cached balance, both through
/// the supplied transactional trees. The entry's before/after balances are
/// computed from the row read inside the same transaction, so the
/// `balance_after = balance_before + amount` identity and the cache/ledger
/// agreement hold on every commit. The metadata JSON is flattened to text
/// here: the stored row must stay bincode-decodable.
#[allow(clippy::too_many_arguments)]
fn credit_tx(
    users: &TransactionalTree,
    ledger: &TransactionalTree,
    user_id: &UserId,
    kind: EntryKind,
    amount: Grains,
    reference_id: Option<[u8; 32]>,
    description: String,
    metadata: serde_json::Value,
    now: Timestamp,
) -> Result<LedgerEntry, ConflictableTransactionError<OrelineError>> {
    let bytes = match users.get(user_id.as_bytes())? {
        Some(b) => b,
        None => {
            return Err(ConflictableTransactionError::Abort(
                OrelineError::UnknownUser(user_id.to_hex()),
            ))
        }
    };
    let mut user: User = dec(&bytes).map_err(ConflictableTransactionError::Abort)?;

    let seq = user.ledger_seq;
    let entry = LedgerEntry {
        id: EntryId::derive(user_id, seq),
        user_id: *user_id,
        kind,
        amount,
        balance_before: user.balance,
        balance_after: user.balance + amount,
        reference_id,
        created_at: now,
        description,
        metadata: metadata.to_string(),
    };
    ledger.insert(
        ledger_key(user_id, seq).as_slice(),
        enc(&entry).map_err(ConflictableTransactionError::Abort)?,
    )?;

    user.balance = entry.balance_after;
    user.ledger_seq = seq + 1;
    users.insert(
        user_id.as_bytes().as_slice(),
        enc(&user).map_err(ConflictableTransactionError::Abort)?,
    )?;
    Ok(entry)
}

/// Shared terminal transition for stop and expiry.
///
/// Already-terminal sessions short-circuit to their stored result, which is
/// what makes a repeated stop (or a stop racing an in-flight heartbeat that
/// lost) observably idempotent. An expired session is paid through the wall,
/// not through `now` — time after the wall never accrues.
fn finalize_session_tx(
    sessions: &TransactionalTree,
    active: &TransactionalTree,
    ledger: &TransactionalTree,
    users: &TransactionalTree,
    mut session: MiningSession,
    now: Timestamp,
) -> Result<StopReceipt, ConflictableTransactionError<OrelineError>> {
    match &session.status {
        SessionStatus::Active => {}
        terminal => {
            let ended_at = session.end_time.unwrap_or(session.start_time);
            return Ok(StopReceipt {
                session_id: session.id,
                user_id: session.user_id,
                status: terminal.label(),
                total_seconds: ended_at - session.start_time,
                total_grains: session.accumulated_grains,
            });
        }
    }

    let expired = session.past_wall(now);
    let effective_elapsed = if expired {
        MAX_SESSION_SECS
    } else {
        session.elapsed_secs(now)
    };
    let final_total = reward_grains(
        effective_elapsed,
        session.hash_power,
        session.efficiency_pct,
    );
    let added = final_total.saturating_sub(session.accumulated_grains);

    if added > 0 {
        credit_tx(
            users,
            ledger,
            &session.user_id,
            EntryKind::MiningReward,
            added,
            Some(*session.id.as_bytes()),
            format!("mining reward, final ({} Grains)", added),
            serde_json::json!({
                "session_id": session.id.to_hex(),
                "elapsed_seconds": effective_elapsed,
                "final": true,
            }),
            now,
        )?;
    }

    let ended_at = session.start_time + effective_elapsed;
    session.status = if expired {
        SessionStatus::Expired { ended_at }
    } else {
        SessionStatus::Completed { ended_at }
    };
    session.end_time = Some(ended_at);
    session.last_heartbeat_at = ended_at;
    session.accumulated_grains = final_total.max(session.accumulated_grains);

    sessions.insert(
        session.id.as_bytes().as_slice(),
        enc(&session).map_err(ConflictableTransactionError::Abort)?,
    )?;
    active.remove(session.user_id.as_bytes().as_slice())?;

    Ok(StopReceipt {
        session_id: session.id,
        user_id: session.user_id,
        status: session.status.label(),
        total_seconds: effective_elapsed,
        total_grains: session.accumulated_grains,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use oreline_core::constants::{
        DEFAULT_COMMISSION_RATE_BPS, MAX_SESSION_SECS,
    };

    const T0: Timestamp = 1_700_000_000;

    fn temp_engine(name: &str) -> MiningEngine {
        let dir = std::env::temp_dir().join(format!("oreline_engine_test_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        MiningEngine::new(Arc::new(StateDb::open(&dir).expect("open temp db")))
    }

    fn uid(handle: &str) -> UserId {
        UserId::from_handle(handle)
    }

    fn start(engine: &MiningEngine, user: UserId, hash_power: u32) -> StartReceipt {
        engine
            .start_session(user, hash_power, StartContext::default(), T0)
            .unwrap()
    }

    // ── Start ────────────────────────────────────────────────────────────────

    #[test]
    fn start_creates_active_session() {
        let engine = temp_engine("start_ok");
        let user = uid("miner-1");
        let receipt = start(&engine, user, 5);
        assert_eq!(receipt.start_time, T0);

        let session = engine.get_active_session(&user, T0).unwrap().unwrap();
        assert_eq!(session.id, receipt.session_id);
        assert_eq!(session.hash_power, 5);
        assert_eq!(session.accumulated_grains, 0);
        assert!(session.status.is_active());
    }

    #[test]
    fn second_start_rejected_while_active() {
        let engine = temp_engine("start_dup");
        let user = uid("miner-dup");
        start(&engine, user, 3);
        let err = engine
            .start_session(user, 3, StartContext::default(), T0 + 10)
            .unwrap_err();
        assert!(matches!(err, OrelineError::SessionAlreadyActive(_)));
    }

    #[test]
    fn start_rejects_bad_hash_power() {
        let engine = temp_engine("start_hp");
        assert!(matches!(
            engine.start_session(uid("hp0"), 0, StartContext::default(), T0),
            Err(OrelineError::InvalidHashPower { .. })
        ));
        assert!(matches!(
            engine.start_session(uid("hp11"), 11, StartContext::default(), T0),
            Err(OrelineError::InvalidHashPower { .. })
        ));
    }

    #[test]
    fn restart_allowed_after_stop() {
        let engine = temp_engine("restart");
        let user = uid("restart");
        let first = start(&engine, user, 2);
        engine.stop_session(&first.session_id, T0 + 60).unwrap();
        let second = engine
            .start_session(user, 2, StartContext::default(), T0 + 120)
            .unwrap();
        assert_ne!(first.session_id, second.session_id);
    }

    // ── Heartbeat ────────────────────────────────────────────────────────────

    #[test]
    fn heartbeat_credits_formula_total() {
        let engine = temp_engine("hb_credit");
        let user = uid("hb");
        let receipt = start(&engine, user, 5);

        let hb = engine.heartbeat(&receipt.session_id, T0 + 15).unwrap();
        assert_eq!(hb.elapsed_seconds, 15);
        assert_eq!(hb.total_grains, reward_grains(15, 5, 100));
        assert_eq!(hb.added_grains, hb.total_grains);

        let (balance, locked) = engine.get_balance(&user).unwrap();
        assert_eq!(balance, hb.total_grains);
        assert_eq!(locked, 0);
    }

    #[test]
    fn heartbeat_pays_delta_not_full_total() {
        let engine = temp_engine("hb_delta");
        let user = uid("hb-delta");
        let receipt = start(&engine, user, 5);

        let hb1 = engine.heartbeat(&receipt.session_id, T0 + 15).unwrap();
        let hb2 = engine.heartbeat(&receipt.session_id, T0 + 30).unwrap();
        assert_eq!(hb2.total_grains, reward_grains(30, 5, 100));
        assert_eq!(hb2.added_grains, reward_grains(30, 5, 100) - reward_grains(15, 5, 100));
        assert!(hb2.added_grains > 0);

        // Balance equals the single authoritative total, not a double count.
        let (balance, _) = engine.get_balance(&user).unwrap();
        assert_eq!(balance, hb1.added_grains + hb2.added_grains);
        assert_eq!(balance, hb2.total_grains);
    }

    #[test]
    fn heartbeat_replay_with_no_elapsed_time_adds_zero() {
        let engine = temp_engine("hb_replay");
        let receipt = start(&engine, uid("hb-replay"), 5);
        engine.heartbeat(&receipt.session_id, T0 + 15).unwrap();
        let replay = engine.heartbeat(&receipt.session_id, T0 + 15).unwrap();
        assert_eq!(replay.added_grains, 0);
        assert_eq!(replay.total_grains, reward_grains(15, 5, 100));
    }

    #[test]
    fn heartbeat_rejects_clock_skew_without_mutation() {
        let engine = temp_engine("hb_skew");
        let user = uid("hb-skew");
        let receipt = start(&engine, user, 5);
        engine.heartbeat(&receipt.session_id, T0 + 30).unwrap();

        let err = engine.heartbeat(&receipt.session_id, T0 + 20).unwrap_err();
        assert!(matches!(err, OrelineError::ClockSkewDetected { .. }));

        // Nothing moved.
        let session = engine.get_active_session(&user, T0 + 30).unwrap().unwrap();
        assert_eq!(session.last_heartbeat_at, T0 + 30);
        assert_eq!(session.accumulated_grains, reward_grains(30, 5, 100));
        let (balance, _) = engine.get_balance(&user).unwrap();
        assert_eq!(balance, reward_grains(30, 5, 100));
    }

    #[test]
    fn heartbeat_after_long_gap_is_bounded_by_cap() {
        let engine = temp_engine("hb_gap");
        let receipt = start(&engine, uid("hb-gap"), 5);
        // Big gap, still inside the wall: one beat catches the whole total up.
        let hb = engine.heartbeat(&receipt.session_id, T0 + 20 * 3600).unwrap();
        assert_eq!(hb.total_grains, reward_grains(20 * 3600, 5, 100));
        assert_eq!(hb.added_grains, hb.total_grains);
    }

    #[test]
    fn heartbeat_on_unknown_session() {
        let engine = temp_engine("hb_missing");
        let bogus = SessionId::derive(&uid("nobody"), T0, 99);
        assert!(matches!(
            engine.heartbeat(&bogus, T0),
            Err(OrelineError::SessionNotFound(_))
        ));
    }

    #[test]
    fn heartbeat_past_wall_expires_and_errors() {
        let engine = temp_engine("hb_wall");
        let user = uid("hb-wall");
        let receipt = start(&engine, user, 5);

        let err = engine
            .heartbeat(&receipt.session_id, T0 + MAX_SESSION_SECS + 600)
            .unwrap_err();
        assert!(matches!(err, OrelineError::SessionNotActive(_)));

        // Session was finalized as Expired and paid through the wall only.
        let session = engine.db.get_session(&receipt.session_id).unwrap().unwrap();
        assert!(matches!(session.status, SessionStatus::Expired { .. }));
        assert_eq!(
            session.accumulated_grains,
            reward_grains(MAX_SESSION_SECS, 5, 100)
        );
        assert!(engine
            .get_active_session(&user, T0 + MAX_SESSION_SECS + 700)
            .unwrap()
            .is_none());
    }

    // ── Stop ─────────────────────────────────────────────────────────────────

    #[test]
    fn stop_credits_exactly_final_total_once() {
        let engine = temp_engine("stop_once");
        let user = uid("stop");
        let receipt = start(&engine, user, 5);

        engine.heartbeat(&receipt.session_id, T0 + 15).unwrap();
        engine.heartbeat(&receipt.session_id, T0 + 30).unwrap();
        let stop = engine.stop_session(&receipt.session_id, T0 + 45).unwrap();

        assert_eq!(stop.status, "completed");
        assert_eq!(stop.total_seconds, 45);
        assert_eq!(stop.total_grains, reward_grains(45, 5, 100));

        // N heartbeats + stop = one formula total, no double counting.
        let (balance, _) = engine.get_balance(&user).unwrap();
        assert_eq!(balance, reward_grains(45, 5, 100));
    }

    #[test]
    fn stop_is_idempotent() {
        let engine = temp_engine("stop_idem");
        let user = uid("stop-idem");
        let receipt = start(&engine, user, 5);

        let first = engine.stop_session(&receipt.session_id, T0 + 45).unwrap();
        let second = engine.stop_session(&receipt.session_id, T0 + 300).unwrap();
        assert_eq!(second.total_grains, first.total_grains);
        assert_eq!(second.total_seconds, first.total_seconds);
        assert_eq!(second.status, "completed");

        let (balance, _) = engine.get_balance(&user).unwrap();
        assert_eq!(balance, first.total_grains);
    }

    #[test]
    fn lazy_expiry_on_read() {
        let engine = temp_engine("lazy_expiry");
        let user = uid("lazy");
        let receipt = start(&engine, user, 4);

        let after_wall = T0 + MAX_SESSION_SECS + 1;
        assert!(engine.get_active_session(&user, after_wall).unwrap().is_none());

        let session = engine.db.get_session(&receipt.session_id).unwrap().unwrap();
        assert!(matches!(session.status, SessionStatus::Expired { .. }));
        // Expiry pays the capped final reward.
        let (balance, _) = engine.get_balance(&user).unwrap();
        assert_eq!(balance, reward_grains(MAX_SESSION_SECS, 4, 100));
    }

    #[test]
    fn ledger_entries_chain_balances() {
        let engine = temp_engine("ledger_chain");
        let user = uid("chain");
        let receipt = start(&engine, user, 5);
        engine.heartbeat(&receipt.session_id, T0 + 15).unwrap();
        engine.heartbeat(&receipt.session_id, T0 + 30).unwrap();
        engine.stop_session(&receipt.session_id, T0 + 45).unwrap();

        let entries = engine.db.iter_ledger_for_user(&user, 100).unwrap();
        assert_eq!(entries.len(), 3);
        for e in &entries {
            assert!(e.balanced());
            assert_eq!(e.kind, EntryKind::MiningReward);
        }
        // Newest-first: each entry's before equals the next-oldest's after.
        assert_eq!(entries[0].balance_before, entries[1].balance_after);
        assert_eq!(entries[1].balance_before, entries[2].balance_after);
        assert_eq!(entries[2].balance_before, 0);

        let (balance, _) = engine.get_balance(&user).unwrap();
        assert_eq!(balance, entries[0].balance_after);
        assert_eq!(engine.db.total_mined_grains(&user).unwrap(), balance);
    }

    // ── Registration ─────────────────────────────────────────────────────────

    #[test]
    fn register_rejects_self_reference_and_unknown_referrer() {
        let engine = temp_engine("reg_guards");
        let user = uid("reg");
        assert!(matches!(
            engine.register_user(user, Some(user), T0),
            Err(OrelineError::ReferralSelfReference)
        ));
        assert!(matches!(
            engine.register_user(user, Some(uid("ghost")), T0),
            Err(OrelineError::UnknownUser(_))
        ));
    }

    #[test]
    fn referrer_is_immutable_once_set() {
        let engine = temp_engine("reg_immutable");
        let referrer_a = uid("ref-a");
        let referrer_b = uid("ref-b");
        let user = uid("referred");
        engine.register_user(referrer_a, None, T0).unwrap();
        engine.register_user(referrer_b, None, T0).unwrap();
        engine.register_user(user, Some(referrer_a), T0).unwrap();

        // Same referrer: idempotent.
        engine.register_user(user, Some(referrer_a), T0 + 1).unwrap();
        // Different referrer: rejected.
        assert!(matches!(
            engine.register_user(user, Some(referrer_b), T0 + 2),
            Err(OrelineError::ReferrerImmutable)
        ));
    }

    #[test]
    fn late_referrer_binding_preserves_balance_and_ledger_seq() {
        let engine = temp_engine("reg_late_bind");
        let referrer = uid("late-ref");
        let user = uid("late-bound");
        engine.register_user(referrer, None, T0).unwrap();

        // Credits land before the referrer is bound.
        let receipt = start(&engine, user, 5);
        engine.heartbeat(&receipt.session_id, T0 + 15).unwrap();
        let before = engine.db.get_user(&user).unwrap().unwrap();
        assert!(before.balance > 0);
        assert_eq!(before.ledger_seq, 1);

        // Binding the referrer must upsert only referred_by; a stale
        // write-back would regress balance/ledger_seq and let the next
        // credit overwrite ledger entry 0.
        engine.register_user(user, Some(referrer), T0 + 16).unwrap();
        let after = engine.db.get_user(&user).unwrap().unwrap();
        assert_eq!(after.balance, before.balance);
        assert_eq!(after.ledger_seq, before.ledger_seq);
        assert_eq!(after.referred_by, Some(referrer));

        engine.heartbeat(&receipt.session_id, T0 + 30).unwrap();
        let entries = engine.db.iter_ledger_for_user(&user, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].balance_after, entries[0].balance_before);
    }

    // ── Commissions ──────────────────────────────────────────────────────────

    fn referred_pair(engine: &MiningEngine) -> (UserId, UserId) {
        let referrer = uid("referrer");
        let referred = uid("referred-miner");
        engine.register_user(referrer, None, T0).unwrap();
        engine.register_user(referred, Some(referrer), T0).unwrap();
        (referrer, referred)
    }

    #[test]
    fn settlement_pays_rate_on_total_mined() {
        let engine = temp_engine("commission_rate");
        let (referrer, referred) = referred_pair(&engine);

        let receipt = start(&engine, referred, 5);
        engine.heartbeat(&receipt.session_id, T0 + 3600).unwrap();

        let mined = engine.db.total_mined_grains(&referred).unwrap();
        assert!(mined > 0);

        let relation = engine.db.get_referral(&referred).unwrap().unwrap();
        assert_eq!(relation.commission_rate_bps, DEFAULT_COMMISSION_RATE_BPS);
        let expected = mined * DEFAULT_COMMISSION_RATE_BPS as u128 / 10_000;
        assert_eq!(relation.total_commission_paid, expected);

        let (referrer_balance, _) = engine.get_balance(&referrer).unwrap();
        assert_eq!(referrer_balance, expected);
    }

    #[test]
    fn settlement_is_idempotent_under_replay() {
        let engine = temp_engine("commission_replay");
        let (referrer, referred) = referred_pair(&engine);
        let receipt = start(&engine, referred, 5);
        engine.heartbeat(&receipt.session_id, T0 + 600).unwrap();

        let first_paid = engine.db.get_referral(&referred).unwrap().unwrap().total_commission_paid;
        // Re-settling with no new mining pays nothing more.
        assert_eq!(engine.settle_commission(&referred, T0 + 601).unwrap(), 0);
        assert_eq!(engine.settle_commission(&referred, T0 + 602).unwrap(), 0);

        let relation = engine.db.get_referral(&referred).unwrap().unwrap();
        assert_eq!(relation.total_commission_paid, first_paid);
        let (referrer_balance, _) = engine.get_balance(&referrer).unwrap();
        assert_eq!(referrer_balance, first_paid);
    }

    #[test]
    fn commission_never_exceeds_rate_times_mined() {
        let engine = temp_engine("commission_bound");
        let (_, referred) = referred_pair(&engine);
        let receipt = start(&engine, referred, 7);

        for step in 1..=10 {
            engine.heartbeat(&receipt.session_id, T0 + step * 45).unwrap();
            engine.settle_commission(&referred, T0 + step * 45).unwrap();

            let mined = engine.db.total_mined_grains(&referred).unwrap();
            let relation = engine.db.get_referral(&referred).unwrap().unwrap();
            assert!(relation.total_commission_paid <= relation.owed_for(mined));
        }
        engine.stop_session(&receipt.session_id, T0 + 500).unwrap();
        let mined = engine.db.total_mined_grains(&referred).unwrap();
        let relation = engine.db.get_referral(&referred).unwrap().unwrap();
        // Fully caught up after the final settlement.
        assert_eq!(relation.total_commission_paid, relation.owed_for(mined));
    }

    #[test]
    fn no_referrer_settles_to_zero() {
        let engine = temp_engine("commission_none");
        let loner = uid("loner");
        let receipt = start(&engine, loner, 5);
        engine.heartbeat(&receipt.session_id, T0 + 60).unwrap();
        assert_eq!(engine.settle_commission(&loner, T0 + 60).unwrap(), 0);
        assert!(engine.db.get_referral(&loner).unwrap().is_none());
    }

    #[test]
    fn commission_entry_references_referred_user() {
        let engine = temp_engine("commission_ref");
        let (referrer, referred) = referred_pair(&engine);
        let receipt = start(&engine, referred, 5);
        engine.heartbeat(&receipt.session_id, T0 + 3600).unwrap();

        let entries = engine.db.iter_ledger_for_user(&referrer, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::ReferralCommission);
        assert_eq!(entries[0].reference_id, Some(*referred.as_bytes()));
    }

    // ── Sweep primitives ─────────────────────────────────────────────────────

    #[test]
    fn expire_stale_sessions_only_touches_past_wall() {
        let engine = temp_engine("expire_stale");
        let fresh = uid("fresh");
        let stale = uid("stale");
        engine
            .start_session(stale, 5, StartContext::default(), T0 - MAX_SESSION_SECS - 100)
            .unwrap();
        start(&engine, fresh, 5);

        let expired = engine.expire_stale_sessions(T0 + 10).unwrap();
        assert_eq!(expired, 1);
        assert!(engine.get_active_session(&fresh, T0 + 10).unwrap().is_some());
        assert!(engine.get_active_session(&stale, T0 + 10).unwrap().is_none());
    }
}
