use std::path::Path;

use oreline_core::error::OrelineError;
use oreline_core::ledger::{EntryKind, LedgerEntry};
use oreline_core::referral::ReferralRelation;
use oreline_core::session::MiningSession;
use oreline_core::types::{Grains, SessionId, UserId};
use oreline_core::user::User;

/// Meta-tree key holding the global session sequence counter (u64 BE).
pub(crate) const META_SESSION_SEQ: &[u8] = b"session_seq";

/// Persistent state database backed by sled (pure-Rust, no C dependencies).
///
/// Named trees (analogous to SQL tables):
///   users           — UserId bytes             → bincode(User)
///   sessions        — SessionId bytes          → bincode(MiningSession)
///   active_by_user  — UserId bytes             → SessionId bytes (at most one)
///   ledger          — UserId bytes ‖ seq (BE)  → bincode(LedgerEntry)
///   referrals       — referred UserId bytes    → bincode(ReferralRelation)
///   meta            — utf8 key bytes           → raw bytes
///
/// The ledger key embeds the per-user entry sequence so one prefix scan
/// yields a user's entries in append order — no secondary index needed.
/// Cross-tree writes that must be all-or-nothing go through
/// `sled::Transactional` in the engine; this type only provides the typed
/// accessors and scans.
pub struct StateDb {
    _db: sled::Db,
    pub(crate) users: sled::Tree,
    pub(crate) sessions: sled::Tree,
    pub(crate) active_by_user: sled::Tree,
    pub(crate) ledger: sled::Tree,
    pub(crate) referrals: sled::Tree,
    pub(crate) meta: sled::Tree,
}

/// Ledger key: user id ‖ big-endian sequence number.
pub(crate) fn ledger_key(user: &UserId, seq: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(user.as_bytes());
    key[32..].copy_from_slice(&seq.to_be_bytes());
    key
}

pub(crate) fn enc<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, OrelineError> {
    bincode::serialize(value).map_err(|e| OrelineError::Serialization(e.to_string()))
}

pub(crate) fn dec<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, OrelineError> {
    bincode::deserialize(bytes).map_err(|e| OrelineError::Serialization(e.to_string()))
}

fn storage(e: sled::Error) -> OrelineError {
    OrelineError::Storage(e.to_string())
}

impl StateDb {
    /// Open or create the state database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OrelineError> {
        let db = sled::open(path).map_err(storage)?;
        let users          = db.open_tree("users").map_err(storage)?;
        let sessions       = db.open_tree("sessions").map_err(storage)?;
        let active_by_user = db.open_tree("active_by_user").map_err(storage)?;
        let ledger         = db.open_tree("ledger").map_err(storage)?;
        let referrals      = db.open_tree("referrals").map_err(storage)?;
        let meta           = db.open_tree("meta").map_err(storage)?;
        Ok(Self { _db: db, users, sessions, active_by_user, ledger, referrals, meta })
    }

    // ── Users ────────────────────────────────────────────────────────────────

    pub fn get_user(&self, id: &UserId) -> Result<Option<User>, OrelineError> {
        match self.users.get(id.as_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_user(&self, user: &User) -> Result<(), OrelineError> {
        self.users
            .insert(user.id.as_bytes(), enc(user)?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn user_exists(&self, id: &UserId) -> bool {
        self.users.contains_key(id.as_bytes()).unwrap_or(false)
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn get_session(&self, id: &SessionId) -> Result<Option<MiningSession>, OrelineError> {
        match self.sessions.get(id.as_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_session(&self, session: &MiningSession) -> Result<(), OrelineError> {
        self.sessions
            .insert(session.id.as_bytes(), enc(session)?)
            .map_err(storage)?;
        Ok(())
    }

    /// The SessionId recorded as active for `user`, if any.
    pub fn active_session_id(&self, user: &UserId) -> Result<Option<SessionId>, OrelineError> {
        match self.active_by_user.get(user.as_bytes()).map_err(storage)? {
            Some(bytes) => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Some(SessionId::from_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// All SessionIds currently in the active index (sweep input).
    pub fn iter_active_session_ids(&self) -> Result<Vec<SessionId>, OrelineError> {
        let mut ids = Vec::new();
        for item in self.active_by_user.iter() {
            let (_, value) = item.map_err(storage)?;
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&value);
            ids.push(SessionId::from_bytes(arr));
        }
        Ok(ids)
    }

    // ── Ledger ───────────────────────────────────────────────────────────────

    /// A user's most recent `limit` ledger entries, newest first.
    pub fn iter_ledger_for_user(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, OrelineError> {
        let mut entries = Vec::new();
        for item in self.ledger.scan_prefix(user.as_bytes()).rev().take(limit) {
            let (_, value) = item.map_err(storage)?;
            entries.push(dec(&value)?);
        }
        Ok(entries)
    }

    /// Sum of a user's MiningReward entries — the authoritative
    /// "total mined to date" the commission engine settles against.
    pub fn total_mined_grains(&self, user: &UserId) -> Result<Grains, OrelineError> {
        let mut total: Grains = 0;
        for item in self.ledger.scan_prefix(user.as_bytes()) {
            let (_, value) = item.map_err(storage)?;
            let entry: LedgerEntry = dec(&value)?;
            if entry.kind == EntryKind::MiningReward {
                total += entry.amount;
            }
        }
        Ok(total)
    }

    /// Sum of ReferralCommission entries credited to `referrer` for a given
    /// referred user (audit queries and tests).
    pub fn total_commission_from(
        &self,
        referrer: &UserId,
        referred: &UserId,
    ) -> Result<Grains, OrelineError> {
        let mut total: Grains = 0;
        for item in self.ledger.scan_prefix(referrer.as_bytes()) {
            let (_, value) = item.map_err(storage)?;
            let entry: LedgerEntry = dec(&value)?;
            if entry.kind == EntryKind::ReferralCommission
                && entry.reference_id == Some(*referred.as_bytes())
            {
                total += entry.amount;
            }
        }
        Ok(total)
    }

    // ── Referral relations ───────────────────────────────────────────────────

    pub fn get_referral(&self, referred: &UserId) -> Result<Option<ReferralRelation>, OrelineError> {
        match self.referrals.get(referred.as_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_referral(&self, relation: &ReferralRelation) -> Result<(), OrelineError> {
        self.referrals
            .insert(relation.referred_id.as_bytes(), enc(relation)?)
            .map_err(storage)?;
        Ok(())
    }

    /// Every stored relation (sweep input).
    pub fn iter_referrals(&self) -> Result<Vec<ReferralRelation>, OrelineError> {
        let mut relations = Vec::new();
        for item in self.referrals.iter() {
            let (_, value) = item.map_err(storage)?;
            relations.push(dec(&value)?);
        }
        Ok(relations)
    }

    /// Relations where `referrer` is the beneficiary.
    pub fn iter_referrals_for_referrer(
        &self,
        referrer: &UserId,
    ) -> Result<Vec<ReferralRelation>, OrelineError> {
        Ok(self
            .iter_referrals()?
            .into_iter()
            .filter(|r| r.referrer_id == *referrer)
            .collect())
    }

    // ── Meta ─────────────────────────────────────────────────────────────────

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), OrelineError> {
        self.meta.insert(key.as_bytes(), value).map_err(storage)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, OrelineError> {
        self.meta
            .get(key.as_bytes())
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(storage)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), OrelineError> {
        self._db.flush().map_err(storage)?;
        Ok(())
    }
}
