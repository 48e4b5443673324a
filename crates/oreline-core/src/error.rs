use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrelineError {
    // ── Session lifecycle ────────────────────────────────────────────────────
    #[error("user {0} already has an active mining session")]
    SessionAlreadyActive(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session is not active: {0}")]
    SessionNotActive(String),

    #[error("hash power out of range: got {got}, valid {min}..={max}")]
    InvalidHashPower { got: u32, min: u32, max: u32 },

    #[error("efficiency out of range: got {got}, max {max}")]
    InvalidEfficiency { got: u32, max: u32 },

    #[error("device fingerprint exceeds {max} bytes")]
    FingerprintTooLong { max: usize },

    // ── Heartbeat protocol ───────────────────────────────────────────────────
    #[error("clock skew detected: now {now} precedes last heartbeat {last}")]
    ClockSkewDetected { now: i64, last: i64 },

    // ── Users & referrals ────────────────────────────────────────────────────
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("a user cannot refer themselves")]
    ReferralSelfReference,

    #[error("referred_by is immutable once set")]
    ReferrerImmutable,

    // ── Ledger ───────────────────────────────────────────────────────────────
    #[error("ledger write failed: {0}")]
    LedgerWriteFailed(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ── General ──────────────────────────────────────────────────────────────
    #[error("{0}")]
    Other(String),
}
