/// ─── Oreline Protocol Constants ─────────────────────────────────────────────
///
/// "Mining" here is a time-based reward simulation: hash power is a formula
/// multiplier, not computational work. The server clock and these constants
/// are the whole protocol.
///
/// Ticker:    ORE
/// Base unit: Grain  (1 ORE = 1,000,000 Grains)

// ── Units ────────────────────────────────────────────────────────────────────

/// 1 ORE expressed in Grains. All ledger amounts are integer Grains.
pub const GRAINS_PER_ORE: u128 = 1_000_000;

// ── Reward formula ───────────────────────────────────────────────────────────

/// Base accrual rate at reference hash power, in Grains per second
/// (0.001 ORE/s).
pub const BASE_RATE_GRAINS_PER_SEC: u128 = 1_000;

/// Hash power is a linear multiplier relative to this reference.
pub const REFERENCE_HASH_POWER: u32 = 1;

/// Valid hash power range for a session.
pub const MIN_HASH_POWER: u32 = 1;
pub const MAX_HASH_POWER: u32 = 10;

/// The time multiplier saturates after this many hours: an unattended
/// session keeps accruing linearly but its rate stops growing.
pub const REWARD_CAP_HOURS: i64 = 24;

/// Efficiency is a percentage; 100 means full rate.
pub const MAX_EFFICIENCY_PCT: u32 = 100;
pub const DEFAULT_EFFICIENCY_PCT: u32 = 100;

// ── Session lifecycle ────────────────────────────────────────────────────────

/// Hard wall for a session: 24 h of capped accrual plus 1 h grace. A session
/// past this wall is finalized as Expired on the next read, heartbeat, or
/// sweep pass.
pub const MAX_SESSION_SECS: i64 = 25 * 3600;

/// Expected client heartbeat cadence (seconds) with the tab in the
/// foreground. Missed beats are harmless: elapsed time is recomputed from
/// the stored start on every beat.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Reduced cadence while the hosting tab is hidden (the background worker
/// only reports liveness less often; it never computes rewards).
pub const BACKGROUND_HEARTBEAT_INTERVAL_SECS: u64 = 60;

// ── Referral commissions ─────────────────────────────────────────────────────

/// Default commission rate in basis points (10%).
pub const DEFAULT_COMMISSION_RATE_BPS: u32 = 1_000;

/// Promotional commission rate in basis points (15%), applied to relations
/// created inside the promotional window.
pub const PROMO_COMMISSION_RATE_BPS: u32 = 1_500;

/// Promotional window (Unix seconds UTC): 2025-12-01 00:00:00 through
/// 2026-01-06 23:59:59. The rate is sampled once, at relation creation;
/// existing relations are rate-locked.
pub const PROMO_WINDOW_START: i64 = 1_764_547_200;
pub const PROMO_WINDOW_END: i64 = 1_767_743_999;

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u128 = 10_000;

// ── Reconciliation sweep ─────────────────────────────────────────────────────

/// Default interval between sweep passes (seconds). Hourly keeps commission
/// drift small without noticeable read load.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3_600;

// ── Limits ───────────────────────────────────────────────────────────────────

/// Maximum ledger entries returned by a single query.
pub const MAX_LEDGER_PAGE: u32 = 200;

/// Maximum bytes of caller-supplied metadata stored on a session
/// (device fingerprint).
pub const MAX_FINGERPRINT_BYTES: usize = 256;
