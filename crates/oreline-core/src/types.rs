use serde::{Deserialize, Serialize};
use std::fmt;

/// Balance in Grains (1 ORE = 1_000_000 Grains). u128 leaves headroom for
/// any plausible lifetime accrual at the capped reward rate.
pub type Grains = u128;

/// Unix timestamp (seconds, UTC). The server clock is the only clock the
/// engine ever reads — client-reported times are never trusted.
pub type Timestamp = i64;

// ── UserId ───────────────────────────────────────────────────────────────────

/// 32-byte user identifier, assigned at registration by the site's account
/// layer and opaque to the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub [u8; 32]);

impl UserId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Derive a UserId from an external handle (email, username). Lets the
    /// site's account layer map its own keys onto engine identifiers.
    pub fn from_handle(handle: &str) -> Self {
        Self(*blake3::hash(handle.as_bytes()).as_bytes())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({}…)", &self.to_hex()[..8])
    }
}

// ── SessionId ────────────────────────────────────────────────────────────────

/// 32-byte mining-session identifier: BLAKE3(user_id ‖ start_time ‖ seq).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 32]);

impl SessionId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Derive the id for a new session.
    pub fn derive(user: &UserId, start_time: Timestamp, seq: u64) -> Self {
        let mut h = blake3::Hasher::new();
        h.update(user.as_bytes());
        h.update(&start_time.to_le_bytes());
        h.update(&seq.to_le_bytes());
        Self(*h.finalize().as_bytes())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}…)", &self.to_hex()[..8])
    }
}

// ── EntryId ──────────────────────────────────────────────────────────────────

/// 32-byte ledger-entry identifier: BLAKE3(user_id ‖ ledger_seq). The per-user
/// sequence number makes ids unique and replays detectable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub [u8; 32]);

impl EntryId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the id for the `seq`-th ledger entry of `user`.
    pub fn derive(user: &UserId, seq: u64) -> Self {
        let mut h = blake3::Hasher::new();
        h.update(user.as_bytes());
        h.update(&seq.to_le_bytes());
        Self(*h.finalize().as_bytes())
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({}…)", &self.to_hex()[..8])
    }
}
