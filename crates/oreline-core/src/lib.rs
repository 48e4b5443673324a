//! oreline-core — shared types, constants, errors, and persisted domain
//! models for the Oreline mining & referral engine.

pub mod constants;
pub mod error;
pub mod ledger;
pub mod referral;
pub mod session;
pub mod types;
pub mod user;
