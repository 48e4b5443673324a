//! oreline-state — persistent session store, ledger, and the mining engine.

pub mod db;
pub mod engine;

pub use db::StateDb;
pub use engine::{HeartbeatReceipt, MiningEngine, StartContext, StartReceipt, StopReceipt};
