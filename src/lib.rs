//! kv-tier-sim: trace-driven simulation of KV-cache placement and migration
//! across a fast (HBM) tier and a far memory tier.
//!
//! A precomputed trace records, for every decode step, which cached tokens the
//! step skips. The simulator replays it against a tier ledger, lets a placement
//! policy and a migration policy move entries between tiers, and charges each
//! step with a bandwidth-contention cost model.

pub mod cache;
pub mod config;
pub mod policy;
pub mod sim;
pub mod trace;
