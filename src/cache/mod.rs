//! Tier residency bookkeeping.
//!
//! - [`location`]: per-entry location codes and per-layer census
//! - [`ledger`]: TierLedger, the location grid plus fast-tier capacity accounting
//! - [`initializer`]: prefill placement before the replay starts

pub mod initializer;
pub mod ledger;
pub mod location;
