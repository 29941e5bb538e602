//! Simulation engine.
//!
//! - [`cost`]: bandwidth-contention step-time model
//! - [`simulator`]: step-by-step trace replay and the upper-bound run
//! - [`experiment`]: runs every placement x migration combination from one initialized ledger
//! - [`report`]: text log and JSON summary writers

pub mod cost;
pub mod experiment;
pub mod report;
pub mod simulator;
