//! Step-time cost model.
//!
//! The fast tier and the far tier work in parallel; a step takes as long as
//! the slower of the two paths:
//!
//! ```text
//! fast      = (α·R + β·W + fast_read + fast_write) / B_fast
//! far_read  = (1-α)·R / min(B_far_read, B_far_internal)
//! far_write = max(
//!     (w_far·W + far_write) / B_far_write,
//!     far_read_mig / B_far_read,
//!     (w_far·W + far_write + far_read_mig) / B_far_internal,
//! )
//! step      = max(fast, far_read + far_write)
//! ```
//!
//! where `w_far` is `1-β` under exclusive accounting and `1` under inclusive
//! accounting. A zero bandwidth contributes zero time.

use serde::Serialize;

use crate::cache::ledger::StepVolumes;
use crate::config::{Accounting, TierConfig};
use crate::policy::migration::MigrationTraffic;

/// Time components of one step, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StepTime {
    pub fast: f64,
    pub far_read: f64,
    pub far_write: f64,
    pub total: f64,
}

/// Bandwidth-contention cost model.
#[derive(Debug, Clone)]
pub struct CostModel {
    fast_bandwidth: f64,
    far_read_bandwidth: f64,
    far_write_bandwidth: f64,
    far_internal_bandwidth: f64,
    far_effective_read_bandwidth: f64,
    accounting: Accounting,
}

fn transfer_time(bytes: f64, bandwidth: f64) -> f64 {
    if bandwidth > 0.0 {
        bytes / bandwidth
    } else {
        0.0
    }
}

impl CostModel {
    pub fn new(tiers: &TierConfig) -> Self {
        Self {
            fast_bandwidth: tiers.fast_bandwidth,
            far_read_bandwidth: tiers.far_read_bandwidth,
            far_write_bandwidth: tiers.far_write_bandwidth,
            far_internal_bandwidth: tiers.far_internal_bandwidth,
            far_effective_read_bandwidth: tiers.far_effective_read_bandwidth(),
            accounting: tiers.accounting,
        }
    }

    /// Time for one step reading `alpha` of its reads from, and writing `beta`
    /// of its writes to, the fast tier, plus the given migration traffic.
    pub fn step_time(
        &self,
        alpha: f64,
        beta: f64,
        volumes: StepVolumes,
        traffic: MigrationTraffic,
    ) -> StepTime {
        let read = volumes.read as f64;
        let write = volumes.write as f64;
        let far_share = match self.accounting {
            Accounting::Exclusive => 1.0 - beta,
            Accounting::Inclusive => 1.0,
        };

        let fast_bytes = alpha * read
            + beta * write
            + traffic.fast_read as f64
            + traffic.fast_write as f64;
        let fast = transfer_time(fast_bytes, self.fast_bandwidth);

        let far_read = transfer_time((1.0 - alpha) * read, self.far_effective_read_bandwidth);

        let far_written = far_share * write + traffic.far_write as f64;
        let migrated_out = traffic.far_read as f64;
        let far_write = transfer_time(far_written, self.far_write_bandwidth)
            .max(transfer_time(migrated_out, self.far_read_bandwidth))
            .max(transfer_time(far_written + migrated_out, self.far_internal_bandwidth));

        StepTime {
            fast,
            far_read,
            far_write,
            total: fast.max(far_read + far_write),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(accounting: Accounting) -> CostModel {
        CostModel::new(&TierConfig {
            fast_bandwidth: 100.0,
            far_read_bandwidth: 10.0,
            far_write_bandwidth: 20.0,
            far_internal_bandwidth: 40.0,
            accounting,
            ..Default::default()
        })
    }

    #[test]
    fn test_fast_dominated_step() {
        let time = model(Accounting::Exclusive).step_time(
            1.0,
            1.0,
            StepVolumes { read: 1000, write: 100 },
            MigrationTraffic::default(),
        );
        assert!((time.fast - 11.0).abs() < 1e-12);
        assert_eq!(time.far_read, 0.0);
        assert_eq!(time.far_write, 0.0);
        assert!((time.total - 11.0).abs() < 1e-12);
    }

    #[test]
    fn test_far_dominated_step() {
        let time = model(Accounting::Exclusive).step_time(
            0.5,
            0.0,
            StepVolumes { read: 1000, write: 100 },
            MigrationTraffic {
                far_read: 40,
                ..Default::default()
            },
        );
        assert!((time.fast - 5.0).abs() < 1e-12);
        // 500 bytes at min(10, 40).
        assert!((time.far_read - 50.0).abs() < 1e-12);
        // max(100/20, 40/10, 140/40) = 5.
        assert!((time.far_write - 5.0).abs() < 1e-12);
        assert!((time.total - 55.0).abs() < 1e-12);
    }

    #[test]
    fn test_migration_read_can_dominate_far_write() {
        let time = model(Accounting::Exclusive).step_time(
            1.0,
            1.0,
            StepVolumes { read: 0, write: 0 },
            MigrationTraffic {
                far_read: 100,
                far_write: 20,
                ..Default::default()
            },
        );
        // max(20/20, 100/10, 120/40) = 10.
        assert!((time.far_write - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_inclusive_writes_through_to_far() {
        let volumes = StepVolumes { read: 0, write: 100 };
        let exclusive = model(Accounting::Exclusive).step_time(0.0, 1.0, volumes, MigrationTraffic::default());
        let inclusive = model(Accounting::Inclusive).step_time(0.0, 1.0, volumes, MigrationTraffic::default());
        assert_eq!(exclusive.far_write, 0.0);
        assert!((inclusive.far_write - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_bandwidth_contributes_nothing() {
        let model = CostModel::new(&TierConfig {
            fast_bandwidth: 0.0,
            far_read_bandwidth: 0.0,
            far_write_bandwidth: 0.0,
            far_internal_bandwidth: 0.0,
            ..Default::default()
        });
        let time = model.step_time(
            0.5,
            0.5,
            StepVolumes { read: 1000, write: 100 },
            MigrationTraffic {
                fast_read: 1,
                fast_write: 1,
                far_read: 1,
                far_write: 1,
            },
        );
        assert_eq!(time, StepTime::default());
    }
}
