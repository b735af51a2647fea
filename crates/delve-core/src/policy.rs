//! Acceleration strategies
//!
//! When a worker runs short on time the controller asks the configured
//! [`AccelerationStrategy`] what the relaunch should aim for. The exact
//! deficit is always reported; the strategy only shapes the targets and the
//! turn budget handed to the worker.

use delve_checkpoint::RequirementTable;
use delve_types::TimeStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shapes relaunch targets under time pressure
pub trait AccelerationStrategy: Send + Sync + fmt::Debug {
    /// Short name used in logs and instructions
    fn name(&self) -> &'static str;

    /// Requirements a relaunched worker should aim for
    fn targets(&self, base: &RequirementTable, status: TimeStatus) -> RequirementTable;

    /// Turn budget after acceleration
    ///
    /// `floor` is the configured minimum; the result never drops below it.
    fn turn_budget(&self, base: u32, floor: u32, _status: TimeStatus) -> u32 {
        base.max(floor)
    }
}

/// Keep the configured requirements whatever the clock says
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAcceleration;

impl AccelerationStrategy for NoAcceleration {
    fn name(&self) -> &'static str {
        "none"
    }

    fn targets(&self, base: &RequirementTable, _status: TimeStatus) -> RequirementTable {
        *base
    }
}

/// Scale requirements down once time turns critical
///
/// Turn budgets shrink with the targets, down to the configured minimum
/// number of turns.
#[derive(Debug, Clone, Copy)]
pub struct RelaxRequirements {
    factor: f64,
}

impl RelaxRequirements {
    /// Relax by `factor` (clamped into `0.0..=1.0`)
    #[inline]
    #[must_use]
    pub fn new(factor: f64) -> Self {
        Self {
            factor: factor.clamp(0.0, 1.0),
        }
    }

    /// Scaling factor
    #[inline]
    #[must_use]
    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl AccelerationStrategy for RelaxRequirements {
    fn name(&self) -> &'static str {
        "relax_requirements"
    }

    fn targets(&self, base: &RequirementTable, status: TimeStatus) -> RequirementTable {
        match status {
            TimeStatus::OnTrack => *base,
            TimeStatus::TimeCritical | TimeStatus::InsufficientTime => base.scaled(self.factor),
        }
    }

    fn turn_budget(&self, base: u32, floor: u32, status: TimeStatus) -> u32 {
        let turns = match status {
            TimeStatus::OnTrack => base,
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            TimeStatus::TimeCritical | TimeStatus::InsufficientTime => {
                ((f64::from(base) * self.factor).ceil() as u32).min(base)
            }
        };
        turns.max(floor)
    }
}

/// Strategy selection as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AccelerationMode {
    /// [`NoAcceleration`]
    None,
    /// [`RelaxRequirements`] with the given factor
    Relax {
        /// Fraction of each threshold kept
        factor: f64,
    },
}

impl Default for AccelerationMode {
    fn default() -> Self {
        Self::Relax { factor: 0.6 }
    }
}

impl AccelerationMode {
    /// Instantiate the configured strategy
    #[must_use]
    pub fn build(self) -> Box<dyn AccelerationStrategy> {
        match self {
            Self::None => Box::new(NoAcceleration),
            Self::Relax { factor } => Box::new(RelaxRequirements::new(factor)),
        }
    }
}
