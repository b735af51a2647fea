//! Minimum completion thresholds and deficit computation

use delve_types::WorkerKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::checkpoint::ItemCounts;

/// Minimum counts a worker must reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Primary items (papers, projects, threads)
    pub primary: u32,
    /// Key findings
    pub key: u32,
}

impl Requirement {
    /// Create requirement
    #[inline]
    #[must_use]
    pub const fn new(primary: u32, key: u32) -> Self {
        Self { primary, key }
    }
}

/// Requirements per worker kind, overridable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementTable {
    /// Academic workers
    pub academic: Requirement,
    /// GitHub workers
    pub github: Requirement,
    /// Community workers
    pub community: Requirement,
}

impl Default for RequirementTable {
    fn default() -> Self {
        Self {
            academic: Requirement::new(5, 3),
            github: Requirement::new(8, 4),
            community: Requirement::new(15, 3),
        }
    }
}

impl RequirementTable {
    /// Requirement for a worker kind
    #[inline]
    #[must_use]
    pub fn get(&self, kind: WorkerKind) -> Requirement {
        match kind {
            WorkerKind::Academic => self.academic,
            WorkerKind::Github => self.github,
            WorkerKind::Community => self.community,
        }
    }

    /// Override one kind's requirement
    #[must_use]
    pub fn with_requirement(mut self, kind: WorkerKind, requirement: Requirement) -> Self {
        match kind {
            WorkerKind::Academic => self.academic = requirement,
            WorkerKind::Github => self.github = requirement,
            WorkerKind::Community => self.community = requirement,
        }
        self
    }

    /// Scale every threshold by `factor`, rounding up, never below 1
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |n: u32| -> u32 {
            if n == 0 {
                return 0;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let scaled = (f64::from(n) * factor.clamp(0.0, 1.0)).ceil() as u32;
            scaled.max(1)
        };
        let apply = |r: Requirement| Requirement::new(scale(r.primary), scale(r.key));
        Self {
            academic: apply(self.academic),
            github: apply(self.github),
            community: apply(self.community),
        }
    }
}

/// Counted quantity that can fall short
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeficitField {
    /// Primary items
    Primary,
    /// Key findings
    Key,
}

impl fmt::Display for DeficitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Key => "key",
        })
    }
}

/// Shortfall of one field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deficit {
    /// Current count
    pub current: u32,
    /// Required count
    pub required: u32,
    /// `required - current`
    pub remaining: u32,
}

/// Deficits keyed by field; empty when the minimum is met
pub type DeficitMap = BTreeMap<DeficitField, Deficit>;

/// Result of comparing progress against a requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimumCheck {
    /// Whether every threshold is reached
    pub met: bool,
    /// Fields that fall short
    pub deficits: DeficitMap,
}

impl MinimumCheck {
    /// Compare counts against a requirement
    #[must_use]
    pub fn evaluate(requirement: Requirement, counts: ItemCounts) -> Self {
        let mut deficits = DeficitMap::new();
        for (field, current, required) in [
            (DeficitField::Primary, counts.primary, requirement.primary),
            (DeficitField::Key, counts.key, requirement.key),
        ] {
            if current < required {
                deficits.insert(
                    field,
                    Deficit {
                        current,
                        required,
                        remaining: required - current,
                    },
                );
            }
        }
        Self {
            met: deficits.is_empty(),
            deficits,
        }
    }
}
