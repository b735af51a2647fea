//! Delve configuration
//!
//! Every heuristic constant lives here rather than in code. The file format
//! is TOML and every field is optional:
//!
//! ```toml
//! data_dir = "research_data"
//! knowledge_base = "default"
//!
//! [budget]
//! reallocation_floor_secs = 900
//!
//! [requirements.github]
//! primary = 10
//! key = 5
//!
//! [continuation]
//! max_relaunches = 2
//! acceleration = { mode = "relax", factor = 0.5 }
//! ```

use crate::error::CoreError;
use crate::policy::AccelerationMode;
use delve_budget::BudgetPolicy;
use delve_checkpoint::RequirementTable;
use delve_memory::WindowLimits;
use delve_types::validate_path_segment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How timed-out workers are continued
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationPolicy {
    /// Relaunches before a deficit is accepted; the last one is the final attempt
    pub max_relaunches: u32,
    /// Checkpoint intervals an expired worker gets before it is written off
    pub grace_checkpoints: u32,
    /// Strategy applied to relaunch targets under time pressure
    pub acceleration: AccelerationMode,
}

impl Default for ContinuationPolicy {
    fn default() -> Self {
        Self {
            max_relaunches: 2,
            grace_checkpoints: 2,
            acceleration: AccelerationMode::default(),
        }
    }
}

impl ContinuationPolicy {
    /// With relaunch limit
    #[inline]
    #[must_use]
    pub fn with_max_relaunches(mut self, max: u32) -> Self {
        self.max_relaunches = max;
        self
    }

    /// With grace period in checkpoint intervals
    #[inline]
    #[must_use]
    pub fn with_grace_checkpoints(mut self, intervals: u32) -> Self {
        self.grace_checkpoints = intervals;
        self
    }

    /// With acceleration mode
    #[inline]
    #[must_use]
    pub fn with_acceleration(mut self, mode: AccelerationMode) -> Self {
        self.acceleration = mode;
        self
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelveConfig {
    /// Root of all durable state
    pub data_dir: PathBuf,
    /// Name of the persisted semantic graph
    pub knowledge_base: String,
    /// Time budget heuristics
    pub budget: BudgetPolicy,
    /// Completion thresholds per worker kind
    pub requirements: RequirementTable,
    /// Relaunch behaviour
    pub continuation: ContinuationPolicy,
    /// Episodic window bounds
    pub window: WindowLimits,
}

impl Default for DelveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("research_data"),
            knowledge_base: "default".to_string(),
            budget: BudgetPolicy::default(),
            requirements: RequirementTable::default(),
            continuation: ContinuationPolicy::default(),
            window: WindowLimits::default(),
        }
    }
}

impl DelveConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Unreadable file, invalid TOML or out-of-range values
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| CoreError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// [`CoreError::Config`] or [`CoreError::Budget`] naming the bad value
    pub fn validate(&self) -> Result<(), CoreError> {
        self.budget.validate()?;
        validate_path_segment(&self.knowledge_base)
            .map_err(|e| CoreError::Config(format!("knowledge_base: {e}")))?;
        if self.window.max_active_sessions == 0 {
            return Err(CoreError::Config("window.max_active_sessions must be positive".into()));
        }
        if self.window.working_set_limit == 0 {
            return Err(CoreError::Config("window.working_set_limit must be positive".into()));
        }
        if let AccelerationMode::Relax { factor } = self.continuation.acceleration {
            if !(factor > 0.0 && factor <= 1.0) {
                return Err(CoreError::Config(format!(
                    "continuation.acceleration.factor must be in (0, 1], got {factor}"
                )));
            }
        }
        Ok(())
    }

    /// With data directory
    #[inline]
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// With knowledge base name
    #[inline]
    #[must_use]
    pub fn with_knowledge_base(mut self, name: impl Into<String>) -> Self {
        self.knowledge_base = name.into();
        self
    }

    /// With budget policy
    #[inline]
    #[must_use]
    pub fn with_budget(mut self, budget: BudgetPolicy) -> Self {
        self.budget = budget;
        self
    }

    /// With requirement table
    #[inline]
    #[must_use]
    pub fn with_requirements(mut self, requirements: RequirementTable) -> Self {
        self.requirements = requirements;
        self
    }

    /// With continuation policy
    #[inline]
    #[must_use]
    pub fn with_continuation(mut self, continuation: ContinuationPolicy) -> Self {
        self.continuation = continuation;
        self
    }

    /// With episodic window limits
    #[inline]
    #[must_use]
    pub fn with_window(mut self, window: WindowLimits) -> Self {
        self.window = window;
        self
    }
}
