//! Concurrency schedules: how many virtual users should be active at a given
//! point of the run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::utils::duration;

/// One leg of a ramp: move linearly to `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "duration")]
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Piecewise-linear ramp over a list of stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampSchedule {
    #[serde(default)]
    pub start_vus: u32,
    pub stages: Vec<Stage>,
}

impl RampSchedule {
    pub fn new(start_vus: u32, stages: Vec<Stage>) -> Self {
        Self { start_vus, stages }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }
        if self.max_target() == 0 {
            return Err(ConfigError::ZeroUsers);
        }
        // an empty timeline ends on the first tick, before any worker exists
        if self.total_duration().is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        Ok(())
    }

    /// Target concurrency `elapsed` after the run started.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let mut from = self.start_vus;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let delta = (stage.target as f64 - from as f64) * progress;
                return (from as f64 + delta).round().max(0.0) as u32;
            }
            from = stage.target;
            stage_start = stage_end;
        }

        from
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn final_target(&self) -> u32 {
        self.stages.last().map(|s| s.target).unwrap_or(self.start_vus)
    }

    pub fn max_target(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .max()
            .unwrap_or(0)
            .max(self.start_vus)
    }

    pub fn is_exhausted(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Index of the stage covering `elapsed`, `None` once every stage has run.
    pub fn stage_index(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (idx, stage) in self.stages.iter().enumerate() {
            stage_end += stage.duration;
            if elapsed < stage_end {
                return Some(idx);
            }
        }
        None
    }

    pub fn description(&self) -> String {
        let legs: Vec<String> = self
            .stages
            .iter()
            .map(|s| format!("{}→{}", duration::format_duration(s.duration), s.target))
            .collect();
        format!("ramping {} vus: {}", self.start_vus, legs.join(", "))
    }
}

/// Fixed number of workers, each running a fixed number of iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationSpec {
    pub vus: u32,
    pub iterations: u64,
    /// Hard cap on the whole run; workers still busy afterwards are stopped.
    #[serde(default, with = "duration::option")]
    pub max_duration: Option<Duration>,
}

impl IterationSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vus == 0 || self.iterations == 0 {
            return Err(ConfigError::ZeroIterations {
                vus: self.vus,
                iterations: self.iterations,
            });
        }
        Ok(())
    }

    pub fn target(&self) -> u32 {
        self.vus
    }

    pub fn total_iterations(&self) -> u64 {
        self.vus as u64 * self.iterations
    }

    pub fn description(&self) -> String {
        format!("{} vus x {} iterations", self.vus, self.iterations)
    }
}

/// What the orchestrator polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum LoadSchedule {
    RampingVus(RampSchedule),
    PerVuIterations(IterationSpec),
}

impl LoadSchedule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::RampingVus(ramp) => ramp.validate(),
            Self::PerVuIterations(spec) => spec.validate(),
        }
    }

    pub fn target_at(&self, elapsed: Duration) -> u32 {
        match self {
            Self::RampingVus(ramp) => ramp.target_at(elapsed),
            Self::PerVuIterations(spec) => spec.target(),
        }
    }

    pub fn iterations_per_vu(&self) -> Option<u64> {
        match self {
            Self::RampingVus(_) => None,
            Self::PerVuIterations(spec) => Some(spec.iterations),
        }
    }

    /// Iterations the whole run performs, when that is fixed up front.
    pub fn total_iterations(&self) -> Option<u64> {
        match self {
            Self::RampingVus(_) => None,
            Self::PerVuIterations(spec) => Some(spec.total_iterations()),
        }
    }

    pub fn max_vus(&self) -> u32 {
        match self {
            Self::RampingVus(ramp) => ramp.max_target(),
            Self::PerVuIterations(spec) => spec.vus,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::RampingVus(ramp) => ramp.description(),
            Self::PerVuIterations(spec) => spec.description(),
        }
    }
}
