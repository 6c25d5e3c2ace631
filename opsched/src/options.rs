// options.rs — Scheduler configuration
//
// Loaded by the surrounding pipeline (or the `opsched` binary from JSON) and
// handed to the scheduler by value. Every field has a default so a partial
// JSON object is always valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Build configuration of the surrounding compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    #[default]
    Normal,
    Tuning,
}

/// Which tuning step the build is at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    #[default]
    None,
    BeforeUbMatch,
    AfterUbMatch,
    AfterBuilder,
    AfterBuilderSub,
}

/// How the kernel compiler should build a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileStrategy {
    /// Ordinary exact-shape build.
    #[default]
    Default,
    /// Keep the result even while tuning.
    KeepOptimize,
    /// Build without tuning.
    NoTune,
    /// Shape-generalized build issued online; never retried.
    FuzzyOnline,
}

impl CompileStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            CompileStrategy::Default => "default",
            CompileStrategy::KeepOptimize => "keep_optimize",
            CompileStrategy::NoTune => "no_tune",
            CompileStrategy::FuzzyOnline => "fuzzy_online",
        }
    }
}

/// Which nodes the scope grouper considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePolicy {
    #[default]
    Full,
    OnlyNeedsRecompile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Sleep between empty polls.
    pub poll_interval_ms: u64,
    /// Give up waiting after this long. `None` waits forever.
    pub deadline_ms: Option<u64>,
    pub build_mode: BuildMode,
    pub build_step: BuildStep,
    /// Runtime is configured for shape-generalized builds.
    pub fuzzy_build: bool,
    pub scope_policy: ScopePolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            poll_interval_ms: 1,
            deadline_ms: None,
            build_mode: BuildMode::Normal,
            build_step: BuildStep::None,
            fuzzy_build: false,
            scope_policy: ScopePolicy::Full,
        }
    }
}

impl SchedulerOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Tuning steps after the builder produce no useful signal from waiting
    /// on or recovering failed builds.
    pub fn tuning_without_recovery(&self) -> bool {
        self.build_mode == BuildMode::Tuning
            && matches!(
                self.build_step,
                BuildStep::AfterBuilder | BuildStep::AfterBuilderSub
            )
    }
}
