//! Normalized configuration — the loader's product, consumed read-only by
//! the engine, scheduler and host.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::StepConfig;

pub const DEFAULT_MAX_PARALLELISM: usize = 3;
pub const DEFAULT_MAX_RUNS_PER_CHECK: u32 = 50;
pub const DEFAULT_MAX_ROUTING_LOOPS: u32 = 10;
pub const DEFAULT_MAX_WORKFLOW_DEPTH: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TagFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TagFilter {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// A step passes when it carries every `include` tag and none of the
    /// `exclude` tags.
    pub fn matches(&self, tags: &[String]) -> bool {
        self.include.iter().all(|tag| tags.contains(tag))
            && !self.exclude.iter().any(|tag| tags.contains(tag))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingLimits {
    /// Combined goto + success + fail transitions allowed per scope.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
}

fn default_max_loops() -> u32 {
    DEFAULT_MAX_ROUTING_LOOPS
}

impl Default for RoutingLimits {
    fn default() -> Self {
        Self {
            max_loops: DEFAULT_MAX_ROUTING_LOOPS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineLimits {
    #[serde(default = "default_max_runs")]
    pub max_runs_per_check: u32,
    #[serde(default = "default_max_depth")]
    pub max_workflow_depth: u32,
}

fn default_max_runs() -> u32 {
    DEFAULT_MAX_RUNS_PER_CHECK
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_WORKFLOW_DEPTH
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_runs_per_check: DEFAULT_MAX_RUNS_PER_CHECK,
            max_workflow_depth: DEFAULT_MAX_WORKFLOW_DEPTH,
        }
    }
}

/// A config-declared cron job tied to a named step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticCronJob {
    pub step: String,
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub timezone: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_sec: u64,
}

fn default_heartbeat() -> u64 {
    15
}

fn default_lock_ttl() -> u64 {
    60
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heartbeat_interval_sec: default_heartbeat(),
            lock_ttl_sec: default_lock_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub jobs: Vec<StaticCronJob>,
    /// Safety-net due-check period; catches missed timers and
    /// wake-from-sleep gaps.
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
    #[serde(default)]
    pub ha: HaConfig,
    /// `memory`, `file`, or a SQL connection URL.
    #[serde(default)]
    pub store: Option<String>,
}

fn default_check_interval() -> u64 {
    30_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            check_interval_ms: default_check_interval(),
            ha: HaConfig::default(),
            store: None,
        }
    }
}

/// Fully-resolved configuration. Step order preserves the source file;
/// the engine uses it to break ties inside a topological wave.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisorConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default = "default_parallelism")]
    pub max_parallelism: usize,
    #[serde(default)]
    pub fail_fast: bool,
    /// Run-level failure predicate evaluated over the aggregate results.
    #[serde(default)]
    pub fail_if: Option<String>,
    #[serde(default)]
    pub tag_filter: Option<TagFilter>,
    #[serde(default)]
    pub routing: RoutingLimits,
    #[serde(default)]
    pub limits: EngineLimits,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_parallelism() -> usize {
    DEFAULT_MAX_PARALLELISM
}

impl Default for VisorConfig {
    fn default() -> Self {
        Self {
            version: None,
            steps: Vec::new(),
            output: None,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            fail_fast: false,
            fail_if: None,
            tag_filter: None,
            routing: RoutingLimits::default(),
            limits: EngineLimits::default(),
            scheduler: None,
            env: HashMap::new(),
        }
    }
}

impl VisorConfig {
    pub fn step(&self, name: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    /// Position in configuration order, used for deterministic tie-breaks.
    pub fn step_index(&self, name: &str) -> usize {
        self.steps
            .iter()
            .position(|step| step.name == name)
            .unwrap_or(usize::MAX)
    }
}
