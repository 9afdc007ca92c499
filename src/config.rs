use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::DispatcherConfig;
use crate::turtles::TurtleKind;

pub const DEFAULT_RUNTIME_MULTIPLIER: f64 = 1.1;
pub const DEFAULT_TIMEOUT_GRACE_MS: u64 = 2000;
pub const DEFAULT_BASELINE_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("pool size must be at least 1")]
    PoolSize,
    #[error("max busy workers must be at least 1")]
    MaxBusy,
    #[error("runtime multiplier must be positive, got {0}")]
    RuntimeMultiplier(f64),
    #[error("minimum score must be between 0 and 1, got {0}")]
    MinScore(f64),
    #[error("no turtles selected")]
    NoTurtles,
}

/// Where mutant test runs execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// On the calling thread, without a process boundary.
    InProcess,
    /// On a pool of worker processes owned by this process.
    #[default]
    Pool,
    /// Through a separate `mutator dispatch` process.
    Subprocess,
}

#[derive(Debug, Clone)]
pub struct MutationConfig {
    pub suite_path: PathBuf,
    /// Methods to mutate; empty means every method with a body.
    pub methods: Vec<String>,
    pub turtles: Vec<TurtleKind>,
    pub runtime_multiplier: f64,
    pub timeout_grace_ms: u64,
    pub baseline_timeout_ms: u64,
    pub pool_size: usize,
    pub max_busy: usize,
    pub one_shot: bool,
    pub load_symbols: bool,
    pub isolation: Isolation,
    /// Pass with survivors as long as the score reaches this.
    pub min_score: Option<f64>,
    pub scratch_root: Option<PathBuf>,
    pub session: String,
}

pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn generate_session_id() -> String {
    format!("{:08x}", fastrand::u32(..))
}

impl MutationConfig {
    pub fn new(suite_path: impl Into<PathBuf>) -> Self {
        let pool_size = default_pool_size();
        MutationConfig {
            suite_path: suite_path.into(),
            methods: Vec::new(),
            turtles: TurtleKind::ALL.to_vec(),
            runtime_multiplier: DEFAULT_RUNTIME_MULTIPLIER,
            timeout_grace_ms: DEFAULT_TIMEOUT_GRACE_MS,
            baseline_timeout_ms: DEFAULT_BASELINE_TIMEOUT_MS,
            pool_size,
            max_busy: pool_size,
            one_shot: false,
            load_symbols: true,
            isolation: Isolation::default(),
            min_score: None,
            scratch_root: None,
            session: generate_session_id(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::PoolSize);
        }
        if self.max_busy == 0 {
            return Err(ConfigError::MaxBusy);
        }
        if !(self.runtime_multiplier > 0.0) {
            return Err(ConfigError::RuntimeMultiplier(self.runtime_multiplier));
        }
        if let Some(score) = self.min_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(ConfigError::MinScore(score));
            }
        }
        if self.turtles.is_empty() {
            return Err(ConfigError::NoTurtles);
        }
        Ok(())
    }

    /// Budget for one mutant given how long the unmutated tests took.
    pub fn time_budget_ms(&self, baseline_ms: u64) -> u64 {
        (baseline_ms as f64 * self.runtime_multiplier) as u64 + self.timeout_grace_ms
    }

    /// How many mutants may be in flight at once.
    pub fn window(&self) -> usize {
        match self.isolation {
            Isolation::InProcess => 1,
            Isolation::Pool | Isolation::Subprocess => self.max_busy.max(1),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            pool_size: self.pool_size,
            max_busy: self.max_busy,
            one_shot: self.one_shot,
            timeout_grace_ms: self.timeout_grace_ms,
            poll_interval: Duration::from_millis(10),
        }
    }
}
