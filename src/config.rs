//! Collector tuning parameters.

use std::fmt;

/// Tunables for the reclamation engine.
///
/// The defaults are what the engine was measured with; most deployments
/// never touch them.
///
/// ```
/// use fission::Config;
///
/// let config = Config {
///     max_workers: 8,
///     verbose: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-mutator retire-buffer capacity. A mutator's buffer is submitted
    /// to the collector as one batch when it fills.
    pub ptrs_per_thread: usize,

    /// Upper bound on parallel scan/sweep workers.
    pub max_workers: usize,

    /// Sweep work-shard size: one worker per this many candidates, capped
    /// by `max_workers`.
    pub addrs_per_worker: usize,

    /// Recursion cap in the transitive decrement. Chains longer than this
    /// are finished by later fixpoint passes instead of deeper recursion.
    pub max_unref_depth: usize,

    /// Quicksort falls back to insertion sort at and below this run length.
    pub sort_threshold: usize,

    /// Log a summary line per reclamation cycle.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ptrs_per_thread: 4096,
            max_workers: 80,
            addrs_per_worker: 128 * 1024,
            max_unref_depth: 30,
            sort_threshold: 16,
            verbose: false,
        }
    }
}

impl Config {
    /// Defaults overridden from `FISSION_*` environment variables:
    /// `FISSION_PTRS_PER_THREAD`, `FISSION_MAX_WORKERS`,
    /// `FISSION_ADDRS_PER_WORKER`, `FISSION_MAX_UNREF_DEPTH`,
    /// `FISSION_VERBOSE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_usize("FISSION_PTRS_PER_THREAD") {
            config.ptrs_per_thread = v;
        }
        if let Some(v) = env_usize("FISSION_MAX_WORKERS") {
            config.max_workers = v;
        }
        if let Some(v) = env_usize("FISSION_ADDRS_PER_WORKER") {
            config.addrs_per_worker = v;
        }
        if let Some(v) = env_usize("FISSION_MAX_UNREF_DEPTH") {
            config.max_unref_depth = v;
        }
        if let Ok(v) = std::env::var("FISSION_VERBOSE") {
            config.verbose = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ptrs_per_thread == 0 {
            return Err(ConfigError::Invalid("ptrs_per_thread must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be > 0"));
        }
        if self.addrs_per_worker == 0 {
            return Err(ConfigError::Invalid("addrs_per_worker must be > 0"));
        }
        if self.sort_threshold == 0 {
            return Err(ConfigError::Invalid("sort_threshold must be > 0"));
        }
        Ok(())
    }
}

/// The collector's only recoverable error surface; everything past
/// `init` terminates the process on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid(what) => write!(f, "invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}
