use std::path::PathBuf;
use std::time::Duration;

/// What to do with a distributed-job request that resolves to a single
/// partition (one target agent, or `partitions == 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionPolicy {
    /// Create an ordinary, non-distributed job instead.
    #[default]
    Degrade,
    /// Reject the request with a validation error.
    Reject,
}

/// Timing and retry policy for the orchestration core.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// An agent silent for longer than this is presumed offline.
    pub heartbeat_timeout_ms: u64,
    /// How often the staleness sweep runs.
    pub sweep_interval_ms: u64,
    /// How often the assignment scheduler runs a pass.
    pub schedule_interval_ms: u64,
    /// Upper bound on waiting for a work order to be acknowledged.
    pub dispatch_timeout_ms: u64,
    /// How many times a job may be requeued after losing its agent before
    /// it is failed. `None` requeues indefinitely.
    pub max_requeues: Option<u32>,
    pub distribution: DistributionPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            sweep_interval_ms: 10_000,
            schedule_interval_ms: 1_000,
            dispatch_timeout_ms: 5_000,
            max_requeues: Some(3),
            distribution: DistributionPolicy::Degrade,
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_timeout_ms as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn with_schedule_interval_ms(mut self, ms: u64) -> Self {
        self.schedule_interval_ms = ms;
        self
    }

    pub fn with_dispatch_timeout_ms(mut self, ms: u64) -> Self {
        self.dispatch_timeout_ms = ms;
        self
    }

    pub fn with_max_requeues(mut self, max: Option<u32>) -> Self {
        self.max_requeues = max;
        self
    }

    pub fn with_distribution(mut self, policy: DistributionPolicy) -> Self {
        self.distribution = policy;
        self
    }

    /// Whether a job that has already been requeued `requeues` times may be
    /// requeued once more.
    pub fn may_requeue(&self, requeues: u32) -> bool {
        match self.max_requeues {
            Some(max) => requeues < max,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// SQLite database file. `None` keeps all state in memory.
    pub database: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
}

impl ServerConfig {
    pub fn new(database: Option<PathBuf>) -> Self {
        Self {
            database,
            ..Default::default()
        }
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }
}
