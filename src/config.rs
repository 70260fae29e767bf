//! Configuration for the cluster control plane.

use std::time::Duration;

/// Main configuration shared by proxies and targets.
///
/// Timeouts follow the layering of the control plane: `cplane_operation` is
/// the base budget of a single intra-cluster RPC, `max_keepalive` bounds one
/// health probe, and the rebalance-specific windows live in
/// [`RebalanceConfig`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Base timeout of a single control-plane RPC.
    pub cplane_operation: Duration,

    /// Budget of a single health/keepalive probe.
    pub max_keepalive: Duration,

    /// Sleep between probe retries after a transport error.
    pub keepalive_retry: Duration,

    /// Period of the stats logger.
    pub stats_time: Duration,

    /// Maximum concurrent peers in a broadcast fan-out.
    pub max_bcast_parallel: usize,

    /// Log verbosity level gating debug/trace call sites (0 = quiet).
    pub verbose: u8,

    /// Rebalance-specific configuration.
    pub rebalance: RebalanceConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cplane_operation: Duration::from_secs(2),
            max_keepalive: Duration::from_secs(4),
            keepalive_retry: Duration::from_secs(1),
            stats_time: Duration::from_secs(10),
            max_bcast_parallel: 24,
            verbose: 0,
            rebalance: RebalanceConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base control-plane RPC timeout.
    pub fn with_cplane_operation(mut self, d: Duration) -> Self {
        self.cplane_operation = d;
        self
    }

    /// Set the per-probe keepalive budget.
    pub fn with_max_keepalive(mut self, d: Duration) -> Self {
        self.max_keepalive = d;
        self
    }

    /// Set the probe retry sleep.
    pub fn with_keepalive_retry(mut self, d: Duration) -> Self {
        self.keepalive_retry = d;
        self
    }

    /// Set the broadcast parallelism bound.
    pub fn with_max_bcast_parallel(mut self, n: usize) -> Self {
        self.max_bcast_parallel = n.max(1);
        self
    }

    /// Set the log verbosity level.
    pub fn with_verbose(mut self, level: u8) -> Self {
        self.verbose = level;
        self
    }

    /// Set the rebalance configuration.
    pub fn with_rebalance(mut self, reb: RebalanceConfig) -> Self {
        self.rebalance = reb;
        self
    }

    /// Shrink every timeout for test runs.
    pub fn fast_for_tests() -> Self {
        Self {
            cplane_operation: Duration::from_millis(100),
            max_keepalive: Duration::from_millis(250),
            keepalive_retry: Duration::from_millis(50),
            stats_time: Duration::from_millis(500),
            max_bcast_parallel: 8,
            verbose: 0,
            rebalance: RebalanceConfig {
                enabled: true,
                dest_retry_time: Duration::from_secs(2),
                quiesce: Duration::from_millis(100),
            },
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_bcast_parallel == 0 {
            return Err("max_bcast_parallel must be at least 1".to_string());
        }
        if self.cplane_operation.is_zero() {
            return Err("cplane_operation must be non-zero".to_string());
        }
        if self.rebalance.dest_retry_time < self.cplane_operation {
            return Err(format!(
                "rebalance.dest_retry_time ({:?}) must be >= cplane_operation ({:?})",
                self.rebalance.dest_retry_time, self.cplane_operation
            ));
        }
        Ok(())
    }
}

/// Rebalance configuration.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Whether membership changes trigger a rebalance at all.
    pub enabled: bool,

    /// How long a target waits for a destination peer during a round.
    pub dest_retry_time: Duration,

    /// How long the transmit queue must stay empty to count as quiescent.
    pub quiesce: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_retry_time: Duration::from_secs(30),
            quiesce: Duration::from_secs(2),
        }
    }
}

impl RebalanceConfig {
    /// Enable or disable rebalancing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the destination-peer wait budget.
    pub fn with_dest_retry_time(mut self, d: Duration) -> Self {
        self.dest_retry_time = d;
        self
    }
}
