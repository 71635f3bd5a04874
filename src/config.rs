use std::{path::PathBuf, time::Duration};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

/// How to reach the cluster. Unset fields fall back to ambient discovery
/// (in-cluster service account or the default kubeconfig).
#[derive(Debug, Clone, Default)]
pub struct ConnectConfig {
    /// Overrides the API server address of whichever config was loaded.
    pub master: Option<String>,
    /// Path to a kubeconfig file.
    pub kubeconfig: Option<PathBuf>,
}

/// Parameters for [`Controller`](crate::Controller).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Restricts list and watch to one namespace. `None` watches all of them.
    pub namespace: Option<String>,
    /// Interval between full relists. Zero disables periodic resync.
    pub resync_period: Duration,
    /// Retry schedule for failed list and watch calls.
    pub backoff: BackoffConfig,
    /// How long registration waits for a new definition to be served.
    pub establish_timeout: Duration,
    /// Server-side timeout of a single watch request.
    pub watch_timeout_secs: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_period: Duration::ZERO,
            backoff: BackoffConfig::default(),
            establish_timeout: Duration::from_secs(30),
            watch_timeout_secs: 290,
        }
    }
}

impl ControllerConfig {
    pub fn namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Exponential backoff bounded by `max`. The defaults are those of
/// `kube_runtime::watcher::DefaultBackoff`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Each delay is drawn from `delay * (1 ± jitter)`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(800),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 1.0,
        }
    }
}

impl BackoffConfig {
    /// A schedule that never gives up; retries continue until cancelled.
    pub fn build(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial)
            .with_max_interval(self.max)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.jitter)
            .with_max_elapsed_time(None)
            .build()
    }
}
