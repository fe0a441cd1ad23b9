use crate::core::{DbError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Transaction coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Hard ceiling on how long `acquire` waits for the lock
    pub max_wait: Duration,

    /// Elapsed times at which a still-waiting caller logs a warning.
    /// Checkpoints at or beyond `max_wait` are never reached.
    pub log_checkpoints: Vec<Duration>,
}

impl CoordinatorConfig {
    /// Create a configuration with the default budget and checkpoints
    pub fn new() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
            log_checkpoints: [100, 500, 1_000, 2_500, 5_000, 7_500, 9_900]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        }
    }

    /// Set the maximum wait budget
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Replace the log checkpoints
    pub fn log_checkpoints(mut self, checkpoints: impl IntoIterator<Item = Duration>) -> Self {
        let mut checkpoints: Vec<Duration> = checkpoints.into_iter().collect();
        checkpoints.sort();
        checkpoints.dedup();
        self.log_checkpoints = checkpoints;
        self
    }

    /// Parse a JSON settings document, e.g.
    ///
    /// ```
    /// # use serialtx::CoordinatorConfig;
    /// let config = CoordinatorConfig::from_json(
    ///     r#"{ "lock_max_wait_ms": 2000, "lock_log_checkpoints_ms": [100, 1000] }"#
    /// ).unwrap();
    /// assert_eq!(config.max_wait.as_millis(), 2000);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: CoordinatorSettings = serde_json::from_str(json)?;
        let config = settings.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_wait.is_zero() {
            return Err(DbError::Config("max_wait must be > 0".to_string()));
        }

        if self.log_checkpoints.iter().any(|c| c.is_zero()) {
            return Err(DbError::Config(
                "log checkpoints must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Checkpoints that can actually fire before the budget runs out, in order
    pub(crate) fn effective_checkpoints(&self) -> impl Iterator<Item = Duration> + '_ {
        self.log_checkpoints
            .iter()
            .copied()
            .filter(|checkpoint| *checkpoint < self.max_wait)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized form of [`CoordinatorConfig`] as it appears in host settings files.
/// Missing fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub lock_max_wait_ms: Option<u64>,
    pub lock_log_checkpoints_ms: Option<Vec<u64>>,
}

impl CoordinatorSettings {
    pub fn into_config(self) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::new();
        if let Some(ms) = self.lock_max_wait_ms {
            config = config.max_wait(Duration::from_millis(ms));
        }
        if let Some(checkpoints) = self.lock_log_checkpoints_ms {
            config = config.log_checkpoints(checkpoints.into_iter().map(Duration::from_millis));
        }
        config
    }
}
