use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default cap on concurrently active requests.
pub const DEFAULT_MAX_ACTIVE_REQUESTS: usize = 1000;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of requests in flight at once. Must be positive.
    pub max_active_requests: usize,
    /// Query params merged into every submitted request.
    pub params: BTreeMap<String, Value>,
    /// Headers merged into every submitted request.
    pub headers: BTreeMap<String, String>,
    /// Pause between two launches, in milliseconds.
    pub launch_delay_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_requests: DEFAULT_MAX_ACTIVE_REQUESTS,
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            launch_delay_ms: None,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut config = Self::default();
        if let Ok(value) = env::var("RESTFLOW_MAX_ACTIVE_REQUESTS") {
            config.max_active_requests = value
                .parse()
                .context("RESTFLOW_MAX_ACTIVE_REQUESTS must be a valid number")?;
        }
        if let Ok(value) = env::var("RESTFLOW_LAUNCH_DELAY_MS") {
            config.launch_delay_ms = Some(
                value
                    .parse()
                    .context("RESTFLOW_LAUNCH_DELAY_MS must be a valid number")?,
            );
        }
        Ok(config)
    }

    pub fn with_max_active_requests(mut self, max: usize) -> Self {
        self.max_active_requests = max;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Pause between launches; `None` when unset or zero.
    pub fn launch_delay(&self) -> Option<Duration> {
        self.launch_delay_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
