use std::env;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

/// Tunables for one executor instance. Defaults match the documented
/// behavior: fan-out capped at 8 concurrent external calls, 30s per call.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Read overrides from the environment, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_concurrency = env::var("AGENTFLOW_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(defaults.max_concurrency);
        let call_timeout = env::var("AGENTFLOW_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.call_timeout);
        Self {
            max_concurrency,
            call_timeout,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Load a `.env` file if present, so local runs pick up API keys the same
/// way deployed ones do.
pub fn load_env_file(path: &Path) {
    if path.exists() {
        dotenvy::from_path(path).ok();
        info!("Loaded .env from {}", path.display());
    } else {
        debug!("no .env at {}", path.display());
    }
}
