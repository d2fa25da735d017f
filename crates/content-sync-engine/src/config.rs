use std::str::FromStr;
use std::time::Duration;

use content_sync_core::VersionId;
use serde::{Deserialize, Serialize};

/// Deployment environment. Privileged environments refuse unauthenticated
/// synchronisation triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn allows_unauthenticated_sync(&self) -> bool {
        !matches!(self, Environment::Prod)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Dev => write!(f, "dev"),
            Environment::Staging => write!(f, "staging"),
            Environment::Prod => write!(f, "prod"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(format!("unknown environment: {}", other)),
        }
    }
}

/// Settings for the version controller and its sync workers.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Live version at process start. Not assumed to be cached.
    pub initial_live_version: VersionId,
    pub environment: Environment,
    /// Upper bound on sync jobs executing at the same time.
    pub max_concurrent_jobs: usize,
    /// Default bound on how long a promotion waits for indexing.
    pub promotion_timeout: Option<Duration>,
    /// Finished jobs kept around for inspection.
    pub job_history: usize,
}

impl SyncConfig {
    pub fn new(initial_live_version: impl Into<VersionId>) -> Self {
        Self {
            initial_live_version: initial_live_version.into(),
            environment: Environment::default(),
            max_concurrent_jobs: 2,
            promotion_timeout: None,
            job_history: 50,
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_promotion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.promotion_timeout = timeout;
        self
    }

    pub fn with_job_history(mut self, n: usize) -> Self {
        self.job_history = n;
        self
    }
}
