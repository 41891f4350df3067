use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tessera_store::ResourceRegistration;

const fn default_timeout_ms() -> u64 {
    300_000
}

const fn default_boot_workers() -> usize {
    4
}

fn default_parallel_boot_key() -> String {
    "subsystem".to_owned()
}

fn default_container() -> String {
    "local".to_owned()
}

/// Kernel settings, read from `tessera.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Budget for lock acquisition and service-container quiescence.
    #[serde(default = "default_timeout_ms")]
    pub blocking_timeout_ms: u64,
    /// Budget for in-flight service removals during rollback.
    #[serde(default = "default_timeout_ms")]
    pub removal_timeout_ms: u64,
    /// Enables the DOMAIN stage.
    pub coordinating_controller: bool,
    #[serde(default = "default_boot_workers")]
    pub boot_workers: usize,
    #[serde(default = "default_parallel_boot_key")]
    pub parallel_boot_key: String,
    #[serde(default = "default_container")]
    pub container: String,
    pub resources: Vec<ResourceRegistration>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            blocking_timeout_ms: default_timeout_ms(),
            removal_timeout_ms: default_timeout_ms(),
            coordinating_controller: false,
            boot_workers: default_boot_workers(),
            parallel_boot_key: default_parallel_boot_key(),
            container: default_container(),
            resources: Vec::new(),
        }
    }
}

impl KernelConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content)
            .map_err(|e| CoreError::Config(format!("invalid kernel config: {e}")))
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    pub fn removal_timeout(&self) -> Duration {
        Duration::from_millis(self.removal_timeout_ms)
    }

    #[must_use]
    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_removal_timeout(mut self, timeout: Duration) -> Self {
        self.removal_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_container(mut self, container: &str) -> Self {
        container.clone_into(&mut self.container);
        self
    }

    #[must_use]
    pub fn with_boot_workers(mut self, workers: usize) -> Self {
        self.boot_workers = workers;
        self
    }

    #[must_use]
    pub fn with_parallel_boot_key(mut self, key: &str) -> Self {
        key.clone_into(&mut self.parallel_boot_key);
        self
    }

    #[must_use]
    pub fn with_coordinating_controller(mut self, enabled: bool) -> Self {
        self.coordinating_controller = enabled;
        self
    }
}
