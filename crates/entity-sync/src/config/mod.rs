//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::core::Schema;
use crate::error::Result;
use crate::orchestrator::OrchestratorOptions;
use crate::sync::SyncOptions;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Build the validated schema from the `record_types` section.
    pub fn schema(&self) -> Result<Schema> {
        Schema::new(self.record_types.clone())
    }

    /// Orchestrator settings from the `migration` section.
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            commit_policy: self.migration.commit_policy,
            sync: SyncOptions {
                mode: self.migration.mode,
                max_relation_depth: self.migration.max_relation_depth,
                dry_run: self.migration.dry_run,
            },
        }
    }
}
