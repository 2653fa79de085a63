//! # StrataDB Configuration Module
//!
//! This module holds everything the engine is told once at startup: the
//! directory layout, the default environment, and the tuning knobs. Nothing
//! in the core reads process globals; a validated [`Config`] value is built
//! here and threaded through explicitly.
//!
//! ## Directory Rules
//!
//! The buffer and database directories must be distinct and neither may be
//! an ancestor of the other. A shared or nested layout would let transport
//! truncation and block sealing race over the same files, so the rule is
//! enforced before the engine touches disk.
//!
//! ## Environments
//!
//! An environment is a named, isolated buffer + database pair. Environment
//! names are sanitized to `[A-Za-z0-9_]`; an empty sanitized name falls back
//! to the configured default, which must itself survive sanitization or
//! [`Config::validate`] fails.
//!
//! ## Module Organization
//!
//! - [`constants`]: numeric configuration values with dependency notes
//! - [`environment`]: environment name sanitization

pub mod constants;
pub mod environment;

pub use constants::*;
pub use environment::sanitize;

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};

/// Startup configuration for an engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub buffer_dir: PathBuf,
    pub database_dir: PathBuf,
    pub default_environment: String,
    pub transport_batch_size: usize,
    pub block_seal_threshold: usize,
}

impl Config {
    pub fn new<B: AsRef<Path>, D: AsRef<Path>>(buffer_dir: B, database_dir: D) -> Self {
        Self {
            buffer_dir: buffer_dir.as_ref().to_path_buf(),
            database_dir: database_dir.as_ref().to_path_buf(),
            default_environment: "default".to_string(),
            transport_batch_size: TRANSPORT_BATCH_SIZE,
            block_seal_threshold: BLOCK_SEAL_THRESHOLD,
        }
    }

    pub fn with_default_environment<S: Into<String>>(mut self, environment: S) -> Self {
        self.default_environment = environment.into();
        self
    }

    pub fn with_transport_batch_size(mut self, size: usize) -> Self {
        self.transport_batch_size = size;
        self
    }

    pub fn with_block_seal_threshold(mut self, threshold: usize) -> Self {
        self.block_seal_threshold = threshold;
        self
    }

    /// Checks the directory layout and the default environment.
    ///
    /// The comparison is textual over normalized components rather than
    /// canonicalized paths: the directories usually do not exist yet at
    /// validation time.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.buffer_dir != self.database_dir,
            "configuration error: buffer directory and database directory must be distinct \
             (both are '{}')",
            self.buffer_dir.display()
        );
        ensure!(
            !is_ancestor(&self.buffer_dir, &self.database_dir)
                && !is_ancestor(&self.database_dir, &self.buffer_dir),
            "configuration error: buffer directory '{}' and database directory '{}' must not \
             nest inside one another",
            self.buffer_dir.display(),
            self.database_dir.display()
        );
        ensure!(
            !environment::strip(&self.default_environment).is_empty(),
            "configuration error: default environment '{}' sanitizes to an empty string",
            self.default_environment
        );
        ensure!(
            self.transport_batch_size > 0,
            "configuration error: transport batch size must be positive"
        );
        ensure!(
            self.block_seal_threshold > 0,
            "configuration error: block seal threshold must be positive"
        );
        Ok(())
    }

    /// Resolves `environment` against this config's default and returns the
    /// per-environment buffer and database roots.
    pub fn environment_dirs(&self, environment: &str) -> Result<(PathBuf, PathBuf)> {
        self.validate()?;
        let env = environment::sanitize_with_default(environment, &self.default_environment);
        Ok((self.buffer_dir.join(&env), self.database_dir.join(&env)))
    }
}

fn is_ancestor(candidate: &Path, of: &Path) -> bool {
    of.ancestors().any(|a| a == candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_sibling_directories_validate() {
        let config = Config::new("/tmp/strata/buffer", "/tmp/strata/database");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn identical_directories_are_rejected() {
        let config = Config::new("/tmp/strata/data", "/tmp/strata/data");
        assert!(config.validate().is_err());
    }

    #[test]
    fn nested_directories_are_rejected() {
        let config = Config::new("/tmp/strata", "/tmp/strata/database");
        assert!(config.validate().is_err());
        let config = Config::new("/tmp/strata/buffer", "/tmp/strata");
        assert!(config.validate().is_err());
    }

    #[test]
    fn unsanitizable_default_environment_is_rejected() {
        let config =
            Config::new("/tmp/strata/buffer", "/tmp/strata/database").with_default_environment("$$");
        assert!(config.validate().is_err());
    }
}
