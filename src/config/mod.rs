mod file_config;

pub use file_config::{EngineConfig, FileConfig, LegacyImportConfig, RetryConfig};

use crate::controller::BackoffPolicy;
use crate::engine::default_worker_threads;
use crate::legacy::LegacyTypeMap;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// TOML values take precedence over these.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub worker_threads: Option<usize>,
    pub legacy_db_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub worker_threads: usize,
    pub tracker_retention: usize,
    pub retry: RetrySettings,
    pub legacy_import: Option<LegacyImportSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60 * 60 * 1000,
            jitter: 0.1,
        }
    }
}

impl RetrySettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LegacyImportSettings {
    pub legacy_db_path: PathBuf,
    pub type_map: LegacyTypeMap,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();
        let engine = file.engine.unwrap_or_default();

        let db_path = engine
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let worker_threads = engine
            .worker_threads
            .or(cli.worker_threads)
            .unwrap_or_else(default_worker_threads);
        if worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        let tracker_retention = engine.tracker_retention.unwrap_or(1000);

        let retry_file = file.retry.unwrap_or_default();
        let defaults = RetrySettings::default();
        let retry = RetrySettings {
            initial_backoff_ms: retry_file
                .initial_backoff_ms
                .unwrap_or(defaults.initial_backoff_ms),
            backoff_multiplier: retry_file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            max_backoff_ms: retry_file.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            jitter: retry_file.jitter.unwrap_or(defaults.jitter),
        };
        if retry.backoff_multiplier < 1.0 {
            bail!(
                "backoff_multiplier must be >= 1.0, got {}",
                retry.backoff_multiplier
            );
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            bail!("jitter must be within [0, 1], got {}", retry.jitter);
        }

        // The legacy database is only imported when a path is known
        let legacy_file = file.legacy_import.unwrap_or_default();
        let legacy_import = legacy_file
            .legacy_db_path
            .map(PathBuf::from)
            .or_else(|| cli.legacy_db_path.clone())
            .map(|legacy_db_path| LegacyImportSettings {
                legacy_db_path,
                type_map: LegacyTypeMap::from_maps(
                    legacy_file.type_map,
                    legacy_file.requirement_map,
                ),
            });

        Ok(Self {
            db_path,
            worker_threads,
            tracker_retention,
            retry,
            legacy_import,
        })
    }
}
