// Configuration management with layered configuration (file, env).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Deployment environment name. The store reset flag is honored only
    /// when this equals "development".
    pub environment: String,
    pub database: DatabaseConfig,
    pub seed: SeedConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub reaper: ReaperConfig,
    pub crawler: CrawlerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the store file.
    pub path: String,
    /// Page-cache budget in KiB; passed to the store with the negative sign
    /// its cache_size pragma expects.
    pub cache_size_kib: u32,
    pub busy_timeout_ms: u64,
    /// Enable write-ahead journaling.
    pub wal: bool,
    /// Delete the store file (and journal sidecars) before opening.
    /// Ignored with a warning outside the development environment.
    pub reset: bool,
}

/// Directories of seed files loaded at startup. All optional; a missing
/// directory is skipped silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    pub jobs_dir: Option<String>,
    pub auth_dir: Option<String>,
    pub variables_dir: Option<String>,
    pub connectors_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the cron loop wakes to evaluate due definitions.
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Heartbeat cadence while a run is in flight.
    pub heartbeat_interval_seconds: u64,
    /// Applied when a definition declares no timeout of its own.
    pub default_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub interval_seconds: u64,
    /// Runs whose freshest liveness signal is older than this are demoted.
    pub stale_threshold_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    pub user_agent: String,
    pub fetch_timeout_seconds: u64,
    /// Worker count used when a crawl step doesn't specify one.
    pub default_concurrency: usize,
    /// Page cap used when a crawl step doesn't specify one.
    pub default_max_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory.
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("QUAERO")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.database.path.is_empty() {
            return Err("Database path cannot be empty".to_string());
        }
        if self.scheduler.poll_interval_seconds == 0 {
            return Err("Scheduler poll_interval_seconds must be greater than 0".to_string());
        }
        if self.executor.heartbeat_interval_seconds == 0 {
            return Err("Executor heartbeat_interval_seconds must be greater than 0".to_string());
        }
        if self.reaper.stale_threshold_minutes <= 0 {
            return Err("Reaper stale_threshold_minutes must be greater than 0".to_string());
        }
        if self.crawler.default_concurrency == 0 {
            return Err("Crawler default_concurrency must be greater than 0".to_string());
        }
        if self.crawler.default_max_pages == 0 {
            return Err("Crawler default_max_pages must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            database: DatabaseConfig {
                path: "data/quaero.db".to_string(),
                cache_size_kib: 64_000,
                busy_timeout_ms: 5_000,
                wal: true,
                reset: false,
            },
            seed: SeedConfig {
                jobs_dir: Some("seed/jobs".to_string()),
                auth_dir: Some("seed/auth".to_string()),
                variables_dir: Some("seed/variables".to_string()),
                connectors_dir: Some("seed/connectors".to_string()),
            },
            scheduler: SchedulerConfig {
                poll_interval_seconds: 10,
            },
            executor: ExecutorConfig {
                heartbeat_interval_seconds: 15,
                default_timeout_seconds: 3_600,
            },
            reaper: ReaperConfig {
                interval_seconds: 60,
                stale_threshold_minutes: 10,
            },
            crawler: CrawlerConfig {
                user_agent: "quaero/0.1".to_string(),
                fetch_timeout_seconds: 30,
                default_concurrency: 4,
                default_max_pages: 500,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_database_path() {
        let mut settings = Settings::default();
        settings.database.path = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_poll_interval() {
        let mut settings = Settings::default();
        settings.scheduler.poll_interval_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("default.toml"),
            r#"
environment = "production"

[database]
path = "/var/lib/quaero/quaero.db"
wal = false

[reaper]
stale_threshold_minutes = 30
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(temp_dir.path()).unwrap();
        assert_eq!(settings.environment, "production");
        assert_eq!(settings.database.path, "/var/lib/quaero/quaero.db");
        assert!(!settings.database.wal);
        assert_eq!(settings.reaper.stale_threshold_minutes, 30);
        // Untouched sections keep defaults
        assert_eq!(settings.scheduler.poll_interval_seconds, 10);
    }

    #[test]
    fn test_missing_config_dir_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load_from_path(temp_dir.path().join("absent")).unwrap();
        assert_eq!(settings.environment, "development");
    }
}
