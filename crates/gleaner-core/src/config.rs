//! Configuration types for Gleaner components.
//!
//! Every component receives its configuration struct at construction time.
//! The file-backed [`GleanerConfig`] is loaded from TOML; every section has
//! defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! [versions]
//! evaluation_threshold = 0.05
//!
//! [[sources]]
//! name = "data-overheid"
//! connector = "ckan"
//! endpoint = "https://data.overheid.nl/data"
//! set_specification = "data-overheid"
//! delete_policy = "transient"
//! purge_interval_days = 7
//!
//! [[datasets]]
//! name = "edusources"
//! sources = ["data-overheid"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::models::NewSource;

/// Database connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// HTTP client configuration for external API calls.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Source synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of sources fetched in parallel.
    pub concurrency: usize,
    /// Seconds after which the syncing flag of an unfinished fetch expires.
    pub lease_secs: u64,
}

impl SyncConfig {
    pub fn lease(&self) -> chrono::Duration {
        lease(self.lease_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            lease_secs: 3600,
        }
    }
}

fn lease(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Validity rules applied to every seed regardless of connector.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Keep documents whose copyright is absent or closed.
    pub allow_closed_access: bool,
    /// Seeds below this educational level become inactive.
    pub min_educational_level: i32,
    /// Publishers whose seeds are skipped.
    pub publisher_denylist: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            allow_closed_access: false,
            min_educational_level: -1,
            publisher_denylist: Vec::new(),
        }
    }
}

/// Enrichment batch processing limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub batch_size: usize,
    /// Maximum batches in flight in asynchronous mode.
    pub concurrency: usize,
    /// Dispatch batches as independent tasks and join them.
    pub asynchronous: bool,
    /// Budget for a single resource call attempt.
    pub soft_time_limit_secs: u64,
    /// Budget for all attempts for one document.
    pub hard_time_limit_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Attempts at acquiring row locks before a merge gives up.
    pub merge_retries: u32,
}

impl EnrichmentConfig {
    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.hard_time_limit_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 4,
            asynchronous: false,
            soft_time_limit_secs: 30,
            hard_time_limit_secs: 120,
            max_retries: 2,
            retry_base_delay_ms: 500,
            merge_retries: 5,
        }
    }
}

/// Dataset version evaluation and retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Largest relative drop in active documents a collection may show.
    pub evaluation_threshold: f64,
    /// Non-current versions older than this are deleted.
    pub purge_after_days: i64,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            evaluation_threshold: 0.05,
            purge_after_days: 30,
        }
    }
}

/// Search index naming and push behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Site name used in remote index names and alias patterns.
    pub site: String,
    /// Languages that get their own index; others go to `unk`.
    pub languages: Vec<String>,
    pub bulk_chunk_size: usize,
    pub resync_interval_secs: u64,
    /// Seconds after which the lock of an unfinished resync expires.
    pub lock_lease_secs: u64,
}

impl IndexConfig {
    pub const UNKNOWN_LANGUAGE: &'static str = "unk";

    /// Maps a document language onto one of the configured index languages.
    pub fn index_language(&self, language: Option<&str>) -> String {
        match language {
            Some(code) if self.languages.iter().any(|l| l == code) => code.to_string(),
            _ => Self::UNKNOWN_LANGUAGE.to_string(),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn lock_lease(&self) -> chrono::Duration {
        lease(self.lock_lease_secs)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            site: "gleaner".to_string(),
            languages: vec!["nl".to_string(), "en".to_string(), "unk".to_string()],
            bulk_chunk_size: 500,
            resync_interval_secs: 300,
            lock_lease_secs: 900,
        }
    }
}

/// A dataset and the names of the sources attached to it.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetEntry {
    pub name: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Root of the `gleaner.toml` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GleanerConfig {
    pub database: DbConfig,
    pub sync: SyncConfig,
    pub normalizer: NormalizerConfig,
    pub enrichment: EnrichmentConfig,
    pub versions: VersionConfig,
    pub index: IndexConfig,
    pub sources: Vec<NewSource>,
    pub datasets: Vec<DatasetEntry>,
}

/// Upper bound for day counts: a century.
const MAX_DAYS: i64 = 36_500;

impl GleanerConfig {
    /// Checks cross references and value ranges.
    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.versions.evaluation_threshold) {
            return Err(AppError::ConfigError(format!(
                "evaluation_threshold must be within 0.0..=1.0, got {}",
                self.versions.evaluation_threshold
            )));
        }
        if self.enrichment.batch_size == 0 || self.index.bulk_chunk_size == 0 {
            return Err(AppError::ConfigError(
                "batch sizes must be greater than zero".to_string(),
            ));
        }
        if !(1..=MAX_DAYS).contains(&self.versions.purge_after_days) {
            return Err(AppError::ConfigError(format!(
                "purge_after_days must be within 1..={}, got {}",
                MAX_DAYS, self.versions.purge_after_days
            )));
        }
        for source in &self.sources {
            if let Some(days) = source.purge_interval_days {
                if !(1..=MAX_DAYS).contains(&days) {
                    return Err(AppError::ConfigError(format!(
                        "source '{}': purge_interval_days must be within 1..={}, got {}",
                        source.name, MAX_DAYS, days
                    )));
                }
            }
        }
        for dataset in &self.datasets {
            for source in &dataset.sources {
                if !self.sources.iter().any(|s| &s.name == source) {
                    return Err(AppError::ConfigError(format!(
                        "dataset '{}' references unknown source '{}'",
                        dataset.name, source
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&NewSource> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Default location of the configuration file: `<config dir>/gleaner/gleaner.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gleaner").join("gleaner.toml"))
}

/// Loads and validates a configuration file.
///
/// A missing file at the default location yields the default configuration;
/// a missing file at an explicit path is an error.
pub fn load_config(path: Option<&Path>) -> Result<GleanerConfig, AppError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => return Ok(GleanerConfig::default()),
        },
    };

    if !path.exists() {
        if explicit {
            return Err(AppError::ConfigError(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), "No configuration file, using defaults");
        return Ok(GleanerConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| AppError::ConfigError(format!("{}: {}", path.display(), e)))?;
    let config: GleanerConfig = toml::from_str(&content)
        .map_err(|e| AppError::ConfigError(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeletePolicy;
    use std::io::Write;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_version_config_defaults() {
        let config = VersionConfig::default();
        assert_eq!(config.evaluation_threshold, 0.05);
        assert_eq!(config.purge_after_days, 30);
    }

    #[test]
    fn test_index_language_falls_back_to_unknown() {
        let config = IndexConfig::default();
        assert_eq!(config.index_language(Some("nl")), "nl");
        assert_eq!(config.index_language(Some("fr")), "unk");
        assert_eq!(config.index_language(None), "unk");
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: GleanerConfig = toml::from_str("").unwrap();
        assert_eq!(config.enrichment.batch_size, 100);
        assert!(config.sources.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[enrichment]
batch_size = 25
asynchronous = true

[[sources]]
name = "edurep"
connector = "ckan"
endpoint = "https://example.org"
set_specification = "edurep_delen"
delete_policy = "transient"
purge_interval_days = 7

[[datasets]]
name = "edusources"
sources = ["edurep"]
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.enrichment.batch_size, 25);
        assert!(config.enrichment.asynchronous);
        assert_eq!(config.enrichment.max_retries, 2);
        let source = config.source("edurep").unwrap();
        assert_eq!(source.delete_policy, DeletePolicy::Transient);
        assert_eq!(source.purge_interval_days, Some(7));
        assert_eq!(config.datasets[0].sources, vec!["edurep".to_string()]);
    }

    #[test]
    fn test_unknown_source_reference_is_rejected() {
        let config: GleanerConfig = toml::from_str(
            r#"
[[datasets]]
name = "edusources"
sources = ["missing"]
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_out_of_range_day_counts_are_rejected() {
        let config: GleanerConfig = toml::from_str(
            r#"
[[sources]]
name = "edurep"
connector = "ckan"
endpoint = "https://example.org"
set_specification = "edurep_delen"
purge_interval_days = 9223372036854775807
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));

        let config: GleanerConfig =
            toml::from_str("[versions]\npurge_after_days = -1\n").unwrap();
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_leases_saturate_instead_of_overflowing() {
        let config = SyncConfig::default();
        assert_eq!(config.lease(), chrono::Duration::hours(1));
        let config = SyncConfig {
            lease_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.lease(), chrono::Duration::MAX);
        assert_eq!(IndexConfig::default().lock_lease(), chrono::Duration::minutes(15));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = load_config(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
