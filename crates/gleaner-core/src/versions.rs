//! Dataset version manager.
//!
//! Each harvest cycle writes into a fresh [`DatasetVersion`]. Before a
//! candidate version goes live it is compared against the current one: any
//! collection that disappeared, or whose active document count dropped by
//! more than the configured threshold, is replaced by a copy of the current
//! version's collection and an administrative notification is sent. The
//! previous data stays live for those collections instead of an upstream
//! outage emptying the index.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::config::VersionConfig;
use crate::error::AppError;
use crate::models::{Dataset, DatasetVersion};
use crate::notify::Notifier;
use crate::traits::{IndexStore, SearchEngine, VersionStore};

/// Splits `major.minor.patch` into its numbers.
pub fn parse_version(version: &str) -> Result<(u64, u64, u64), AppError> {
    let invalid = || AppError::InvalidVersion(version.to_string());
    let mut parts = version.trim().split('.');
    let mut next = || -> Result<u64, AppError> {
        parts
            .next()
            .ok_or_else(invalid)?
            .parse::<u64>()
            .map_err(|_| invalid())
    };
    let parsed = (next()?, next()?, next()?);
    if parts.next().is_some() || parsed.1 >= 1_000 || parsed.2 >= 1_000 {
        return Err(invalid());
    }
    Ok(parsed)
}

/// Maps a version string onto one monotonic integer.
///
/// ```
/// use gleaner_core::versions::reduce_version_integer;
///
/// assert_eq!(reduce_version_integer("1.2.3").unwrap(), 1_002_003);
/// assert!(reduce_version_integer("0.10.0").unwrap() > reduce_version_integer("0.9.12").unwrap());
/// ```
pub fn reduce_version_integer(version: &str) -> Result<u64, AppError> {
    let (major, minor, patch) = parse_version(version)?;
    Ok(major * 1_000_000 + minor * 1_000 + patch)
}

/// The highest version; unparseable version strings are ignored.
pub fn latest_version(versions: &[DatasetVersion]) -> Option<&DatasetVersion> {
    versions
        .iter()
        .filter_map(|v| reduce_version_integer(&v.version).ok().map(|n| (n, v)))
        .max_by(|(a, va), (b, vb)| a.cmp(b).then(va.created_at.cmp(&vb.created_at)))
        .map(|(_, v)| v)
}

/// The patch bump of the highest version, or `0.0.1` for the first one.
pub fn next_version(versions: &[DatasetVersion]) -> Result<String, AppError> {
    match latest_version(versions) {
        None => Ok("0.0.1".to_string()),
        Some(latest) => {
            let (major, minor, patch) = parse_version(&latest.version)?;
            let (minor, patch) = if patch + 1 >= 1_000 {
                (minor + 1, 0)
            } else {
                (minor, patch + 1)
            };
            let (major, minor) = if minor >= 1_000 {
                (major + 1, 0)
            } else {
                (major, minor)
            };
            Ok(format!("{}.{}.{}", major, minor, patch))
        }
    }
}

/// A collection that may not be promoted as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlaggedCollection {
    pub name: String,
    pub baseline: u64,
    /// `None` when the candidate lacks the collection entirely.
    pub candidate: Option<u64>,
}

/// Compares active counts per collection against a baseline.
///
/// Only collections present in the baseline are checked. A zero baseline is
/// never flagged for a drop.
pub fn evaluate_counts(
    baseline: &HashMap<String, u64>,
    candidate: &HashMap<String, u64>,
    threshold: f64,
) -> Vec<FlaggedCollection> {
    let mut flagged: Vec<FlaggedCollection> = baseline
        .iter()
        .filter_map(|(name, &base)| {
            let count = candidate.get(name).copied();
            let regressed = match count {
                None => true,
                Some(_) if base == 0 => false,
                Some(count) => {
                    let drop = (base as f64 - count as f64) / base as f64;
                    drop > threshold
                }
            };
            regressed.then(|| FlaggedCollection {
                name: name.clone(),
                baseline: base,
                candidate: count,
            })
        })
        .collect();
    flagged.sort_by(|a, b| a.name.cmp(&b.name));
    flagged
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Evaluation {
    /// The current version the candidate was compared against.
    pub baseline: Option<DatasetVersion>,
    pub flagged: Vec<FlaggedCollection>,
}

impl Evaluation {
    pub fn is_healthy(&self) -> bool {
        self.flagged.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Promotion {
    pub version: DatasetVersion,
    /// Collections restored from the previous current version.
    pub fallbacks: Vec<String>,
}

pub struct VersionManager<S> {
    store: S,
    engine: Arc<dyn SearchEngine>,
    notifier: Arc<dyn Notifier>,
    config: VersionConfig,
}

impl<S> VersionManager<S>
where
    S: VersionStore + IndexStore,
{
    pub fn new(
        store: S,
        engine: Arc<dyn SearchEngine>,
        notifier: Arc<dyn Notifier>,
        config: VersionConfig,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            config,
        }
    }

    /// Flags collections of `candidate` that regressed against the current
    /// version. Nothing is flagged on a first harvest.
    pub async fn evaluate_dataset_version(
        &self,
        candidate: &DatasetVersion,
    ) -> Result<Evaluation, AppError> {
        let baseline = match self.store.current_version(candidate.dataset_id).await? {
            Some(current) if current.id != candidate.id => current,
            _ => return Ok(Evaluation::default()),
        };

        let baseline_counts = self.store.active_counts(baseline.id).await?;
        let candidate_counts = self.store.active_counts(candidate.id).await?;
        let flagged = evaluate_counts(
            &baseline_counts,
            &candidate_counts,
            self.config.evaluation_threshold,
        );

        Ok(Evaluation {
            baseline: Some(baseline),
            flagged,
        })
    }

    /// Evaluates the candidate, restores flagged collections from the current
    /// version, then makes the candidate current.
    pub async fn promote(
        &self,
        dataset: &Dataset,
        candidate: &DatasetVersion,
    ) -> Result<Promotion, AppError> {
        let evaluation = self.evaluate_dataset_version(candidate).await?;
        let mut fallbacks = Vec::with_capacity(evaluation.flagged.len());

        if let Some(baseline) = &evaluation.baseline {
            let collections = self.store.collections(baseline.id).await?;
            for flagged in &evaluation.flagged {
                let Some(source) = collections.iter().find(|c| c.name == flagged.name) else {
                    continue;
                };
                self.store
                    .copy_collection(source, candidate.id, Utc::now())
                    .await?;

                let found = flagged
                    .candidate
                    .map_or_else(|| "missing".to_string(), |n| n.to_string());
                tracing::warn!(
                    dataset = %dataset.name,
                    version = %candidate.version,
                    collection = %flagged.name,
                    baseline = flagged.baseline,
                    candidate = %found,
                    "Collection regressed, falling back to promoted data"
                );
                self.notifier.notify(
                    &format!("Fallback for {} in {}", flagged.name, dataset.name),
                    &format!(
                        "Version {} has {} active documents in collection '{}' where version {} has {}. The promoted collection was copied into the new version.",
                        candidate.version, found, flagged.name, baseline.version, flagged.baseline
                    ),
                );
                fallbacks.push(flagged.name.clone());
            }
        }

        self.set_current(dataset, candidate).await?;
        Ok(Promotion {
            version: candidate.clone(),
            fallbacks,
        })
    }

    /// Makes `version` the only current version of the dataset.
    pub async fn set_current(
        &self,
        dataset: &Dataset,
        version: &DatasetVersion,
    ) -> Result<(), AppError> {
        if version.dataset_id != dataset.id {
            return Err(AppError::VersionNotFound(format!(
                "{} in dataset {}",
                version.version, dataset.name
            )));
        }
        self.store.set_current(dataset.id, version.id).await?;
        tracing::info!(dataset = %dataset.name, version = %version.version, "Promoted version");
        Ok(())
    }

    /// Resolves a version string and makes it current. Nothing changes when
    /// the string matches no version or more than one.
    pub async fn set_current_by_version(
        &self,
        dataset: &Dataset,
        version: &str,
    ) -> Result<DatasetVersion, AppError> {
        let target = reduce_version_integer(version)?;
        let versions = self.store.versions(dataset.id).await?;
        let mut matches: Vec<DatasetVersion> = versions
            .into_iter()
            .filter(|v| reduce_version_integer(&v.version).ok() == Some(target))
            .collect();

        match matches.len() {
            0 => Err(AppError::VersionNotFound(format!(
                "{} in dataset {}",
                version, dataset.name
            ))),
            1 => {
                let found = matches.remove(0);
                self.set_current(dataset, &found).await?;
                Ok(found)
            }
            n => Err(AppError::AmbiguousVersion {
                version: version.to_string(),
                matches: n,
            }),
        }
    }

    /// Deletes non-current versions older than the purge window together with
    /// their remote indices. Returns the deleted version strings.
    pub async fn purge(&self, dataset: &Dataset) -> Result<Vec<String>, AppError> {
        let cutoff = Duration::try_days(self.config.purge_after_days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| {
                AppError::ConfigError(format!(
                    "purge_after_days out of range: {}",
                    self.config.purge_after_days
                ))
            })?;
        let versions = self.store.versions(dataset.id).await?;
        let mut deleted = Vec::new();

        for version in versions
            .into_iter()
            .filter(|v| !v.is_current && v.created_at < cutoff)
        {
            for index in self.store.indices(version.id).await? {
                match self.engine.delete_index(&index.remote_name).await {
                    Ok(()) | Err(AppError::IndexNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.store.delete_version(version.id).await?;
            tracing::info!(dataset = %dataset.name, version = %version.version, "Purged version");
            deleted.push(version.version);
        }

        Ok(deleted)
    }
}
