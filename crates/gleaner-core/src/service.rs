//! Harvest cycle orchestration.
//!
//! [`HarvestService`] wires the tracker, enrichment processor, version
//! manager and index publisher around one store and runs whole cycles:
//!
//! 1. prepare the dataset and create the cycle's version
//! 2. per source, concurrently: fetch, then run each enrichment phase and
//!    advance the harvest after every phase that completed
//! 3. evaluate and promote the version
//! 4. optionally publish it to the search engine
//!
//! A failing source is recorded in the [`CycleSummary`] and does not stop
//! the others.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::{GleanerConfig, SyncConfig};
use crate::enrichment::EnrichmentProcessor;
use crate::error::AppError;
use crate::harvest::{HarvestTracker, PreparedCycle};
use crate::index::{IndexPublisher, ResyncReport};
use crate::models::{
    Dataset, DatasetStatus, DatasetVersion, Harvest, HarvestStage, PipelinePhase, SearchIndex,
    SourceHarvest,
};
use crate::notify::Notifier;
use crate::seeds::SeedNormalizer;
use crate::sync::{CycleSummary, SourceHarvestResult, SyncStats};
use crate::traits::{
    ConnectorRegistry, DocumentStore, HarvestStore, IndexStore, ResourceFetcher, SearchEngine,
    VersionStore,
};
use crate::versions::{latest_version, Promotion, VersionManager};

/// Enrichment phases in cycle order, with the stage a harvest must be at
/// for the phase to run.
const STAGE_PHASES: [(HarvestStage, PipelinePhase); 3] = [
    (HarvestStage::New, PipelinePhase::Extraction),
    (HarvestStage::Basic, PipelinePhase::Video),
    (HarvestStage::Video, PipelinePhase::Preview),
];

/// Remote collaborators of a service.
#[derive(Clone)]
pub struct Collaborators {
    pub connectors: ConnectorRegistry,
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub engine: Arc<dyn SearchEngine>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleOptions {
    /// Reset every harvest of the dataset before fetching.
    pub reset: bool,
    /// Push the promoted version to the search engine.
    pub publish: bool,
    /// Drop and recreate remote indices when publishing.
    pub recreate: bool,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            reset: false,
            publish: true,
            recreate: false,
        }
    }
}

pub struct HarvestService<S> {
    store: S,
    tracker: HarvestTracker<S>,
    enrichment: EnrichmentProcessor<S>,
    versions: VersionManager<S>,
    publisher: IndexPublisher<S>,
    sync: SyncConfig,
}

impl<S> HarvestService<S>
where
    S: HarvestStore + DocumentStore + VersionStore + IndexStore + Clone + 'static,
{
    pub fn new(store: S, collaborators: Collaborators, config: &GleanerConfig) -> Self {
        let Collaborators {
            connectors,
            fetcher,
            engine,
            notifier,
        } = collaborators;

        Self {
            tracker: HarvestTracker::new(
                store.clone(),
                connectors,
                SeedNormalizer::new(config.normalizer.clone()),
            )
            .with_sync_lease(config.sync.lease()),
            enrichment: EnrichmentProcessor::new(
                store.clone(),
                fetcher,
                config.enrichment.clone(),
            ),
            versions: VersionManager::new(
                store.clone(),
                engine.clone(),
                notifier,
                config.versions.clone(),
            ),
            publisher: IndexPublisher::new(store.clone(), engine, config.index.clone()),
            sync: config.sync.clone(),
            store,
        }
    }

    pub fn tracker(&self) -> &HarvestTracker<S> {
        &self.tracker
    }

    /// Registers the datasets and sources declared in the configuration.
    pub async fn setup(
        &self,
        config: &GleanerConfig,
    ) -> Result<Vec<(Dataset, Vec<Harvest>)>, AppError> {
        let mut registered = Vec::with_capacity(config.datasets.len());
        for entry in &config.datasets {
            let sources = entry
                .sources
                .iter()
                .map(|name| {
                    config
                        .source(name)
                        .cloned()
                        .ok_or_else(|| AppError::SourceNotFound(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            registered.push(self.tracker.register(&entry.name, &sources).await?);
        }
        Ok(registered)
    }

    /// Runs one full harvest cycle for a dataset.
    ///
    /// Cancellation stops new work from being dispatched; a cancelled cycle
    /// is summarized but its version is not promoted.
    pub async fn run_cycle(
        &self,
        dataset_name: &str,
        options: CycleOptions,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, AppError> {
        let dataset = self.tracker.dataset(dataset_name).await?;
        let cycle = self.tracker.prepare(&dataset, options.reset).await?;
        let PreparedCycle {
            version, harvests, ..
        } = &cycle;

        let mut summary = CycleSummary::new(&dataset.name);
        summary.version = Some(version.version.clone());

        let results: Vec<SourceHarvestResult> = stream::iter(harvests.iter())
            .map(|prepared| self.run_harvest(prepared.as_source_harvest(), version, cancel))
            .buffer_unordered(self.sync.concurrency.max(1))
            .collect()
            .await;
        for result in results {
            summary.add(result);
        }

        if cancel.is_cancelled() {
            tracing::warn!(
                dataset = %dataset.name,
                version = %version.version,
                "Cycle cancelled, version left unpromoted"
            );
            return Ok(summary);
        }

        let promotion = self.versions.promote(&dataset, version).await?;
        summary.fallback_collections = promotion.fallbacks;
        summary.promoted = true;

        if options.publish {
            let published = self
                .publisher
                .publish_version(&dataset, version, options.recreate)
                .await?;
            summary.published_indices = published.len();
        }

        tracing::info!(
            dataset = %dataset.name,
            version = %version.version,
            successful = summary.successful_count(),
            failed = summary.failed_count(),
            seeds = summary.total_seeds(),
            fallbacks = summary.fallback_collections.len(),
            published = summary.published_indices,
            "Harvest cycle complete"
        );
        Ok(summary)
    }

    async fn run_harvest(
        &self,
        target: SourceHarvest,
        version: &DatasetVersion,
        cancel: &CancellationToken,
    ) -> SourceHarvestResult {
        let name = target.source.name.clone();
        let mut stage = HarvestStage::New;
        match self.drive_harvest(&target, version, cancel, &mut stage).await {
            Ok(stats) => SourceHarvestResult::success(name, stats, stage),
            Err(e) => {
                tracing::warn!(source = %name, stage = %stage, error = %e, "Harvest stopped");
                SourceHarvestResult::failure(name, stage, e.to_string())
            }
        }
    }

    async fn drive_harvest(
        &self,
        target: &SourceHarvest,
        version: &DatasetVersion,
        cancel: &CancellationToken,
        stage: &mut HarvestStage,
    ) -> Result<SyncStats, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::InvalidState("cycle cancelled".to_string()));
        }
        let report = self.tracker.fetch(target, version).await?;

        for (from, phase) in STAGE_PHASES {
            let descriptor = self.enrichment.descriptor(phase);
            let phase_report = self
                .enrichment
                .run_collection(report.collection.id, &descriptor, cancel)
                .await?;
            if phase_report.cancelled {
                return Err(AppError::InvalidState(format!(
                    "cycle cancelled during {} phase",
                    phase
                )));
            }
            *stage = self.advance(&target.harvest, from).await?;
        }
        *stage = self.advance(&target.harvest, HarvestStage::Preview).await?;

        Ok(report.stats)
    }

    async fn advance(&self, harvest: &Harvest, from: HarvestStage) -> Result<HarvestStage, AppError> {
        if !self.tracker.advance_harvest(harvest, from).await? {
            return Err(AppError::InvalidState(format!(
                "harvest {} is no longer at stage {}",
                harvest.id, from
            )));
        }
        from.next()
            .ok_or_else(|| AppError::InvalidState(format!("no stage after {}", from)))
    }

    /// Resets every harvest of the dataset and prepares a clean version.
    pub async fn reset(&self, dataset_name: &str) -> Result<PreparedCycle, AppError> {
        let dataset = self.tracker.dataset(dataset_name).await?;
        self.tracker.prepare(&dataset, true).await
    }

    /// Promotes the latest version with evaluation, or makes a named
    /// version current without it.
    pub async fn promote(
        &self,
        dataset_name: &str,
        version: Option<&str>,
    ) -> Result<Promotion, AppError> {
        let dataset = self.tracker.dataset(dataset_name).await?;
        match version {
            Some(requested) => {
                let version = self
                    .versions
                    .set_current_by_version(&dataset, requested)
                    .await?;
                Ok(Promotion {
                    version,
                    fallbacks: Vec::new(),
                })
            }
            None => {
                let versions = self.store.versions(dataset.id).await?;
                let latest = latest_version(&versions)
                    .cloned()
                    .ok_or_else(|| AppError::VersionNotFound(format!("any in {}", dataset.name)))?;
                self.versions.promote(&dataset, &latest).await
            }
        }
    }

    /// Publishes the current version of a dataset.
    pub async fn publish(
        &self,
        dataset_name: &str,
        recreate: bool,
    ) -> Result<Vec<SearchIndex>, AppError> {
        let dataset = self.tracker.dataset(dataset_name).await?;
        let current = self
            .store
            .current_version(dataset.id)
            .await?
            .ok_or_else(|| AppError::VersionNotFound(format!("current of {}", dataset.name)))?;
        self.publisher
            .publish_version(&dataset, &current, recreate)
            .await
    }

    pub async fn resync(&self) -> Result<ResyncReport, AppError> {
        self.publisher.resync().await
    }

    /// Resyncs on a fixed interval until cancelled.
    pub async fn resync_loop(
        &self,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let report = self.resync().await?;
                    tracing::debug!(
                        synced = report.synced,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Resync pass"
                    );
                }
            }
        }
    }

    pub async fn purge(&self, dataset_name: &str) -> Result<Vec<String>, AppError> {
        let dataset = self.tracker.dataset(dataset_name).await?;
        self.versions.purge(&dataset).await
    }

    /// Harvests, versions and indices of a dataset.
    pub async fn status(&self, dataset_name: &str) -> Result<DatasetStatus, AppError> {
        let Some(dataset) = self.store.get_dataset(dataset_name).await? else {
            return Ok(DatasetStatus::default());
        };
        let harvests = self.store.harvests(dataset.id).await?;
        let versions = self.store.versions(dataset.id).await?;
        let mut indices = Vec::new();
        for version in &versions {
            indices.extend(self.store.indices(version.id).await?);
        }
        Ok(DatasetStatus {
            dataset: Some(dataset),
            harvests,
            versions,
            indices,
        })
    }
}
