//! Harvest tracker.
//!
//! Decides what each source of a dataset must (re-)fetch at the start of a
//! cycle, reconciles fetched seeds into the cycle's dataset version, and moves
//! harvests through `New -> Basic -> Video -> Preview -> Complete`.
//!
//! # Watermarks
//!
//! `latest_update_at` is the incremental cutoff passed to the connector. It
//! and `harvested_at` only advance when a fetch completes without errors, so
//! a failed fetch is retried from the same point on the next cycle.
//!
//! # Resets
//!
//! A harvest is reset to epoch when the caller asks for it, when its source
//! cannot report deletes (`delete_policy = no`), or when its `purge_after`
//! moment has passed. The collections of reset sources are left out of the
//! new dataset version, so a version never mixes stale and fresh data for
//! one source.
//!
//! # Sync flags
//!
//! A fetch raises `is_syncing` for its harvest. The flag is a lease: one
//! older than the configured sync lease belongs to a fetch that never
//! finished and is taken over. Prepare clears every flag of the dataset.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::SyncConfig;
use crate::error::AppError;
use crate::models::{
    epoch, Collection, Dataset, DatasetVersion, DeletePolicy, DocumentUpsert, Harvest,
    HarvestStage, NewSource, Seed, Source, SourceHarvest,
};
use crate::seeds::{NormalizeOptions, SeedNormalizer};
use crate::sync::{needs_reprocessing, SyncOutcome, SyncStats};
use crate::traits::{ConnectorRegistry, DocumentStore, HarvestStore, VersionStore};
use crate::versions::{latest_version, next_version};

/// A harvest after the prepare step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedHarvest {
    pub harvest: Harvest,
    pub source: Source,
    /// Watermarks went back to epoch.
    pub was_reset: bool,
}

impl PreparedHarvest {
    pub fn as_source_harvest(&self) -> SourceHarvest {
        SourceHarvest {
            harvest: self.harvest.clone(),
            source: self.source.clone(),
        }
    }
}

/// Everything a cycle needs after prepare.
#[derive(Debug, Clone)]
pub struct PreparedCycle {
    pub dataset: Dataset,
    pub version: DatasetVersion,
    pub harvests: Vec<PreparedHarvest>,
}

/// Result of one successful fetch.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub collection: Collection,
    pub fetched: usize,
    pub stats: SyncStats,
}

impl FetchReport {
    /// `(success_count, error_count)`; the error count of a returned report is
    /// always zero since any error fails the fetch.
    pub fn counts(&self) -> (usize, usize) {
        (self.fetched, self.stats.failed)
    }
}

/// Whether a harvest goes back to epoch during prepare.
pub fn should_reset(harvest: &Harvest, source: &Source, reset: bool, now: DateTime<Utc>) -> bool {
    reset
        || source.delete_policy == DeletePolicy::No
        || harvest.purge_after.is_some_and(|moment| moment <= now)
}

/// Computes the post-prepare state of every harvest of a dataset.
///
/// Stores call this while holding the per-dataset lock and persist the
/// returned harvests as-is.
pub fn plan_preparation(
    harvests: &[SourceHarvest],
    reset: bool,
    now: DateTime<Utc>,
) -> Vec<PreparedHarvest> {
    harvests
        .iter()
        .map(|SourceHarvest { harvest, source }| {
            let was_reset = should_reset(harvest, source, reset, now);
            let mut harvest = harvest.clone();
            harvest.stage = HarvestStage::New;
            harvest.is_syncing = false;
            harvest.sync_started_at = None;
            if was_reset {
                harvest.latest_update_at = epoch();
                harvest.harvested_at = None;
            }
            if was_reset || harvest.purge_after.is_none() {
                harvest.purge_after = source.purge_deadline(now);
            }
            PreparedHarvest {
                harvest,
                source: source.clone(),
                was_reset,
            }
        })
        .collect()
}

/// Drives harvests of datasets through prepare, fetch and stage transitions.
pub struct HarvestTracker<S> {
    store: S,
    connectors: ConnectorRegistry,
    normalizer: SeedNormalizer,
    sync_lease: Duration,
}

impl<S> HarvestTracker<S>
where
    S: HarvestStore + VersionStore + DocumentStore,
{
    pub fn new(store: S, connectors: ConnectorRegistry, normalizer: SeedNormalizer) -> Self {
        Self {
            store,
            connectors,
            normalizer,
            sync_lease: SyncConfig::default().lease(),
        }
    }

    /// Age after which a sync flag is considered abandoned.
    pub fn with_sync_lease(mut self, lease: Duration) -> Self {
        self.sync_lease = lease;
        self
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    /// Looks up a dataset by name.
    pub async fn dataset(&self, name: &str) -> Result<Dataset, AppError> {
        self.store
            .get_dataset(name)
            .await?
            .ok_or_else(|| AppError::DatasetNotFound(name.to_string()))
    }

    /// Registers a dataset and attaches the given sources to it.
    ///
    /// Re-registering is harmless: existing harvests keep their progress.
    pub async fn register(
        &self,
        dataset_name: &str,
        sources: &[NewSource],
    ) -> Result<(Dataset, Vec<Harvest>), AppError> {
        let dataset = self.store.register_dataset(dataset_name).await?;
        let mut harvests = Vec::with_capacity(sources.len());
        for new_source in sources {
            let source = self.store.register_source(new_source).await?;
            harvests.push(
                self.store
                    .attach_source(dataset.id, source.id, Utc::now())
                    .await?,
            );
        }
        tracing::info!(
            dataset = %dataset.name,
            sources = harvests.len(),
            "Registered dataset"
        );
        Ok((dataset, harvests))
    }

    /// Prepares a new cycle: rewinds or resets every harvest and creates the
    /// dataset version the cycle writes into.
    pub async fn prepare(&self, dataset: &Dataset, reset: bool) -> Result<PreparedCycle, AppError> {
        let now = Utc::now();
        let harvests = self.store.prepare_harvests(dataset.id, reset, now).await?;

        let excluded: Vec<String> = harvests
            .iter()
            .filter(|p| p.was_reset)
            .map(|p| p.source.set_specification.clone())
            .collect();

        let versions = self.store.versions(dataset.id).await?;
        let version_name = next_version(&versions)?;
        let copy_from = latest_version(&versions).map(|v| v.id);
        let version = self
            .store
            .create_version(dataset.id, &version_name, copy_from, &excluded, now)
            .await?;

        for prepared in harvests.iter().filter(|p| p.was_reset) {
            match self.connectors.get(&prepared.source.name) {
                Ok(connector) => {
                    connector
                        .purge_resources(&prepared.source.set_specification)
                        .await?
                }
                Err(e) => tracing::warn!(
                    source = %prepared.source.name,
                    error = %e,
                    "Cannot purge resources"
                ),
            }
        }

        tracing::info!(
            dataset = %dataset.name,
            version = %version.version,
            harvests = harvests.len(),
            reset = excluded.len(),
            "Prepared harvest cycle"
        );

        Ok(PreparedCycle {
            dataset: dataset.clone(),
            version,
            harvests,
        })
    }

    /// Fetches one source into the version's collection for it.
    ///
    /// Fails with [`AppError::HarvestBusy`] if another fetch of the harvest
    /// started within the sync lease, and with [`AppError::FetchFailed`] if any record broke the
    /// record-state contract. Watermarks advance only on success.
    pub async fn fetch(
        &self,
        target: &SourceHarvest,
        version: &DatasetVersion,
    ) -> Result<FetchReport, AppError> {
        let harvest = &target.harvest;
        let source = &target.source;
        let connector = self.connectors.get(&source.name)?;

        let started = Utc::now();
        if !self
            .store
            .begin_sync(harvest.id, started, self.sync_lease)
            .await?
        {
            return Err(AppError::HarvestBusy(source.name.clone()));
        }

        let result = async {
            let seeds = connector
                .extract_seeds(&source.set_specification, harvest.latest_update_at)
                .await?;
            self.reconcile(source, version, seeds, started).await
        }
        .await;

        let watermark = result.as_ref().ok().map(|_| started);
        self.store.finish_sync(harvest.id, watermark).await?;

        match &result {
            Ok(report) => tracing::info!(
                source = %source.name,
                version = %version.version,
                fetched = report.fetched,
                created = report.stats.created,
                updated = report.stats.updated,
                unchanged = report.stats.unchanged,
                deleted = report.stats.deleted,
                "Fetch complete"
            ),
            Err(e) => tracing::warn!(
                source = %source.name,
                since = %harvest.latest_update_at,
                error = %e,
                "Fetch failed"
            ),
        }

        result
    }

    async fn reconcile(
        &self,
        source: &Source,
        version: &DatasetVersion,
        seeds: Vec<Seed>,
        now: DateTime<Utc>,
    ) -> Result<FetchReport, AppError> {
        let fetched = seeds.len();
        let normalized = self.normalizer.normalize(
            seeds,
            NormalizeOptions {
                include_deleted: true,
                allow_empty_url: source.allow_empty_url,
            },
        );
        if normalized.errors > 0 {
            return Err(AppError::FetchFailed {
                source_name: source.name.clone(),
                errors: normalized.errors,
            });
        }

        let collection = self
            .store
            .ensure_collection(version.id, &source.set_specification, now)
            .await?;
        let existing = self.store.content_hashes(collection.id).await?;
        let (upserts, deletes) = normalized.partition();

        // the last occurrence of an external id wins
        let mut latest: HashMap<String, Seed> = HashMap::with_capacity(upserts.len());
        for seed in upserts {
            latest.insert(seed.external_id.clone(), seed);
        }

        let mut stats = SyncStats::new();
        let mut writes = Vec::with_capacity(latest.len());
        for seed in latest.into_values() {
            let hash = seed.content_hash()?;
            let decision =
                needs_reprocessing(existing.get(&seed.external_id).map(String::as_str), &hash);
            stats.record(decision.outcome);
            if decision.outcome == SyncOutcome::Unchanged {
                continue;
            }
            writes.push(DocumentUpsert {
                properties: seed.to_properties()?,
                external_id: seed.external_id,
                state: seed.state,
                content_hash: hash,
                reset_pipeline: decision.needs_enrichment,
            });
        }

        self.store
            .upsert_documents(collection.id, version.id, &writes, now)
            .await?;
        let deleted = self
            .store
            .delete_documents(collection.id, &deletes, now)
            .await?;
        stats.record_many(SyncOutcome::Deleted, deleted);

        Ok(FetchReport {
            collection,
            fetched,
            stats,
        })
    }

    /// Moves every harvest of the dataset at `from` one stage forward.
    pub async fn advance(&self, dataset: &Dataset, from: HarvestStage) -> Result<u64, AppError> {
        let to = next_stage(from)?;
        let moved = self.store.transition_stage(dataset.id, from, to).await?;
        tracing::debug!(dataset = %dataset.name, %from, %to, moved, "Advanced harvests");
        Ok(moved)
    }

    /// Moves one harvest forward if it is still at `from`.
    pub async fn advance_harvest(
        &self,
        harvest: &Harvest,
        from: HarvestStage,
    ) -> Result<bool, AppError> {
        let to = next_stage(from)?;
        self.store.transition_harvest(harvest.id, from, to).await
    }
}

fn next_stage(from: HarvestStage) -> Result<HarvestStage, AppError> {
    from.next()
        .ok_or_else(|| AppError::InvalidState(format!("no stage after {}", from)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::config::NormalizerConfig;
    use crate::memory::MemoryStore;
    use crate::models::{SeedState, PipelinePhase};
    use crate::traits::Connector;

    #[derive(Default)]
    struct FakeConnector {
        seeds: Mutex<Vec<Seed>>,
        since: Mutex<Vec<DateTime<Utc>>>,
        purged: AtomicUsize,
        fail: Mutex<bool>,
        hang: Mutex<bool>,
    }

    impl FakeConnector {
        fn set(&self, seeds: Vec<Seed>) {
            *self.seeds.lock().unwrap() = seeds;
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn connector_type(&self) -> &str {
            "fake"
        }

        async fn extract_seeds(
            &self,
            _set_specification: &str,
            since: DateTime<Utc>,
        ) -> Result<Vec<Seed>, AppError> {
            self.since.lock().unwrap().push(since);
            let hang = *self.hang.lock().unwrap();
            if hang {
                std::future::pending::<()>().await;
            }
            if *self.fail.lock().unwrap() {
                return Err(AppError::NetworkError("connection refused".to_string()));
            }
            Ok(self.seeds.lock().unwrap().clone())
        }

        async fn purge_resources(&self, _set_specification: &str) -> Result<(), AppError> {
            self.purged.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn seed(id: &str, state: SeedState) -> Seed {
        let mut seed = Seed::new(id, state);
        seed.url = Some(format!("https://example.com/{}", id));
        seed
    }

    fn new_source(policy: DeletePolicy) -> NewSource {
        NewSource {
            name: "edurep".to_string(),
            connector: "fake".to_string(),
            endpoint: "https://example.com".to_string(),
            set_specification: "edurep_delen".to_string(),
            delete_policy: policy,
            purge_interval_days: Some(7),
            allow_empty_url: false,
        }
    }

    async fn setup(
        policy: DeletePolicy,
    ) -> (HarvestTracker<MemoryStore>, MemoryStore, Arc<FakeConnector>, Dataset) {
        let store = MemoryStore::new();
        let connector = Arc::new(FakeConnector::default());
        let mut registry = ConnectorRegistry::new();
        registry.register("edurep", connector.clone());
        let tracker = HarvestTracker::new(
            store.clone(),
            registry,
            SeedNormalizer::new(NormalizerConfig {
                allow_closed_access: true,
                ..Default::default()
            }),
        );
        let (dataset, _) = tracker
            .register("edusources", &[new_source(policy)])
            .await
            .unwrap();
        (tracker, store, connector, dataset)
    }

    fn source_harvest(policy: DeletePolicy, purge_after: Option<DateTime<Utc>>) -> SourceHarvest {
        let source = Source {
            id: uuid::Uuid::new_v4(),
            name: "edurep".to_string(),
            connector: "fake".to_string(),
            endpoint: String::new(),
            set_specification: "edurep_delen".to_string(),
            delete_policy: policy,
            purge_interval_days: Some(7),
            allow_empty_url: false,
            created_at: epoch(),
        };
        let mut harvest = Harvest::attached(uuid::Uuid::new_v4(), source.id, None);
        harvest.stage = HarvestStage::Complete;
        harvest.latest_update_at = Utc::now() - Duration::days(1);
        harvest.harvested_at = Some(harvest.latest_update_at);
        harvest.purge_after = purge_after;
        SourceHarvest { harvest, source }
    }

    #[test]
    fn test_plan_keeps_watermarks_without_reset() {
        let now = Utc::now();
        let input = source_harvest(DeletePolicy::Transient, Some(now + Duration::days(1)));
        let plan = plan_preparation(std::slice::from_ref(&input), false, now);

        assert!(!plan[0].was_reset);
        assert_eq!(plan[0].harvest.stage, HarvestStage::New);
        assert_eq!(plan[0].harvest.latest_update_at, input.harvest.latest_update_at);
        assert_eq!(plan[0].harvest.harvested_at, input.harvest.harvested_at);
    }

    #[test]
    fn test_plan_resets_on_request_policy_and_retention() {
        let now = Utc::now();
        let cases = [
            (source_harvest(DeletePolicy::Persistent, None), true),
            (source_harvest(DeletePolicy::No, None), false),
            (
                source_harvest(DeletePolicy::Transient, Some(now - Duration::seconds(1))),
                false,
            ),
        ];
        for (input, reset) in cases {
            let plan = plan_preparation(std::slice::from_ref(&input), reset, now);
            assert!(plan[0].was_reset);
            assert_eq!(plan[0].harvest.latest_update_at, epoch());
            assert!(plan[0].harvest.harvested_at.is_none());
            assert_eq!(plan[0].harvest.purge_after, Some(now + Duration::days(7)));
        }
    }

    #[test]
    fn test_plan_fills_missing_purge_deadline_and_clears_sync_flags() {
        let now = Utc::now();
        let mut input = source_harvest(DeletePolicy::Transient, None);
        input.harvest.is_syncing = true;
        input.harvest.sync_started_at = Some(now);
        let plan = plan_preparation(std::slice::from_ref(&input), false, now);

        assert!(!plan[0].was_reset);
        assert_eq!(plan[0].harvest.purge_after, Some(now + Duration::days(7)));
        assert!(!plan[0].harvest.is_syncing);
        assert!(plan[0].harvest.sync_started_at.is_none());
    }

    #[test]
    fn test_plan_is_idempotent_without_reset() {
        let now = Utc::now();
        let input = vec![
            source_harvest(DeletePolicy::Transient, Some(now + Duration::days(3))),
            source_harvest(DeletePolicy::No, None),
        ];
        let first = plan_preparation(&input, false, now);
        let again: Vec<SourceHarvest> = first.iter().map(|p| p.as_source_harvest()).collect();
        let second = plan_preparation(&again, false, now);

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.harvest.latest_update_at, b.harvest.latest_update_at);
            assert_eq!(a.harvest.harvested_at, b.harvest.harvested_at);
        }
    }

    #[tokio::test]
    async fn test_prepare_twice_keeps_watermarks() {
        let (tracker, store, connector, dataset) = setup(DeletePolicy::Transient).await;
        connector.set(vec![seed("a", SeedState::Active)]);
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        tracker
            .fetch(&cycle.harvests[0].as_source_harvest(), &cycle.version)
            .await
            .unwrap();

        tracker.prepare(&dataset, false).await.unwrap();
        let first = store.harvests(dataset.id).await.unwrap();
        tracker.prepare(&dataset, false).await.unwrap();
        let second = store.harvests(dataset.id).await.unwrap();

        assert_ne!(first[0].harvest.latest_update_at, epoch());
        assert_eq!(
            first[0].harvest.latest_update_at,
            second[0].harvest.latest_update_at
        );
        assert_eq!(first[0].harvest.harvested_at, second[0].harvest.harvested_at);
    }

    #[tokio::test]
    async fn test_prepare_creates_versions_and_purges_reset_sources() {
        let (tracker, _store, connector, dataset) = setup(DeletePolicy::Transient).await;

        let first = tracker.prepare(&dataset, false).await.unwrap();
        assert_eq!(first.version.version, "0.0.1");
        // the purge deadline set on attach is a week out, so nothing reset
        assert!(!first.harvests[0].was_reset);
        assert_eq!(connector.purged.load(Ordering::SeqCst), 0);

        let second = tracker.prepare(&dataset, true).await.unwrap();
        assert_eq!(second.version.version, "0.0.2");
        assert!(second.harvests[0].was_reset);
        assert_eq!(connector.purged.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_source_collection_is_not_copied() {
        let (tracker, store, connector, dataset) = setup(DeletePolicy::Transient).await;
        connector.set(vec![seed("a", SeedState::Active)]);
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        tracker
            .fetch(&cycle.harvests[0].as_source_harvest(), &cycle.version)
            .await
            .unwrap();

        let incremental = tracker.prepare(&dataset, false).await.unwrap();
        assert_eq!(store.collections(incremental.version.id).await.unwrap().len(), 1);

        let reset = tracker.prepare(&dataset, true).await.unwrap();
        assert!(store.collections(reset.version.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_upserts_active_and_deletes_deleted() {
        let (tracker, store, connector, dataset) = setup(DeletePolicy::Persistent).await;

        // two documents that the upstream later reports as deleted
        connector.set(vec![seed("d1", SeedState::Active), seed("d2", SeedState::Active)]);
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        tracker
            .fetch(&cycle.harvests[0].as_source_harvest(), &cycle.version)
            .await
            .unwrap();

        let mut seeds: Vec<Seed> = (0..10)
            .map(|i| seed(&format!("a{}", i), SeedState::Active))
            .collect();
        seeds.push(Seed::new("d1", SeedState::Deleted));
        seeds.push(Seed::new("d2", SeedState::Deleted));
        connector.set(seeds);

        let cycle = tracker.prepare(&dataset, true).await.unwrap();
        assert_eq!(cycle.harvests[0].harvest.latest_update_at, epoch());
        // the reset dropped the collection, so seed the two documents again
        let collection = store
            .ensure_collection(cycle.version.id, "edurep_delen", Utc::now())
            .await
            .unwrap();
        let existing: Vec<DocumentUpsert> = ["d1", "d2"]
            .iter()
            .map(|id| DocumentUpsert {
                external_id: id.to_string(),
                state: SeedState::Active,
                properties: Default::default(),
                content_hash: "old".to_string(),
                reset_pipeline: true,
            })
            .collect();
        store
            .upsert_documents(collection.id, cycle.version.id, &existing, Utc::now())
            .await
            .unwrap();

        let report = tracker
            .fetch(&cycle.harvests[0].as_source_harvest(), &cycle.version)
            .await
            .unwrap();

        assert_eq!(report.stats.created, 10);
        assert_eq!(report.stats.deleted, 2);
        let docs = store.collection_documents(collection.id).await.unwrap();
        assert_eq!(docs.iter().filter(|d| d.is_active()).count(), 10);
        assert_eq!(
            docs.iter()
                .filter(|d| d.deleted_at.is_some() && d.state == SeedState::Deleted)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_unchanged_documents_are_not_rewritten() {
        let (tracker, store, connector, dataset) = setup(DeletePolicy::Transient).await;
        connector.set(vec![seed("a", SeedState::Active), seed("b", SeedState::Active)]);
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        let target = cycle.harvests[0].as_source_harvest();
        let first = tracker.fetch(&target, &cycle.version).await.unwrap();
        assert_eq!(first.stats.created, 2);

        // stamp a phase so a rewrite would be visible
        let docs = store.collection_documents(first.collection.id).await.unwrap();
        let patches: Vec<_> = docs
            .iter()
            .map(|d| crate::models::DocumentPatch {
                document_id: d.id,
                phase: PipelinePhase::Extraction,
                record: crate::models::PhaseRecord {
                    success: true,
                    resource: None,
                    processed_at: Utc::now(),
                },
                target_property: None,
                values: Default::default(),
            })
            .collect();
        store.apply_merge(&patches, Utc::now()).await.unwrap();

        let mut changed = seed("b", SeedState::Active);
        changed.title = Some("new title".to_string());
        connector.set(vec![seed("a", SeedState::Active), changed]);
        let second = tracker.fetch(&target, &cycle.version).await.unwrap();
        assert_eq!(second.stats.unchanged, 1);
        assert_eq!(second.stats.updated, 1);

        let docs = store.collection_documents(first.collection.id).await.unwrap();
        let a = docs.iter().find(|d| d.external_id == "a").unwrap();
        let b = docs.iter().find(|d| d.external_id == "b").unwrap();
        assert!(a.pipeline.succeeded(PipelinePhase::Extraction));
        assert!(b.pipeline.is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_watermark() {
        let (tracker, store, connector, dataset) = setup(DeletePolicy::Transient).await;
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        let target = cycle.harvests[0].as_source_harvest();

        *connector.fail.lock().unwrap() = true;
        assert!(tracker.fetch(&target, &cycle.version).await.is_err());
        let harvest = &store.harvests(dataset.id).await.unwrap()[0].harvest;
        assert_eq!(harvest.latest_update_at, epoch());
        assert!(harvest.harvested_at.is_none());
        assert!(!harvest.is_syncing);
    }

    #[tokio::test]
    async fn test_seed_errors_fail_the_fetch() {
        let (tracker, store, connector, dataset) = setup(DeletePolicy::Transient).await;
        connector.set(vec![seed("a", SeedState::Active), Seed::new("", SeedState::Active)]);
        let cycle = tracker.prepare(&dataset, false).await.unwrap();

        let result = tracker
            .fetch(&cycle.harvests[0].as_source_harvest(), &cycle.version)
            .await;
        assert!(matches!(result, Err(AppError::FetchFailed { errors: 1, .. })));
        let harvest = &store.harvests(dataset.id).await.unwrap()[0].harvest;
        assert!(harvest.harvested_at.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_fetch_is_busy() {
        let (tracker, store, _connector, dataset) = setup(DeletePolicy::Transient).await;
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        let target = cycle.harvests[0].as_source_harvest();

        assert!(store
            .begin_sync(target.harvest.id, Utc::now(), Duration::hours(1))
            .await
            .unwrap());
        let result = tracker.fetch(&target, &cycle.version).await;
        assert!(matches!(result, Err(AppError::HarvestBusy(_))));
    }

    #[tokio::test]
    async fn test_interrupted_fetch_does_not_block_next_cycle() {
        let (tracker, store, connector, dataset) = setup(DeletePolicy::Transient).await;
        connector.set(vec![seed("a", SeedState::Active)]);
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        let target = cycle.harvests[0].as_source_harvest();

        *connector.hang.lock().unwrap() = true;
        let interrupted = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            tracker.fetch(&target, &cycle.version),
        )
        .await;
        assert!(interrupted.is_err());
        assert!(store.harvests(dataset.id).await.unwrap()[0].harvest.is_syncing);
        *connector.hang.lock().unwrap() = false;

        // the flag is still within its lease
        let result = tracker.fetch(&target, &cycle.version).await;
        assert!(matches!(result, Err(AppError::HarvestBusy(_))));

        let cycle = tracker.prepare(&dataset, true).await.unwrap();
        assert!(!cycle.harvests[0].harvest.is_syncing);
        let report = tracker
            .fetch(&cycle.harvests[0].as_source_harvest(), &cycle.version)
            .await
            .unwrap();
        assert_eq!(report.stats.created, 1);
        let harvest = &store.harvests(dataset.id).await.unwrap()[0].harvest;
        assert!(!harvest.is_syncing);
        assert!(harvest.harvested_at.is_some());
    }

    #[tokio::test]
    async fn test_expired_sync_flag_is_taken_over() {
        let (tracker, store, connector, dataset) = setup(DeletePolicy::Transient).await;
        connector.set(vec![seed("a", SeedState::Active)]);
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        let target = cycle.harvests[0].as_source_harvest();

        // a worker that died two hours into an hour-long lease
        let crashed_at = Utc::now() - Duration::hours(2);
        assert!(store
            .begin_sync(target.harvest.id, crashed_at, Duration::hours(1))
            .await
            .unwrap());

        let report = tracker.fetch(&target, &cycle.version).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert!(!store.harvests(dataset.id).await.unwrap()[0].harvest.is_syncing);
    }

    #[tokio::test]
    async fn test_attached_harvest_is_purged_after_interval() {
        let (tracker, store, connector, _dataset) = setup(DeletePolicy::Transient).await;
        let dataset = store.register_dataset("archive").await.unwrap();
        let source = store
            .register_source(&new_source(DeletePolicy::Transient))
            .await
            .unwrap();
        let attached_at = Utc::now() - Duration::days(8);
        let harvest = store
            .attach_source(dataset.id, source.id, attached_at)
            .await
            .unwrap();
        assert_eq!(harvest.purge_after, Some(attached_at + Duration::days(7)));

        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        assert!(cycle.harvests[0].was_reset);
        assert_eq!(connector.purged.load(Ordering::SeqCst), 1);
        let deadline = cycle.harvests[0].harvest.purge_after.unwrap();
        assert!(deadline > Utc::now() + Duration::days(6));
    }

    #[tokio::test]
    async fn test_incremental_fetch_uses_watermark() {
        let (tracker, _store, connector, dataset) = setup(DeletePolicy::Transient).await;
        connector.set(vec![seed("a", SeedState::Active)]);
        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        tracker
            .fetch(&cycle.harvests[0].as_source_harvest(), &cycle.version)
            .await
            .unwrap();

        let cycle = tracker.prepare(&dataset, false).await.unwrap();
        tracker
            .fetch(&cycle.harvests[0].as_source_harvest(), &cycle.version)
            .await
            .unwrap();

        let since = connector.since.lock().unwrap().clone();
        assert_eq!(since[0], epoch());
        assert!(since[1] > epoch());
    }

    #[tokio::test]
    async fn test_stage_transitions_are_guarded() {
        let (tracker, store, _connector, dataset) = setup(DeletePolicy::Transient).await;
        tracker.prepare(&dataset, false).await.unwrap();

        assert_eq!(tracker.advance(&dataset, HarvestStage::New).await.unwrap(), 1);
        // repeating the same transition is a no-op
        assert_eq!(tracker.advance(&dataset, HarvestStage::New).await.unwrap(), 0);
        // skipping ahead matches nothing
        assert_eq!(tracker.advance(&dataset, HarvestStage::Video).await.unwrap(), 0);

        let harvest = store.harvests(dataset.id).await.unwrap()[0].harvest.clone();
        assert_eq!(harvest.stage, HarvestStage::Basic);
        assert!(tracker
            .advance_harvest(&harvest, HarvestStage::Basic)
            .await
            .unwrap());
        assert!(tracker
            .advance(&dataset, HarvestStage::Complete)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_dataset() {
        let (tracker, _store, _connector, _dataset) = setup(DeletePolicy::Transient).await;
        assert!(matches!(
            tracker.dataset("missing").await,
            Err(AppError::DatasetNotFound(_))
        ));
    }
}
