//! Store and collaborator traits.
//!
//! The components in this crate never talk to a database, a feed or a search
//! engine directly. Persistence goes through the four store traits, which
//! [`crate::memory::MemoryStore`] and the PostgreSQL repository implement;
//! remote systems go through [`Connector`], [`ResourceFetcher`] and
//! [`SearchEngine`].
//!
//! Stores are used as generic parameters. Collaborators are held as trait
//! objects so a single run can mix connector types.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AppError;
use crate::harvest::PreparedHarvest;
use crate::models::{
    Batch, Collection, Dataset, DatasetVersion, Document, DocumentPatch, DocumentUpsert, Harvest,
    HarvestStage, NewSource, PipelinePhase, ProcessResult, ResourceRef, SearchIndex, Seed, Source,
    SourceHarvest,
};

// =============================================================================
// Stores
// =============================================================================

/// Datasets, sources and the harvests joining them.
#[async_trait]
pub trait HarvestStore: Send + Sync {
    /// Creates the dataset, or returns it if the name already exists.
    async fn register_dataset(&self, name: &str) -> Result<Dataset, AppError>;

    /// Creates or updates a source by name.
    async fn register_source(&self, source: &NewSource) -> Result<Source, AppError>;

    /// Creates the harvest for a (dataset, source) pair at `New`/epoch, due
    /// for a purge one interval of the source after `now`.
    /// Attaching twice returns the existing harvest untouched.
    async fn attach_source(
        &self,
        dataset_id: Uuid,
        source_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Harvest, AppError>;

    async fn get_dataset(&self, name: &str) -> Result<Option<Dataset>, AppError>;

    async fn harvests(&self, dataset_id: Uuid) -> Result<Vec<SourceHarvest>, AppError>;

    /// Resets or rewinds every harvest of a dataset under a per-dataset lock.
    ///
    /// Implementations apply [`crate::harvest::plan_preparation`] to the
    /// locked rows and persist the result before releasing the lock.
    async fn prepare_harvests(
        &self,
        dataset_id: Uuid,
        reset: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<PreparedHarvest>, AppError>;

    /// Moves every harvest of the dataset that is at `from` to `to`.
    /// Returns the number of rows moved; zero when nothing was at `from`.
    async fn transition_stage(
        &self,
        dataset_id: Uuid,
        from: HarvestStage,
        to: HarvestStage,
    ) -> Result<u64, AppError>;

    /// Guarded single-harvest variant of [`transition_stage`](Self::transition_stage).
    async fn transition_harvest(
        &self,
        harvest_id: Uuid,
        from: HarvestStage,
        to: HarvestStage,
    ) -> Result<bool, AppError>;

    /// Marks the harvest as syncing since `now`. Returns false if another
    /// fetch raised the flag less than `lease` ago; older flags are taken over.
    async fn begin_sync(
        &self,
        harvest_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, AppError>;

    /// Clears the syncing flag. With a watermark, also records the fetch as
    /// successful by advancing `latest_update_at` and `harvested_at`.
    async fn finish_sync(
        &self,
        harvest_id: Uuid,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<(), AppError>;
}

/// Documents and enrichment bookkeeping.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All documents of a collection, soft-deleted ones included.
    async fn collection_documents(&self, collection_id: Uuid) -> Result<Vec<Document>, AppError>;

    /// All documents of a version, optionally only those modified after `since`.
    async fn version_documents(
        &self,
        version_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Document>, AppError>;

    async fn documents_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Document>, AppError>;

    /// `external_id -> content_hash` for the live documents of a collection.
    async fn content_hashes(&self, collection_id: Uuid)
        -> Result<HashMap<String, String>, AppError>;

    /// Inserts or rewrites documents by `(collection, external_id)`.
    /// Rewriting a soft-deleted document revives it.
    async fn upsert_documents(
        &self,
        collection_id: Uuid,
        version_id: Uuid,
        documents: &[DocumentUpsert],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError>;

    /// Soft-deletes live documents with the given external ids.
    async fn delete_documents(
        &self,
        collection_id: Uuid,
        external_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError>;

    /// Applies all patches atomically after locking exactly the patched rows.
    ///
    /// Fails with [`AppError::LockContention`] without writing anything when
    /// any of the rows is held by another writer.
    async fn apply_merge(
        &self,
        patches: &[DocumentPatch],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError>;

    async fn create_batch(
        &self,
        phase: PipelinePhase,
        now: DateTime<Utc>,
    ) -> Result<Batch, AppError>;

    async fn record_results(&self, results: &[ProcessResult]) -> Result<(), AppError>;

    async fn batch_results(&self, batch_id: Uuid) -> Result<Vec<ProcessResult>, AppError>;

    async fn finish_batch(&self, batch_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError>;
}

/// Dataset versions and their collections.
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn versions(&self, dataset_id: Uuid) -> Result<Vec<DatasetVersion>, AppError>;

    async fn current_version(&self, dataset_id: Uuid)
        -> Result<Option<DatasetVersion>, AppError>;

    /// Creates a version, copying the collections and documents of
    /// `copy_from` except the collections named in `exclude`.
    async fn create_version(
        &self,
        dataset_id: Uuid,
        version: &str,
        copy_from: Option<Uuid>,
        exclude: &[String],
        now: DateTime<Utc>,
    ) -> Result<DatasetVersion, AppError>;

    async fn collections(&self, version_id: Uuid) -> Result<Vec<Collection>, AppError>;

    async fn ensure_collection(
        &self,
        version_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Collection, AppError>;

    /// Active document count per collection name.
    async fn active_counts(&self, version_id: Uuid) -> Result<HashMap<String, u64>, AppError>;

    /// Replaces the same-named collection of the target version with a copy
    /// of `source`, documents included.
    async fn copy_collection(
        &self,
        source: &Collection,
        target_version_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Collection, AppError>;

    /// Makes `version_id` the only current version of its dataset in one
    /// atomic write.
    async fn set_current(&self, dataset_id: Uuid, version_id: Uuid) -> Result<(), AppError>;

    /// Deletes a version with its collections, documents and index records.
    async fn delete_version(&self, version_id: Uuid) -> Result<(), AppError>;
}

/// Search index records.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn indices(&self, version_id: Uuid) -> Result<Vec<SearchIndex>, AppError>;

    /// Indices attached to the current version of any dataset.
    async fn current_indices(&self) -> Result<Vec<SearchIndex>, AppError>;

    async fn get_or_create_index(
        &self,
        version_id: Uuid,
        language: &str,
        remote_name: &str,
        configuration: &Value,
        now: DateTime<Utc>,
    ) -> Result<SearchIndex, AppError>;

    /// Persists configuration, error accounting and `pushed_at`.
    async fn save_index(&self, index: &SearchIndex) -> Result<(), AppError>;

    /// Non-blocking lock. Returns false when another worker took it less
    /// than `lease` before `now`.
    async fn try_lock_index(
        &self,
        index_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, AppError>;

    async fn unlock_index(&self, index_id: Uuid) -> Result<(), AppError>;
}

// =============================================================================
// Connectors
// =============================================================================

/// A source type that can produce seeds.
///
/// Implementations map their upstream format onto [`Seed`] and must fill
/// `external_id` and `state` for every record, deleted ones included.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector type identifier, e.g. `ckan`.
    fn connector_type(&self) -> &str;

    /// Every record of the set changed after `since`.
    async fn extract_seeds(
        &self,
        set_specification: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Seed>, AppError>;

    /// Drops cached upstream resources before a full re-fetch.
    async fn purge_resources(&self, _set_specification: &str) -> Result<(), AppError> {
        Ok(())
    }
}

/// Connectors keyed by source name.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source_name: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.insert(source_name.into(), connector);
    }

    pub fn get(&self, source_name: &str) -> Result<Arc<dyn Connector>, AppError> {
        self.connectors
            .get(source_name)
            .cloned()
            .ok_or_else(|| AppError::ConnectorNotFound(source_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

// =============================================================================
// Resource service
// =============================================================================

/// A call to an external resource, e.g. text extraction for a url.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    pub kind: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// What a resource call produced. A non-empty `failures` is authoritative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOutcome {
    pub successes: Vec<ResourceRef>,
    pub failures: Vec<ResourceRef>,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.successes.is_empty()
    }
}

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn call(&self, request: &ResourceRequest) -> Result<CallOutcome, AppError>;

    /// Content of a previously produced resource.
    async fn retrieve(&self, resource: &ResourceRef) -> Result<Value, AppError>;
}

// =============================================================================
// Search engine
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    Index { id: String, body: Value },
    Delete { id: String },
}

impl BulkAction {
    pub fn id(&self) -> &str {
        match self {
            BulkAction::Index { id, .. } | BulkAction::Delete { id } => id,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, BulkAction::Delete { .. })
    }
}

/// Per-item response of a bulk request, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AliasAction {
    /// `index` may be a wildcard pattern.
    Remove { index: String, alias: String },
    Add { index: String, alias: String },
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn index_exists(&self, name: &str) -> Result<bool, AppError>;

    async fn create_index(&self, name: &str, configuration: &Value) -> Result<(), AppError>;

    /// Fails with [`AppError::IndexNotFound`] when the index is absent.
    async fn delete_index(&self, name: &str) -> Result<(), AppError>;

    async fn bulk(&self, index: &str, actions: &[BulkAction])
        -> Result<Vec<BulkItemResult>, AppError>;

    /// Applies all actions as one atomic alias update. Fails with
    /// [`AppError::IndexNotFound`] when a remove matches nothing.
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullConnector;

    #[async_trait]
    impl Connector for NullConnector {
        fn connector_type(&self) -> &str {
            "null"
        }

        async fn extract_seeds(
            &self,
            _set_specification: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<Seed>, AppError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ConnectorRegistry::new();
        assert!(registry.is_empty());
        registry.register("edurep", Arc::new(NullConnector));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("edurep").unwrap().connector_type(), "null");
        assert!(matches!(
            registry.get("sharekit"),
            Err(AppError::ConnectorNotFound(name)) if name == "sharekit"
        ));
    }

    #[tokio::test]
    async fn test_purge_resources_defaults_to_noop() {
        let connector = NullConnector;
        assert!(connector.purge_resources("edurep").await.is_ok());
    }

    #[test]
    fn test_call_outcome_failures_are_authoritative() {
        let outcome = CallOutcome {
            successes: vec![ResourceRef::new("extract", "1")],
            failures: vec![ResourceRef::new("extract", "2")],
        };
        assert!(!outcome.is_success());
        assert!(!CallOutcome::default().is_success());
    }

    #[test]
    fn test_bulk_action_id() {
        let action = BulkAction::Delete {
            id: "abc".to_string(),
        };
        assert_eq!(action.id(), "abc");
        assert!(action.is_delete());
    }
}
