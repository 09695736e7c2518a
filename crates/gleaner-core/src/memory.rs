//! In-memory implementation of every store trait.
//!
//! Backs the unit tests and dry runs. All state sits behind one mutex, which
//! plays the part of the per-dataset lock and of the single-statement
//! promotion. Merges take row leases that are held across an await point, so
//! two merges over overlapping documents really do contend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::harvest::{plan_preparation, PreparedHarvest};
use crate::models::{
    Batch, Collection, Dataset, DatasetVersion, Document, DocumentPatch, DocumentUpsert, Harvest,
    HarvestStage, NewSource, Pipeline, PipelinePhase, ProcessResult, SearchIndex, SeedState,
    Source, SourceHarvest, sync_held,
};
use crate::traits::{DocumentStore, HarvestStore, IndexStore, VersionStore};

#[derive(Debug, Default)]
struct State {
    datasets: Vec<Dataset>,
    sources: Vec<Source>,
    harvests: Vec<Harvest>,
    versions: Vec<DatasetVersion>,
    collections: Vec<Collection>,
    documents: Vec<Document>,
    batches: Vec<Batch>,
    results: Vec<ProcessResult>,
    indices: Vec<SearchIndex>,
    locked: HashSet<Uuid>,
}

impl State {
    fn source_harvests(&self, dataset_id: Uuid) -> Vec<SourceHarvest> {
        let mut joined: Vec<SourceHarvest> = self
            .harvests
            .iter()
            .filter(|h| h.dataset_id == dataset_id)
            .filter_map(|h| {
                self.sources
                    .iter()
                    .find(|s| s.id == h.source_id)
                    .map(|s| SourceHarvest {
                        harvest: h.clone(),
                        source: s.clone(),
                    })
            })
            .collect();
        joined.sort_by(|a, b| a.source.name.cmp(&b.source.name));
        joined
    }

    fn harvest_mut(&mut self, harvest_id: Uuid) -> Result<&mut Harvest, AppError> {
        self.harvests
            .iter_mut()
            .find(|h| h.id == harvest_id)
            .ok_or_else(|| AppError::InvalidState(format!("unknown harvest {}", harvest_id)))
    }

    fn copy_documents(
        &mut self,
        from_collection: Uuid,
        to: &Collection,
        now: DateTime<Utc>,
    ) {
        let copies: Vec<Document> = self
            .documents
            .iter()
            .filter(|d| d.collection_id == from_collection)
            .map(|d| Document {
                id: Uuid::new_v4(),
                dataset_version_id: Some(to.dataset_version_id),
                collection_id: to.id,
                created_at: now,
                ..d.clone()
            })
            .collect();
        self.documents.extend(copies);
    }

    fn new_collection(&mut self, version_id: Uuid, name: &str, now: DateTime<Utc>) -> Collection {
        let collection = Collection {
            id: Uuid::new_v4(),
            dataset_version_id: version_id,
            name: name.to_string(),
            created_at: now,
        };
        self.collections.push(collection.clone());
        collection
    }
}

/// Shared in-memory store; clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

/// Row locks held on behalf of a simulated concurrent writer.
#[derive(Debug)]
pub struct DocumentLease {
    state: Arc<Mutex<State>>,
    ids: Vec<Uuid>,
}

impl Drop for DocumentLease {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            for id in &self.ids {
                state.locked.remove(id);
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::Generic("memory store lock poisoned".to_string()))
    }

    /// Holds row locks on the documents until the lease is dropped.
    pub fn lock_documents(&self, ids: &[Uuid]) -> DocumentLease {
        if let Ok(mut state) = self.state.lock() {
            state.locked.extend(ids.iter().copied());
        }
        DocumentLease {
            state: self.state.clone(),
            ids: ids.to_vec(),
        }
    }

    /// All enrichment batches, oldest first.
    pub fn batches(&self) -> Vec<Batch> {
        self.state
            .lock()
            .map(|state| state.batches.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HarvestStore for MemoryStore {
    async fn register_dataset(&self, name: &str) -> Result<Dataset, AppError> {
        let mut state = self.state()?;
        if let Some(existing) = state.datasets.iter().find(|d| d.name == name) {
            return Ok(existing.clone());
        }
        let dataset = Dataset {
            id: Uuid::new_v4(),
            name: name.to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        state.datasets.push(dataset.clone());
        Ok(dataset)
    }

    async fn register_source(&self, new: &NewSource) -> Result<Source, AppError> {
        let mut state = self.state()?;
        if let Some(existing) = state.sources.iter_mut().find(|s| s.name == new.name) {
            existing.connector = new.connector.clone();
            existing.endpoint = new.endpoint.clone();
            existing.set_specification = new.set_specification.clone();
            existing.delete_policy = new.delete_policy;
            existing.purge_interval_days = new.purge_interval_days;
            existing.allow_empty_url = new.allow_empty_url;
            return Ok(existing.clone());
        }
        let source = Source {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            connector: new.connector.clone(),
            endpoint: new.endpoint.clone(),
            set_specification: new.set_specification.clone(),
            delete_policy: new.delete_policy,
            purge_interval_days: new.purge_interval_days,
            allow_empty_url: new.allow_empty_url,
            created_at: Utc::now(),
        };
        state.sources.push(source.clone());
        Ok(source)
    }

    async fn attach_source(
        &self,
        dataset_id: Uuid,
        source_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Harvest, AppError> {
        let mut state = self.state()?;
        if !state.datasets.iter().any(|d| d.id == dataset_id) {
            return Err(AppError::DatasetNotFound(dataset_id.to_string()));
        }
        let purge_after = state
            .sources
            .iter()
            .find(|s| s.id == source_id)
            .ok_or_else(|| AppError::SourceNotFound(source_id.to_string()))?
            .purge_deadline(now);
        if let Some(existing) = state
            .harvests
            .iter()
            .find(|h| h.dataset_id == dataset_id && h.source_id == source_id)
        {
            return Ok(existing.clone());
        }
        let harvest = Harvest::attached(dataset_id, source_id, purge_after);
        state.harvests.push(harvest.clone());
        Ok(harvest)
    }

    async fn get_dataset(&self, name: &str) -> Result<Option<Dataset>, AppError> {
        Ok(self.state()?.datasets.iter().find(|d| d.name == name).cloned())
    }

    async fn harvests(&self, dataset_id: Uuid) -> Result<Vec<SourceHarvest>, AppError> {
        Ok(self.state()?.source_harvests(dataset_id))
    }

    async fn prepare_harvests(
        &self,
        dataset_id: Uuid,
        reset: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<PreparedHarvest>, AppError> {
        let mut state = self.state()?;
        if !state.datasets.iter().any(|d| d.id == dataset_id) {
            return Err(AppError::DatasetNotFound(dataset_id.to_string()));
        }
        let planned = plan_preparation(&state.source_harvests(dataset_id), reset, now);
        for prepared in &planned {
            let harvest = state.harvest_mut(prepared.harvest.id)?;
            *harvest = prepared.harvest.clone();
        }
        Ok(planned)
    }

    async fn transition_stage(
        &self,
        dataset_id: Uuid,
        from: HarvestStage,
        to: HarvestStage,
    ) -> Result<u64, AppError> {
        let mut state = self.state()?;
        let mut moved = 0;
        for harvest in state
            .harvests
            .iter_mut()
            .filter(|h| h.dataset_id == dataset_id && h.stage == from)
        {
            harvest.stage = to;
            moved += 1;
        }
        Ok(moved)
    }

    async fn transition_harvest(
        &self,
        harvest_id: Uuid,
        from: HarvestStage,
        to: HarvestStage,
    ) -> Result<bool, AppError> {
        let mut state = self.state()?;
        let harvest = state.harvest_mut(harvest_id)?;
        if harvest.stage != from {
            return Ok(false);
        }
        harvest.stage = to;
        Ok(true)
    }

    async fn begin_sync(
        &self,
        harvest_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, AppError> {
        let mut state = self.state()?;
        let harvest = state.harvest_mut(harvest_id)?;
        if sync_held(harvest.is_syncing, harvest.sync_started_at, now, lease) {
            return Ok(false);
        }
        harvest.is_syncing = true;
        harvest.sync_started_at = Some(now);
        Ok(true)
    }

    async fn finish_sync(
        &self,
        harvest_id: Uuid,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let mut state = self.state()?;
        let harvest = state.harvest_mut(harvest_id)?;
        harvest.is_syncing = false;
        harvest.sync_started_at = None;
        if let Some(moment) = watermark {
            harvest.latest_update_at = moment;
            harvest.harvested_at = Some(moment);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn collection_documents(&self, collection_id: Uuid) -> Result<Vec<Document>, AppError> {
        Ok(self
            .state()?
            .documents
            .iter()
            .filter(|d| d.collection_id == collection_id)
            .cloned()
            .collect())
    }

    async fn version_documents(
        &self,
        version_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Document>, AppError> {
        Ok(self
            .state()?
            .documents
            .iter()
            .filter(|d| d.dataset_version_id == Some(version_id))
            .filter(|d| since.is_none_or(|moment| d.modified_at > moment))
            .cloned()
            .collect())
    }

    async fn documents_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Document>, AppError> {
        Ok(self
            .state()?
            .documents
            .iter()
            .filter(|d| ids.contains(&d.id))
            .cloned()
            .collect())
    }

    async fn content_hashes(
        &self,
        collection_id: Uuid,
    ) -> Result<HashMap<String, String>, AppError> {
        Ok(self
            .state()?
            .documents
            .iter()
            .filter(|d| d.collection_id == collection_id && d.deleted_at.is_none())
            .map(|d| (d.external_id.clone(), d.content_hash.clone()))
            .collect())
    }

    async fn upsert_documents(
        &self,
        collection_id: Uuid,
        version_id: Uuid,
        documents: &[DocumentUpsert],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut state = self.state()?;
        for upsert in documents {
            let existing = state
                .documents
                .iter_mut()
                .find(|d| d.collection_id == collection_id && d.external_id == upsert.external_id);
            match existing {
                Some(document) => {
                    document.state = upsert.state;
                    document.properties = upsert.properties.clone();
                    document.content_hash = upsert.content_hash.clone();
                    document.modified_at = now;
                    document.deleted_at = None;
                    if upsert.reset_pipeline {
                        document.pipeline = Pipeline::new();
                    }
                }
                None => state.documents.push(Document {
                    id: Uuid::new_v4(),
                    dataset_version_id: Some(version_id),
                    collection_id,
                    external_id: upsert.external_id.clone(),
                    state: upsert.state,
                    properties: upsert.properties.clone(),
                    pipeline: Pipeline::new(),
                    content_hash: upsert.content_hash.clone(),
                    created_at: now,
                    modified_at: now,
                    deleted_at: None,
                }),
            }
        }
        Ok(documents.len())
    }

    async fn delete_documents(
        &self,
        collection_id: Uuid,
        external_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut state = self.state()?;
        let mut deleted = 0;
        for document in state.documents.iter_mut().filter(|d| {
            d.collection_id == collection_id
                && d.deleted_at.is_none()
                && external_ids.contains(&d.external_id)
        }) {
            document.state = SeedState::Deleted;
            document.deleted_at = Some(now);
            document.modified_at = now;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn apply_merge(
        &self,
        patches: &[DocumentPatch],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let ids: HashSet<Uuid> = patches.iter().map(|p| p.document_id).collect();
        {
            let mut state = self.state()?;
            let held = ids.iter().filter(|id| state.locked.contains(id)).count();
            if held > 0 {
                return Err(AppError::LockContention(held));
            }
            state.locked.extend(ids.iter().copied());
        }

        tokio::task::yield_now().await;

        let mut state = self.state()?;
        let mut applied = 0;
        for patch in patches {
            let Some(document) = state.documents.iter_mut().find(|d| d.id == patch.document_id)
            else {
                continue;
            };
            match &patch.target_property {
                Some(target) => {
                    let entry = document
                        .properties
                        .entry(target.clone())
                        .or_insert_with(|| Value::Object(Default::default()));
                    match entry {
                        Value::Object(map) => map.extend(patch.values.clone()),
                        other => *other = Value::Object(patch.values.clone()),
                    }
                }
                None => document.properties.extend(patch.values.clone()),
            }
            document.pipeline.record(patch.phase, patch.record.clone());
            document.modified_at = now;
            applied += 1;
        }
        for id in &ids {
            state.locked.remove(id);
        }
        Ok(applied)
    }

    async fn create_batch(
        &self,
        phase: PipelinePhase,
        now: DateTime<Utc>,
    ) -> Result<Batch, AppError> {
        let batch = Batch {
            id: Uuid::new_v4(),
            phase,
            created_at: now,
            finished_at: None,
        };
        self.state()?.batches.push(batch.clone());
        Ok(batch)
    }

    async fn record_results(&self, results: &[ProcessResult]) -> Result<(), AppError> {
        self.state()?.results.extend_from_slice(results);
        Ok(())
    }

    async fn batch_results(&self, batch_id: Uuid) -> Result<Vec<ProcessResult>, AppError> {
        Ok(self
            .state()?
            .results
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn finish_batch(&self, batch_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut state = self.state()?;
        if let Some(batch) = state.batches.iter_mut().find(|b| b.id == batch_id) {
            batch.finished_at = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn versions(&self, dataset_id: Uuid) -> Result<Vec<DatasetVersion>, AppError> {
        let mut versions: Vec<DatasetVersion> = self
            .state()?
            .versions
            .iter()
            .filter(|v| v.dataset_id == dataset_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.created_at);
        Ok(versions)
    }

    async fn current_version(
        &self,
        dataset_id: Uuid,
    ) -> Result<Option<DatasetVersion>, AppError> {
        Ok(self
            .state()?
            .versions
            .iter()
            .find(|v| v.dataset_id == dataset_id && v.is_current)
            .cloned())
    }

    async fn create_version(
        &self,
        dataset_id: Uuid,
        version: &str,
        copy_from: Option<Uuid>,
        exclude: &[String],
        now: DateTime<Utc>,
    ) -> Result<DatasetVersion, AppError> {
        let mut state = self.state()?;
        let created = DatasetVersion {
            id: Uuid::new_v4(),
            dataset_id,
            version: version.to_string(),
            is_current: false,
            created_at: now,
        };
        state.versions.push(created.clone());

        if let Some(previous) = copy_from {
            let sources: Vec<Collection> = state
                .collections
                .iter()
                .filter(|c| c.dataset_version_id == previous && !exclude.contains(&c.name))
                .cloned()
                .collect();
            for source in sources {
                let copy = state.new_collection(created.id, &source.name, now);
                state.copy_documents(source.id, &copy, now);
            }
        }
        Ok(created)
    }

    async fn collections(&self, version_id: Uuid) -> Result<Vec<Collection>, AppError> {
        Ok(self
            .state()?
            .collections
            .iter()
            .filter(|c| c.dataset_version_id == version_id)
            .cloned()
            .collect())
    }

    async fn ensure_collection(
        &self,
        version_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Collection, AppError> {
        let mut state = self.state()?;
        if let Some(existing) = state
            .collections
            .iter()
            .find(|c| c.dataset_version_id == version_id && c.name == name)
        {
            return Ok(existing.clone());
        }
        Ok(state.new_collection(version_id, name, now))
    }

    async fn active_counts(&self, version_id: Uuid) -> Result<HashMap<String, u64>, AppError> {
        let state = self.state()?;
        Ok(state
            .collections
            .iter()
            .filter(|c| c.dataset_version_id == version_id)
            .map(|c| {
                let active = state
                    .documents
                    .iter()
                    .filter(|d| d.collection_id == c.id && d.is_active())
                    .count() as u64;
                (c.name.clone(), active)
            })
            .collect())
    }

    async fn copy_collection(
        &self,
        source: &Collection,
        target_version_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Collection, AppError> {
        let mut state = self.state()?;
        let target = match state
            .collections
            .iter()
            .find(|c| c.dataset_version_id == target_version_id && c.name == source.name)
            .cloned()
        {
            Some(existing) => {
                state.documents.retain(|d| d.collection_id != existing.id);
                existing
            }
            None => state.new_collection(target_version_id, &source.name, now),
        };
        state.copy_documents(source.id, &target, now);
        Ok(target)
    }

    async fn set_current(&self, dataset_id: Uuid, version_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state()?;
        if !state
            .versions
            .iter()
            .any(|v| v.id == version_id && v.dataset_id == dataset_id)
        {
            return Err(AppError::VersionNotFound(version_id.to_string()));
        }
        for version in state.versions.iter_mut().filter(|v| v.dataset_id == dataset_id) {
            version.is_current = version.id == version_id;
        }
        Ok(())
    }

    async fn delete_version(&self, version_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state()?;
        let removed: HashSet<Uuid> = state
            .documents
            .iter()
            .filter(|d| d.dataset_version_id == Some(version_id))
            .map(|d| d.id)
            .collect();
        state.results.retain(|r| !removed.contains(&r.document_id));
        state.documents.retain(|d| d.dataset_version_id != Some(version_id));
        state.collections.retain(|c| c.dataset_version_id != version_id);
        state.indices.retain(|i| i.dataset_version_id != version_id);
        state.versions.retain(|v| v.id != version_id);
        Ok(())
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn indices(&self, version_id: Uuid) -> Result<Vec<SearchIndex>, AppError> {
        Ok(self
            .state()?
            .indices
            .iter()
            .filter(|i| i.dataset_version_id == version_id)
            .cloned()
            .collect())
    }

    async fn current_indices(&self) -> Result<Vec<SearchIndex>, AppError> {
        let state = self.state()?;
        Ok(state
            .indices
            .iter()
            .filter(|i| {
                state
                    .versions
                    .iter()
                    .any(|v| v.id == i.dataset_version_id && v.is_current)
            })
            .cloned()
            .collect())
    }

    async fn get_or_create_index(
        &self,
        version_id: Uuid,
        language: &str,
        remote_name: &str,
        configuration: &Value,
        now: DateTime<Utc>,
    ) -> Result<SearchIndex, AppError> {
        let mut state = self.state()?;
        if let Some(existing) = state
            .indices
            .iter()
            .find(|i| i.dataset_version_id == version_id && i.language == language)
        {
            return Ok(existing.clone());
        }
        let index = SearchIndex {
            id: Uuid::new_v4(),
            dataset_version_id: version_id,
            language: language.to_string(),
            remote_name: remote_name.to_string(),
            configuration: configuration.clone(),
            error_count: 0,
            push_errors: Vec::new(),
            pushed_at: None,
            is_syncing: false,
            sync_started_at: None,
            created_at: now,
        };
        state.indices.push(index.clone());
        Ok(index)
    }

    async fn save_index(&self, index: &SearchIndex) -> Result<(), AppError> {
        let mut state = self.state()?;
        let stored = state
            .indices
            .iter_mut()
            .find(|i| i.id == index.id)
            .ok_or_else(|| AppError::InvalidState(format!("unknown index {}", index.id)))?;
        stored.configuration = index.configuration.clone();
        stored.error_count = index.error_count;
        stored.push_errors = index.push_errors.clone();
        stored.pushed_at = index.pushed_at;
        Ok(())
    }

    async fn try_lock_index(
        &self,
        index_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, AppError> {
        let mut state = self.state()?;
        match state.indices.iter_mut().find(|i| i.id == index_id) {
            Some(index) if !sync_held(index.is_syncing, index.sync_started_at, now, lease) => {
                index.is_syncing = true;
                index.sync_started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock_index(&self, index_id: Uuid) -> Result<(), AppError> {
        let mut state = self.state()?;
        if let Some(index) = state.indices.iter_mut().find(|i| i.id == index_id) {
            index.is_syncing = false;
            index.sync_started_at = None;
        }
        Ok(())
    }
}
