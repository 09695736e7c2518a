//! Domain models shared by every Gleaner component.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

/// The watermark of a harvest that has never synced.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Whether a sync flag raised at `started_at` still blocks other workers.
///
/// A flag without a start time, or one older than `lease`, was left behind
/// by a worker that never finished and may be taken over.
pub fn sync_held(
    is_syncing: bool,
    started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lease: Duration,
) -> bool {
    is_syncing && started_at.is_some_and(|at| at > stale_before(now, lease))
}

/// Sync flags raised before this moment have expired.
pub fn stale_before(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The moment a harvest attached or reset at `now` becomes due for a purge.
pub fn purge_deadline(interval_days: Option<i64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    interval_days
        .and_then(Duration::try_days)
        .and_then(|interval| now.checked_add_signed(interval))
}

// =============================================================================
// Datasets, sources and harvests
// =============================================================================

/// A named set of sources that is versioned and published as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// How an upstream feed reports deleted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// The source never reports deletes; only a full re-fetch reveals them.
    #[default]
    No,
    /// Deletes are reported and remembered forever.
    Persistent,
    /// Deletes are reported for a while and then forgotten.
    Transient,
}

impl DeletePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletePolicy::No => "no",
            DeletePolicy::Persistent => "persistent",
            DeletePolicy::Transient => "transient",
        }
    }
}

impl FromStr for DeletePolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" => Ok(DeletePolicy::No),
            "persistent" => Ok(DeletePolicy::Persistent),
            "transient" => Ok(DeletePolicy::Transient),
            other => Err(AppError::InvalidState(format!("delete policy '{}'", other))),
        }
    }
}

/// A named upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    /// Connector type, e.g. `ckan`.
    pub connector: String,
    pub endpoint: String,
    pub set_specification: String,
    pub delete_policy: DeletePolicy,
    /// Days after which a harvest of this source is purged and re-fetched.
    pub purge_interval_days: Option<i64>,
    /// Keep active seeds without a url (materials that only group children).
    pub allow_empty_url: bool,
    pub created_at: DateTime<Utc>,
}

impl Source {
    /// `None` without an interval or when the day count is out of range.
    pub fn purge_interval(&self) -> Option<Duration> {
        self.purge_interval_days.and_then(Duration::try_days)
    }

    pub fn purge_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        purge_deadline(self.purge_interval_days, now)
    }
}

/// Input for registering or updating a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    pub connector: String,
    pub endpoint: String,
    pub set_specification: String,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
    #[serde(default)]
    pub purge_interval_days: Option<i64>,
    #[serde(default)]
    pub allow_empty_url: bool,
}

/// Progress of one source within one dataset.
///
/// Stages only move forward, one step at a time; a reset is the only way
/// back to [`HarvestStage::New`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HarvestStage {
    #[default]
    New,
    Basic,
    Video,
    Preview,
    Complete,
}

impl HarvestStage {
    pub const ALL: [HarvestStage; 5] = [
        HarvestStage::New,
        HarvestStage::Basic,
        HarvestStage::Video,
        HarvestStage::Preview,
        HarvestStage::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestStage::New => "new",
            HarvestStage::Basic => "basic",
            HarvestStage::Video => "video",
            HarvestStage::Preview => "preview",
            HarvestStage::Complete => "complete",
        }
    }

    /// The stage that follows this one, or `None` for `Complete`.
    pub fn next(&self) -> Option<HarvestStage> {
        match self {
            HarvestStage::New => Some(HarvestStage::Basic),
            HarvestStage::Basic => Some(HarvestStage::Video),
            HarvestStage::Video => Some(HarvestStage::Preview),
            HarvestStage::Preview => Some(HarvestStage::Complete),
            HarvestStage::Complete => None,
        }
    }
}

impl fmt::Display for HarvestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarvestStage {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HarvestStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| AppError::InvalidState(format!("harvest stage '{}'", s)))
    }
}

/// The join of a source and a dataset, tracking ingestion progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Harvest {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub source_id: Uuid,
    pub stage: HarvestStage,
    /// High-water mark of the last successfully ingested update.
    pub latest_update_at: DateTime<Utc>,
    /// Last successful fetch.
    pub harvested_at: Option<DateTime<Utc>>,
    /// Moment after which the next prepare purges this harvest.
    pub purge_after: Option<DateTime<Utc>>,
    pub is_syncing: bool,
    /// When the current fetch raised `is_syncing`.
    #[serde(default)]
    pub sync_started_at: Option<DateTime<Utc>>,
}

impl Harvest {
    /// A harvest as created when a source is attached to a dataset.
    pub fn attached(dataset_id: Uuid, source_id: Uuid, purge_after: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            source_id,
            stage: HarvestStage::New,
            latest_update_at: epoch(),
            harvested_at: None,
            purge_after,
            is_syncing: false,
            sync_started_at: None,
        }
    }
}

/// A harvest together with the source it tracks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHarvest {
    pub harvest: Harvest,
    pub source: Source,
}

// =============================================================================
// Seeds
// =============================================================================

/// Lifecycle state of an upstream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedState {
    #[default]
    Active,
    Inactive,
    Deleted,
    Skipped,
}

impl SeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedState::Active => "active",
            SeedState::Inactive => "inactive",
            SeedState::Deleted => "deleted",
            SeedState::Skipped => "skipped",
        }
    }

    /// Rank on the exclusion scale; demotion may only increase it.
    pub(crate) fn exclusion_rank(&self) -> u8 {
        match self {
            SeedState::Active => 0,
            SeedState::Inactive => 1,
            SeedState::Skipped => 2,
            SeedState::Deleted => 3,
        }
    }
}

impl fmt::Display for SeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeedState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SeedState::Active),
            "inactive" => Ok(SeedState::Inactive),
            "deleted" => Ok(SeedState::Deleted),
            "skipped" => Ok(SeedState::Skipped),
            other => Err(AppError::InvalidState(format!("seed state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeedFile {
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Normalized language of a record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Language {
    pub metadata: Option<String>,
}

/// Canonical representation of one upstream record.
///
/// Every field serializes, so absent optional data shows up as `null` or an
/// empty list rather than a missing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub external_id: String,
    pub state: SeedState,
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub files: Vec<SeedFile>,
    pub authors: Vec<String>,
    pub publishers: Vec<String>,
    pub copyright: Option<String>,
    /// Ordinal of the lowest educational level; -1 is unknown.
    pub lowest_educational_level: i32,
    pub language: Language,
    pub technical_type: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    /// Connector-specific fields.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Default for Seed {
    fn default() -> Self {
        Self {
            external_id: String::new(),
            state: SeedState::Active,
            url: None,
            title: None,
            description: None,
            files: Vec::new(),
            authors: Vec::new(),
            publishers: Vec::new(),
            copyright: None,
            lowest_educational_level: -1,
            language: Language::default(),
            technical_type: None,
            modified_at: None,
            metadata: Map::new(),
        }
    }
}

impl Seed {
    pub fn new(external_id: impl Into<String>, state: SeedState) -> Self {
        Self {
            external_id: external_id.into(),
            state,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SeedState::Active
    }

    /// The seed as a JSON object, used as the document's base properties.
    pub fn to_properties(&self) -> Result<Map<String, Value>, AppError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(AppError::Generic("seed did not serialize to an object".to_string())),
        }
    }

    /// SHA-256 over the canonical JSON form of the seed.
    pub fn content_hash(&self) -> Result<String, AppError> {
        let bytes = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

// =============================================================================
// Pipeline ledger
// =============================================================================

/// Enrichment phases known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Text extraction from the document's main resource.
    Extraction,
    /// Video metadata (duration, embed url).
    Video,
    /// Preview images.
    Preview,
}

impl PipelinePhase {
    pub const ALL: [PipelinePhase; 3] = [
        PipelinePhase::Extraction,
        PipelinePhase::Video,
        PipelinePhase::Preview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Extraction => "extraction",
            PipelinePhase::Video => "video",
            PipelinePhase::Preview => "preview",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelinePhase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelinePhase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| AppError::InvalidState(format!("pipeline phase '{}'", s)))
    }
}

/// Reference to a result or error held by an external resource service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub success: bool,
    pub resource: Option<ResourceRef>,
    pub processed_at: DateTime<Utc>,
}

/// Per-document record of which enrichment phases ran and how they ended.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline(BTreeMap<PipelinePhase, PhaseRecord>);

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, phase: PipelinePhase) -> Option<&PhaseRecord> {
        self.0.get(&phase)
    }

    pub fn record(&mut self, phase: PipelinePhase, record: PhaseRecord) {
        self.0.insert(phase, record);
    }

    pub fn succeeded(&self, phase: PipelinePhase) -> bool {
        self.0.get(&phase).is_some_and(|r| r.success)
    }

    pub fn failed(&self, phase: PipelinePhase) -> bool {
        self.0.get(&phase).is_some_and(|r| !r.success)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PipelinePhase, &PhaseRecord)> {
        self.0.iter()
    }
}

// =============================================================================
// Documents, versions and collections
// =============================================================================

/// The durable, index-bound form of a record inside one dataset version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub dataset_version_id: Option<Uuid>,
    pub collection_id: Uuid,
    pub external_id: String,
    pub state: SeedState,
    pub properties: Map<String, Value>,
    pub pipeline: Pipeline,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn is_active(&self) -> bool {
        self.state == SeedState::Active && self.deleted_at.is_none()
    }

    /// Looks up a dotted property path such as `language.metadata`.
    pub fn property(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.properties.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Normalized language code, if the document has one.
    pub fn language(&self) -> Option<&str> {
        self.property("language.metadata").and_then(Value::as_str)
    }
}

/// A reconciled seed ready to be written into a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUpsert {
    pub external_id: String,
    pub state: SeedState,
    pub properties: Map<String, Value>,
    pub content_hash: String,
    /// Clear the pipeline ledger because the content changed.
    pub reset_pipeline: bool,
}

/// One merge write: a pipeline stamp plus the derived properties.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPatch {
    pub document_id: Uuid,
    pub phase: PipelinePhase,
    pub record: PhaseRecord,
    /// Property receiving `values`; `None` merges them at the top level.
    pub target_property: Option<String>,
    pub values: Map<String, Value>,
}

/// An immutable content snapshot of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatasetVersion {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub version: String,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

/// Documents of one source specification within a dataset version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Collection {
    pub id: Uuid,
    pub dataset_version_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Enrichment bookkeeping
// =============================================================================

/// A unit of enrichment work over a fixed set of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub phase: PipelinePhase,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of one resource call for one document in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub document_id: Uuid,
    pub success: bool,
    pub result: Option<ResourceRef>,
    pub error: Option<ResourceRef>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Search indices
// =============================================================================

/// A bulk item the search engine did not accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushError {
    pub document_id: String,
    pub status: u16,
    pub reason: String,
}

/// One remote index per dataset version and language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIndex {
    pub id: Uuid,
    pub dataset_version_id: Uuid,
    pub language: String,
    pub remote_name: String,
    pub configuration: Value,
    pub error_count: u64,
    pub push_errors: Vec<PushError>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub is_syncing: bool,
    #[serde(default)]
    pub sync_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Counts shown by the status command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatasetStatus {
    pub dataset: Option<Dataset>,
    pub harvests: Vec<SourceHarvest>,
    pub versions: Vec<DatasetVersion>,
    pub indices: Vec<SearchIndex>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_harvest_stage_order() {
        let mut stage = HarvestStage::New;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, HarvestStage::ALL.to_vec());
    }

    #[test]
    fn test_harvest_stage_parse() {
        assert_eq!("video".parse::<HarvestStage>().unwrap(), HarvestStage::Video);
        assert!("unknown".parse::<HarvestStage>().is_err());
    }

    #[test]
    fn test_seed_serializes_every_key() {
        let seed = Seed::new("abc", SeedState::Active);
        let props = seed.to_properties().unwrap();
        for key in [
            "external_id",
            "state",
            "url",
            "files",
            "authors",
            "copyright",
            "lowest_educational_level",
            "language",
        ] {
            assert!(props.contains_key(key), "missing {}", key);
        }
        assert_eq!(props["lowest_educational_level"], json!(-1));
        assert_eq!(props["language"], json!({"metadata": null}));
    }

    #[test]
    fn test_seed_metadata_is_flattened() {
        let mut seed = Seed::new("abc", SeedState::Active);
        seed.metadata.insert("aggregation_level".to_string(), json!(2));
        let props = seed.to_properties().unwrap();
        assert_eq!(props["aggregation_level"], json!(2));
    }

    #[test]
    fn test_content_hash_tracks_state() {
        let active = Seed::new("abc", SeedState::Active);
        let deleted = Seed::new("abc", SeedState::Deleted);
        assert_eq!(active.content_hash().unwrap().len(), 64);
        assert_eq!(active.content_hash().unwrap(), active.clone().content_hash().unwrap());
        assert_ne!(active.content_hash().unwrap(), deleted.content_hash().unwrap());
    }

    #[test]
    fn test_pipeline_round_trips_as_map() {
        let mut pipeline = Pipeline::new();
        pipeline.record(
            PipelinePhase::Extraction,
            PhaseRecord {
                success: true,
                resource: Some(ResourceRef::new("extract", "42")),
                processed_at: epoch(),
            },
        );
        let value = serde_json::to_value(&pipeline).unwrap();
        assert!(value["extraction"]["success"].as_bool().unwrap());
        let back: Pipeline = serde_json::from_value(value).unwrap();
        assert!(back.succeeded(PipelinePhase::Extraction));
        assert!(!back.failed(PipelinePhase::Extraction));
        assert!(back.get(PipelinePhase::Video).is_none());
    }

    #[test]
    fn test_document_property_path() {
        let doc = Document {
            id: Uuid::new_v4(),
            dataset_version_id: None,
            collection_id: Uuid::new_v4(),
            external_id: "abc".to_string(),
            state: SeedState::Active,
            properties: json!({
                "language": {"metadata": "nl"},
                "files": [{"url": "https://example.com/a.pdf"}]
            })
            .as_object()
            .cloned()
            .unwrap(),
            pipeline: Pipeline::new(),
            content_hash: String::new(),
            created_at: epoch(),
            modified_at: epoch(),
            deleted_at: None,
        };
        assert_eq!(doc.language(), Some("nl"));
        assert_eq!(
            doc.property("files.0.url"),
            Some(&json!("https://example.com/a.pdf"))
        );
        assert!(doc.property("files.1.url").is_none());
        assert!(doc.is_active());
    }

    #[test]
    fn test_epoch_is_unix_zero() {
        assert_eq!(epoch().timestamp(), 0);
    }

    #[test]
    fn test_sync_flag_expires_after_lease() {
        let now = Utc::now();
        let lease = Duration::minutes(10);
        assert!(sync_held(true, Some(now - Duration::minutes(1)), now, lease));
        assert!(!sync_held(true, Some(now - Duration::minutes(11)), now, lease));
        assert!(!sync_held(true, None, now, lease));
        assert!(!sync_held(false, Some(now), now, lease));
        // an unbounded lease never expires
        assert!(sync_held(true, Some(epoch()), now, Duration::MAX));
    }

    #[test]
    fn test_purge_deadline_rejects_out_of_range_intervals() {
        let now = Utc::now();
        assert_eq!(purge_deadline(Some(7), now), Some(now + Duration::days(7)));
        assert_eq!(purge_deadline(None, now), None);
        assert_eq!(purge_deadline(Some(i64::MAX), now), None);
        assert_eq!(purge_deadline(Some(i64::MAX / 86_400 / 1_000), now), None);
    }
}
