//! Enrichment batch processor.
//!
//! Runs one pipeline phase over a set of documents:
//!
//! 1. **Filter** - only documents whose prerequisite phase succeeded and that
//!    have not run this phase yet (or failed it before) take part.
//! 2. **Process** - documents are chunked into batches; each batch is
//!    persisted as a [`Batch`] and every resource call outcome as a
//!    [`ProcessResult`] row. Calls run under a soft per-attempt budget with
//!    bounded retries, inside a hard per-document budget.
//! 3. **Merge** - successful results are retrieved, passed through the
//!    phase extractor and written into the documents together with the
//!    pipeline stamp. The write locks exactly the affected rows; on
//!    contention the whole merge is recomputed and retried.
//!
//! One failing document never fails its batch. A batch in which every call
//! failed at transport level means the backend is down, and the phase stops
//! with [`AppError::ResourceUnavailable`].
//!
//! Batches run one after another, or as bounded concurrent tasks that are
//! joined before [`EnrichmentProcessor::run`] returns.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EnrichmentConfig;
use crate::error::AppError;
use crate::extract::extract;
use crate::models::{
    Batch, Document, DocumentPatch, PhaseRecord, PipelinePhase, ProcessResult, ResourceRef,
};
use crate::traits::{CallOutcome, DocumentStore, ResourceFetcher, ResourceRequest};

/// How to build the resource call for a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCall {
    pub kind: String,
    /// Property paths passed as positional arguments.
    pub args: Vec<String>,
    /// Keyword argument name to property path.
    pub kwargs: Vec<(String, String)>,
}

impl ResourceCall {
    pub fn new(kind: &str, args: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            kwargs: Vec::new(),
        }
    }

    /// `None` when a positional argument is missing or null.
    pub fn request_for(&self, document: &Document) -> Option<ResourceRequest> {
        let args = self
            .args
            .iter()
            .map(|path| document.property(path).filter(|v| !v.is_null()).cloned())
            .collect::<Option<Vec<Value>>>()?;
        let kwargs: Map<String, Value> = self
            .kwargs
            .iter()
            .map(|(name, path)| {
                (
                    name.clone(),
                    document.property(path).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();
        Some(ResourceRequest {
            kind: self.kind.clone(),
            args,
            kwargs,
        })
    }
}

/// Where merged values go and which fields the phase guarantees.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSpec {
    /// `None` merges the fields at the top level of `properties`.
    pub target_property: Option<String>,
    pub fields: Vec<String>,
}

/// Restricts a phase to documents whose property equals a value.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyFilter {
    pub path: String,
    pub equals: Value,
}

impl PropertyFilter {
    pub fn matches(&self, document: &Document) -> bool {
        document.property(&self.path) == Some(&self.equals)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDescriptor {
    pub phase: PipelinePhase,
    pub depends_on: Option<PipelinePhase>,
    pub batch_size: usize,
    pub call: ResourceCall,
    pub merge: MergeSpec,
    pub filter: Option<PropertyFilter>,
}

impl PhaseDescriptor {
    /// Text extraction from the document url, merged as top-level `text`.
    pub fn extraction(batch_size: usize) -> Self {
        Self {
            phase: PipelinePhase::Extraction,
            depends_on: None,
            batch_size,
            call: ResourceCall::new("extract", &["url"]),
            merge: MergeSpec {
                target_property: None,
                fields: vec!["text".to_string()],
            },
            filter: None,
        }
    }

    /// Video metadata for documents of technical type `video`.
    pub fn video(batch_size: usize) -> Self {
        Self {
            phase: PipelinePhase::Video,
            depends_on: Some(PipelinePhase::Extraction),
            batch_size,
            call: ResourceCall::new("video", &["url"]),
            merge: MergeSpec {
                target_property: Some("video".to_string()),
                fields: vec!["duration".to_string(), "embed_url".to_string()],
            },
            filter: Some(PropertyFilter {
                path: "technical_type".to_string(),
                equals: Value::String("video".to_string()),
            }),
        }
    }

    /// Preview images, merged into `previews`.
    pub fn preview(batch_size: usize) -> Self {
        Self {
            phase: PipelinePhase::Preview,
            depends_on: Some(PipelinePhase::Extraction),
            batch_size,
            call: ResourceCall::new("preview", &["url"]),
            merge: MergeSpec {
                target_property: Some("previews".to_string()),
                fields: vec![
                    "full_size".to_string(),
                    "preview".to_string(),
                    "preview_small".to_string(),
                ],
            },
            filter: None,
        }
    }

    pub fn for_phase(phase: PipelinePhase, batch_size: usize) -> Self {
        match phase {
            PipelinePhase::Extraction => Self::extraction(batch_size),
            PipelinePhase::Video => Self::video(batch_size),
            PipelinePhase::Preview => Self::preview(batch_size),
        }
    }

    /// Whether the document takes part in this phase.
    ///
    /// A phase that succeeded is never rerun; a phase that failed always is.
    pub fn is_eligible(&self, document: &Document) -> bool {
        if !document.is_active() {
            return false;
        }
        match document.pipeline.get(self.phase) {
            Some(record) => !record.success,
            None => {
                self.depends_on
                    .is_none_or(|dependency| document.pipeline.succeeded(dependency))
                    && self.filter.as_ref().is_none_or(|f| f.matches(document))
            }
        }
    }
}

/// Counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

/// Counts for one phase run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: PipelinePhase,
    pub eligible: usize,
    pub batches: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The run stopped dispatching batches because of cancellation.
    pub cancelled: bool,
}

impl PhaseReport {
    fn new(phase: PipelinePhase, eligible: usize) -> Self {
        Self {
            phase,
            eligible,
            batches: 0,
            succeeded: 0,
            failed: 0,
            cancelled: false,
        }
    }

    fn add(&mut self, outcome: BatchOutcome) {
        self.batches += 1;
        self.succeeded += outcome.succeeded;
        self.failed += outcome.failed;
    }
}

pub struct EnrichmentProcessor<S> {
    store: S,
    fetcher: Arc<dyn ResourceFetcher>,
    config: EnrichmentConfig,
}

impl<S: Clone> Clone for EnrichmentProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            fetcher: self.fetcher.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S> EnrichmentProcessor<S>
where
    S: DocumentStore + Clone + 'static,
{
    pub fn new(store: S, fetcher: Arc<dyn ResourceFetcher>, config: EnrichmentConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    /// Descriptor for a phase with the configured batch size.
    pub fn descriptor(&self, phase: PipelinePhase) -> PhaseDescriptor {
        PhaseDescriptor::for_phase(phase, self.config.batch_size)
    }

    /// Runs a phase over the documents of one collection.
    pub async fn run_collection(
        &self,
        collection_id: Uuid,
        descriptor: &PhaseDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PhaseReport, AppError> {
        let documents = self.store.collection_documents(collection_id).await?;
        self.run(documents, descriptor, cancel).await
    }

    /// Runs a phase over a document set.
    pub async fn run(
        &self,
        documents: Vec<Document>,
        descriptor: &PhaseDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PhaseReport, AppError> {
        let eligible: Vec<Document> = documents
            .into_iter()
            .filter(|d| descriptor.is_eligible(d))
            .collect();
        let batches: Vec<Vec<Document>> = eligible
            .chunks(descriptor.batch_size.max(1))
            .map(<[Document]>::to_vec)
            .collect();
        let mut report = PhaseReport::new(descriptor.phase, eligible.len());

        if self.config.asynchronous {
            self.run_concurrent(batches, descriptor, cancel, &mut report)
                .await?;
        } else {
            for batch in batches {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                report.add(self.process_batch(batch, descriptor).await?);
            }
        }

        tracing::info!(
            phase = %descriptor.phase,
            eligible = report.eligible,
            batches = report.batches,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            "Enrichment phase finished"
        );
        Ok(report)
    }

    async fn run_concurrent(
        &self,
        batches: Vec<Vec<Document>>,
        descriptor: &PhaseDescriptor,
        cancel: &CancellationToken,
        report: &mut PhaseReport,
    ) -> Result<(), AppError> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for batch in batches {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Generic(e.to_string()))?;
            let processor = self.clone();
            let descriptor = descriptor.clone();
            tasks.spawn(async move {
                let _permit = permit;
                processor.process_batch(batch, &descriptor).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.add(outcome),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(AppError::Generic(format!(
                        "enrichment task failed: {}",
                        e
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Processes and merges one batch.
    pub async fn process_batch(
        &self,
        documents: Vec<Document>,
        descriptor: &PhaseDescriptor,
    ) -> Result<BatchOutcome, AppError> {
        let phase = descriptor.phase;
        let batch = self.store.create_batch(phase, Utc::now()).await?;
        let mut rows = Vec::with_capacity(documents.len());
        let mut transport_failures = 0;

        for document in &documents {
            let attempt = match descriptor.call.request_for(document) {
                Some(request) => self.call_with_budget(&request).await,
                None => Err(AppError::InvalidState(format!(
                    "document {} has no input for {}",
                    document.external_id, phase
                ))),
            };

            match attempt {
                Ok(outcome) if outcome.is_success() => {
                    rows.extend(outcome.successes.into_iter().map(|resource| {
                        result_row(&batch, document.id, true, Some(resource), None)
                    }));
                }
                Ok(CallOutcome { failures, .. }) => {
                    tracing::debug!(
                        phase = %phase,
                        document = %document.external_id,
                        failures = failures.len(),
                        "Resource call reported failure"
                    );
                    rows.push(result_row(
                        &batch,
                        document.id,
                        false,
                        None,
                        failures.into_iter().next(),
                    ));
                }
                Err(e) => {
                    if e.is_transport() {
                        transport_failures += 1;
                    }
                    tracing::debug!(
                        phase = %phase,
                        document = %document.external_id,
                        error = %e,
                        "Resource call failed"
                    );
                    rows.push(result_row(&batch, document.id, false, None, None));
                }
            }
        }

        self.store.record_results(&rows).await?;

        if !documents.is_empty() && transport_failures == documents.len() {
            self.store.finish_batch(batch.id, Utc::now()).await?;
            tracing::warn!(
                phase = %phase,
                batch = %batch.id,
                failures = transport_failures,
                "Resource backend unreachable for the whole batch"
            );
            return Err(AppError::ResourceUnavailable {
                phase: phase.to_string(),
                failures: transport_failures,
            });
        }

        let outcome = self.merge(&batch, descriptor).await?;
        self.store.finish_batch(batch.id, Utc::now()).await?;
        Ok(outcome)
    }

    async fn call_with_budget(&self, request: &ResourceRequest) -> Result<CallOutcome, AppError> {
        let hard = self.config.hard_time_limit();
        match tokio::time::timeout(hard, self.call_with_retries(request)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(hard.as_secs())),
        }
    }

    async fn call_with_retries(&self, request: &ResourceRequest) -> Result<CallOutcome, AppError> {
        let soft = self.config.soft_time_limit();
        let mut attempt = 0u32;
        loop {
            let error = match tokio::time::timeout(soft, self.fetcher.call(request)).await {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(e)) => e,
                Err(_) => AppError::Timeout(soft.as_secs()),
            };
            if attempt >= self.config.max_retries || !error.is_retryable() {
                return Err(error);
            }
            let delay = self.config.retry_base_delay() * 2u32.saturating_pow(attempt);
            tracing::debug!(kind = %request.kind, attempt, error = %error, "Retrying resource call");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Writes the batch results into the documents, retrying the whole merge
    /// while the rows are locked by another writer.
    async fn merge(
        &self,
        batch: &Batch,
        descriptor: &PhaseDescriptor,
    ) -> Result<BatchOutcome, AppError> {
        let mut attempt = 0u32;
        loop {
            let (patches, outcome) = self.build_patches(batch.id, descriptor).await?;
            match self.store.apply_merge(&patches, Utc::now()).await {
                Ok(_) => return Ok(outcome),
                Err(AppError::LockContention(rows)) if attempt < self.config.merge_retries => {
                    attempt += 1;
                    tracing::debug!(batch = %batch.id, rows, attempt, "Merge contended, retrying");
                    tokio::time::sleep(self.config.retry_base_delay() * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn build_patches(
        &self,
        batch_id: Uuid,
        descriptor: &PhaseDescriptor,
    ) -> Result<(Vec<DocumentPatch>, BatchOutcome), AppError> {
        let results = self.store.batch_results(batch_id).await?;

        let mut order: Vec<Uuid> = Vec::new();
        let mut grouped: HashMap<Uuid, Vec<ProcessResult>> = HashMap::new();
        for row in results {
            if !grouped.contains_key(&row.document_id) {
                order.push(row.document_id);
            }
            grouped.entry(row.document_id).or_default().push(row);
        }

        let now = Utc::now();
        let mut patches = Vec::with_capacity(order.len());
        let mut outcome = BatchOutcome::default();

        for document_id in order {
            let rows = grouped.remove(&document_id).unwrap_or_default();
            let error = rows.iter().find(|r| !r.success).map(|r| r.error.clone());
            let successes: Vec<ResourceRef> = rows.into_iter().filter_map(|r| r.result).collect();

            let values = match error {
                Some(_) => None,
                None if successes.is_empty() => None,
                None => self.retrieve_all(&successes).await,
            };

            let patch = match values {
                Some(contents) => DocumentPatch {
                    document_id,
                    phase: descriptor.phase,
                    record: PhaseRecord {
                        success: true,
                        resource: successes.first().cloned(),
                        processed_at: now,
                    },
                    target_property: descriptor.merge.target_property.clone(),
                    values: extract(descriptor.phase, &descriptor.merge.fields, &contents),
                },
                None => DocumentPatch {
                    document_id,
                    phase: descriptor.phase,
                    record: PhaseRecord {
                        success: false,
                        resource: error.flatten(),
                        processed_at: now,
                    },
                    target_property: None,
                    values: Map::new(),
                },
            };

            if patch.record.success {
                outcome.succeeded += 1;
            } else {
                outcome.failed += 1;
            }
            patches.push(patch);
        }

        Ok((patches, outcome))
    }

    async fn retrieve_all(&self, resources: &[ResourceRef]) -> Option<Vec<Value>> {
        let mut contents = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.fetcher.retrieve(resource).await {
                Ok(content) => contents.push(content),
                Err(e) => {
                    tracing::warn!(
                        kind = %resource.kind,
                        id = %resource.id,
                        error = %e,
                        "Cannot retrieve resource"
                    );
                    return None;
                }
            }
        }
        Some(contents)
    }
}

fn result_row(
    batch: &Batch,
    document_id: Uuid,
    success: bool,
    result: Option<ResourceRef>,
    error: Option<ResourceRef>,
) -> ProcessResult {
    ProcessResult {
        id: Uuid::new_v4(),
        batch_id: batch.id,
        document_id,
        success,
        result,
        error,
        created_at: Utc::now(),
    }
}
