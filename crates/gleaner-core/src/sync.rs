//! Reconciliation outcomes and harvest cycle statistics.
//!
//! Pure bookkeeping: delta detection for document upserts and the counters
//! reported at the end of a fetch or a harvest cycle.

use serde::Serialize;

use crate::models::HarvestStage;

/// Outcome of reconciling a single seed against the stored documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Content hash matches the stored document - nothing written
    Unchanged,
    /// Content changed - document rewritten and pipeline cleared
    Updated,
    /// First time this external id is seen in the collection
    Created,
    /// Upstream reported the record as deleted
    Deleted,
    /// Seed could not be reconciled
    Failed,
}

/// Statistics for one fetch.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub unchanged: usize,
    pub updated: usize,
    pub created: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Unchanged => self.unchanged += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Deleted => self.deleted += 1,
            SyncOutcome::Failed => self.failed += 1,
        }
    }

    pub fn record_many(&mut self, outcome: SyncOutcome, count: usize) {
        for _ in 0..count {
            self.record(outcome);
        }
    }

    /// Returns the total number of processed seeds.
    pub fn total(&self) -> usize {
        self.successful() + self.failed
    }

    /// Returns the number of successfully reconciled seeds.
    pub fn successful(&self) -> usize {
        self.unchanged + self.updated + self.created + self.deleted
    }

    /// Seeds that resulted in a write.
    pub fn upserted(&self) -> usize {
        self.updated + self.created
    }
}

/// Result of delta detection for a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReprocessingDecision {
    /// Whether the pipeline ledger must be cleared so enrichment runs again
    pub needs_enrichment: bool,
    /// The outcome classification for this seed
    pub outcome: SyncOutcome,
    /// Human-readable reason for the decision
    pub reason: &'static str,
}

/// Determines if a document needs rewriting based on content hash comparison.
///
/// # Arguments
/// * `existing_hash` - Stored content hash for this external id (None if new)
/// * `new_hash` - Content hash computed from the incoming seed
pub fn needs_reprocessing(existing_hash: Option<&str>, new_hash: &str) -> ReprocessingDecision {
    match existing_hash {
        Some(hash) if hash == new_hash => ReprocessingDecision {
            needs_enrichment: false,
            outcome: SyncOutcome::Unchanged,
            reason: "content hash matches",
        },
        Some(_) => ReprocessingDecision {
            needs_enrichment: true,
            outcome: SyncOutcome::Updated,
            reason: "content hash changed",
        },
        None => ReprocessingDecision {
            needs_enrichment: true,
            outcome: SyncOutcome::Created,
            reason: "new document",
        },
    }
}

// =============================================================================
// Harvest cycle results
// =============================================================================

/// Result of running one source through a harvest cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHarvestResult {
    pub source_name: String,
    pub stats: SyncStats,
    /// Stage the harvest reached by the end of the cycle.
    pub stage: HarvestStage,
    /// Error message if a stage failed, None if every stage succeeded.
    pub error: Option<String>,
}

impl SourceHarvestResult {
    pub fn success(name: String, stats: SyncStats, stage: HarvestStage) -> Self {
        Self {
            source_name: name,
            stats,
            stage,
            error: None,
        }
    }

    pub fn failure(name: String, stage: HarvestStage, error: String) -> Self {
        Self {
            source_name: name,
            stats: SyncStats::default(),
            stage,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated results from one harvest cycle of a dataset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub dataset: String,
    pub version: Option<String>,
    pub results: Vec<SourceHarvestResult>,
    /// Collections restored from the promoted version by the evaluation guard.
    pub fallback_collections: Vec<String>,
    pub promoted: bool,
    pub published_indices: usize,
}

impl CycleSummary {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Default::default()
        }
    }

    pub fn add(&mut self, result: SourceHarvestResult) {
        match self
            .results
            .iter_mut()
            .find(|r| r.source_name == result.source_name)
        {
            Some(existing) => {
                // a later stage failure overrides an earlier success
                if result.error.is_some() || existing.error.is_none() {
                    existing.stage = result.stage;
                    existing.error = result.error.or(existing.error.take());
                }
                if result.stats != SyncStats::default() {
                    existing.stats = result.stats;
                }
            }
            None => self.results.push(result),
        }
    }

    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    /// Total seeds processed across all sources.
    pub fn total_seeds(&self) -> usize {
        self.results.iter().map(|r| r.stats.total()).sum()
    }
}
