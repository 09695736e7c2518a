//! Gleaner Core - Domain types, components and orchestration.
//!
//! The components depend on the store traits in [`traits`] and on the
//! remote collaborators (connectors, resource service, search engine)
//! only through traits, so they run the same against PostgreSQL and the
//! in-memory store.

pub mod config;
pub mod enrichment;
pub mod error;
pub mod extract;
pub mod harvest;
pub mod index;
pub mod memory;
pub mod models;
pub mod notify;
pub mod seeds;
pub mod service;
pub mod sync;
pub mod traits;
pub mod versions;

#[cfg(test)]
mod testing;

pub use config::{
    default_config_path, load_config, DatasetEntry, DbConfig, EnrichmentConfig, GleanerConfig,
    HttpConfig, IndexConfig, NormalizerConfig, SyncConfig, VersionConfig,
};
pub use enrichment::{EnrichmentProcessor, PhaseDescriptor, PhaseReport};
pub use error::AppError;
pub use harvest::{HarvestTracker, PreparedCycle, PreparedHarvest};
pub use index::{IndexPublisher, ResyncReport};
pub use memory::MemoryStore;
pub use models::{
    Collection, Dataset, DatasetStatus, DatasetVersion, DeletePolicy, Document, Harvest,
    HarvestStage, NewSource, Pipeline, PipelinePhase, ResourceRef, SearchIndex, Seed, SeedFile,
    SeedState, Source, SourceHarvest,
};
pub use notify::{Notifier, TracingNotifier};
pub use seeds::SeedNormalizer;
pub use service::{Collaborators, CycleOptions, HarvestService};
pub use sync::{
    needs_reprocessing, CycleSummary, ReprocessingDecision, SourceHarvestResult, SyncOutcome,
    SyncStats,
};
pub use traits::{
    AliasAction, BulkAction, BulkItemResult, CallOutcome, Connector, ConnectorRegistry,
    DocumentStore, HarvestStore, IndexStore, ResourceFetcher, ResourceRequest, SearchEngine,
    VersionStore,
};
pub use versions::{Evaluation, Promotion, VersionManager};
