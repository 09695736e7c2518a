//! Index publisher.
//!
//! Mirrors the documents of a dataset version into one search index per
//! language and moves the `latest-<language>` aliases onto them.
//!
//! Remote index names are slugs of `<dataset>-<version>-<site>-<language>`,
//! so every index of a site and language matches `*-<site>-<language>` and
//! the alias swap can detach the alias from all of them in one call.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::IndexConfig;
use crate::error::AppError;
use crate::models::{Dataset, DatasetVersion, Document, PushError, SearchIndex};
use crate::traits::{AliasAction, BulkAction, DocumentStore, IndexStore, SearchEngine};

/// Lowercase alphanumerics separated by single dashes.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub fn remote_name(dataset: &str, version: &str, site: &str, language: &str) -> String {
    slugify(&format!("{}-{}-{}-{}", dataset, version, site, language))
}

pub fn latest_alias(language: &str) -> String {
    format!("latest-{}", language)
}

/// Index settings and mappings with a language-specific text analyzer.
pub fn analyzer_configuration(language: &str) -> Value {
    let analyzer = match language {
        "nl" => "dutch",
        "en" => "english",
        "de" => "german",
        "fr" => "french",
        _ => "standard",
    };
    json!({
        "settings": {
            "analysis": {
                "analyzer": {
                    "text_analyzer": {
                        "type": analyzer
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "external_id": { "type": "keyword" },
                "title": { "type": "text", "analyzer": "text_analyzer" },
                "description": { "type": "text", "analyzer": "text_analyzer" },
                "text": { "type": "text", "analyzer": "text_analyzer" },
                "url": { "type": "keyword" },
                "technical_type": { "type": "keyword" },
                "lowest_educational_level": { "type": "integer" },
                "modified_at": { "type": "date" }
            }
        }
    })
}

/// Groups documents by index language.
pub fn partition_by_language(
    config: &IndexConfig,
    documents: Vec<Document>,
) -> BTreeMap<String, Vec<Document>> {
    let mut partitions: BTreeMap<String, Vec<Document>> = BTreeMap::new();
    for document in documents {
        partitions
            .entry(config.index_language(document.language()))
            .or_default()
            .push(document);
    }
    partitions
}

fn document_body(document: &Document) -> Value {
    let mut body = document.properties.clone();
    body.insert(
        "external_id".to_string(),
        Value::String(document.external_id.clone()),
    );
    body.insert("modified_at".to_string(), json!(document.modified_at));
    Value::Object(body)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub synced: usize,
    /// Indices another worker was already syncing.
    pub skipped: usize,
    pub failed: usize,
}

pub struct IndexPublisher<S> {
    store: S,
    engine: Arc<dyn SearchEngine>,
    config: IndexConfig,
}

impl<S> IndexPublisher<S>
where
    S: IndexStore + DocumentStore,
{
    pub fn new(store: S, engine: Arc<dyn SearchEngine>, config: IndexConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The index record for a version and language, created on first use.
    pub async fn index_for(
        &self,
        dataset: &Dataset,
        version: &DatasetVersion,
        language: &str,
    ) -> Result<SearchIndex, AppError> {
        let name = remote_name(&dataset.name, &version.version, &self.config.site, language);
        self.store
            .get_or_create_index(
                version.id,
                language,
                &name,
                &analyzer_configuration(language),
                Utc::now(),
            )
            .await
    }

    /// Pushes documents into the remote index.
    ///
    /// With `recreate`, an existing remote index is dropped and created again
    /// with a fresh configuration and the error accounting starts over.
    /// Rejected items are counted and kept but do not stop the push.
    pub async fn push(
        &self,
        mut index: SearchIndex,
        documents: &[Document],
        recreate: bool,
    ) -> Result<SearchIndex, AppError> {
        let started = Utc::now();
        let exists = self.engine.index_exists(&index.remote_name).await?;

        if recreate && exists {
            self.engine.delete_index(&index.remote_name).await?;
        }
        let incremental = exists && !recreate;
        if !incremental {
            index.configuration = analyzer_configuration(&index.language);
            self.engine
                .create_index(&index.remote_name, &index.configuration)
                .await?;
        }
        if recreate {
            index.error_count = 0;
            index.push_errors.clear();
        }

        let actions: Vec<BulkAction> = documents
            .iter()
            .filter_map(|document| {
                if document.is_active() {
                    Some(BulkAction::Index {
                        id: document.external_id.clone(),
                        body: document_body(document),
                    })
                } else if incremental {
                    Some(BulkAction::Delete {
                        id: document.external_id.clone(),
                    })
                } else {
                    None
                }
            })
            .collect();

        let mut pushed = 0;
        let mut errors = 0;
        for chunk in actions.chunks(self.config.bulk_chunk_size.max(1)) {
            let results = self.engine.bulk(&index.remote_name, chunk).await?;
            let answered = results.len();
            for (action, item) in chunk.iter().zip(results) {
                let ok = (200..300).contains(&item.status) || (action.is_delete() && item.status == 404);
                if ok {
                    pushed += 1;
                    continue;
                }
                errors += 1;
                index.push_errors.push(PushError {
                    document_id: item.id,
                    status: item.status,
                    reason: item.error.unwrap_or_else(|| format!("status {}", item.status)),
                });
            }
            // actions the engine did not answer for were not applied
            for action in chunk.iter().skip(answered) {
                errors += 1;
                index.push_errors.push(PushError {
                    document_id: action.id().to_string(),
                    status: 0,
                    reason: "missing from bulk response".to_string(),
                });
            }
        }

        index.error_count += errors;
        index.pushed_at = Some(started);
        self.store.save_index(&index).await?;

        tracing::info!(
            index = %index.remote_name,
            language = %index.language,
            recreate,
            pushed,
            errors,
            "Pushed documents"
        );
        Ok(index)
    }

    /// Points `latest-<language>` at this index in one alias update.
    pub async fn promote_to_latest(&self, index: &SearchIndex) -> Result<(), AppError> {
        let alias = latest_alias(&index.language);
        let add = AliasAction::Add {
            index: index.remote_name.clone(),
            alias: alias.clone(),
        };
        let swap = [
            AliasAction::Remove {
                index: format!("*-{}-{}", slugify(&self.config.site), index.language),
                alias: alias.clone(),
            },
            add.clone(),
        ];

        match self.engine.update_aliases(&swap).await {
            Ok(()) => {}
            // nothing carried the alias yet
            Err(AppError::IndexNotFound(_)) => self.engine.update_aliases(&[add]).await?,
            Err(e) => return Err(e),
        }
        tracing::info!(alias = %alias, index = %index.remote_name, "Moved alias");
        Ok(())
    }

    /// Pushes every document of a version, one index per language, and moves
    /// the aliases once all pushes are done.
    pub async fn publish_version(
        &self,
        dataset: &Dataset,
        version: &DatasetVersion,
        recreate: bool,
    ) -> Result<Vec<SearchIndex>, AppError> {
        let documents = self.store.version_documents(version.id, None).await?;
        let partitions = partition_by_language(&self.config, documents);

        let mut published = Vec::with_capacity(partitions.len());
        for (language, documents) in &partitions {
            let index = self.index_for(dataset, version, language).await?;
            published.push(self.push(index, documents, recreate).await?);
        }
        for index in &published {
            self.promote_to_latest(index).await?;
        }
        Ok(published)
    }

    /// Re-pushes documents modified since the last push of every index of a
    /// current version. Indices locked by another worker are skipped unless
    /// the lock outlived its lease.
    pub async fn resync(&self) -> Result<ResyncReport, AppError> {
        let mut report = ResyncReport::default();
        let lease = self.config.lock_lease();

        for index in self.store.current_indices().await? {
            if !self
                .store
                .try_lock_index(index.id, Utc::now(), lease)
                .await?
            {
                tracing::debug!(index = %index.remote_name, "Index already syncing");
                report.skipped += 1;
                continue;
            }

            let name = index.remote_name.clone();
            let result = self.resync_index(index.clone(), index.pushed_at).await;
            self.store.unlock_index(index.id).await?;

            match result {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    tracing::warn!(index = %name, error = %e, "Resync failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn resync_index(
        &self,
        index: SearchIndex,
        since: Option<DateTime<Utc>>,
    ) -> Result<SearchIndex, AppError> {
        let language = index.language.clone();
        let documents: Vec<Document> = self
            .store
            .version_documents(index.dataset_version_id, since)
            .await?
            .into_iter()
            .filter(|d| self.config.index_language(d.language()) == language)
            .collect();
        if documents.is_empty() {
            return Ok(index);
        }
        self.push(index, &documents, false).await
    }
}
