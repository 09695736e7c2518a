//! PostgreSQL implementation of the Gleaner store traits.
//!
//! Concurrency guarantees come from the database:
//!
//! - stage transitions, sync flags and index locks are guarded `UPDATE`s
//!   whose affected-row count tells the caller whether it won
//! - harvest preparation locks the dataset row for the whole transaction
//! - merges lock exactly the patched rows with `FOR UPDATE NOWAIT` and
//!   report [`AppError::LockContention`] instead of waiting
//! - promotion is one `UPDATE` backed by a deferrable exclusion constraint

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gleaner_core::error::AppError;
use gleaner_core::harvest::{plan_preparation, PreparedHarvest};
use gleaner_core::models::{
    Batch, Collection, Dataset, DatasetVersion, Document, DocumentPatch, DocumentUpsert, Harvest,
    HarvestStage, NewSource, Pipeline, PipelinePhase, ProcessResult, PushError, ResourceRef,
    SearchIndex, SeedState, Source, SourceHarvest, purge_deadline, stale_before,
};
use gleaner_core::traits::{DocumentStore, HarvestStore, IndexStore, VersionStore};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Column lists for SELECT queries. Must remain const literals to ensure SQL
/// safety since format!() bypasses sqlx compile-time validation.
const SOURCE_COLUMNS: &str = "id, name, connector, endpoint, set_specification, delete_policy, purge_interval_days, allow_empty_url, created_at";
const HARVEST_COLUMNS: &str =
    "id, dataset_id, source_id, stage, latest_update_at, harvested_at, purge_after, is_syncing, sync_started_at";
const SOURCE_HARVEST_COLUMNS: &str = "h.id, h.dataset_id, h.source_id, h.stage, h.latest_update_at, h.harvested_at, h.purge_after, h.is_syncing, h.sync_started_at, s.name AS source_name, s.connector, s.endpoint, s.set_specification, s.delete_policy, s.purge_interval_days, s.allow_empty_url, s.created_at AS source_created_at";
const VERSION_COLUMNS: &str = "id, dataset_id, version, is_current, created_at";
const COLLECTION_COLUMNS: &str = "id, dataset_version_id, name, created_at";
const DOCUMENT_COLUMNS: &str = "id, dataset_version_id, collection_id, external_id, state, properties, pipeline, content_hash, created_at, modified_at, deleted_at";
const INDEX_COLUMNS: &str = "id, dataset_version_id, language, remote_name, configuration, error_count, push_errors, pushed_at, is_syncing, sync_started_at, created_at";

/// SQLSTATE raised by `NOWAIT` when a row lock is held elsewhere.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Repository implementing every Gleaner store trait on PostgreSQL.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use gleaner_db::PgRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/gleaner")
///     .await?;
///
/// let repo = PgRepository::new(pool);
/// repo.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PgRepository {
    pool: Pool<Postgres>,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.into()))?;
        tracing::debug!("Database migrations applied");
        Ok(())
    }

    async fn copy_documents<'e, E>(
        executor: E,
        from_collection: Uuid,
        to: &Collection,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (
                id, dataset_version_id, collection_id, external_id, state, properties,
                pipeline, content_hash, created_at, modified_at, deleted_at
            )
            SELECT gen_random_uuid(), $2, $3, external_id, state, properties,
                   pipeline, content_hash, $4, modified_at, deleted_at
            FROM documents
            WHERE collection_id = $1
            "#,
        )
        .bind(from_collection)
        .bind(to.dataset_version_id)
        .bind(to.id)
        .bind(now)
        .execute(executor)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected())
    }
}

/// Whether a database error means a row lock was not available.
pub fn is_lock_not_available(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(LOCK_NOT_AVAILABLE),
        _ => false,
    }
}

#[async_trait]
impl HarvestStore for PgRepository {
    async fn register_dataset(&self, name: &str) -> Result<Dataset, AppError> {
        sqlx::query_as::<_, Dataset>(
            r#"
            INSERT INTO datasets (id, name, is_active, created_at)
            VALUES ($1, $2, TRUE, NOW())
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name, is_active, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn register_source(&self, source: &NewSource) -> Result<Source, AppError> {
        let query = format!(
            r#"
            INSERT INTO sources (
                id, name, connector, endpoint, set_specification, delete_policy,
                purge_interval_days, allow_empty_url, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (name) DO UPDATE SET
                connector = EXCLUDED.connector,
                endpoint = EXCLUDED.endpoint,
                set_specification = EXCLUDED.set_specification,
                delete_policy = EXCLUDED.delete_policy,
                purge_interval_days = EXCLUDED.purge_interval_days,
                allow_empty_url = EXCLUDED.allow_empty_url
            RETURNING {}
            "#,
            SOURCE_COLUMNS
        );
        let row: SourceRow = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(&source.name)
            .bind(&source.connector)
            .bind(&source.endpoint)
            .bind(&source.set_specification)
            .bind(source.delete_policy.as_str())
            .bind(source.purge_interval_days)
            .bind(source.allow_empty_url)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        row.try_into()
    }

    async fn attach_source(
        &self,
        dataset_id: Uuid,
        source_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Harvest, AppError> {
        let (dataset_exists, source_exists, purge_interval_days): (bool, bool, Option<i64>) =
            sqlx::query_as(
                r#"
                SELECT EXISTS (SELECT 1 FROM datasets WHERE id = $1),
                       EXISTS (SELECT 1 FROM sources WHERE id = $2),
                       (SELECT purge_interval_days FROM sources WHERE id = $2)
                "#,
            )
            .bind(dataset_id)
            .bind(source_id)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        if !dataset_exists {
            return Err(AppError::DatasetNotFound(dataset_id.to_string()));
        }
        if !source_exists {
            return Err(AppError::SourceNotFound(source_id.to_string()));
        }

        let fresh = Harvest::attached(
            dataset_id,
            source_id,
            purge_deadline(purge_interval_days, now),
        );
        let query = format!(
            r#"
            INSERT INTO harvests (
                id, dataset_id, source_id, stage, latest_update_at, harvested_at,
                purge_after, is_syncing, sync_started_at
            )
            VALUES ($1, $2, $3, $4, $5, NULL, $6, FALSE, NULL)
            ON CONFLICT (dataset_id, source_id) DO UPDATE SET dataset_id = EXCLUDED.dataset_id
            RETURNING {}
            "#,
            HARVEST_COLUMNS
        );
        let row: HarvestRow = sqlx::query_as(&query)
            .bind(fresh.id)
            .bind(dataset_id)
            .bind(source_id)
            .bind(fresh.stage.as_str())
            .bind(fresh.latest_update_at)
            .bind(fresh.purge_after)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        row.try_into()
    }

    async fn get_dataset(&self, name: &str) -> Result<Option<Dataset>, AppError> {
        sqlx::query_as::<_, Dataset>(
            "SELECT id, name, is_active, created_at FROM datasets WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn harvests(&self, dataset_id: Uuid) -> Result<Vec<SourceHarvest>, AppError> {
        let query = format!(
            r#"
            SELECT {}
            FROM harvests h
            JOIN sources s ON s.id = h.source_id
            WHERE h.dataset_id = $1
            ORDER BY s.name
            "#,
            SOURCE_HARVEST_COLUMNS
        );
        let rows: Vec<SourceHarvestRow> = sqlx::query_as(&query)
            .bind(dataset_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn prepare_harvests(
        &self,
        dataset_id: Uuid,
        reset: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<PreparedHarvest>, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        // the dataset row is the per-dataset lock
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM datasets WHERE id = $1 FOR UPDATE")
                .bind(dataset_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(AppError::DatabaseError)?;
        if locked.is_none() {
            return Err(AppError::DatasetNotFound(dataset_id.to_string()));
        }

        let query = format!(
            r#"
            SELECT {}
            FROM harvests h
            JOIN sources s ON s.id = h.source_id
            WHERE h.dataset_id = $1
            ORDER BY s.name
            "#,
            SOURCE_HARVEST_COLUMNS
        );
        let rows: Vec<SourceHarvestRow> = sqlx::query_as(&query)
            .bind(dataset_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
        let current = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<SourceHarvest>, AppError>>()?;

        let planned = plan_preparation(&current, reset, now);
        for prepared in &planned {
            let harvest = &prepared.harvest;
            sqlx::query(
                r#"
                UPDATE harvests
                SET stage = $2, latest_update_at = $3, harvested_at = $4, purge_after = $5,
                    is_syncing = $6, sync_started_at = $7
                WHERE id = $1
                "#,
            )
            .bind(harvest.id)
            .bind(harvest.stage.as_str())
            .bind(harvest.latest_update_at)
            .bind(harvest.harvested_at)
            .bind(harvest.purge_after)
            .bind(harvest.is_syncing)
            .bind(harvest.sync_started_at)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
        }

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(planned)
    }

    async fn transition_stage(
        &self,
        dataset_id: Uuid,
        from: HarvestStage,
        to: HarvestStage,
    ) -> Result<u64, AppError> {
        let result =
            sqlx::query("UPDATE harvests SET stage = $3 WHERE dataset_id = $1 AND stage = $2")
                .bind(dataset_id)
                .bind(from.as_str())
                .bind(to.as_str())
                .execute(&self.pool)
                .await
                .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected())
    }

    async fn transition_harvest(
        &self,
        harvest_id: Uuid,
        from: HarvestStage,
        to: HarvestStage,
    ) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE harvests SET stage = $3 WHERE id = $1 AND stage = $2")
            .bind(harvest_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() == 1)
    }

    async fn begin_sync(
        &self,
        harvest_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE harvests
            SET is_syncing = TRUE, sync_started_at = $2
            WHERE id = $1
              AND (is_syncing = FALSE OR sync_started_at IS NULL OR sync_started_at <= $3)
            "#,
        )
        .bind(harvest_id)
        .bind(now)
        .bind(stale_before(now, lease))
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_sync(
        &self,
        harvest_id: Uuid,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE harvests
            SET is_syncing = FALSE,
                sync_started_at = NULL,
                latest_update_at = COALESCE($2, latest_update_at),
                harvested_at = COALESCE($2, harvested_at)
            WHERE id = $1
            "#,
        )
        .bind(harvest_id)
        .bind(watermark)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgRepository {
    async fn collection_documents(&self, collection_id: Uuid) -> Result<Vec<Document>, AppError> {
        let query = format!(
            "SELECT {} FROM documents WHERE collection_id = $1 ORDER BY external_id",
            DOCUMENT_COLUMNS
        );
        let rows: Vec<DocumentRow> = sqlx::query_as(&query)
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn version_documents(
        &self,
        version_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Document>, AppError> {
        let query = format!(
            r#"
            SELECT {} FROM documents
            WHERE dataset_version_id = $1
              AND ($2::timestamptz IS NULL OR modified_at > $2)
            ORDER BY external_id
            "#,
            DOCUMENT_COLUMNS
        );
        let rows: Vec<DocumentRow> = sqlx::query_as(&query)
            .bind(version_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn documents_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Document>, AppError> {
        let query = format!("SELECT {} FROM documents WHERE id = ANY($1)", DOCUMENT_COLUMNS);
        let rows: Vec<DocumentRow> = sqlx::query_as(&query)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn content_hashes(
        &self,
        collection_id: Uuid,
    ) -> Result<HashMap<String, String>, AppError> {
        let rows: Vec<HashRow> = sqlx::query_as(
            r#"
            SELECT external_id, content_hash
            FROM documents
            WHERE collection_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.external_id, row.content_hash))
            .collect())
    }

    async fn upsert_documents(
        &self,
        collection_id: Uuid,
        version_id: Uuid,
        documents: &[DocumentUpsert],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        for document in documents {
            sqlx::query(
                r#"
                INSERT INTO documents (
                    id, dataset_version_id, collection_id, external_id, state, properties,
                    pipeline, content_hash, created_at, modified_at, deleted_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb, $7, $8, $8, NULL)
                ON CONFLICT (collection_id, external_id) DO UPDATE SET
                    state = EXCLUDED.state,
                    properties = EXCLUDED.properties,
                    content_hash = EXCLUDED.content_hash,
                    modified_at = EXCLUDED.modified_at,
                    deleted_at = NULL,
                    pipeline = CASE WHEN $9 THEN '{}'::jsonb ELSE documents.pipeline END
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(version_id)
            .bind(collection_id)
            .bind(&document.external_id)
            .bind(document.state.as_str())
            .bind(Json(&document.properties))
            .bind(&document.content_hash)
            .bind(now)
            .bind(document.reset_pipeline)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
        }
        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(documents.len())
    }

    async fn delete_documents(
        &self,
        collection_id: Uuid,
        external_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET state = $3, deleted_at = $4, modified_at = $4
            WHERE collection_id = $1 AND external_id = ANY($2) AND deleted_at IS NULL
            "#,
        )
        .bind(collection_id)
        .bind(external_ids)
        .bind(SeedState::Deleted.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() as usize)
    }

    async fn apply_merge(
        &self,
        patches: &[DocumentPatch],
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut ids: Vec<Uuid> = patches.iter().map(|p| p.document_id).collect();
        ids.sort();
        ids.dedup();

        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        if let Err(e) = sqlx::query("SELECT id FROM documents WHERE id = ANY($1) FOR UPDATE NOWAIT")
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
        {
            return Err(if is_lock_not_available(&e) {
                AppError::LockContention(ids.len())
            } else {
                AppError::DatabaseError(e)
            });
        }

        let mut applied = 0;
        for patch in patches {
            let result = sqlx::query(
                r#"
                UPDATE documents SET
                    properties = CASE
                        WHEN $2::text IS NULL THEN properties || $3
                        WHEN jsonb_typeof(properties -> $2) = 'object'
                            THEN jsonb_set(properties, ARRAY[$2], (properties -> $2) || $3)
                        ELSE jsonb_set(properties, ARRAY[$2], $3)
                    END,
                    pipeline = jsonb_set(pipeline, ARRAY[$4::text], $5),
                    modified_at = $6
                WHERE id = $1
                "#,
            )
            .bind(patch.document_id)
            .bind(patch.target_property.as_deref())
            .bind(Json(&patch.values))
            .bind(patch.phase.as_str())
            .bind(Json(&patch.record))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
            applied += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(applied)
    }

    async fn create_batch(
        &self,
        phase: PipelinePhase,
        now: DateTime<Utc>,
    ) -> Result<Batch, AppError> {
        let row: BatchRow = sqlx::query_as(
            r#"
            INSERT INTO batches (id, phase, created_at, finished_at)
            VALUES ($1, $2, $3, NULL)
            RETURNING id, phase, created_at, finished_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(phase.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        row.try_into()
    }

    async fn record_results(&self, results: &[ProcessResult]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        for result in results {
            sqlx::query(
                r#"
                INSERT INTO process_results (
                    id, batch_id, document_id, success, result, error, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(result.id)
            .bind(result.batch_id)
            .bind(result.document_id)
            .bind(result.success)
            .bind(result.result.as_ref().map(Json))
            .bind(result.error.as_ref().map(Json))
            .bind(result.created_at)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
        }
        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn batch_results(&self, batch_id: Uuid) -> Result<Vec<ProcessResult>, AppError> {
        let rows: Vec<ResultRow> = sqlx::query_as(
            r#"
            SELECT id, batch_id, document_id, success, result, error, created_at
            FROM process_results
            WHERE batch_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn finish_batch(&self, batch_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE batches SET finished_at = $2 WHERE id = $1")
            .bind(batch_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }
}

#[async_trait]
impl VersionStore for PgRepository {
    async fn versions(&self, dataset_id: Uuid) -> Result<Vec<DatasetVersion>, AppError> {
        let query = format!(
            "SELECT {} FROM dataset_versions WHERE dataset_id = $1 ORDER BY created_at",
            VERSION_COLUMNS
        );
        sqlx::query_as::<_, DatasetVersion>(&query)
            .bind(dataset_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn current_version(
        &self,
        dataset_id: Uuid,
    ) -> Result<Option<DatasetVersion>, AppError> {
        let query = format!(
            "SELECT {} FROM dataset_versions WHERE dataset_id = $1 AND is_current",
            VERSION_COLUMNS
        );
        sqlx::query_as::<_, DatasetVersion>(&query)
            .bind(dataset_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn create_version(
        &self,
        dataset_id: Uuid,
        version: &str,
        copy_from: Option<Uuid>,
        exclude: &[String],
        now: DateTime<Utc>,
    ) -> Result<DatasetVersion, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        let query = format!(
            r#"
            INSERT INTO dataset_versions (id, dataset_id, version, is_current, created_at)
            VALUES ($1, $2, $3, FALSE, $4)
            RETURNING {}
            "#,
            VERSION_COLUMNS
        );
        let created: DatasetVersion = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(dataset_id)
            .bind(version)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;

        if let Some(previous) = copy_from {
            let query = format!(
                "SELECT {} FROM collections WHERE dataset_version_id = $1 AND NOT (name = ANY($2))",
                COLLECTION_COLUMNS
            );
            let sources: Vec<Collection> = sqlx::query_as(&query)
                .bind(previous)
                .bind(exclude)
                .fetch_all(&mut *tx)
                .await
                .map_err(AppError::DatabaseError)?;

            for source in sources {
                let copy = Collection {
                    id: Uuid::new_v4(),
                    dataset_version_id: created.id,
                    name: source.name.clone(),
                    created_at: now,
                };
                sqlx::query(
                    "INSERT INTO collections (id, dataset_version_id, name, created_at) VALUES ($1, $2, $3, $4)",
                )
                .bind(copy.id)
                .bind(copy.dataset_version_id)
                .bind(&copy.name)
                .bind(copy.created_at)
                .execute(&mut *tx)
                .await
                .map_err(AppError::DatabaseError)?;
                Self::copy_documents(&mut *tx, source.id, &copy, now).await?;
            }
        }

        tx.commit().await.map_err(AppError::DatabaseError)?;
        Ok(created)
    }

    async fn collections(&self, version_id: Uuid) -> Result<Vec<Collection>, AppError> {
        let query = format!(
            "SELECT {} FROM collections WHERE dataset_version_id = $1 ORDER BY name",
            COLLECTION_COLUMNS
        );
        sqlx::query_as::<_, Collection>(&query)
            .bind(version_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn ensure_collection(
        &self,
        version_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Collection, AppError> {
        let query = format!(
            r#"
            INSERT INTO collections (id, dataset_version_id, name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dataset_version_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING {}
            "#,
            COLLECTION_COLUMNS
        );
        sqlx::query_as::<_, Collection>(&query)
            .bind(Uuid::new_v4())
            .bind(version_id)
            .bind(name)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn active_counts(&self, version_id: Uuid) -> Result<HashMap<String, u64>, AppError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT c.name,
                   COUNT(d.id) FILTER (WHERE d.state = 'active' AND d.deleted_at IS NULL)
            FROM collections c
            LEFT JOIN documents d ON d.collection_id = c.id
            WHERE c.dataset_version_id = $1
            GROUP BY c.name
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|(name, count)| (name, u64::try_from(count).unwrap_or_default()))
            .collect())
    }

    async fn copy_collection(
        &self,
        source: &Collection,
        target_version_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Collection, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        let query = format!(
            r#"
            INSERT INTO collections (id, dataset_version_id, name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dataset_version_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING {}
            "#,
            COLLECTION_COLUMNS
        );
        let target: Collection = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(target_version_id)
            .bind(&source.name)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;

        sqlx::query("DELETE FROM documents WHERE collection_id = $1")
            .bind(target.id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::DatabaseError)?;
        let copied = Self::copy_documents(&mut *tx, source.id, &target, now).await?;

        tx.commit().await.map_err(AppError::DatabaseError)?;
        tracing::debug!(collection = %target.name, copied, "Copied collection");
        Ok(target)
    }

    async fn set_current(&self, dataset_id: Uuid, version_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE dataset_versions
            SET is_current = (id = $2)
            WHERE dataset_id = $1
              AND EXISTS (SELECT 1 FROM dataset_versions WHERE id = $2 AND dataset_id = $1)
            "#,
        )
        .bind(dataset_id)
        .bind(version_id)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(AppError::VersionNotFound(version_id.to_string()));
        }
        Ok(())
    }

    async fn delete_version(&self, version_id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM dataset_versions WHERE id = $1")
            .bind(version_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }
}

#[async_trait]
impl IndexStore for PgRepository {
    async fn indices(&self, version_id: Uuid) -> Result<Vec<SearchIndex>, AppError> {
        let query = format!(
            "SELECT {} FROM search_indices WHERE dataset_version_id = $1 ORDER BY language",
            INDEX_COLUMNS
        );
        let rows: Vec<IndexRow> = sqlx::query_as(&query)
            .bind(version_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn current_indices(&self) -> Result<Vec<SearchIndex>, AppError> {
        let query = format!(
            r#"
            SELECT {} FROM search_indices
            WHERE dataset_version_id IN (SELECT id FROM dataset_versions WHERE is_current)
            ORDER BY remote_name
            "#,
            INDEX_COLUMNS
        );
        let rows: Vec<IndexRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_or_create_index(
        &self,
        version_id: Uuid,
        language: &str,
        remote_name: &str,
        configuration: &Value,
        now: DateTime<Utc>,
    ) -> Result<SearchIndex, AppError> {
        let query = format!(
            r#"
            INSERT INTO search_indices (
                id, dataset_version_id, language, remote_name, configuration,
                error_count, push_errors, pushed_at, is_syncing, sync_started_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, '[]'::jsonb, NULL, FALSE, NULL, $6)
            ON CONFLICT (dataset_version_id, language) DO UPDATE SET language = EXCLUDED.language
            RETURNING {}
            "#,
            INDEX_COLUMNS
        );
        let row: IndexRow = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(version_id)
            .bind(language)
            .bind(remote_name)
            .bind(Json(configuration))
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(row.into())
    }

    async fn save_index(&self, index: &SearchIndex) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE search_indices
            SET configuration = $2, error_count = $3, push_errors = $4, pushed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(index.id)
        .bind(Json(&index.configuration))
        .bind(i64::try_from(index.error_count).unwrap_or(i64::MAX))
        .bind(Json(&index.push_errors))
        .bind(index.pushed_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidState(format!("unknown index {}", index.id)));
        }
        Ok(())
    }

    async fn try_lock_index(
        &self,
        index_id: Uuid,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE search_indices
            SET is_syncing = TRUE, sync_started_at = $2
            WHERE id = $1
              AND (is_syncing = FALSE OR sync_started_at IS NULL OR sync_started_at <= $3)
            "#,
        )
        .bind(index_id)
        .bind(now)
        .bind(stale_before(now, lease))
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock_index(&self, index_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE search_indices SET is_syncing = FALSE, sync_started_at = NULL WHERE id = $1")
            .bind(index_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }
}

/// Helper struct for deserializing source rows
#[derive(sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    connector: String,
    endpoint: String,
    set_specification: String,
    delete_policy: String,
    purge_interval_days: Option<i64>,
    allow_empty_url: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<SourceRow> for Source {
    type Error = AppError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        Ok(Source {
            id: row.id,
            name: row.name,
            connector: row.connector,
            endpoint: row.endpoint,
            set_specification: row.set_specification,
            delete_policy: row.delete_policy.parse()?,
            purge_interval_days: row.purge_interval_days,
            allow_empty_url: row.allow_empty_url,
            created_at: row.created_at,
        })
    }
}

/// Helper struct for deserializing harvest rows
#[derive(sqlx::FromRow)]
struct HarvestRow {
    id: Uuid,
    dataset_id: Uuid,
    source_id: Uuid,
    stage: String,
    latest_update_at: DateTime<Utc>,
    harvested_at: Option<DateTime<Utc>>,
    purge_after: Option<DateTime<Utc>>,
    is_syncing: bool,
    sync_started_at: Option<DateTime<Utc>>,
}

impl TryFrom<HarvestRow> for Harvest {
    type Error = AppError;

    fn try_from(row: HarvestRow) -> Result<Self, Self::Error> {
        Ok(Harvest {
            id: row.id,
            dataset_id: row.dataset_id,
            source_id: row.source_id,
            stage: row.stage.parse()?,
            latest_update_at: row.latest_update_at,
            harvested_at: row.harvested_at,
            purge_after: row.purge_after,
            is_syncing: row.is_syncing,
            sync_started_at: row.sync_started_at,
        })
    }
}

/// Helper struct for deserializing harvest rows joined with their source
#[derive(sqlx::FromRow)]
struct SourceHarvestRow {
    #[sqlx(flatten)]
    harvest: HarvestRow,
    source_name: String,
    connector: String,
    endpoint: String,
    set_specification: String,
    delete_policy: String,
    purge_interval_days: Option<i64>,
    allow_empty_url: bool,
    source_created_at: DateTime<Utc>,
}

impl TryFrom<SourceHarvestRow> for SourceHarvest {
    type Error = AppError;

    fn try_from(row: SourceHarvestRow) -> Result<Self, Self::Error> {
        let source = SourceRow {
            id: row.harvest.source_id,
            name: row.source_name,
            connector: row.connector,
            endpoint: row.endpoint,
            set_specification: row.set_specification,
            delete_policy: row.delete_policy,
            purge_interval_days: row.purge_interval_days,
            allow_empty_url: row.allow_empty_url,
            created_at: row.source_created_at,
        };
        Ok(SourceHarvest {
            harvest: row.harvest.try_into()?,
            source: source.try_into()?,
        })
    }
}

/// Helper struct for deserializing document rows
#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    dataset_version_id: Option<Uuid>,
    collection_id: Uuid,
    external_id: String,
    state: String,
    properties: Json<Map<String, Value>>,
    pipeline: Json<Pipeline>,
    content_hash: String,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = AppError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Document {
            id: row.id,
            dataset_version_id: row.dataset_version_id,
            collection_id: row.collection_id,
            external_id: row.external_id,
            state: row.state.parse()?,
            properties: row.properties.0,
            pipeline: row.pipeline.0,
            content_hash: row.content_hash,
            created_at: row.created_at,
            modified_at: row.modified_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// Helper struct for deserializing hash lookup query results
#[derive(sqlx::FromRow)]
struct HashRow {
    external_id: String,
    content_hash: String,
}

/// Helper struct for deserializing batch rows
#[derive(sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    phase: String,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = AppError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(Batch {
            id: row.id,
            phase: row.phase.parse()?,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

/// Helper struct for deserializing process result rows
#[derive(sqlx::FromRow)]
struct ResultRow {
    id: Uuid,
    batch_id: Uuid,
    document_id: Uuid,
    success: bool,
    result: Option<Json<ResourceRef>>,
    error: Option<Json<ResourceRef>>,
    created_at: DateTime<Utc>,
}

impl From<ResultRow> for ProcessResult {
    fn from(row: ResultRow) -> Self {
        ProcessResult {
            id: row.id,
            batch_id: row.batch_id,
            document_id: row.document_id,
            success: row.success,
            result: row.result.map(|r| r.0),
            error: row.error.map(|e| e.0),
            created_at: row.created_at,
        }
    }
}

/// Helper struct for deserializing search index rows
#[derive(sqlx::FromRow)]
struct IndexRow {
    id: Uuid,
    dataset_version_id: Uuid,
    language: String,
    remote_name: String,
    configuration: Json<Value>,
    error_count: i64,
    push_errors: Json<Vec<PushError>>,
    pushed_at: Option<DateTime<Utc>>,
    is_syncing: bool,
    sync_started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<IndexRow> for SearchIndex {
    fn from(row: IndexRow) -> Self {
        SearchIndex {
            id: row.id,
            dataset_version_id: row.dataset_version_id,
            language: row.language,
            remote_name: row.remote_name,
            configuration: row.configuration.0,
            error_count: u64::try_from(row.error_count).unwrap_or_default(),
            push_errors: row.push_errors.0,
            pushed_at: row.pushed_at,
            is_syncing: row.is_syncing,
            sync_started_at: row.sync_started_at,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_core::models::{epoch, DeletePolicy, PhaseRecord};
    use serde_json::json;

    fn document_row(state: &str) -> DocumentRow {
        let mut pipeline = Pipeline::new();
        pipeline.record(
            PipelinePhase::Extraction,
            PhaseRecord {
                success: true,
                resource: Some(ResourceRef::new("extract", "42")),
                processed_at: epoch(),
            },
        );
        DocumentRow {
            id: Uuid::new_v4(),
            dataset_version_id: Some(Uuid::new_v4()),
            collection_id: Uuid::new_v4(),
            external_id: "doc-1".to_string(),
            state: state.to_string(),
            properties: Json(json!({"title": "Rust"}).as_object().cloned().unwrap()),
            pipeline: Json(pipeline),
            content_hash: "abc".to_string(),
            created_at: epoch(),
            modified_at: epoch(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_document_row_conversion() {
        let document: Document = document_row("active").try_into().unwrap();
        assert!(document.is_active());
        assert!(document.pipeline.succeeded(PipelinePhase::Extraction));
        assert_eq!(document.properties["title"], json!("Rust"));
    }

    #[test]
    fn test_document_row_rejects_unknown_state() {
        let result: Result<Document, AppError> = document_row("archived").try_into();
        assert!(matches!(result, Err(AppError::InvalidState(_))));
    }

    #[test]
    fn test_source_harvest_row_conversion() {
        let row = SourceHarvestRow {
            harvest: HarvestRow {
                id: Uuid::new_v4(),
                dataset_id: Uuid::new_v4(),
                source_id: Uuid::new_v4(),
                stage: "video".to_string(),
                latest_update_at: epoch(),
                harvested_at: None,
                purge_after: None,
                is_syncing: true,
                sync_started_at: Some(epoch()),
            },
            source_name: "edurep".to_string(),
            connector: "ckan".to_string(),
            endpoint: "https://example.com".to_string(),
            set_specification: "edurep_delen".to_string(),
            delete_policy: "transient".to_string(),
            purge_interval_days: Some(7),
            allow_empty_url: false,
            source_created_at: epoch(),
        };
        let joined: SourceHarvest = row.try_into().unwrap();
        assert_eq!(joined.harvest.stage, HarvestStage::Video);
        assert_eq!(joined.source.delete_policy, DeletePolicy::Transient);
        assert_eq!(joined.source.id, joined.harvest.source_id);
        assert_eq!(joined.harvest.sync_started_at, Some(epoch()));
    }

    #[test]
    fn test_pipeline_json_keys_match_phase_names() {
        let row = document_row("active");
        let stored = serde_json::to_value(&row.pipeline.0).unwrap();
        assert!(stored.get(PipelinePhase::Extraction.as_str()).is_some());
    }

    #[test]
    fn test_negative_error_count_is_clamped() {
        let row = IndexRow {
            id: Uuid::new_v4(),
            dataset_version_id: Uuid::new_v4(),
            language: "nl".to_string(),
            remote_name: "x-nl".to_string(),
            configuration: Json(json!({})),
            error_count: -1,
            push_errors: Json(Vec::new()),
            pushed_at: None,
            is_syncing: false,
            sync_started_at: None,
            created_at: epoch(),
        };
        assert_eq!(SearchIndex::from(row).error_count, 0);
    }

    #[test]
    fn test_lock_error_detection_ignores_other_errors() {
        assert!(!is_lock_not_available(&sqlx::Error::RowNotFound));
    }
}
