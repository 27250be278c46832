use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::time::Duration;

use super::{EmbeddedRecord, GenerationHashes, RecoveryReport, VectorIndex, validate_vector};
use crate::error::IndexError;
use crate::models::{
    ColumnIdentity, ColumnRecord, Generation, GenerationStatus, IndexConfig, IndexStats,
    QueryFilter, SearchHit,
};

pub struct PgVectorIndex {
    pool: PgPool,
    table_name: String,
    generations_table: String,
    collection: String,
    dimension: usize,
}

impl PgVectorIndex {
    pub async fn new(config: &IndexConfig, dimension: usize) -> Result<Self, IndexError> {
        let url = config.url.as_deref().ok_or_else(|| {
            IndexError::Postgres("index.url (or DATABASE_URL) is required".to_string())
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max)
            .acquire_timeout(Duration::from_secs(config.pool_acquire_timeout.into()))
            .connect(url)
            .await?;

        let index = Self {
            pool,
            table_name: config.collection.clone(),
            generations_table: format!("{}_generations", config.collection),
            collection: config.collection.clone(),
            dimension,
        };

        index.check_pgvector_extension().await?;
        index.create_tables().await?;
        index.check_dimension().await?;

        Ok(index)
    }

    async fn check_pgvector_extension(&self) -> Result<(), IndexError> {
        let result: Option<(String,)> =
            sqlx::query_as("SELECT extname FROM pg_extension WHERE extname = 'vector'")
                .fetch_optional(&self.pool)
                .await?;

        if result.is_none() {
            return Err(IndexError::PgVectorMissing);
        }

        Ok(())
    }

    async fn create_tables(&self) -> Result<(), IndexError> {
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {}_meta (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    dimension INTEGER NOT NULL
                )
                "#,
                self.collection
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    generation_id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    status TEXT NOT NULL
                        CHECK (status IN ('building', 'active', 'superseded', 'retired')),
                    record_count BIGINT NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    activated_at TIMESTAMPTZ
                )
                "#,
                self.generations_table
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {}_active_project_idx ON {} (project_id) \
                 WHERE status = 'active'",
                self.collection, self.generations_table
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    generation_id TEXT NOT NULL REFERENCES {}(generation_id) ON DELETE CASCADE,
                    project_id TEXT NOT NULL,
                    dataset_name TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    column_name TEXT NOT NULL,
                    data_type TEXT NOT NULL,
                    description TEXT,
                    is_nullable BOOLEAN NOT NULL,
                    mode TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    embedding vector({}) NOT NULL,
                    PRIMARY KEY (generation_id, project_id, dataset_name, table_name, column_name)
                )
                "#,
                self.table_name, self.generations_table, self.dimension
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {}_embedding_idx ON {} \
                 USING hnsw (embedding vector_cosine_ops)",
                self.collection, self.table_name
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn check_dimension(&self) -> Result<(), IndexError> {
        let query = format!(
            "INSERT INTO {}_meta (id, dimension) VALUES (1, $1) ON CONFLICT (id) DO NOTHING",
            self.collection
        );
        sqlx::query(&query)
            .bind(self.dimension as i32)
            .execute(&self.pool)
            .await?;

        let query = format!("SELECT dimension FROM {}_meta WHERE id = 1", self.collection);
        let (stored,): (i32,) = sqlx::query_as(&query).fetch_one(&self.pool).await?;
        if stored as usize != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: stored as usize,
                actual: self.dimension,
            });
        }
        Ok(())
    }

    fn generation_select(&self) -> String {
        format!(
            "SELECT generation_id, project_id, status, record_count, created_at, activated_at \
             FROM {}",
            self.generations_table
        )
    }

    async fn require_generation(&self, generation_id: &str) -> Result<Generation, IndexError> {
        self.generation(generation_id)
            .await?
            .ok_or_else(|| IndexError::GenerationNotFound(generation_id.to_string()))
    }
}

fn generation_from_row(row: &PgRow) -> Result<Generation, IndexError> {
    let status: String = row.get("status");
    let record_count: i64 = row.get("record_count");
    Ok(Generation {
        generation_id: row.get("generation_id"),
        project_id: row.get("project_id"),
        status: status.parse().map_err(IndexError::InvalidDbValue)?,
        record_count: record_count.max(0) as u64,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        activated_at: row.get::<Option<DateTime<Utc>>, _>("activated_at"),
    })
}

fn record_from_row(row: &PgRow) -> Result<ColumnRecord, IndexError> {
    let mode: String = row.get("mode");
    Ok(ColumnRecord {
        identity: ColumnIdentity {
            project_id: row.get("project_id"),
            dataset_name: row.get("dataset_name"),
            table_name: row.get("table_name"),
            column_name: row.get("column_name"),
        },
        data_type: row.get("data_type"),
        description: row.get("description"),
        is_nullable: row.get("is_nullable"),
        mode: mode.parse().map_err(IndexError::InvalidDbValue)?,
    })
}

fn state_error(generation: &Generation, expected: &'static str) -> IndexError {
    IndexError::GenerationState {
        generation_id: generation.generation_id.clone(),
        status: generation.status.to_string(),
        expected,
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn health_check(&self) -> Result<bool, IndexError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| true)
            .map_err(IndexError::from)
    }

    async fn begin_generation(
        &self,
        project_id: &str,
        generation_id: &str,
    ) -> Result<(), IndexError> {
        if let Some(existing) = self.generation(generation_id).await? {
            return Err(state_error(&existing, "absent"));
        }

        let query = format!(
            "INSERT INTO {} (generation_id, project_id, status) VALUES ($1, $2, 'building')",
            self.generations_table
        );
        sqlx::query(&query)
            .bind(generation_id)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append(
        &self,
        generation_id: &str,
        records: Vec<EmbeddedRecord>,
    ) -> Result<u64, IndexError> {
        for (_, vector) in &records {
            validate_vector(vector, self.dimension)?;
        }

        let generation = self.require_generation(generation_id).await?;
        if generation.status != GenerationStatus::Building {
            return Err(state_error(&generation, "building"));
        }

        let insert = format!(
            r#"
            INSERT INTO {} (generation_id, project_id, dataset_name, table_name, column_name,
                            data_type, description, is_nullable, mode, content_hash, embedding)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (generation_id, project_id, dataset_name, table_name, column_name)
            DO UPDATE SET
                data_type = EXCLUDED.data_type,
                description = EXCLUDED.description,
                is_nullable = EXCLUDED.is_nullable,
                mode = EXCLUDED.mode,
                content_hash = EXCLUDED.content_hash,
                embedding = EXCLUDED.embedding
            "#,
            self.table_name
        );

        let mut tx = self.pool.begin().await?;

        for (record, vector) in records {
            if record.identity.project_id != generation.project_id {
                return Err(IndexError::ProjectMismatch {
                    record: record.identity.to_string(),
                    record_project: record.identity.project_id.clone(),
                    project: generation.project_id.clone(),
                });
            }
            let content_hash = record.content_hash();
            let id = record.identity;
            sqlx::query(&insert)
                .bind(generation_id)
                .bind(&id.project_id)
                .bind(&id.dataset_name)
                .bind(&id.table_name)
                .bind(&id.column_name)
                .bind(&record.data_type)
                .bind(&record.description)
                .bind(record.is_nullable)
                .bind(record.mode.to_string())
                .bind(&content_hash)
                .bind(Vector::from(vector))
                .execute(&mut *tx)
                .await?;
        }

        let update = format!(
            r#"
            UPDATE {g} SET record_count =
                (SELECT COUNT(*) FROM {t} WHERE generation_id = $1)
            WHERE generation_id = $1
            RETURNING record_count
            "#,
            g = self.generations_table,
            t = self.table_name
        );
        let (count,): (i64,) = sqlx::query_as(&update)
            .bind(generation_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(count.max(0) as u64)
    }

    async fn publish(&self, generation_id: &str) -> Result<Option<String>, IndexError> {
        let generation = self.require_generation(generation_id).await?;
        if generation.status != GenerationStatus::Building {
            return Err(state_error(&generation, "building"));
        }

        let mut tx = self.pool.begin().await?;

        let supersede = format!(
            "UPDATE {} SET status = 'superseded' \
             WHERE project_id = $1 AND status = 'active' RETURNING generation_id",
            self.generations_table
        );
        let previous: Option<(String,)> = sqlx::query_as(&supersede)
            .bind(&generation.project_id)
            .fetch_optional(&mut *tx)
            .await?;

        let activate = format!(
            "UPDATE {} SET status = 'active', activated_at = now() \
             WHERE generation_id = $1 AND status = 'building'",
            self.generations_table
        );
        let updated = sqlx::query(&activate)
            .bind(generation_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(IndexError::GenerationNotFound(generation_id.to_string()));
        }

        tx.commit().await?;
        Ok(previous.map(|(id,)| id))
    }

    async fn abort_generation(&self, generation_id: &str) -> Result<(), IndexError> {
        let Some(generation) = self.generation(generation_id).await? else {
            return Ok(());
        };
        if generation.status != GenerationStatus::Building {
            return Err(state_error(&generation, "building"));
        }

        let query = format!(
            "DELETE FROM {} WHERE generation_id = $1",
            self.generations_table
        );
        sqlx::query(&query)
            .bind(generation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retire_generation(&self, generation_id: &str) -> Result<u64, IndexError> {
        let generation = self.require_generation(generation_id).await?;
        match generation.status {
            GenerationStatus::Superseded | GenerationStatus::Retired => {}
            _ => return Err(state_error(&generation, "superseded")),
        }

        let mut tx = self.pool.begin().await?;

        let delete = format!("DELETE FROM {} WHERE generation_id = $1", self.table_name);
        let deleted = sqlx::query(&delete)
            .bind(generation_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let retire = format!(
            "UPDATE {} SET status = 'retired' WHERE generation_id = $1",
            self.generations_table
        );
        sqlx::query(&retire)
            .bind(generation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<SearchHit>, IndexError> {
        validate_vector(vector, self.dimension)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let embedding = Vector::from(vector.to_vec());

        let mut where_parts = vec!["g.status = 'active'".to_string()];
        if filter.project_id.is_some() {
            where_parts.push("g.project_id = $3".to_string());
        }
        if let Some(score) = filter.min_score {
            where_parts.push(format!("(1 - (e.embedding <=> $1)) >= {}", score));
        }

        let query = format!(
            r#"
            SELECT
                e.project_id, e.dataset_name, e.table_name, e.column_name,
                e.data_type, e.description, e.is_nullable, e.mode,
                1 - (e.embedding <=> $1) AS score
            FROM {t} e
            JOIN {g} g ON g.generation_id = e.generation_id
            WHERE {w}
            ORDER BY e.embedding <=> $1,
                     e.project_id, e.dataset_name, e.table_name, e.column_name
            LIMIT $2
            "#,
            t = self.table_name,
            g = self.generations_table,
            w = where_parts.join(" AND ")
        );

        let mut query_builder = sqlx::query(&query).bind(&embedding).bind(top_k as i64);
        if let Some(ref project_id) = filter.project_id {
            query_builder = query_builder.bind(project_id);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<SearchHit, IndexError> {
                let record = record_from_row(row)?;
                let score: f64 = row.get("score");
                Ok(SearchHit {
                    identity: record.identity.clone(),
                    score: score as f32,
                    record,
                })
            })
            .collect()
    }

    async fn generation(&self, generation_id: &str) -> Result<Option<Generation>, IndexError> {
        let query = format!("{} WHERE generation_id = $1", self.generation_select());
        sqlx::query(&query)
            .bind(generation_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(generation_from_row)
            .transpose()
    }

    async fn active_generation(&self, project_id: &str) -> Result<Option<Generation>, IndexError> {
        let query = format!(
            "{} WHERE project_id = $1 AND status = 'active'",
            self.generation_select()
        );
        sqlx::query(&query)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(generation_from_row)
            .transpose()
    }

    async fn generation_hashes(
        &self,
        generation_id: &str,
    ) -> Result<GenerationHashes, IndexError> {
        let query = format!(
            r#"
            SELECT project_id, dataset_name, table_name, column_name, content_hash, embedding
            FROM {}
            WHERE generation_id = $1
            "#,
            self.table_name
        );
        let rows = sqlx::query(&query)
            .bind(generation_id)
            .fetch_all(&self.pool)
            .await?;

        let mut hashes = GenerationHashes::new();
        for row in rows {
            let identity = ColumnIdentity {
                project_id: row.get("project_id"),
                dataset_name: row.get("dataset_name"),
                table_name: row.get("table_name"),
                column_name: row.get("column_name"),
            };
            let content_hash: String = row.get("content_hash");
            let embedding: Vector = row.get("embedding");
            hashes.insert(identity, (content_hash, embedding.to_vec()));
        }
        Ok(hashes)
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        let query = format!(
            r#"
            SELECT
                (SELECT COUNT(*) FROM {t} e
                 JOIN {g} a ON a.generation_id = e.generation_id
                 WHERE a.status = 'active') AS total_records,
                COUNT(*) AS active_generations,
                MAX(activated_at) AS last_updated
            FROM {g}
            WHERE status = 'active'
            "#,
            t = self.table_name,
            g = self.generations_table
        );
        let row = sqlx::query(&query).fetch_one(&self.pool).await?;

        let total_records: i64 = row.get("total_records");
        let active_generations: i64 = row.get("active_generations");
        Ok(IndexStats {
            collection: self.collection.clone(),
            total_records: total_records.max(0) as u64,
            dimension: self.dimension,
            active_generations: active_generations.max(0) as u64,
            last_updated: row.get::<Option<DateTime<Utc>>, _>("last_updated"),
        })
    }

    async fn recover(&self) -> Result<RecoveryReport, IndexError> {
        let mut tx = self.pool.begin().await?;

        let abort = format!(
            "DELETE FROM {} WHERE status = 'building'",
            self.generations_table
        );
        let aborted = sqlx::query(&abort).execute(&mut *tx).await?.rows_affected();

        let purge = format!(
            r#"
            DELETE FROM {t} WHERE generation_id IN
                (SELECT generation_id FROM {g} WHERE status = 'superseded')
            "#,
            t = self.table_name,
            g = self.generations_table
        );
        sqlx::query(&purge).execute(&mut *tx).await?;

        let retire = format!(
            "UPDATE {} SET status = 'retired' WHERE status = 'superseded'",
            self.generations_table
        );
        let retired = sqlx::query(&retire)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(RecoveryReport { aborted, retired })
    }
}
