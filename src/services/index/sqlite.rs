//! SQLite-backed index with brute-force cosine ranking.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{
    EmbeddedRecord, GenerationHashes, RecoveryReport, VectorIndex, cosine_similarity,
    decode_vector, encode_vector, rank_hits, validate_vector,
};
use crate::error::IndexError;
use crate::models::{
    ColumnIdentity, ColumnMode, ColumnRecord, Generation, GenerationStatus, IndexStats,
    QueryFilter, SearchHit,
};

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS index_meta (
    collection TEXT PRIMARY KEY,
    dimension INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS generations (
    generation_id TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    project_id TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('building', 'active', 'superseded', 'retired')),
    record_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    activated_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_generations_active_project
    ON generations(collection, project_id)
    WHERE status = 'active';

CREATE TABLE IF NOT EXISTS column_embeddings (
    generation_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    dataset_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    data_type TEXT NOT NULL,
    description TEXT,
    is_nullable INTEGER NOT NULL,
    mode TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    embedding BLOB NOT NULL,
    PRIMARY KEY(generation_id, project_id, dataset_name, table_name, column_name),
    FOREIGN KEY(generation_id)
        REFERENCES generations(generation_id)
        ON DELETE CASCADE
);
";

const GENERATION_COLUMNS: &str =
    "generation_id, project_id, status, record_count, created_at, activated_at";

pub struct SqliteIndex {
    conn: Arc<Mutex<Connection>>,
    collection: String,
    dimension: usize,
}

impl SqliteIndex {
    /// Open or create the index file.
    pub fn open(path: &Path, collection: &str, dimension: usize) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn, collection, dimension)
    }

    pub fn open_in_memory(collection: &str, dimension: usize) -> Result<Self, IndexError> {
        Self::init(Connection::open_in_memory()?, collection, dimension)
    }

    fn init(conn: Connection, collection: &str, dimension: usize) -> Result<Self, IndexError> {
        if dimension == 0 {
            return Err(IndexError::InvalidVector(
                "index dimension must be greater than 0".to_string(),
            ));
        }

        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<i64> = conn
            .query_row(
                "SELECT dimension FROM index_meta WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(stored) if stored as usize != dimension => {
                return Err(IndexError::DimensionMismatch {
                    expected: stored as usize,
                    actual: dimension,
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO index_meta (collection, dimension) VALUES (?1, ?2)",
                    params![collection, dimension as i64],
                )?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            collection: collection.to_string(),
            dimension,
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, IndexError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, IndexError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| IndexError::TaskError("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| IndexError::TaskError(e.to_string()))?
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, IndexError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| IndexError::InvalidDbValue(format!("timestamp {raw}: {e}")))
}

struct GenerationRow {
    generation_id: String,
    project_id: String,
    status: String,
    record_count: i64,
    created_at: String,
    activated_at: Option<String>,
}

impl GenerationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            generation_id: row.get(0)?,
            project_id: row.get(1)?,
            status: row.get(2)?,
            record_count: row.get(3)?,
            created_at: row.get(4)?,
            activated_at: row.get(5)?,
        })
    }

    fn into_generation(self) -> Result<Generation, IndexError> {
        Ok(Generation {
            generation_id: self.generation_id,
            project_id: self.project_id,
            status: self.status.parse().map_err(IndexError::InvalidDbValue)?,
            record_count: self.record_count.max(0) as u64,
            created_at: parse_time(&self.created_at)?,
            activated_at: self.activated_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn load_generation(
    conn: &Connection,
    collection: &str,
    generation_id: &str,
) -> Result<Option<Generation>, IndexError> {
    conn.query_row(
        &format!(
            "SELECT {GENERATION_COLUMNS} FROM generations
             WHERE collection = ?1 AND generation_id = ?2"
        ),
        params![collection, generation_id],
        GenerationRow::from_row,
    )
    .optional()?
    .map(GenerationRow::into_generation)
    .transpose()
}

fn require_generation(
    conn: &Connection,
    collection: &str,
    generation_id: &str,
) -> Result<Generation, IndexError> {
    load_generation(conn, collection, generation_id)?
        .ok_or_else(|| IndexError::GenerationNotFound(generation_id.to_string()))
}

fn state_error(generation: &Generation, expected: &'static str) -> IndexError {
    IndexError::GenerationState {
        generation_id: generation.generation_id.clone(),
        status: generation.status.to_string(),
        expected,
    }
}

fn decode_record(row: &Row<'_>) -> rusqlite::Result<(ColumnRecord, String, Vec<u8>)> {
    let mode_raw: String = row.get(7)?;
    let mode = mode_raw.parse::<ColumnMode>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(IndexError::InvalidDbValue(err)),
        )
    })?;
    let record = ColumnRecord {
        identity: ColumnIdentity {
            project_id: row.get(0)?,
            dataset_name: row.get(1)?,
            table_name: row.get(2)?,
            column_name: row.get(3)?,
        },
        data_type: row.get(4)?,
        description: row.get(5)?,
        is_nullable: row.get(6)?,
        mode,
    };
    Ok((record, row.get(8)?, row.get(9)?))
}

const RECORD_COLUMNS: &str = "e.project_id, e.dataset_name, e.table_name, e.column_name, \
     e.data_type, e.description, e.is_nullable, e.mode, e.content_hash, e.embedding";

fn delete_rows(conn: &Connection, generation_id: &str) -> Result<u64, IndexError> {
    let deleted = conn.execute(
        "DELETE FROM column_embeddings WHERE generation_id = ?1",
        params![generation_id],
    )?;
    Ok(deleted as u64)
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn health_check(&self) -> Result<bool, IndexError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(true)
        })
        .await
    }

    async fn begin_generation(
        &self,
        project_id: &str,
        generation_id: &str,
    ) -> Result<(), IndexError> {
        let collection = self.collection.clone();
        let project_id = project_id.to_string();
        let generation_id = generation_id.to_string();

        self.with_conn(move |conn| {
            if let Some(existing) = load_generation(conn, &collection, &generation_id)? {
                return Err(state_error(&existing, "absent"));
            }
            conn.execute(
                "INSERT INTO generations (generation_id, collection, project_id, status, created_at)
                 VALUES (?1, ?2, ?3, 'building', ?4)",
                params![generation_id, collection, project_id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn append(
        &self,
        generation_id: &str,
        records: Vec<EmbeddedRecord>,
    ) -> Result<u64, IndexError> {
        for (_, vector) in &records {
            validate_vector(vector, self.dimension)?;
        }

        let collection = self.collection.clone();
        let generation_id = generation_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let generation = require_generation(&tx, &collection, &generation_id)?;
            if generation.status != GenerationStatus::Building {
                return Err(state_error(&generation, "building"));
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO column_embeddings (
                        generation_id, project_id, dataset_name, table_name, column_name,
                        data_type, description, is_nullable, mode, content_hash, embedding
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(generation_id, project_id, dataset_name, table_name, column_name)
                     DO UPDATE SET
                        data_type = excluded.data_type,
                        description = excluded.description,
                        is_nullable = excluded.is_nullable,
                        mode = excluded.mode,
                        content_hash = excluded.content_hash,
                        embedding = excluded.embedding",
                )?;

                for (record, vector) in &records {
                    if record.identity.project_id != generation.project_id {
                        return Err(IndexError::ProjectMismatch {
                            record: record.identity.to_string(),
                            record_project: record.identity.project_id.clone(),
                            project: generation.project_id.clone(),
                        });
                    }
                    let id = &record.identity;
                    stmt.execute(params![
                        generation_id,
                        id.project_id,
                        id.dataset_name,
                        id.table_name,
                        id.column_name,
                        record.data_type,
                        record.description,
                        record.is_nullable,
                        record.mode.to_string(),
                        record.content_hash(),
                        encode_vector(vector),
                    ])?;
                }
            }

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM column_embeddings WHERE generation_id = ?1",
                params![generation_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE generations SET record_count = ?2 WHERE generation_id = ?1",
                params![generation_id, count],
            )?;
            tx.commit()?;
            Ok(count as u64)
        })
        .await
    }

    async fn publish(&self, generation_id: &str) -> Result<Option<String>, IndexError> {
        let collection = self.collection.clone();
        let generation_id = generation_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let generation = require_generation(&tx, &collection, &generation_id)?;
            if generation.status != GenerationStatus::Building {
                return Err(state_error(&generation, "building"));
            }

            let previous: Option<String> = tx
                .query_row(
                    "SELECT generation_id FROM generations
                     WHERE collection = ?1 AND project_id = ?2 AND status = 'active'",
                    params![collection, generation.project_id],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "UPDATE generations SET status = 'superseded'
                 WHERE collection = ?1 AND project_id = ?2 AND status = 'active'",
                params![collection, generation.project_id],
            )?;
            tx.execute(
                "UPDATE generations SET status = 'active', activated_at = ?2
                 WHERE generation_id = ?1",
                params![generation_id, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(previous)
        })
        .await
    }

    async fn abort_generation(&self, generation_id: &str) -> Result<(), IndexError> {
        let collection = self.collection.clone();
        let generation_id = generation_id.to_string();

        self.with_conn(move |conn| {
            let Some(generation) = load_generation(conn, &collection, &generation_id)? else {
                return Ok(());
            };
            if generation.status != GenerationStatus::Building {
                return Err(state_error(&generation, "building"));
            }
            conn.execute(
                "DELETE FROM generations WHERE generation_id = ?1",
                params![generation_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn retire_generation(&self, generation_id: &str) -> Result<u64, IndexError> {
        let collection = self.collection.clone();
        let generation_id = generation_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let generation = require_generation(&tx, &collection, &generation_id)?;
            match generation.status {
                GenerationStatus::Superseded | GenerationStatus::Retired => {}
                _ => return Err(state_error(&generation, "superseded")),
            }
            let deleted = delete_rows(&tx, &generation_id)?;
            tx.execute(
                "UPDATE generations SET status = 'retired' WHERE generation_id = ?1",
                params![generation_id],
            )?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
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

        let collection = self.collection.clone();
        let dimension = self.dimension;
        let query_vector = vector.to_vec();
        let filter = filter.clone();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS}
                 FROM column_embeddings e
                 JOIN generations g ON g.generation_id = e.generation_id
                 WHERE g.collection = ?1
                   AND g.status = 'active'
                   AND (?2 IS NULL OR g.project_id = ?2)"
            ))?;
            let rows = stmt.query_map(params![collection, filter.project_id], decode_record)?;

            let mut hits = Vec::new();
            for row in rows {
                let (record, _, blob) = row?;
                let candidate = decode_vector(&blob, dimension)?;
                let Some(score) = cosine_similarity(&query_vector, &candidate) else {
                    continue;
                };
                let score = score as f32;
                if filter.min_score.is_some_and(|min| score < min) {
                    continue;
                }
                hits.push(SearchHit {
                    identity: record.identity.clone(),
                    score,
                    record,
                });
            }
            Ok(rank_hits(hits, top_k))
        })
        .await
    }

    async fn generation(&self, generation_id: &str) -> Result<Option<Generation>, IndexError> {
        let collection = self.collection.clone();
        let generation_id = generation_id.to_string();
        self.with_conn(move |conn| load_generation(conn, &collection, &generation_id))
            .await
    }

    async fn active_generation(&self, project_id: &str) -> Result<Option<Generation>, IndexError> {
        let collection = self.collection.clone();
        let project_id = project_id.to_string();

        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {GENERATION_COLUMNS} FROM generations
                     WHERE collection = ?1 AND project_id = ?2 AND status = 'active'"
                ),
                params![collection, project_id],
                GenerationRow::from_row,
            )
            .optional()?
            .map(GenerationRow::into_generation)
            .transpose()
        })
        .await
    }

    async fn generation_hashes(
        &self,
        generation_id: &str,
    ) -> Result<GenerationHashes, IndexError> {
        let dimension = self.dimension;
        let generation_id = generation_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM column_embeddings e WHERE e.generation_id = ?1"
            ))?;
            let rows = stmt.query_map(params![generation_id], decode_record)?;

            let mut hashes = GenerationHashes::new();
            for row in rows {
                let (record, content_hash, blob) = row?;
                let vector = decode_vector(&blob, dimension)?;
                hashes.insert(record.identity, (content_hash, vector));
            }
            Ok(hashes)
        })
        .await
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        let collection = self.collection.clone();
        let dimension = self.dimension;

        self.with_conn(move |conn| {
            let (total_records, active_generations, last_updated): (i64, i64, Option<String>) =
                conn.query_row(
                    "SELECT
                        (SELECT COUNT(*) FROM column_embeddings e
                         JOIN generations g ON g.generation_id = e.generation_id
                         WHERE g.collection = ?1 AND g.status = 'active'),
                        COUNT(*),
                        MAX(activated_at)
                     FROM generations
                     WHERE collection = ?1 AND status = 'active'",
                    params![collection],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;

            Ok(IndexStats {
                collection,
                total_records: total_records.max(0) as u64,
                dimension,
                active_generations: active_generations.max(0) as u64,
                last_updated: last_updated.as_deref().map(parse_time).transpose()?,
            })
        })
        .await
    }

    async fn recover(&self) -> Result<RecoveryReport, IndexError> {
        let collection = self.collection.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let aborted = tx.execute(
                "DELETE FROM generations WHERE collection = ?1 AND status = 'building'",
                params![collection],
            )?;

            let superseded: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT generation_id FROM generations
                     WHERE collection = ?1 AND status = 'superseded'",
                )?;
                let ids = stmt
                    .query_map(params![collection], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                ids
            };
            for generation_id in &superseded {
                delete_rows(&tx, generation_id)?;
                tx.execute(
                    "UPDATE generations SET status = 'retired' WHERE generation_id = ?1",
                    params![generation_id],
                )?;
            }
            tx.commit()?;

            Ok(RecoveryReport {
                aborted: aborted as u64,
                retired: superseded.len() as u64,
            })
        })
        .await
    }
}
