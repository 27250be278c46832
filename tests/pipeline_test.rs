//! Integration tests for the full dbvec pipeline.
//!
//! Tests the complete flow: catalog walk → embed → generation publish → search,
//! plus the daemon protocol on top of it.

use async_trait::async_trait;
use dbvec::client::DaemonClient;
use dbvec::error::{DaemonError, EmbeddingError, ErrorKind, SearchError};
use dbvec::models::{
    ColumnMode, Config, ExtractRequest, GenerationStatus, RunStatus, SearchConfig, SearchQuery,
};
use dbvec::server::DaemonServer;
use dbvec::services::index::SqliteIndex;
use dbvec::services::{
    Embedder, EmbeddingProvider, ExtractionPipeline, PipelineSettings, SearchService, VectorIndex,
};
use dbvec::sources::{
    CatalogSnapshot, SnapshotColumn, SnapshotDataset, SnapshotProject, SnapshotSource,
    SnapshotTable,
};
use dbvec::utils::RetryConfig;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const TEST_DIM: usize = 16;

/// Mock provider: deterministic vectors derived from the text hash.
struct HashProvider;

fn hash_vector(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    (0..TEST_DIM)
        .map(|i| (f32::from(digest[i % digest.len()]) / 255.0) - 0.5)
        .collect()
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn name(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        "hash-16"
    }

    fn max_batch_size(&self) -> usize {
        8
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }
}

fn table(name: &str, columns: &[(&str, &str, Option<&str>)]) -> SnapshotTable {
    SnapshotTable {
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|(column, data_type, description)| {
                let col = SnapshotColumn::new(*column, *data_type).with_mode(ColumnMode::Nullable);
                match description {
                    Some(d) => col.with_description(*d),
                    None => col,
                }
            })
            .collect(),
    }
}

/// 2 datasets, 3 tables, 12 columns.
fn acme_project() -> SnapshotProject {
    SnapshotProject {
        project_id: "acme".to_string(),
        datasets: vec![
            SnapshotDataset {
                name: "crm".to_string(),
                tables: vec![
                    table(
                        "customers",
                        &[
                            ("customer_id", "INT64", Some("Primary key")),
                            ("email", "STRING", Some("Customer email address")),
                            ("signup_date", "DATE", None),
                            ("country", "STRING", Some("ISO country code")),
                        ],
                    ),
                    table(
                        "contacts",
                        &[
                            ("contact_id", "INT64", None),
                            ("customer_id", "INT64", None),
                            ("phone", "STRING", Some("Phone number")),
                            ("created_at", "TIMESTAMP", None),
                        ],
                    ),
                ],
            },
            SnapshotDataset {
                name: "sales".to_string(),
                tables: vec![table(
                    "orders",
                    &[
                        ("order_id", "INT64", None),
                        ("customer_id", "INT64", None),
                        ("amount", "NUMERIC", Some("Order total in USD")),
                        ("ordered_at", "TIMESTAMP", None),
                    ],
                )],
            },
        ],
    }
}

fn globex_project() -> SnapshotProject {
    SnapshotProject {
        project_id: "globex".to_string(),
        datasets: vec![SnapshotDataset {
            name: "ops".to_string(),
            tables: vec![table(
                "shipments",
                &[("shipment_id", "INT64", None), ("carrier", "STRING", None)],
            )],
        }],
    }
}

struct Harness {
    pipeline: ExtractionPipeline,
    search: SearchService,
    index: Arc<dyn VectorIndex>,
}

fn harness_with_index(index: Arc<dyn VectorIndex>) -> Harness {
    let catalog = CatalogSnapshot {
        projects: vec![acme_project(), globex_project()],
    };
    let embedder = Embedder::new(Arc::new(HashProvider), TEST_DIM, RetryConfig::new(1));
    let settings = PipelineSettings {
        batch_size: 5,
        concurrency: 2,
        default_project: Some("acme".to_string()),
        ..Default::default()
    };

    let pipeline = ExtractionPipeline::new(
        Arc::new(SnapshotSource::new(catalog)),
        embedder.clone(),
        Arc::clone(&index),
        settings,
    );
    let search = SearchService::new(embedder, Arc::clone(&index), SearchConfig::default());
    Harness {
        pipeline,
        search,
        index,
    }
}

fn harness() -> Harness {
    harness_with_index(Arc::new(SqliteIndex::open_in_memory("test", TEST_DIM).unwrap()))
}

async fn wait_terminal(
    pipeline: &ExtractionPipeline,
    run_id: &str,
) -> dbvec::models::ExtractionRun {
    for _ in 0..1000 {
        let run = pipeline.status(Some(run_id), None).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {run_id} did not finish");
}

#[tokio::test]
async fn test_extraction_indexes_every_column() {
    let h = harness();

    let run = h.pipeline.extract(ExtractRequest::default()).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.datasets_processed, 2);
    assert_eq!(run.tables_processed, 3);
    assert_eq!(run.records_processed, 12);
    assert!(run.finished_at.is_some());

    let stats = h.index.stats().await.unwrap();
    assert_eq!(stats.total_records, 12);
    assert_eq!(stats.active_generations, 1);
    assert_eq!(stats.dimension, TEST_DIM);

    let generation = h.index.generation(&run.run_id).await.unwrap().unwrap();
    assert_eq!(generation.status, GenerationStatus::Active);
    assert_eq!(generation.record_count, 12);
}

#[tokio::test]
async fn test_exact_text_scores_one() {
    let h = harness();
    h.pipeline.extract(ExtractRequest::default()).await.unwrap();

    // the embedding text of acme.crm.customers.email
    let text = "Column Name: email | Data Type: STRING | Table: crm.customers | Description: Customer email address";
    let results = h.search.search(&SearchQuery::new(text)).await.unwrap();

    let top = &results.results[0];
    assert_eq!(top.identity.to_string(), "acme.crm.customers.email");
    assert!((top.score - 1.0).abs() < 1e-4, "score was {}", top.score);
}

#[tokio::test]
async fn test_force_refresh_swaps_generations() {
    let h = harness();
    let first = h.pipeline.extract(ExtractRequest::default()).await.unwrap();

    let second = h
        .pipeline
        .extract(ExtractRequest {
            project_id: Some("acme".to_string()),
            force_refresh: true,
        })
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.records_reused, 0);

    let active = h.index.active_generation("acme").await.unwrap().unwrap();
    assert_eq!(active.generation_id, second.run_id);

    let old = h.index.generation(&first.run_id).await.unwrap().unwrap();
    assert_eq!(old.status, GenerationStatus::Retired);

    // no identity appears twice: the old generation is not mixed in
    let hits = h
        .index
        .query(&hash_vector("anything"), 100, &Default::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 12);
    let mut identities: Vec<_> = hits.iter().map(|h| h.identity.to_string()).collect();
    identities.sort();
    identities.dedup();
    assert_eq!(identities.len(), 12);
}

#[tokio::test]
async fn test_search_validation_and_ordering() {
    let h = harness();
    h.pipeline.extract(ExtractRequest::default()).await.unwrap();

    let empty = h.search.search(&SearchQuery::new("").with_top_k(0)).await;
    assert!(matches!(empty, Err(SearchError::InvalidQuery(_))));

    let too_many = h
        .search
        .search(&SearchQuery::new("customer email").with_top_k(150))
        .await;
    assert!(matches!(too_many, Err(SearchError::InvalidQuery(_))));

    let results = h
        .search
        .search(&SearchQuery::new("customer email").with_top_k(5))
        .await
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(
        results
            .results
            .windows(2)
            .all(|pair| pair[0].score >= pair[1].score)
    );
}

#[tokio::test]
async fn test_projects_extract_independently() {
    let h = harness();

    let acme = h.pipeline.trigger(ExtractRequest::default()).await.unwrap();
    let globex = h
        .pipeline
        .trigger(ExtractRequest {
            project_id: Some("globex".to_string()),
            force_refresh: false,
        })
        .await
        .unwrap();

    let acme = wait_terminal(&h.pipeline, &acme.run_id).await;
    let globex = wait_terminal(&h.pipeline, &globex.run_id).await;
    assert_eq!(acme.status, RunStatus::Succeeded);
    assert_eq!(globex.status, RunStatus::Succeeded);
    assert_eq!(globex.records_processed, 2);

    let stats = h.index.stats().await.unwrap();
    assert_eq!(stats.total_records, 14);
    assert_eq!(stats.active_generations, 2);

    let scoped = h
        .search
        .search(&SearchQuery::new("carrier").with_project("globex").with_top_k(100))
        .await
        .unwrap();
    assert_eq!(scoped.len(), 2);
    assert!(scoped.results.iter().all(|hit| hit.identity.project_id == "globex"));
}

#[tokio::test]
async fn test_unknown_project_fails_run() {
    let h = harness();
    let run = h
        .pipeline
        .extract(ExtractRequest {
            project_id: Some("initech".to_string()),
            force_refresh: false,
        })
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.is_some());
    assert!(h.index.active_generation("initech").await.unwrap().is_none());
}

#[tokio::test]
async fn test_index_file_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.db");

    let run_id = {
        let index = Arc::new(SqliteIndex::open(&path, "test", TEST_DIM).unwrap());
        let h = harness_with_index(index);
        h.pipeline.extract(ExtractRequest::default()).await.unwrap().run_id
    };

    let reopened = SqliteIndex::open(&path, "test", TEST_DIM).unwrap();
    let active = reopened.active_generation("acme").await.unwrap().unwrap();
    assert_eq!(active.generation_id, run_id);
    assert_eq!(reopened.stats().await.unwrap().total_records, 12);
}

#[tokio::test]
async fn test_daemon_round_trip() {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.daemon.auto_start = false;
    config.daemon.socket_path = Some(dir.path().join("dbvec.sock"));

    let h = harness();
    let server = Arc::new(DaemonServer::with_services(&config, h.pipeline, h.search));
    let handle = tokio::spawn(Arc::clone(&server).run());

    let client = DaemonClient::new(&config);
    for _ in 0..200 {
        if client.ping().await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let run = client.extract(ExtractRequest::default()).await.unwrap();
    let mut current = run.clone();
    for _ in 0..1000 {
        current = client
            .run_status(Some(run.run_id.clone()), None)
            .await
            .unwrap();
        if current.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(current.status, RunStatus::Succeeded);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.total_records, 12);

    let results = client
        .search(SearchQuery::new("order amount").with_top_k(3))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);

    let invalid = client.search(SearchQuery::new("x").with_top_k(101)).await;
    assert!(matches!(
        invalid,
        Err(DaemonError::Remote {
            kind: ErrorKind::Validation,
            ..
        })
    ));

    let missing = client.run_status(Some("nope".to_string()), None).await;
    assert!(matches!(
        missing,
        Err(DaemonError::Remote {
            kind: ErrorKind::NotFound,
            ..
        })
    ));

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert!(health.all_healthy());

    client.shutdown().await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(!config.socket_path().exists());
}
