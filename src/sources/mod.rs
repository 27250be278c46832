//! Warehouse catalog adapters.
//!
//! Every adapter exposes the same three reads: datasets of a project, tables of
//! a dataset, columns of a table. Paginated upstream listings are surfaced as a
//! single lazy stream through [`paginate`].

mod bigquery;
mod postgres;
mod snapshot;

pub use bigquery::BigQuerySource;
pub use postgres::PostgresSource;
pub use snapshot::{
    CatalogSnapshot, SnapshotColumn, SnapshotDataset, SnapshotProject, SnapshotSource,
    SnapshotTable,
};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::error::SourceError;
use crate::models::{CatalogConfig, CatalogDriver, ColumnRecord, DatasetRef, TableRef};

/// Catalog reader used by the extraction pipeline.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &str;

    /// Datasets of a project, lazily paged.
    fn list_datasets<'a>(&'a self, project_id: &'a str)
    -> BoxStream<'a, Result<DatasetRef, SourceError>>;

    /// Tables of a dataset, lazily paged.
    fn list_tables<'a>(&'a self, dataset: &'a DatasetRef)
    -> BoxStream<'a, Result<TableRef, SourceError>>;

    /// Column records of one table, in catalog order.
    async fn get_columns(&self, table: &TableRef) -> Result<Vec<ColumnRecord>, SourceError>;

    /// Cheap reachability probe used by `status`.
    async fn health_check(&self) -> Result<bool, SourceError> {
        Ok(true)
    }
}

/// One page of an upstream listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Turn a page fetcher into a lazy stream of items.
///
/// The fetcher receives `None` for the first page and the previous page's
/// token afterwards. An empty or missing token ends the stream; an error is
/// yielded once and ends it as well.
pub fn paginate<'a, T, F, Fut>(fetch_page: F) -> BoxStream<'a, Result<T, SourceError>>
where
    T: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>, SourceError>> + Send + 'a,
{
    stream::try_unfold(
        (fetch_page, Cursor::Start),
        |(mut fetch_page, cursor)| async move {
            let token = match cursor {
                Cursor::Done => return Ok::<_, SourceError>(None),
                Cursor::Start => None,
                Cursor::Next(token) => Some(token),
            };

            let page = fetch_page(token).await?;
            let next = match page.next_page_token {
                Some(token) if !token.is_empty() => Cursor::Next(token),
                _ => Cursor::Done,
            };

            let items = stream::iter(page.items.into_iter().map(Ok::<T, SourceError>));
            Ok(Some((items, (fetch_page, next))))
        },
    )
    .try_flatten()
    .boxed()
}

/// Build the catalog adapter selected in configuration.
pub async fn create_source(config: &CatalogConfig) -> Result<Arc<dyn MetadataSource>, SourceError> {
    match config.driver {
        CatalogDriver::BigQuery => Ok(Arc::new(BigQuerySource::new(config)?)),
        CatalogDriver::Postgres => Ok(Arc::new(PostgresSource::new(config).await?)),
        CatalogDriver::Snapshot => {
            let path = config.snapshot_path.as_ref().ok_or_else(|| {
                SourceError::Configuration("catalog.snapshot_path is required".to_string())
            })?;
            Ok(Arc::new(SnapshotSource::from_path(path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn pages() -> Vec<Page<u32>> {
        vec![
            Page {
                items: vec![1, 2],
                next_page_token: Some("a".to_string()),
            },
            Page {
                items: vec![],
                next_page_token: Some("b".to_string()),
            },
            Page {
                items: vec![3],
                next_page_token: Some(String::new()),
            },
        ]
    }

    #[tokio::test]
    async fn test_paginate_follows_tokens() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tokens = Arc::clone(&seen);
        let mut remaining = pages().into_iter();

        let items: Vec<u32> = paginate(move |token| {
            tokens.lock().unwrap().push(token);
            let page = remaining.next().unwrap_or_else(|| Page::last(vec![]));
            async move { Ok(page) }
        })
        .try_collect()
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![None, Some("a".to_string()), Some("b".to_string())]
        );
    }

    #[tokio::test]
    async fn test_paginate_stops_after_error() {
        let mut calls = 0;
        let results: Vec<Result<u32, SourceError>> = paginate(move |_| {
            calls += 1;
            let call = calls;
            async move {
                if call == 1 {
                    Ok(Page {
                        items: vec![7],
                        next_page_token: Some("next".to_string()),
                    })
                } else {
                    Err(SourceError::Unavailable("down".to_string()))
                }
            }
        })
        .collect()
        .await;

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Ok(7)));
        assert!(matches!(results[1], Err(SourceError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_create_source_requires_snapshot_path() {
        let config = CatalogConfig {
            driver: CatalogDriver::Snapshot,
            ..Default::default()
        };
        let result = create_source(&config).await;
        assert!(matches!(result, Err(SourceError::Configuration(_))));
    }
}
