//! PostgreSQL catalog adapter reading `information_schema`.
//!
//! The project maps to the connected database and datasets map to schemas.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

use super::MetadataSource;
use crate::error::SourceError;
use crate::models::{CatalogConfig, ColumnMode, ColumnRecord, DatasetRef, TableRef};
use crate::utils::{RetryConfig, retry};

const LIST_SCHEMAS: &str = r#"
    SELECT schema_name::text
    FROM information_schema.schemata
    WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
      AND schema_name NOT LIKE 'pg_toast%'
      AND schema_name NOT LIKE 'pg_temp%'
    ORDER BY schema_name
"#;

const LIST_TABLES: &str = r#"
    SELECT table_name::text
    FROM information_schema.tables
    WHERE table_schema = $1
      AND table_type = 'BASE TABLE'
    ORDER BY table_name
"#;

const LIST_COLUMNS: &str = r#"
    SELECT
        column_name::text AS column_name,
        data_type::text AS data_type,
        is_nullable::text AS is_nullable,
        col_description(
            (quote_ident(table_schema) || '.' || quote_ident(table_name))::regclass,
            ordinal_position
        ) AS column_description
    FROM information_schema.columns
    WHERE table_schema = $1
      AND table_name = $2
    ORDER BY ordinal_position
"#;

pub struct PostgresSource {
    pool: PgPool,
    retry: RetryConfig,
}

impl PostgresSource {
    pub async fn new(config: &CatalogConfig) -> Result<Self, SourceError> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            SourceError::Configuration("catalog.database_url is required".to_string())
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(config.timeout_secs))
            .connect(url)
            .await
            .map_err(db_error)?;

        Ok(Self {
            pool,
            retry: config.retry.to_retry_config(),
        })
    }

    async fn fetch_names(
        &self,
        sql: &'static str,
        schema: Option<&str>,
    ) -> Result<Vec<String>, SourceError> {
        let rows = retry(&self.retry, || async move {
            let mut query = sqlx::query(sql);
            if let Some(schema) = schema {
                query = query.bind(schema);
            }
            query.fetch_all(&self.pool).await.map_err(db_error)
        })
        .await?;

        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }
}

fn db_error(e: sqlx::Error) -> SourceError {
    SourceError::Database(e.to_string())
}

fn column_from_row(table: &TableRef, row: &PgRow) -> ColumnRecord {
    let name: String = row.get("column_name");
    let data_type: String = row.get("data_type");
    let is_nullable: String = row.get("is_nullable");
    let description: Option<String> = row.get("column_description");

    let mode = if is_nullable == "YES" {
        ColumnMode::Nullable
    } else {
        ColumnMode::Required
    };
    ColumnRecord::new(table, name, data_type, mode).with_description(description)
}

/// Single-query listing surfaced as a stream.
fn once_listing<'a, T: Send + 'a>(
    fut: impl Future<Output = Result<Vec<T>, SourceError>> + Send + 'a,
) -> BoxStream<'a, Result<T, SourceError>> {
    stream::once(fut)
        .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, SourceError>)))
        .try_flatten()
        .boxed()
}

#[async_trait]
impl MetadataSource for PostgresSource {
    fn name(&self) -> &str {
        "postgres"
    }

    fn list_datasets<'a>(
        &'a self,
        project_id: &'a str,
    ) -> BoxStream<'a, Result<DatasetRef, SourceError>> {
        once_listing(async move {
            let names = self.fetch_names(LIST_SCHEMAS, None).await?;
            Ok(names
                .into_iter()
                .map(|name| DatasetRef::new(project_id, name))
                .collect())
        })
    }

    fn list_tables<'a>(
        &'a self,
        dataset: &'a DatasetRef,
    ) -> BoxStream<'a, Result<TableRef, SourceError>> {
        once_listing(async move {
            let names = self
                .fetch_names(LIST_TABLES, Some(&dataset.dataset_name))
                .await?;
            Ok(names.into_iter().map(|name| dataset.table(name)).collect())
        })
    }

    async fn get_columns(&self, table: &TableRef) -> Result<Vec<ColumnRecord>, SourceError> {
        let rows = retry(&self.retry, || async move {
            sqlx::query(LIST_COLUMNS)
                .bind(&table.dataset_name)
                .bind(&table.table_name)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)
        })
        .await?;

        Ok(rows.iter().map(|row| column_from_row(table, row)).collect())
    }

    async fn health_check(&self) -> Result<bool, SourceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| true)
            .map_err(db_error)
    }
}
