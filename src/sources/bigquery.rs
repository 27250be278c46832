//! BigQuery catalog adapter over the REST v2 API.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{MetadataSource, Page, paginate};
use crate::error::SourceError;
use crate::models::{CatalogConfig, ColumnMode, ColumnRecord, DatasetRef, TableRef};
use crate::utils::{RetryConfig, retry};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetEntry {
    dataset_reference: DatasetReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableEntry {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    #[serde(default)]
    schema: Option<TableSchema>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    fields: Vec<SchemaField>,
}

/// Reads datasets, tables and schemas through `bigquery.googleapis.com`.
pub struct BigQuerySource {
    client: Client,
    base_url: String,
    access_token: Option<String>,
    page_size: u32,
    retry: RetryConfig,
}

impl BigQuerySource {
    pub fn new(config: &CatalogConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            page_size: config.page_size.max(1),
            retry: config.retry.to_retry_config(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn page_query(&self, token: Option<String>) -> Vec<(&'static str, String)> {
        let mut query = vec![("maxResults", self.page_size.to_string())];
        if let Some(token) = token {
            query.push(("pageToken", token));
        }
        query
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&'static str, String)],
    ) -> Result<T, SourceError> {
        retry(&self.retry, || async move {
            let mut request = self.client.get(url).query(query);
            if let Some(ref token) = self.access_token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::from_status(status.as_u16(), body));
            }

            response
                .json::<T>()
                .await
                .map_err(|e| SourceError::ParseError(e.to_string()))
        })
        .await
    }
}

/// Flatten a schema into column records; nested RECORD fields become
/// `parent.child` columns after their parent.
fn flatten_fields(
    table: &TableRef,
    prefix: Option<&str>,
    fields: Vec<SchemaField>,
    out: &mut Vec<ColumnRecord>,
) -> Result<(), SourceError> {
    for field in fields {
        let name = match prefix {
            Some(prefix) => format!("{}.{}", prefix, field.name),
            None => field.name,
        };
        let mode: ColumnMode = field
            .mode
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(SourceError::ParseError)?;

        out.push(
            ColumnRecord::new(table, name.clone(), field.field_type, mode)
                .with_description(field.description),
        );

        if !field.fields.is_empty() {
            flatten_fields(table, Some(&name), field.fields, out)?;
        }
    }
    Ok(())
}

#[async_trait]
impl MetadataSource for BigQuerySource {
    fn name(&self) -> &str {
        "bigquery"
    }

    fn list_datasets<'a>(
        &'a self,
        project_id: &'a str,
    ) -> BoxStream<'a, Result<DatasetRef, SourceError>> {
        let url = format!("{}/projects/{}/datasets", self.base_url, project_id);
        paginate(move |token| {
            let url = url.clone();
            async move {
                let list: DatasetList = self.get_json(&url, &self.page_query(token)).await?;
                Ok(Page {
                    items: list
                        .datasets
                        .into_iter()
                        .map(|d| DatasetRef::new(project_id, d.dataset_reference.dataset_id))
                        .collect(),
                    next_page_token: list.next_page_token,
                })
            }
        })
    }

    fn list_tables<'a>(
        &'a self,
        dataset: &'a DatasetRef,
    ) -> BoxStream<'a, Result<TableRef, SourceError>> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables",
            self.base_url, dataset.project_id, dataset.dataset_name
        );
        paginate(move |token| {
            let url = url.clone();
            async move {
                let list: TableList = self.get_json(&url, &self.page_query(token)).await?;
                Ok(Page {
                    items: list
                        .tables
                        .into_iter()
                        .map(|t| dataset.table(t.table_reference.table_id))
                        .collect(),
                    next_page_token: list.next_page_token,
                })
            }
        })
    }

    async fn get_columns(&self, table: &TableRef) -> Result<Vec<ColumnRecord>, SourceError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.base_url, table.project_id, table.dataset_name, table.table_name
        );
        let resource: TableResource = self.get_json(&url, &[]).await?;

        let mut columns = Vec::new();
        if let Some(schema) = resource.schema {
            flatten_fields(table, None, schema.fields, &mut columns)?;
        }
        Ok(columns)
    }

    async fn health_check(&self) -> Result<bool, SourceError> {
        Ok(self.access_token.is_some())
    }
}
