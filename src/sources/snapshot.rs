//! Catalog read from a JSON snapshot file.
//!
//! Useful for offline extraction and as a deterministic fixture. The file
//! layout mirrors the warehouse hierarchy:
//!
//! ```json
//! {"projects": [{"project_id": "acme", "datasets": [{"name": "sales",
//!   "tables": [{"name": "orders", "columns": [
//!     {"name": "order_id", "data_type": "INT64", "mode": "REQUIRED"}]}]}]}]}
//! ```

use std::path::Path;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use super::MetadataSource;
use crate::error::SourceError;
use crate::models::{ColumnMode, ColumnRecord, DatasetRef, TableRef};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub projects: Vec<SnapshotProject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotProject {
    pub project_id: String,
    #[serde(default)]
    pub datasets: Vec<SnapshotDataset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDataset {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<SnapshotTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTable {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<SnapshotColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotColumn {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub mode: ColumnMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SnapshotColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            mode: ColumnMode::Nullable,
            description: None,
        }
    }

    pub fn with_mode(mut self, mode: ColumnMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub struct SnapshotSource {
    catalog: CatalogSnapshot,
}

impl SnapshotSource {
    pub fn new(catalog: CatalogSnapshot) -> Self {
        Self { catalog }
    }

    pub fn from_path(path: &Path) -> Result<Self, SourceError> {
        let content = std::fs::read_to_string(path)?;
        let catalog = serde_json::from_str(&content)
            .map_err(|e| SourceError::ParseError(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(catalog))
    }

    fn project(&self, project_id: &str) -> Result<&SnapshotProject, SourceError> {
        self.catalog
            .projects
            .iter()
            .find(|p| p.project_id == project_id)
            .ok_or_else(|| SourceError::NotFound(format!("project {}", project_id)))
    }

    fn dataset(&self, dataset: &DatasetRef) -> Result<&SnapshotDataset, SourceError> {
        self.project(&dataset.project_id)?
            .datasets
            .iter()
            .find(|d| d.name == dataset.dataset_name)
            .ok_or_else(|| {
                SourceError::NotFound(format!(
                    "dataset {}.{}",
                    dataset.project_id, dataset.dataset_name
                ))
            })
    }
}

fn listing<'a, T: Send + 'a>(
    items: Result<Vec<T>, SourceError>,
) -> BoxStream<'a, Result<T, SourceError>> {
    match items {
        Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
        Err(e) => stream::once(async move { Err(e) }).boxed(),
    }
}

#[async_trait]
impl MetadataSource for SnapshotSource {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn list_datasets<'a>(
        &'a self,
        project_id: &'a str,
    ) -> BoxStream<'a, Result<DatasetRef, SourceError>> {
        listing(self.project(project_id).map(|project| {
            project
                .datasets
                .iter()
                .map(|d| DatasetRef::new(project_id, d.name.clone()))
                .collect()
        }))
    }

    fn list_tables<'a>(
        &'a self,
        dataset: &'a DatasetRef,
    ) -> BoxStream<'a, Result<TableRef, SourceError>> {
        listing(self.dataset(dataset).map(|d| {
            d.tables
                .iter()
                .map(|t| dataset.table(t.name.clone()))
                .collect()
        }))
    }

    async fn get_columns(&self, table: &TableRef) -> Result<Vec<ColumnRecord>, SourceError> {
        let dataset = DatasetRef::new(table.project_id.clone(), table.dataset_name.clone());
        let snapshot_table = self
            .dataset(&dataset)?
            .tables
            .iter()
            .find(|t| t.name == table.table_name)
            .ok_or_else(|| SourceError::NotFound(format!("table {}", table)))?;

        Ok(snapshot_table
            .columns
            .iter()
            .map(|c| {
                ColumnRecord::new(table, c.name.clone(), c.data_type.clone(), c.mode)
                    .with_description(c.description.clone())
            })
            .collect())
    }
}
