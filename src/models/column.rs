//! Catalog references and the column-level record that gets vectorized.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::calculate_checksum;

/// A dataset (BigQuery dataset, Postgres schema) inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetRef {
    pub project_id: String,
    pub dataset_name: String,
}

impl DatasetRef {
    pub fn new(project_id: impl Into<String>, dataset_name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_name: dataset_name.into(),
        }
    }

    pub fn table(&self, table_name: impl Into<String>) -> TableRef {
        TableRef {
            project_id: self.project_id.clone(),
            dataset_name: self.dataset_name.clone(),
            table_name: table_name.into(),
        }
    }
}

/// A table inside a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_name: String,
    pub table_name: String,
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.project_id, self.dataset_name, self.table_name
        )
    }
}

/// Column mode as reported by the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnMode {
    Required,
    #[default]
    Nullable,
    Repeated,
}

impl std::str::FromStr for ColumnMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "REQUIRED" => Ok(ColumnMode::Required),
            "NULLABLE" | "" => Ok(ColumnMode::Nullable),
            "REPEATED" => Ok(ColumnMode::Repeated),
            _ => Err(format!("unknown column mode: {}", s)),
        }
    }
}

impl fmt::Display for ColumnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnMode::Required => write!(f, "REQUIRED"),
            ColumnMode::Nullable => write!(f, "NULLABLE"),
            ColumnMode::Repeated => write!(f, "REPEATED"),
        }
    }
}

/// Stable key that correlates a column across generations.
///
/// Ordering is lexical field by field, which is what search uses to break
/// score ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnIdentity {
    pub project_id: String,
    pub dataset_name: String,
    pub table_name: String,
    pub column_name: String,
}

impl ColumnIdentity {
    pub fn new(table: &TableRef, column_name: impl Into<String>) -> Self {
        Self {
            project_id: table.project_id.clone(),
            dataset_name: table.dataset_name.clone(),
            table_name: table.table_name.clone(),
            column_name: column_name.into(),
        }
    }
}

impl fmt::Display for ColumnIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.project_id, self.dataset_name, self.table_name, self.column_name
        )
    }
}

/// One vectorizable unit: a single column of a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRecord {
    #[serde(flatten)]
    pub identity: ColumnIdentity,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_nullable: bool,
    pub mode: ColumnMode,
}

impl ColumnRecord {
    pub fn new(
        table: &TableRef,
        column_name: impl Into<String>,
        data_type: impl Into<String>,
        mode: ColumnMode,
    ) -> Self {
        Self {
            identity: ColumnIdentity::new(table, column_name),
            data_type: data_type.into(),
            description: None,
            is_nullable: mode == ColumnMode::Nullable,
            mode,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self
    }

    /// Text handed to the embedding provider for this column.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![
            format!("Column Name: {}", self.identity.column_name),
            format!("Data Type: {}", self.data_type),
            format!(
                "Table: {}.{}",
                self.identity.dataset_name, self.identity.table_name
            ),
        ];
        if let Some(ref description) = self.description {
            parts.push(format!("Description: {}", description));
        }
        parts.join(" | ")
    }

    /// Hash of the embedding text; equal hashes mean the stored vector is reusable.
    pub fn content_hash(&self) -> String {
        calculate_checksum(&self.embedding_text())
    }
}
