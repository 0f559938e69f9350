//! Schema model: raw table descriptions, entities and versioned snapshots.
//!
//! A [`SchemaSnapshot`] is immutable once built. Refreshing the schema builds
//! a new snapshot with a higher revision; nothing is patched in place.

pub mod store;

pub use store::SchemaStore;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of sample values kept per column.
pub const MAX_SAMPLE_VALUES: usize = 3;

/// Column as described by the database client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_values: Vec<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            nullable: data_type.starts_with("Nullable("),
            data_type,
            description: None,
            sample_values: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_samples<I, S>(mut self, samples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sample_values = samples
            .into_iter()
            .take(MAX_SAMPLE_VALUES)
            .map(Into::into)
            .collect();
        self
    }
}

/// Table as described by the database client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            description: None,
            row_count: None,
            columns,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_row_count(mut self, rows: u64) -> Self {
        self.row_count = Some(rows);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// Kind of a schema entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Table,
    Column,
}

/// A table or a table+column pair used for retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntity {
    /// `table` for tables, `table.column` for columns.
    pub qualified_name: String,
    pub kind: EntityKind,
    /// Owning table (the entity itself for tables).
    pub table: String,
    /// Declared type, columns only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    pub nullable: bool,
    /// Position within the snapshot (tables) or within the table (columns).
    pub ordinal: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Text handed to the embedding provider.
    pub embedding_text: String,
}

impl SchemaEntity {
    pub fn is_table(&self) -> bool {
        self.kind == EntityKind::Table
    }
}

/// An inferred foreign-key style relationship, e.g. `orders.user_id -> users.id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.from_table, self.from_column, self.to_table, self.to_column
        )
    }
}

/// Structural problems found while building a snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Duplicate table '{0}' in schema description")]
    DuplicateTable(String),

    #[error("Duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    #[error("Table with an empty name in schema description")]
    EmptyTableName,
}

/// Immutable, versioned view of the database schema.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    revision: u64,
    refreshed_at: DateTime<Utc>,
    tables: Vec<TableSchema>,
    entities: Vec<SchemaEntity>,
    relationships: Vec<Relationship>,
    #[serde(skip)]
    table_index: HashMap<String, usize>,
    #[serde(skip)]
    entity_index: HashMap<String, usize>,
}

impl SchemaSnapshot {
    /// Build a snapshot from raw table descriptions.
    pub fn new(revision: u64, tables: Vec<TableSchema>) -> Result<Self, SchemaError> {
        let mut table_index = HashMap::with_capacity(tables.len());
        for (position, table) in tables.iter().enumerate() {
            if table.name.trim().is_empty() {
                return Err(SchemaError::EmptyTableName);
            }
            if table_index.insert(table.name.clone(), position).is_some() {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }
            let mut seen = std::collections::HashSet::new();
            for column in &table.columns {
                if !seen.insert(column.name.as_str()) {
                    return Err(SchemaError::DuplicateColumn {
                        table: table.name.clone(),
                        column: column.name.clone(),
                    });
                }
            }
        }

        let mut entities = Vec::new();
        for (position, table) in tables.iter().enumerate() {
            entities.push(SchemaEntity {
                qualified_name: table.name.clone(),
                kind: EntityKind::Table,
                table: table.name.clone(),
                data_type: None,
                nullable: false,
                ordinal: position,
                description: table.description.clone(),
                embedding_text: table_embedding_text(table),
            });
            for (ordinal, column) in table.columns.iter().enumerate() {
                entities.push(SchemaEntity {
                    qualified_name: format!("{}.{}", table.name, column.name),
                    kind: EntityKind::Column,
                    table: table.name.clone(),
                    data_type: Some(column.data_type.clone()),
                    nullable: column.nullable,
                    ordinal,
                    description: column.description.clone(),
                    embedding_text: column_embedding_text(&table.name, column),
                });
            }
        }

        let entity_index = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.qualified_name.clone(), i))
            .collect();
        let relationships = infer_relationships(&tables, &table_index);

        Ok(Self {
            revision,
            refreshed_at: Utc::now(),
            tables,
            entities,
            relationships,
            table_index,
            entity_index,
        })
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn entities(&self) -> &[SchemaEntity] {
        &self.entities
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.table_index.get(name).map(|&i| &self.tables[i])
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table_index.contains_key(name)
    }

    pub fn entity(&self, qualified_name: &str) -> Option<&SchemaEntity> {
        self.entity_index
            .get(qualified_name)
            .map(|&i| &self.entities[i])
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn table_embedding_text(table: &TableSchema) -> String {
    let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    let mut text = format!("Table {} with columns: {}", table.name, columns.join(", "));
    if let Some(description) = &table.description {
        text.push_str(". ");
        text.push_str(description);
    }

    let samples: Vec<String> = table
        .columns
        .iter()
        .take(5)
        .filter(|c| !c.sample_values.is_empty())
        .map(|c| {
            let values: Vec<&str> = c.sample_values.iter().take(2).map(String::as_str).collect();
            format!("{} contains {}", c.name, values.join(", "))
        })
        .collect();
    if !samples.is_empty() {
        text.push_str(". Sample data: ");
        text.push_str(&samples.join("; "));
    }
    text
}

fn column_embedding_text(table: &str, column: &ColumnSchema) -> String {
    let mut text = format!(
        "Column {} in table {} of type {}",
        column.name, table, column.data_type
    );
    if let Some(description) = &column.description {
        text.push_str(". ");
        text.push_str(description);
    }
    if !column.sample_values.is_empty() {
        text.push_str(" with example values: ");
        text.push_str(&column.sample_values.join(", "));
    }
    text
}

/// `<x>_id` columns point at table `<x>` or `<x>s` when that table has an `id` column.
fn infer_relationships(
    tables: &[TableSchema],
    table_index: &HashMap<String, usize>,
) -> Vec<Relationship> {
    let mut relationships = Vec::new();
    for table in tables {
        for column in &table.columns {
            let Some(stem) = column.name.strip_suffix("_id") else {
                continue;
            };
            if stem.is_empty() {
                continue;
            }
            let plural = format!("{stem}s");
            let target = [stem, plural.as_str()]
                .into_iter()
                .filter_map(|candidate| table_index.get(candidate).map(|&i| &tables[i]))
                .find(|t| t.name != table.name && t.has_column("id"));
            if let Some(target) = target {
                relationships.push(Relationship {
                    from_table: table.name.clone(),
                    from_column: column.name.clone(),
                    to_table: target.name.clone(),
                    to_column: "id".to_string(),
                });
            }
        }
    }
    relationships
}
