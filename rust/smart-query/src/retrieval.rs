//! Schema context assembly for SQL synthesis.
//!
//! The retriever embeds the question, searches the pinned index generation
//! and expands every hit to its whole table. When semantic retrieval is not
//! possible the orchestrator falls back to [`RetrievalContext::full_schema`].

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use crate::embedding::{EmbeddingIndex, IndexGeneration, ScoredEntity};
use crate::error::{PipelineError, PipelineResult};
use crate::schema::{Relationship, SchemaSnapshot, TableSchema};

/// Schema subset handed to the synthesizer.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalContext {
    revision: u64,
    tables: Vec<TableSchema>,
    matched: Vec<ScoredEntity>,
    relationships: Vec<Relationship>,
    fallback: bool,
}

impl RetrievalContext {
    /// Every table of `snapshot` in snapshot order, bounded by `budget`
    /// entities (one per table plus one per column).
    ///
    /// A table that does not fit is dropped, except the first one, which is
    /// truncated to the budget so the context is never empty.
    pub fn full_schema(snapshot: &SchemaSnapshot, budget: usize) -> Self {
        let mut tables = Vec::new();
        let mut used = 0usize;

        for table in snapshot.tables() {
            let cost = 1 + table.columns.len();
            if used + cost <= budget {
                tables.push(table.clone());
                used += cost;
            } else if tables.is_empty() && budget > 0 {
                let mut truncated = table.clone();
                truncated.columns.truncate(budget - 1);
                tables.push(truncated);
                break;
            } else {
                break;
            }
        }

        if tables.len() < snapshot.tables().len() {
            tracing::debug!(
                included = tables.len(),
                total = snapshot.tables().len(),
                budget,
                "Full-schema context truncated by entity budget"
            );
        }

        Self::assemble(snapshot, tables, Vec::new(), true)
    }

    fn assemble(
        snapshot: &SchemaSnapshot,
        tables: Vec<TableSchema>,
        matched: Vec<ScoredEntity>,
        fallback: bool,
    ) -> Self {
        let included: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        let relationships = snapshot
            .relationships()
            .iter()
            .filter(|r| {
                included.contains(r.from_table.as_str()) && included.contains(r.to_table.as_str())
            })
            .filter(|r| {
                tables.iter().any(|t| t.name == r.from_table && t.has_column(&r.from_column))
            })
            .cloned()
            .collect();

        Self {
            revision: snapshot.revision(),
            tables,
            matched,
            relationships,
            fallback,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Search hits that selected the tables; empty for a fallback context.
    pub fn matched(&self) -> &[ScoredEntity] {
        &self.matched
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Whether this is the full-schema fallback rather than a semantic match.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Number of entities in the context.
    pub fn entity_count(&self) -> usize {
        self.tables.iter().map(|t| 1 + t.columns.len()).sum()
    }

    /// Deterministic text for the prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, table) in self.tables.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            match table.row_count {
                Some(rows) => {
                    let _ = writeln!(out, "Table: {} ({rows} rows)", table.name);
                }
                None => {
                    let _ = writeln!(out, "Table: {}", table.name);
                }
            }
            if let Some(description) = &table.description {
                let _ = writeln!(out, "Description: {description}");
            }
            out.push_str("Columns:\n");
            for column in &table.columns {
                let _ = write!(out, "  - {} ({}", column.name, column.data_type);
                if column.nullable {
                    out.push_str(", nullable");
                }
                out.push(')');
                if let Some(description) = &column.description {
                    let _ = write!(out, ": {description}");
                }
                if !column.sample_values.is_empty() {
                    let _ = write!(out, " [examples: {}]", column.sample_values.join(", "));
                }
                out.push('\n');
            }
        }

        if !self.relationships.is_empty() {
            out.push_str("\nRelationships:\n");
            for relationship in &self.relationships {
                let _ = writeln!(out, "  - {relationship}");
            }
        }
        out.trim_end().to_string()
    }
}

/// Selects the schema subset relevant to a question.
#[derive(Debug, Clone)]
pub struct ContextRetriever {
    index: Arc<EmbeddingIndex>,
}

impl ContextRetriever {
    pub fn new(index: Arc<EmbeddingIndex>) -> Self {
        Self { index }
    }

    /// Top `k` entities for `question`, expanded to whole tables ordered by
    /// their best hit.
    pub async fn retrieve(
        &self,
        question: &str,
        generation: &IndexGeneration,
        k: usize,
    ) -> PipelineResult<RetrievalContext> {
        if k == 0 || generation.is_empty() {
            return Err(PipelineError::RetrievalEmpty);
        }

        let vector = self.index.provider().embed(question).await?;
        let hits = generation.similarity_search(&vector, k)?;
        let snapshot = generation.snapshot();

        let mut seen = HashSet::new();
        let mut tables = Vec::new();
        for hit in &hits {
            let Some(entity) = snapshot.entity(&hit.qualified_name) else {
                continue;
            };
            if seen.insert(entity.table.as_str()) {
                if let Some(table) = snapshot.table(&entity.table) {
                    tables.push(table.clone());
                }
            }
        }
        if tables.is_empty() {
            return Err(PipelineError::RetrievalEmpty);
        }

        tracing::debug!(
            revision = generation.revision(),
            hits = hits.len(),
            tables = ?tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Retrieved schema context"
        );
        Ok(RetrievalContext::assemble(snapshot, tables, hits, false))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::embedding::{EmbeddingProvider, HashingEmbedder};
    use crate::error::ProviderError;
    use crate::schema::ColumnSchema;

    /// The weight column matches exactly; every orders entity is close.
    struct WeightEmbedder;

    #[async_trait]
    impl EmbeddingProvider for WeightEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts
                .iter()
                .map(|text| {
                    if text == "parcel weight" || text.starts_with("Column weight ") {
                        vec![1.0, 0.0, 0.0]
                    } else if text.starts_with("Table orders ") || text.contains(" in table orders ")
                    {
                        vec![0.8, 0.6, 0.0]
                    } else {
                        vec![0.0, 0.0, 1.0]
                    }
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            3
        }

        fn name(&self) -> &'static str {
            "weight"
        }
    }

    fn snapshot() -> Arc<SchemaSnapshot> {
        Arc::new(
            SchemaSnapshot::new(
                3,
                vec![
                    TableSchema::new(
                        "customers",
                        vec![
                            ColumnSchema::new("id", "UInt64"),
                            ColumnSchema::new("name", "String").with_samples(["Acme", "Globex"]),
                            ColumnSchema::new("revenue", "Float64"),
                        ],
                    )
                    .with_row_count(42),
                    TableSchema::new(
                        "orders",
                        vec![
                            ColumnSchema::new("id", "UInt64"),
                            ColumnSchema::new("customer_id", "UInt64"),
                            ColumnSchema::new("status", "Nullable(String)"),
                        ],
                    )
                    .with_description("One row per order"),
                    TableSchema::new(
                        "products",
                        vec![
                            ColumnSchema::new("sku", "String"),
                            ColumnSchema::new("weight", "Float32"),
                        ],
                    ),
                ],
            )
            .unwrap(),
        )
    }

    async fn retriever() -> (ContextRetriever, Arc<IndexGeneration>) {
        let index = Arc::new(EmbeddingIndex::new(Arc::new(HashingEmbedder::new(256)), 16));
        let generation = index.build(snapshot()).await.unwrap();
        (ContextRetriever::new(index), generation)
    }

    #[tokio::test]
    async fn test_retrieve_expands_to_tables() {
        let (retriever, generation) = retriever().await;
        let context = retriever
            .retrieve("customers with the highest revenue", &generation, 2)
            .await
            .unwrap();
        assert_eq!(context.table_names()[0], "customers");
        assert_eq!(context.tables()[0].columns.len(), 3);
        assert_eq!(context.revision(), 3);
        assert!(!context.is_fallback());
        assert_eq!(context.matched().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_k_is_empty() {
        let (retriever, generation) = retriever().await;
        assert!(matches!(
            retriever.retrieve("anything", &generation, 0).await,
            Err(PipelineError::RetrievalEmpty)
        ));
    }

    #[test]
    fn test_full_schema_budget() {
        let snapshot = snapshot();
        let all = RetrievalContext::full_schema(&snapshot, 200);
        assert_eq!(all.table_names(), vec!["customers", "orders", "products"]);
        assert!(all.is_fallback());

        let two = RetrievalContext::full_schema(&snapshot, 8);
        assert_eq!(two.table_names(), vec!["customers", "orders"]);
        assert_eq!(two.entity_count(), 8);

        let truncated = RetrievalContext::full_schema(&snapshot, 2);
        assert_eq!(truncated.table_names(), vec!["customers"]);
        assert_eq!(truncated.entity_count(), 2);

        assert!(RetrievalContext::full_schema(&snapshot, 0).tables().is_empty());
    }

    #[test]
    fn test_render() {
        let context = RetrievalContext::full_schema(&snapshot(), 8);
        let text = context.render();
        assert!(text.starts_with("Table: customers (42 rows)\nColumns:\n  - id (UInt64)\n"));
        assert!(text.contains("  - name (String) [examples: Acme, Globex]\n"));
        assert!(text.contains("Table: orders\nDescription: One row per order\n"));
        assert!(text.contains("  - status (Nullable(String), nullable)"));
        assert!(text.ends_with("Relationships:\n  - orders.customer_id -> customers.id"));
        assert_eq!(text, context.render());
    }

    #[tokio::test]
    async fn test_tables_ordered_by_best_hit() {
        let index = Arc::new(EmbeddingIndex::new(Arc::new(WeightEmbedder), 16));
        let generation = index.build(snapshot()).await.unwrap();
        let retriever = ContextRetriever::new(index);

        let context = retriever.retrieve("parcel weight", &generation, 4).await.unwrap();

        // orders has three hits, products only one, but products holds the best.
        assert_eq!(context.table_names(), vec!["products", "orders"]);
        let matched: Vec<&str> = context
            .matched()
            .iter()
            .map(|h| h.qualified_name.as_str())
            .collect();
        assert_eq!(
            matched,
            vec!["products.weight", "orders", "orders.customer_id", "orders.id"]
        );
    }
}
