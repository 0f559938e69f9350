//! ClickHouse client over the HTTP interface.
//!
//! Statements are sent as the POST body. Results are requested as
//! `JSONCompact`; user statements run with `readonly=1` so the server refuses
//! writes even if one slipped past validation.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::config::DatabaseConfig;
use crate::database::{DatabaseClient, DatabaseError, QueryRows};
use crate::schema::{ColumnSchema, TableSchema};

/// Concurrent sample-value queries per table.
const SAMPLE_CONCURRENCY: usize = 4;

/// ClickHouse HTTP client.
#[derive(Clone)]
pub struct ClickHouseClient {
    config: DatabaseConfig,
    client: Client,
}

impl std::fmt::Debug for ClickHouseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickHouseClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct CompactColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CompactResponse {
    #[serde(default)]
    meta: Vec<CompactColumn>,
    #[serde(default)]
    data: Vec<Vec<serde_json::Value>>,
}

impl ClickHouseClient {
    pub fn new(config: DatabaseConfig) -> Result<Self, DatabaseError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| DatabaseError::Unavailable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Send one statement and decode the `JSONCompact` body.
    async fn query(&self, sql: &str, readonly: bool) -> Result<QueryRows, DatabaseError> {
        let mut params = vec![
            ("database", self.config.database.as_str()),
            ("default_format", "JSONCompact"),
        ];
        // Applied last; later settings in the same request would be refused.
        if readonly {
            params.push(("readonly", "1"));
        }

        let mut request = self
            .client
            .post(self.config.url())
            .query(&params)
            .header("X-ClickHouse-User", &self.config.user)
            .body(sql.to_string());
        if let Some(ref password) = self.config.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DatabaseError::Unavailable(self.redact(&e.to_string())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DatabaseError::Unavailable(self.redact(&e.to_string())))?;

        if !status.is_success() {
            let message = self.redact(body.trim());
            tracing::debug!(status = status.as_u16(), error = %message, "ClickHouse query failed");
            return Err(if status.is_server_error() && message.is_empty() {
                DatabaseError::Unavailable(format!("HTTP {status}"))
            } else {
                DatabaseError::Execution(message)
            });
        }

        parse_compact(&body)
    }

    /// Replace the configured password wherever it appears in `message`.
    fn redact(&self, message: &str) -> String {
        match self.config.password.as_deref() {
            Some(password) if !password.is_empty() => message.replace(password, "***"),
            _ => message.to_string(),
        }
    }

    async fn list_tables(&self) -> Result<Vec<TableSchema>, DatabaseError> {
        let sql = format!(
            "SELECT name, comment, total_rows FROM system.tables \
             WHERE database = {} AND NOT is_temporary ORDER BY name",
            quote_literal(&self.config.database)
        );
        let rows = self.query(&sql, true).await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows.rows {
            let Some(name) = row.first().and_then(serde_json::Value::as_str) else {
                return Err(DatabaseError::Decode("table name is not a string".to_string()));
            };
            let mut table = TableSchema::new(name, Vec::new());
            if let Some(comment) = row.get(1).and_then(serde_json::Value::as_str) {
                if !comment.is_empty() {
                    table = table.with_description(comment);
                }
            }
            if let Some(rows) = row.get(2).and_then(as_u64) {
                table = table.with_row_count(rows);
            }
            tables.push(table);
        }
        Ok(tables)
    }

    async fn list_columns(&self, tables: &mut [TableSchema]) -> Result<(), DatabaseError> {
        let sql = format!(
            "SELECT table, name, type, comment FROM system.columns \
             WHERE database = {} ORDER BY table, position",
            quote_literal(&self.config.database)
        );
        let rows = self.query(&sql, true).await?;

        for row in rows.rows {
            let field = |i: usize| row.get(i).and_then(serde_json::Value::as_str);
            let (Some(table), Some(name), Some(data_type)) = (field(0), field(1), field(2)) else {
                return Err(DatabaseError::Decode("unexpected system.columns row".to_string()));
            };
            let Some(target) = tables.iter_mut().find(|t| t.name == table) else {
                continue;
            };
            let mut column = ColumnSchema::new(name, data_type);
            if let Some(comment) = field(3).filter(|c| !c.is_empty()) {
                column = column.with_description(comment);
            }
            target.columns.push(column);
        }
        Ok(())
    }

    /// Fill `sample_values` for every column. Failures leave a column
    /// without samples.
    async fn load_samples(&self, table: &mut TableSchema) {
        let limit = self.config.sample_values;
        if limit == 0 {
            return;
        }
        let table_name = table.name.clone();
        let queries: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                format!(
                    "SELECT DISTINCT {col} FROM {db}.{tbl} WHERE {col} IS NOT NULL LIMIT {limit}",
                    col = quote_identifier(&c.name),
                    db = quote_identifier(&self.config.database),
                    tbl = quote_identifier(&table_name),
                )
            })
            .collect();

        let table_name = table_name.as_str();
        let samples: Vec<Option<Vec<String>>> = stream::iter(queries)
            .map(|sql| async move {
                match self.query(&sql, true).await {
                    Ok(rows) => Some(
                        rows.rows
                            .iter()
                            .filter_map(|r| r.first())
                            .map(render_value)
                            .collect(),
                    ),
                    Err(e) => {
                        tracing::debug!(table = table_name, error = %e, "Sample value query failed");
                        None
                    }
                }
            })
            .buffered(SAMPLE_CONCURRENCY)
            .collect()
            .await;

        for (column, values) in table.columns.iter_mut().zip(samples) {
            if let Some(values) = values {
                column.sample_values = values;
            }
        }
    }
}

#[async_trait]
impl DatabaseClient for ClickHouseClient {
    async fn describe_schema(&self) -> Result<Vec<TableSchema>, DatabaseError> {
        let mut tables = self.list_tables().await?;
        self.list_columns(&mut tables).await?;
        for table in &mut tables {
            self.load_samples(table).await;
        }
        tracing::debug!(
            database = %self.config.database,
            tables = tables.len(),
            "Described ClickHouse schema"
        );
        Ok(tables)
    }

    async fn execute(&self, sql: &str) -> Result<QueryRows, DatabaseError> {
        self.query(sql, true).await
    }

    fn name(&self) -> &'static str {
        "clickhouse"
    }
}

fn parse_compact(body: &str) -> Result<QueryRows, DatabaseError> {
    if body.trim().is_empty() {
        return Ok(QueryRows::default());
    }
    let parsed: CompactResponse =
        serde_json::from_str(body).map_err(|e| DatabaseError::Decode(e.to_string()))?;
    Ok(QueryRows {
        columns: parsed.meta.into_iter().map(|c| c.name).collect(),
        rows: parsed.data,
    })
}

/// 64-bit integers arrive quoted by default.
fn as_u64(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact() {
        let body = r#"{
            "meta": [{"name": "name", "type": "String"}, {"name": "total", "type": "UInt64"}],
            "data": [["Acme", "120"], ["Globex", "80"]],
            "rows": 2,
            "statistics": {"elapsed": 0.001}
        }"#;
        let rows = parse_compact(body).unwrap();
        assert_eq!(rows.columns, vec!["name", "total"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows[0][0], "Acme");
        assert!(parse_compact("").unwrap().is_empty());
        assert!(matches!(parse_compact("not json"), Err(DatabaseError::Decode(_))));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_identifier("order`s"), "`order\\`s`");
        assert_eq!(quote_literal("it's"), "'it\\'s'");
    }

    #[test]
    fn test_numeric_helpers() {
        assert_eq!(as_u64(&serde_json::json!("42")), Some(42));
        assert_eq!(as_u64(&serde_json::json!(7)), Some(7));
        assert_eq!(as_u64(&serde_json::Value::Null), None);
        assert_eq!(render_value(&serde_json::json!(1.5)), "1.5");
        assert_eq!(render_value(&serde_json::json!("x")), "x");
    }

    #[test]
    fn test_redaction() {
        let client = ClickHouseClient::new(DatabaseConfig {
            password: Some("hunter2".to_string()),
            ..DatabaseConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.redact("auth failed for default:hunter2"),
            "auth failed for default:***"
        );
        assert!(!format!("{client:?}").contains("hunter2"));
    }
}
