//! End-to-end pipeline scenarios against in-memory doubles.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{MockDatabase, ScriptedLlm, json_sql, orchestrator, test_config};
use smart_query::error::{ProviderError, ReasonCode, Stage};

#[tokio::test]
async fn test_top_customers_by_revenue() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering(
        "SELECT name, revenue FROM customers ORDER BY revenue DESC LIMIT 10",
    ));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.process("Show me the top 10 customers by revenue").await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.stage, Stage::Completed);
    let sql = result.sql.unwrap();
    assert!(sql.ends_with("LIMIT 10"));
    assert!(!sql.contains("LIMIT 1000"));
    assert!(result.relevant_tables.contains(&"customers".to_string()));
    assert!(!result.fallback_context);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.row_count, Some(2));
    assert_eq!(result.revision, Some(1));

    // First request refreshed the schema lazily.
    assert_eq!(db.describe_count(), 1);
    assert_eq!(db.executed().len(), 1);
    assert!(llm.prompt(0).user.contains("Table: customers (1200 rows)"));
}

#[tokio::test]
async fn test_unknown_table_fails_after_one_retry() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering("SELECT * FROM invoices"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.process("list all invoices").await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.stage, Stage::Validating);
    assert_eq!(error.reason_code, ReasonCode::UnknownIdentifier);
    assert_eq!(error.identifiers, vec!["invoices"]);
    assert_eq!(result.attempts, 2);
    assert_eq!(llm.calls(), 2);

    let retry = llm.prompt(1).user;
    assert!(retry.contains("UnknownIdentifier"));
    assert!(retry.contains("These names do not exist in the schema: invoices"));
    assert!(!retry.contains("SELECT * FROM invoices"));
    assert!(db.executed().is_empty());
}

#[tokio::test]
async fn test_retry_can_recover() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::new(vec![
        Ok(json_sql("SELECT revenue FROM clients")),
        Ok(json_sql("SELECT revenue FROM customers")),
    ]));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.process("total revenue per customer").await;

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(
        result.sql.as_deref(),
        Some("SELECT revenue FROM customers LIMIT 1000")
    );
}

#[tokio::test]
async fn test_provider_timeout_hides_prompt() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::timing_out());
    let pipeline = orchestrator(test_config(), &db, &llm);

    let question = "top 10 customers by revenue";
    let result = pipeline.process(question).await;

    let error = result.error.unwrap();
    assert_eq!(error.stage, Stage::Synthesizing);
    assert_eq!(error.reason_code, ReasonCode::ProviderError);
    assert!(!error.message.contains(question));
    assert!(!error.message.contains("Schema:"));
    assert!(!error.message.contains("SQL expert"));
    // Provider errors consume the single retry.
    assert_eq!(llm.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_provider_timeouts_fit_default_deadline() {
    let config = test_config();
    let llm_timeout = Duration::from_secs(config.llm.timeout_secs);
    let db = Arc::new(MockDatabase::new());
    // Each attempt runs the full LLM timeout before failing.
    let llm = Arc::new(ScriptedLlm::timing_out().with_delay(llm_timeout + Duration::from_millis(50)));
    let pipeline = orchestrator(config, &db, &llm);

    let result = pipeline.process("top 10 customers by revenue").await;

    let error = result.error.unwrap();
    assert_eq!(error.stage, Stage::Synthesizing);
    assert_eq!(error.reason_code, ReasonCode::ProviderError);
    assert_eq!(result.attempts, 2);
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_provider_error_then_success() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::new(vec![
        Err(ProviderError::Http {
            status: 503,
            message: "overloaded".to_string(),
        }),
        Ok(json_sql("SELECT count() FROM orders")),
    ]));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.process("how many orders are there").await;

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    // A provider failure is retried with the original prompt.
    assert_eq!(llm.prompt(0), llm.prompt(1));
}

#[tokio::test(start_paused = true)]
async fn test_request_deadline() {
    let mut config = test_config();
    config.pipeline.request_timeout_secs = 1;
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(
        ScriptedLlm::answering("SELECT name FROM customers").with_delay(Duration::from_secs(5)),
    );
    let pipeline = orchestrator(config, &db, &llm);

    let result = pipeline.process("customer names").await;

    let error = result.error.unwrap();
    assert_eq!(error.stage, Stage::Synthesizing);
    assert_eq!(error.reason_code, ReasonCode::RequestTimeout);
    assert_eq!(result.attempts, 1);
    assert!(db.executed().is_empty());
}

#[tokio::test]
async fn test_zero_k_uses_bounded_full_schema() {
    let mut config = test_config();
    config.retrieval.top_k = 0;
    config.retrieval.fallback_entity_budget = 6;
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering("SELECT name FROM customers LIMIT 5"));
    let pipeline = orchestrator(config, &db, &llm);

    let result = pipeline.process("five customer names").await;

    assert!(result.success);
    assert!(result.fallback_context);
    assert_eq!(result.relevant_tables, vec!["customers"]);
    let prompt = llm.prompt(0).user;
    assert!(prompt.contains("Table: customers"));
    assert!(!prompt.contains("Table: orders"));
}

#[tokio::test]
async fn test_cache_hit_skips_provider() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering("SELECT name FROM customers"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let first = pipeline.process("Customer names").await;
    let second = pipeline.process("  customer   NAMES ").await;

    assert!(first.success && !first.cached);
    assert!(second.success && second.cached);
    assert_eq!(second.sql, first.sql);
    assert_eq!(llm.calls(), 1);
    // Cache hits still execute.
    assert_eq!(db.executed().len(), 2);
}

#[tokio::test]
async fn test_refresh_clears_cache() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering("SELECT name FROM customers"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    assert!(pipeline.process("customer names").await.success);
    let summary = pipeline.refresh_schema().await.unwrap();
    assert_eq!(summary.revision, 2);
    assert_eq!(summary.index_revision, 2);
    assert_eq!(summary.tables, 3);

    let again = pipeline.process("customer names").await;
    assert!(!again.cached);
    assert_eq!(again.revision, Some(2));
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_refreshes_collapse() {
    let db = Arc::new(MockDatabase::new().with_delay(Duration::from_millis(50)));
    let llm = Arc::new(ScriptedLlm::answering("SELECT 1"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let results = futures::future::join_all((0..5).map(|_| pipeline.refresh_schema())).await;

    assert_eq!(db.describe_count(), 1);
    for summary in results {
        assert_eq!(summary.unwrap().revision, 1);
    }
}

#[tokio::test]
async fn test_concurrent_first_requests_refresh_once() {
    let db = Arc::new(MockDatabase::new().with_delay(Duration::from_millis(50)));
    let llm = Arc::new(ScriptedLlm::answering("SELECT name FROM customers"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let results = futures::future::join_all([
        pipeline.generate("customer names"),
        pipeline.generate("customer revenue"),
        pipeline.generate("customer countries"),
    ])
    .await;

    assert!(results.iter().all(|r| r.success));
    assert_eq!(db.describe_count(), 1);
}

#[tokio::test]
async fn test_invalid_questions() {
    let mut config = test_config();
    config.pipeline.max_question_chars = 20;
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering("SELECT 1"));
    let pipeline = orchestrator(config, &db, &llm);

    for question in ["", "   \n\t", "this question is far too long to accept"] {
        let result = pipeline.process(question).await;
        let error = result.error.unwrap();
        assert_eq!(error.stage, Stage::Received);
        assert_eq!(error.reason_code, ReasonCode::InvalidQuestion);
    }
    assert_eq!(llm.calls(), 0);
    assert_eq!(db.describe_count(), 0);
}

#[tokio::test]
async fn test_schema_unavailable() {
    let db = Arc::new(MockDatabase::new());
    db.fail_describe.store(true, Ordering::SeqCst);
    let llm = Arc::new(ScriptedLlm::answering("SELECT 1"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.process("customer names").await;

    let error = result.error.unwrap();
    assert_eq!(error.stage, Stage::Retrieving);
    assert_eq!(error.reason_code, ReasonCode::SchemaUnavailable);
    assert!(!error.message.contains("connection refused"));
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_prose_response_is_synthesis_empty() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::new(vec![Ok(
        "I could not find that information in the schema.".to_string(),
    )]));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.process("what is the weather").await;

    let error = result.error.unwrap();
    assert_eq!(error.stage, Stage::Synthesizing);
    assert_eq!(error.reason_code, ReasonCode::SynthesisEmpty);
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn test_write_statement_is_terminal() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering("DELETE FROM orders WHERE status = 'refunded'"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.process("remove refunded orders").await;

    let error = result.error.unwrap();
    assert_eq!(error.stage, Stage::Validating);
    assert_eq!(error.reason_code, ReasonCode::DisallowedStatement);
    assert_eq!(llm.calls(), 1);
    assert!(db.executed().is_empty());
}

#[tokio::test]
async fn test_generate_does_not_execute() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering(
        "SELECT status, count() AS n FROM orders GROUP BY status",
    ));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.generate("orders per status").await;

    assert!(result.success);
    assert_eq!(
        result.sql.as_deref(),
        Some("SELECT status, count() AS n FROM orders GROUP BY status LIMIT 1000")
    );
    assert!(result.rows.is_none());
    assert!(db.executed().is_empty());
}

#[tokio::test]
async fn test_execute_sql() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering("SELECT 1"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let accepted = pipeline.execute_sql("SELECT name FROM customers;").await;
    assert!(accepted.success);
    assert_eq!(db.executed(), vec!["SELECT name FROM customers LIMIT 1000"]);

    let rejected = pipeline.execute_sql("DROP TABLE customers").await;
    let error = rejected.error.unwrap();
    assert_eq!(error.stage, Stage::Validating);
    assert_eq!(error.reason_code, ReasonCode::DisallowedStatement);
    assert_eq!(db.executed().len(), 1);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_execution_error() {
    let db = Arc::new(MockDatabase::new());
    db.fail_execute.store(true, Ordering::SeqCst);
    let llm = Arc::new(ScriptedLlm::answering("SELECT name FROM customers"));
    let pipeline = orchestrator(test_config(), &db, &llm);

    let result = pipeline.process("customer names").await;

    let error = result.error.unwrap();
    assert_eq!(error.stage, Stage::Executing);
    assert_eq!(error.reason_code, ReasonCode::ExecutionError);
}

#[tokio::test]
async fn test_store_refresh_triggers_rebuild() {
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering("SELECT name FROM customers"));
    let pipeline = orchestrator(test_config(), &db, &llm);
    let watcher = pipeline.spawn_invalidation();

    pipeline.refresh_schema().await.unwrap();
    assert!(pipeline.process("customer names").await.success);

    let snapshot = pipeline.store().refresh().await.unwrap();
    assert_eq!(snapshot.revision(), 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.index().published_revision() != Some(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let status = pipeline.status().await;
    assert!(status.is_ready());
    assert_eq!(status.cache.total_entries, 0);
    watcher.abort();
}
