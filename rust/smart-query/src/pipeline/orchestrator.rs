use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::cache::{CachedSql, QueryCache};
use super::{PipelineStatus, QueryResult, RefreshSummary};
use crate::config::AppConfig;
use crate::database::{DatabaseClient, QueryRows};
use crate::embedding::{EmbeddingIndex, EmbeddingProvider, IndexGeneration};
use crate::error::{PipelineError, PipelineResult, Stage, StageError};
use crate::llm::LlmProvider;
use crate::logging::OpTimer;
use crate::retrieval::{ContextRetriever, RetrievalContext};
use crate::schema::{SchemaSnapshot, SchemaStore};
use crate::sql::{SqlSynthesizer, SqlValidator, SynthesisFeedback, ValidationVerdict};

/// Whether a request runs the accepted SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Execute,
    GenerateOnly,
}

/// Schema state a request is pinned to.
struct Pinned {
    snapshot: Arc<SchemaSnapshot>,
    generation: Option<Arc<IndexGeneration>>,
}

/// Drives questions through retrieval, synthesis, validation and execution.
pub struct QueryOrchestrator {
    config: AppConfig,
    store: Arc<SchemaStore>,
    index: Arc<EmbeddingIndex>,
    retriever: ContextRetriever,
    synthesizer: SqlSynthesizer,
    validator: SqlValidator,
    database: Arc<dyn DatabaseClient>,
    cache: QueryCache,
    /// Revision the cache entries belong to; zero before the first snapshot.
    cache_revision: AtomicU64,
}

impl std::fmt::Debug for QueryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOrchestrator")
            .field("store", &self.store)
            .field("index", &self.index)
            .field("synthesizer", &self.synthesizer)
            .field("database", &self.database.name())
            .finish_non_exhaustive()
    }
}

impl QueryOrchestrator {
    pub fn new(
        config: AppConfig,
        database: Arc<dyn DatabaseClient>,
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let store = Arc::new(SchemaStore::new(Arc::clone(&database)));
        let index = Arc::new(EmbeddingIndex::new(embedder, config.embedding.batch_size));
        let retriever = ContextRetriever::new(Arc::clone(&index));
        let synthesizer = SqlSynthesizer::new(llm, config.validator.dialect);
        let validator = SqlValidator::new(config.validator.clone());
        let cache = QueryCache::new(
            config.pipeline.cache_ttl(),
            config.pipeline.cache_max_entries,
        );

        Self {
            config,
            store,
            index,
            retriever,
            synthesizer,
            validator,
            database,
            cache,
            cache_revision: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SchemaStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Answer `question` and execute the resulting SQL.
    pub async fn process(&self, question: &str) -> QueryResult {
        self.run_question(question, Mode::Execute).await
    }

    /// Produce validated SQL for `question` without executing it.
    pub async fn generate(&self, question: &str) -> QueryResult {
        self.run_question(question, Mode::GenerateOnly).await
    }

    /// Validate caller-provided SQL and execute it if accepted.
    pub async fn execute_sql(&self, sql: &str) -> QueryResult {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("execute_sql", %request_id);
        async {
            let started = Instant::now();
            let deadline = started + self.config.pipeline.request_timeout();
            let mut result = QueryResult::new(request_id, None);

            if let Err(err) = self.execute_sql_inner(sql, deadline, &mut result).await {
                result.fail(&err);
            }
            self.finish(&mut result, started);
            result
        }
        .instrument(span)
        .await
    }

    /// Refresh the schema, rebuild the index and clear the cache.
    ///
    /// Concurrent calls share one database round trip.
    pub async fn refresh_schema(&self) -> PipelineResult<RefreshSummary> {
        let timer = OpTimer::new("pipeline", "refresh_schema");
        let result = self.refresh_and_build().await;
        timer.finish_with_result(result.as_ref());

        let generation = result?;
        let snapshot = generation.snapshot();
        Ok(RefreshSummary {
            revision: snapshot.revision(),
            tables: snapshot.tables().len(),
            entities: snapshot.entities().len(),
            relationships: snapshot.relationships().len(),
            index_revision: generation.revision(),
        })
    }

    /// Latest published snapshot.
    pub fn schema(&self) -> Option<Arc<SchemaSnapshot>> {
        self.store.current()
    }

    pub async fn status(&self) -> PipelineStatus {
        let snapshot = self.store.current();
        PipelineStatus {
            schema_revision: snapshot.as_ref().map(|s| s.revision()),
            index_revision: self.index.published_revision(),
            tables: snapshot.as_ref().map_or(0, |s| s.tables().len()),
            database: self.database.name(),
            embedder: self.index.provider().name(),
            cache: self.cache.stats().await,
        }
    }

    /// Rebuild the index and clear the cache whenever the store publishes a
    /// new snapshot.
    pub fn spawn_invalidation(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut receiver = self.store.subscribe();
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let snapshot = receiver.borrow_and_update().clone();
                let Some(snapshot) = snapshot else {
                    continue;
                };
                this.sync_cache(snapshot.revision()).await;
                if let Err(e) = this.index.build(snapshot).await {
                    tracing::warn!(error = %e, "Index rebuild after schema change failed");
                }
            }
        })
    }

    async fn run_question(&self, question: &str, mode: Mode) -> QueryResult {
        let request_id = Uuid::new_v4();
        let mode_name = match mode {
            Mode::Execute => "process",
            Mode::GenerateOnly => "generate",
        };
        let span = tracing::info_span!("query", %request_id, mode = mode_name);
        async {
            let started = Instant::now();
            let deadline = started + self.config.pipeline.request_timeout();
            let mut result = QueryResult::new(request_id, Some(question.to_string()));

            if let Err(err) = self.run_stages(question, mode, deadline, &mut result).await {
                result.fail(&err);
            }
            self.finish(&mut result, started);
            result
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        question: &str,
        mode: Mode,
        deadline: Instant,
        result: &mut QueryResult,
    ) -> Result<(), StageError> {
        let question = self
            .check_question(question)
            .map_err(|e| StageError::new(Stage::Received, e))?;

        result.stage = Stage::Retrieving;
        let pinned = self
            .pin(deadline)
            .await
            .map_err(|e| StageError::new(Stage::Retrieving, e))?;
        let revision = pinned.snapshot.revision();
        result.revision = Some(revision);
        self.sync_cache(revision).await;

        let sql = if let Some(hit) = self.cache.get(question, revision).await {
            tracing::debug!(revision, "Query cache hit");
            result.cached = true;
            result.relevant_tables = hit.relevant_tables;
            result.fallback_context = hit.fallback_context;
            hit.sql
        } else {
            let context = self
                .retrieve(question, &pinned, deadline)
                .await
                .map_err(|e| StageError::new(Stage::Retrieving, e))?;
            result.relevant_tables = context.table_names();
            result.fallback_context = context.is_fallback();

            let sql = self
                .synthesize_validated(question, &context, &pinned.snapshot, deadline, result)
                .await?;
            self.cache
                .put(
                    question,
                    revision,
                    CachedSql {
                        sql: sql.clone(),
                        relevant_tables: result.relevant_tables.clone(),
                        fallback_context: result.fallback_context,
                    },
                )
                .await;
            sql
        };
        result.sql = Some(sql.clone());

        if mode == Mode::GenerateOnly {
            result.complete(None);
            return Ok(());
        }

        result.stage = Stage::Executing;
        let rows = self
            .execute(&sql, deadline)
            .await
            .map_err(|e| StageError::new(Stage::Executing, e))?;
        result.complete(Some(rows));
        Ok(())
    }

    async fn execute_sql_inner(
        &self,
        sql: &str,
        deadline: Instant,
        result: &mut QueryResult,
    ) -> Result<(), StageError> {
        result.stage = Stage::Retrieving;
        let pinned = self
            .pin(deadline)
            .await
            .map_err(|e| StageError::new(Stage::Retrieving, e))?;
        result.revision = Some(pinned.snapshot.revision());

        result.stage = Stage::Validating;
        let timer = OpTimer::new("pipeline", Stage::Validating.as_str());
        let verdict = self.validator.validate(sql, &pinned.snapshot);
        let accepted = match verdict {
            ValidationVerdict::Accepted { sql, .. } => Ok(sql),
            ValidationVerdict::Rejected {
                reason,
                message,
                identifiers,
            } => Err(PipelineError::Rejected {
                reason,
                message,
                identifiers,
            }),
        };
        timer.finish_with_result(accepted.as_ref());
        let accepted = accepted.map_err(|e| StageError::new(Stage::Validating, e))?;
        result.sql = Some(accepted.clone());

        result.stage = Stage::Executing;
        let rows = self
            .execute(&accepted, deadline)
            .await
            .map_err(|e| StageError::new(Stage::Executing, e))?;
        result.complete(Some(rows));
        Ok(())
    }

    fn check_question<'a>(&self, question: &'a str) -> PipelineResult<&'a str> {
        let trimmed = question.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidQuestion(
                "question must not be empty".to_string(),
            ));
        }
        let max = self.config.pipeline.max_question_chars;
        if trimmed.chars().count() > max {
            return Err(PipelineError::InvalidQuestion(format!(
                "question exceeds {max} characters"
            )));
        }
        Ok(trimmed)
    }

    /// Snapshot and index generation for the request, refreshing lazily when
    /// nothing has been built yet.
    async fn pin(&self, deadline: Instant) -> PipelineResult<Pinned> {
        if let Ok(generation) = self.index.current() {
            return Ok(Pinned {
                snapshot: Arc::clone(generation.snapshot()),
                generation: Some(generation),
            });
        }

        let snapshot = match self.store.current() {
            Some(snapshot) => snapshot,
            None => {
                tracing::info!("No schema snapshot yet; refreshing before first request");
                within(deadline, self.timeout(), self.store.refresh()).await?
            }
        };

        match within(deadline, self.timeout(), self.index.build(Arc::clone(&snapshot))).await {
            Ok(generation) if generation.revision() == snapshot.revision() => Ok(Pinned {
                snapshot,
                generation: Some(generation),
            }),
            Ok(generation) => Ok(Pinned {
                snapshot: Arc::clone(generation.snapshot()),
                generation: Some(generation),
            }),
            Err(PipelineError::Timeout(after)) => Err(PipelineError::Timeout(after)),
            Err(e) => {
                tracing::warn!(error = %e, "Index build failed; using full-schema context");
                Ok(Pinned {
                    snapshot,
                    generation: None,
                })
            }
        }
    }

    async fn retrieve(
        &self,
        question: &str,
        pinned: &Pinned,
        deadline: Instant,
    ) -> PipelineResult<RetrievalContext> {
        check_deadline(deadline, self.timeout())?;
        let timer = OpTimer::new("pipeline", Stage::Retrieving.as_str());
        let retrieval = &self.config.retrieval;

        let result = match &pinned.generation {
            Some(generation) => {
                within(
                    deadline,
                    self.timeout(),
                    self.retriever.retrieve(question, generation, retrieval.top_k),
                )
                .await
            }
            None => Err(PipelineError::IndexNotReady),
        };
        let result = match result {
            Err(PipelineError::RetrievalEmpty | PipelineError::IndexNotReady) => {
                tracing::info!(
                    budget = retrieval.fallback_entity_budget,
                    "Falling back to full-schema context"
                );
                Ok(RetrievalContext::full_schema(
                    &pinned.snapshot,
                    retrieval.fallback_entity_budget,
                ))
            }
            other => other,
        };
        timer.finish_with_result(result.as_ref());
        result
    }

    /// Synthesize and validate, re-synthesizing once when allowed.
    async fn synthesize_validated(
        &self,
        question: &str,
        context: &RetrievalContext,
        snapshot: &SchemaSnapshot,
        deadline: Instant,
        result: &mut QueryResult,
    ) -> Result<String, StageError> {
        let max_attempts = 1 + self.config.pipeline.synthesis_retries;
        let mut feedback: Option<SynthesisFeedback> = None;

        loop {
            result.stage = Stage::Synthesizing;
            result.attempts += 1;
            let retry_allowed = result.attempts < max_attempts;

            check_deadline(deadline, self.timeout())
                .map_err(|e| StageError::new(Stage::Synthesizing, e))?;
            let timer = OpTimer::new("pipeline", Stage::Synthesizing.as_str());
            let candidate = match &feedback {
                None => {
                    within(deadline, self.timeout(), self.synthesizer.synthesize(question, context))
                        .await
                }
                Some(feedback) => {
                    within(
                        deadline,
                        self.timeout(),
                        self.synthesizer.resynthesize(question, context, feedback),
                    )
                    .await
                }
            };
            timer.finish_with_result(candidate.as_ref());

            let candidate = match candidate {
                Ok(candidate) => candidate,
                Err(PipelineError::Provider(e)) if retry_allowed => {
                    tracing::info!(error = %e, "Provider error; retrying synthesis");
                    continue;
                }
                Err(e) => return Err(StageError::new(Stage::Synthesizing, e)),
            };

            result.stage = Stage::Validating;
            check_deadline(deadline, self.timeout())
                .map_err(|e| StageError::new(Stage::Validating, e))?;
            let timer = OpTimer::new("pipeline", Stage::Validating.as_str());
            let verdict = self.validator.validate(&candidate.sql, snapshot);
            match verdict {
                ValidationVerdict::Accepted {
                    sql,
                    injected_limit,
                } => {
                    tracing::debug!(injected_limit, "Candidate SQL accepted");
                    timer.finish();
                    return Ok(sql);
                }
                ValidationVerdict::Rejected {
                    reason,
                    message,
                    identifiers,
                } => {
                    if reason.is_retryable() && retry_allowed {
                        timer.finish_with_result::<(), _>(Err(&reason));
                        tracing::info!(%reason, ?identifiers, "Candidate rejected; re-synthesizing");
                        feedback = Some(SynthesisFeedback {
                            reason: reason.into(),
                            identifiers,
                        });
                        continue;
                    }
                    let err = PipelineError::Rejected {
                        reason,
                        message,
                        identifiers,
                    };
                    timer.finish_with_result::<(), _>(Err(&err));
                    return Err(StageError::new(Stage::Validating, err));
                }
            }
        }
    }

    async fn execute(&self, sql: &str, deadline: Instant) -> PipelineResult<QueryRows> {
        check_deadline(deadline, self.timeout())?;
        let timer = OpTimer::new("pipeline", Stage::Executing.as_str());
        let rows = within(deadline, self.timeout(), async {
            self.database
                .execute(sql)
                .await
                .map_err(|e| PipelineError::Execution(e.to_string()))
        })
        .await;
        timer.finish_with_result(rows.as_ref());
        rows
    }

    async fn refresh_and_build(&self) -> PipelineResult<Arc<IndexGeneration>> {
        let snapshot = self.store.refresh().await?;
        self.sync_cache(snapshot.revision()).await;
        self.index.build(snapshot).await
    }

    /// Drop cached SQL that belongs to an older revision.
    async fn sync_cache(&self, revision: u64) {
        let previous = self.cache_revision.fetch_max(revision, Ordering::SeqCst);
        if previous < revision {
            let removed = self.cache.clear().await;
            if removed > 0 {
                tracing::info!(previous, revision, removed, "Query cache cleared for new schema revision");
            }
        }
    }

    fn finish(&self, result: &mut QueryResult, started: Instant) {
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result.error {
            None => tracing::info!(
                attempts = result.attempts,
                cached = result.cached,
                fallback = result.fallback_context,
                duration_ms = result.duration_ms,
                "Request completed"
            ),
            Some(failure) => tracing::warn!(
                stage = %failure.stage,
                reason_code = %failure.reason_code,
                attempts = result.attempts,
                duration_ms = result.duration_ms,
                "Request failed"
            ),
        }
    }

    fn timeout(&self) -> Duration {
        self.config.pipeline.request_timeout()
    }
}

fn check_deadline(deadline: Instant, timeout: Duration) -> PipelineResult<()> {
    if Instant::now() >= deadline {
        Err(PipelineError::Timeout(timeout))
    } else {
        Ok(())
    }
}

/// Run `fut` unless the request deadline passes first.
async fn within<T, F>(deadline: Instant, timeout: Duration, fut: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout(timeout)),
    }
}
