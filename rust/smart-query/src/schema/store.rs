//! Versioned schema snapshot store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, watch};

use crate::database::DatabaseClient;
use crate::error::{PipelineError, PipelineResult};
use crate::schema::SchemaSnapshot;

/// Holds the latest [`SchemaSnapshot`] and publishes new revisions.
///
/// Refreshes are serialized. A caller that had to wait for a running refresh
/// gets that refresh's snapshot instead of querying the database again.
pub struct SchemaStore {
    client: Arc<dyn DatabaseClient>,
    sender: watch::Sender<Option<Arc<SchemaSnapshot>>>,
    next_revision: AtomicU64,
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for SchemaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaStore")
            .field("client", &self.client.name())
            .field("revision", &self.current().map(|s| s.revision()))
            .finish_non_exhaustive()
    }
}

impl SchemaStore {
    pub fn new(client: Arc<dyn DatabaseClient>) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            client,
            sender,
            next_revision: AtomicU64::new(1),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Latest snapshot, `None` before the first successful refresh.
    pub fn current(&self) -> Option<Arc<SchemaSnapshot>> {
        self.sender.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<SchemaSnapshot>>> {
        self.sender.subscribe()
    }

    /// Database client the store reads from.
    pub fn client(&self) -> &Arc<dyn DatabaseClient> {
        &self.client
    }

    /// Describe the database and publish a snapshot with a new revision.
    ///
    /// On failure the previous snapshot stays in effect.
    pub async fn refresh(&self) -> PipelineResult<Arc<SchemaSnapshot>> {
        let seen = self.current().map(|s| s.revision());
        let _guard = self.refresh_lock.lock().await;

        // Someone else published while we waited.
        if let Some(current) = self.current() {
            if Some(current.revision()) != seen {
                tracing::debug!(
                    revision = current.revision(),
                    "Schema refresh collapsed into concurrent refresh"
                );
                return Ok(current);
            }
        }

        let tables = self.client.describe_schema().await.map_err(|e| {
            tracing::warn!(client = self.client.name(), error = %e, "Schema refresh failed");
            PipelineError::SchemaUnavailable(e.to_string())
        })?;

        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst);
        let snapshot = SchemaSnapshot::new(revision, tables).map_err(|e| {
            tracing::warn!(error = %e, "Database returned an invalid schema");
            PipelineError::SchemaUnavailable(e.to_string())
        })?;
        let snapshot = Arc::new(snapshot);

        self.sender.send_replace(Some(Arc::clone(&snapshot)));
        tracing::info!(
            revision,
            tables = snapshot.tables().len(),
            entities = snapshot.entities().len(),
            "Schema snapshot published"
        );
        Ok(snapshot)
    }
}
