//! Registry of named database contexts.

use crate::db::context::DatabaseContext;
use crate::db::provider::ConnectionFactory;
use crate::error::{DbError, DbResult};
use crate::models::{DbMode, ReadWriteMode, SupportedDatabase};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Summary of a registered context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSummary {
    pub id: String,
    pub context_id: String,
    pub product: SupportedDatabase,
    pub mode: DbMode,
    pub read_write_mode: ReadWriteMode,
    pub connected_at: DateTime<Utc>,
}

/// Named contexts sharing one provider type.
pub struct ContextRegistry<F: ConnectionFactory> {
    contexts: Arc<RwLock<HashMap<String, DatabaseContext<F>>>>,
}

impl<F: ConnectionFactory> Clone for ContextRegistry<F> {
    fn clone(&self) -> Self {
        Self {
            contexts: Arc::clone(&self.contexts),
        }
    }
}

impl<F: ConnectionFactory> Default for ContextRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ConnectionFactory> ContextRegistry<F> {
    pub fn new() -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register an already-built context under `id`.
    ///
    /// On a duplicate id the new context is closed and an error returned.
    pub async fn register(&self, id: &str, context: DatabaseContext<F>) -> DbResult<()> {
        let rejected = {
            let mut contexts = self.contexts.write().await;
            if contexts.contains_key(id) {
                Some(context)
            } else {
                info!(
                    id = %id,
                    context_id = %context.id(),
                    product = %context.product(),
                    mode = %context.mode(),
                    "Context registered"
                );
                contexts.insert(id.to_string(), context);
                None
            }
        };

        // Close outside the lock
        if let Some(context) = rejected {
            if let Err(e) = context.close().await {
                warn!(id = %id, error = %e, "Failed to close rejected context");
            }
            return Err(DbError::configuration(format!(
                "Context '{}' already exists",
                id
            )));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<DatabaseContext<F>> {
        let contexts = self.contexts.read().await;
        contexts
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::context_not_found(id))
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.contexts.read().await.contains_key(id)
    }

    /// Remove and close the context registered under `id`.
    pub async fn remove(&self, id: &str) -> DbResult<()> {
        let context = self
            .contexts
            .write()
            .await
            .remove(id)
            .ok_or_else(|| DbError::context_not_found(id))?;
        context.close().await?;
        info!(id = %id, "Context removed");
        Ok(())
    }

    pub async fn list(&self) -> Vec<ContextSummary> {
        let contexts = self.contexts.read().await;
        let mut summaries: Vec<_> = contexts
            .iter()
            .map(|(id, context)| ContextSummary {
                id: id.clone(),
                context_id: context.id().to_string(),
                product: context.product(),
                mode: context.mode(),
                read_write_mode: context.read_write_mode(),
                connected_at: context.created_at(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }

    /// Close every context and empty the registry.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.contexts.write().await.drain().collect();
        for (id, context) in drained {
            info!(id = %id, "Closing context");
            if let Err(e) = context.close().await {
                warn!(id = %id, error = %e, "Failed to close context");
            }
        }
        info!("All contexts closed");
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ContextRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextRegistry").finish_non_exhaustive()
    }
}
