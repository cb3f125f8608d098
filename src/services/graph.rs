//! Graph store boundary.
//!
//! The engine reads committed entities at the start of a run and, when
//! persistence is enabled, writes proposals back at the end. Only the three
//! operations below are used; versioning and permissions belong to the
//! store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::agent::entity::{LocalEntityId, ProposedEntity};
use crate::error::ServiceError;
use crate::llm::retry::BackoffPolicy;

/// Attempts per operation made by [`RetryingGraphStore`].
pub const DEFAULT_GRAPH_ATTEMPTS: u32 = 3;

/// Filter for [`GraphStore::query_entities`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityQuery {
    /// Restrict to these entity types; empty matches every type.
    pub entity_type_ids: Vec<String>,
    /// Case-insensitive substring over name and summary.
    pub text: Option<String>,
    /// Maximum number of results.
    pub limit: usize,
}

/// An entity as the graph store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    /// Graph id, reused as the run-local id.
    pub entity_id: LocalEntityId,
    /// Entity type.
    pub entity_type_id: String,
    /// Display name.
    pub name: String,
    /// Stored description.
    pub summary: String,
    /// Property values.
    pub properties: Map<String, Value>,
}

/// Reads and writes entities.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Returns committed entities matching `query`.
    async fn query_entities(&self, query: &EntityQuery) -> Result<Vec<StoredEntity>, ServiceError>;

    /// Creates a new entity from a proposal.
    async fn create_entity(&self, entity: &ProposedEntity) -> Result<StoredEntity, ServiceError>;

    /// Merges `properties` into an existing entity.
    async fn patch_entity(
        &self,
        entity_id: LocalEntityId,
        properties: &Map<String, Value>,
    ) -> Result<StoredEntity, ServiceError>;
}

/// Retries transient graph failures with jittered backoff.
pub struct RetryingGraphStore {
    inner: Arc<dyn GraphStore>,
    attempts: u32,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for RetryingGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingGraphStore")
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryingGraphStore {
    /// Wraps `inner` with the default three attempts.
    #[must_use]
    pub fn new(inner: Arc<dyn GraphStore>) -> Self {
        Self {
            inner,
            attempts: DEFAULT_GRAPH_ATTEMPTS,
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(5)),
        }
    }

    /// Overrides attempts and backoff.
    #[must_use]
    pub fn with_policy(mut self, attempts: u32, backoff: BackoffPolicy) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ServiceError>> + Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(operation, attempt, error = %err, ?delay, "graph call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl GraphStore for RetryingGraphStore {
    async fn query_entities(&self, query: &EntityQuery) -> Result<Vec<StoredEntity>, ServiceError> {
        self.retry("query_entities", || self.inner.query_entities(query))
            .await
    }

    async fn create_entity(&self, entity: &ProposedEntity) -> Result<StoredEntity, ServiceError> {
        self.retry("create_entity", || self.inner.create_entity(entity))
            .await
    }

    async fn patch_entity(
        &self,
        entity_id: LocalEntityId,
        properties: &Map<String, Value>,
    ) -> Result<StoredEntity, ServiceError> {
        self.retry("patch_entity", || self.inner.patch_entity(entity_id, properties))
            .await
    }
}

/// Process-local graph store.
///
/// Backs offline runs and tests; `fail_next` injects transient failures.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    entities: Mutex<HashMap<LocalEntityId, StoredEntity>>,
    failures: Mutex<u32>,
}

impl InMemoryGraphStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `entities`.
    #[must_use]
    pub fn with_entities(entities: impl IntoIterator<Item = StoredEntity>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.entities.lock() {
            map.extend(entities.into_iter().map(|e| (e.entity_id, e)));
        }
        store
    }

    /// Makes the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = count;
        }
    }

    /// Snapshot of every stored entity.
    #[must_use]
    pub fn entities(&self) -> Vec<StoredEntity> {
        self.entities
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check_failure(&self) -> Result<(), ServiceError> {
        let mut failures = self.failures.lock().map_err(|_| unavailable("lock poisoned"))?;
        if *failures > 0 {
            *failures -= 1;
            return Err(unavailable("injected failure"));
        }
        Ok(())
    }
}

fn unavailable(message: &str) -> ServiceError {
    ServiceError::Unavailable {
        service: "graph",
        message: message.to_string(),
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn query_entities(&self, query: &EntityQuery) -> Result<Vec<StoredEntity>, ServiceError> {
        self.check_failure()?;
        let needle = query.text.as_deref().map(str::to_lowercase);
        let entities = self.entities.lock().map_err(|_| unavailable("lock poisoned"))?;
        let mut found: Vec<StoredEntity> = entities
            .values()
            .filter(|e| {
                query.entity_type_ids.is_empty() || query.entity_type_ids.contains(&e.entity_type_id)
            })
            .filter(|e| {
                needle.as_ref().is_none_or(|n| {
                    e.name.to_lowercase().contains(n) || e.summary.to_lowercase().contains(n)
                })
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        if query.limit > 0 {
            found.truncate(query.limit);
        }
        Ok(found)
    }

    async fn create_entity(&self, entity: &ProposedEntity) -> Result<StoredEntity, ServiceError> {
        self.check_failure()?;
        let stored = StoredEntity {
            entity_id: entity.local_entity_id,
            entity_type_id: entity.entity_type_id.clone(),
            name: entity.name.clone(),
            summary: entity.summary.clone(),
            properties: entity.properties.clone(),
        };
        let mut entities = self.entities.lock().map_err(|_| unavailable("lock poisoned"))?;
        if entities.contains_key(&stored.entity_id) {
            return Err(ServiceError::Rejected {
                service: "graph",
                message: format!("entity {} already exists", stored.entity_id),
            });
        }
        entities.insert(stored.entity_id, stored.clone());
        Ok(stored)
    }

    async fn patch_entity(
        &self,
        entity_id: LocalEntityId,
        properties: &Map<String, Value>,
    ) -> Result<StoredEntity, ServiceError> {
        self.check_failure()?;
        let mut entities = self.entities.lock().map_err(|_| unavailable("lock poisoned"))?;
        let entity = entities.get_mut(&entity_id).ok_or_else(|| ServiceError::NotFound {
            service: "graph",
            what: entity_id.to_string(),
        })?;
        for (key, value) in properties {
            entity.properties.insert(key.clone(), value.clone());
        }
        Ok(entity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(name: &str, entity_type_id: &str) -> StoredEntity {
        StoredEntity {
            entity_id: LocalEntityId::new(),
            entity_type_id: entity_type_id.to_string(),
            name: name.to_string(),
            summary: format!("{name} summary"),
            properties: Map::new(),
        }
    }

    fn fast(store: Arc<dyn GraphStore>) -> RetryingGraphStore {
        RetryingGraphStore::new(store).with_policy(
            3,
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_query_filters_by_type_and_text() {
        let store = InMemoryGraphStore::with_entities([
            stored("Acme Corp", "company"),
            stored("Globex", "company"),
            stored("Ada Lovelace", "person"),
        ]);
        let query = EntityQuery {
            entity_type_ids: vec!["company".to_string()],
            text: Some("acme".to_string()),
            limit: 10,
        };
        let found = store.query_entities(&query).await.unwrap_or_default();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Acme Corp");
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let inner = Arc::new(InMemoryGraphStore::with_entities([stored("Acme", "company")]));
        inner.fail_next(2);
        let store = fast(inner);
        let found = store.query_entities(&EntityQuery::default()).await;
        assert_eq!(found.map(|f| f.len()).unwrap_or_default(), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let inner = Arc::new(InMemoryGraphStore::new());
        inner.fail_next(3);
        let store = fast(inner);
        let result = store.query_entities(&EntityQuery::default()).await;
        assert!(matches!(result, Err(ServiceError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let inner = Arc::new(InMemoryGraphStore::new());
        let store = fast(inner.clone());
        let result = store.patch_entity(LocalEntityId::new(), &Map::new()).await;
        assert!(matches!(result, Err(ServiceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_patch_merges_properties() {
        let entity = stored("Acme", "company");
        let id = entity.entity_id;
        let store = InMemoryGraphStore::with_entities([entity]);
        let mut properties = Map::new();
        properties.insert("founded".to_string(), json!(1999));
        let patched = store
            .patch_entity(id, &properties)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(patched.properties.get("founded"), Some(&json!(1999)));
    }
}
