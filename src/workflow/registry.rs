//! Definition store with a hot-reload cache
//!
//! Writes go through validation into SQLite and then swap a fresh cache
//! snapshot in with `ArcSwap`, so engine reads never block on an
//! administrator editing templates.

use crate::error::{WorkflowError, WorkflowResult};
use crate::workflow::seed;
use crate::workflow::storage::{DefinitionMetadata, DefinitionStorage};
use crate::workflow::types::WorkflowDefinition;
use crate::workflow::validate::validate_definition;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Immutable snapshot of every known definition
#[derive(Debug, Default)]
struct DefinitionCache {
    by_id: HashMap<String, Arc<WorkflowDefinition>>,
    /// name -> id
    by_name: HashMap<String, String>,
}

impl DefinitionCache {
    fn with(&self, definition: Arc<WorkflowDefinition>) -> Self {
        let mut by_id = self.by_id.clone();
        let mut by_name = self.by_name.clone();
        // A rename leaves the old name pointing at nothing
        if let Some(previous) = by_id.get(&definition.id) {
            by_name.remove(&previous.name);
        }
        by_name.insert(definition.name.clone(), definition.id.clone());
        by_id.insert(definition.id.clone(), definition);
        Self { by_id, by_name }
    }
}

#[derive(Debug)]
pub struct DefinitionStore {
    cache: ArcSwap<DefinitionCache>,
    storage: DefinitionStorage,
}

impl DefinitionStore {
    pub fn new(storage: DefinitionStorage) -> Self {
        Self {
            cache: ArcSwap::new(Arc::new(DefinitionCache::default())),
            storage,
        }
    }

    /// Load every stored definition into the cache (startup)
    pub async fn init_from_storage(&self) -> WorkflowResult<()> {
        let mut cache = DefinitionCache::default();
        for definition in self.storage.load_all().await? {
            cache = cache.with(Arc::new(definition));
        }
        let count = cache.by_id.len();
        self.cache.store(Arc::new(cache));

        tracing::info!("Initialized definition store with {} definitions", count);
        Ok(())
    }

    /// Validate and persist a new definition.
    ///
    /// Fails with `InvalidDefinition` on structural errors or when the name
    /// is already taken.
    pub async fn create(&self, mut definition: WorkflowDefinition) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.check(&definition)?;

        if self.storage.get_by_name(&definition.name).await?.is_some() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "a definition named '{}' already exists",
                definition.name
            )));
        }
        if definition.id.is_empty() {
            definition.id = uuid::Uuid::new_v4().to_string();
        }

        self.storage.save(&definition).await?;
        tracing::info!("Created workflow definition: {} ({})", definition.name, definition.id);
        Ok(self.publish(definition))
    }

    /// Replace an existing definition; running instances keep their copy by id
    pub async fn update(
        &self,
        id: &str,
        mut definition: WorkflowDefinition,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        definition.id = id.to_string();
        self.check(&definition)?;

        if self.storage.get(id).await?.is_none() {
            return Err(WorkflowError::DefinitionNotFound(id.to_string()));
        }
        if let Some(existing) = self.storage.get_by_name(&definition.name).await? {
            if existing.id != id {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "a definition named '{}' already exists",
                    definition.name
                )));
            }
        }

        self.storage.save(&definition).await?;
        tracing::info!("Updated workflow definition: {} ({})", definition.name, id);
        Ok(self.publish(definition))
    }

    /// Toggle whether new instances may start from a definition
    pub async fn set_active(&self, id: &str, active: bool) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let mut definition = self
            .storage
            .get(id)
            .await?
            .ok_or_else(|| WorkflowError::DefinitionNotFound(id.to_string()))?;
        definition.is_active = active;

        self.storage.save(&definition).await?;
        tracing::info!("Definition {} is now {}", definition.name, if active { "active" } else { "inactive" });
        Ok(self.publish(definition))
    }

    /// Lookup used by `start`: missing and inactive are both not found
    pub fn find_active_by_name(&self, name: &str) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let cache = self.cache.load();
        cache
            .by_name
            .get(name)
            .and_then(|id| cache.by_id.get(id))
            .filter(|definition| definition.is_active)
            .cloned()
            .ok_or_else(|| WorkflowError::DefinitionNotFound(name.to_string()))
    }

    /// Lookup by id, including inactive definitions still referenced by instances
    pub fn get(&self, id: &str) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.cache
            .load()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::DefinitionNotFound(id.to_string()))
    }

    pub async fn list(&self) -> WorkflowResult<Vec<DefinitionMetadata>> {
        self.storage.list().await
    }

    /// Insert the bundled templates that are not present yet (upsert by name)
    pub async fn seed_defaults(&self) -> WorkflowResult<usize> {
        let mut created = 0;
        for definition in seed::default_definitions()? {
            if self.storage.get_by_name(&definition.name).await?.is_some() {
                tracing::debug!("Seed definition already present: {}", definition.name);
                continue;
            }
            self.create(definition).await?;
            created += 1;
        }

        tracing::info!("🌱 Seeded {} default workflow definitions", created);
        Ok(created)
    }

    fn check(&self, definition: &WorkflowDefinition) -> WorkflowResult<()> {
        for warning in validate_definition(definition)? {
            tracing::warn!("Definition '{}': {}", definition.name, warning);
        }
        Ok(())
    }

    fn publish(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let published = Arc::new(definition);
        self.cache.rcu(|cache| cache.with(Arc::clone(&published)));
        published
    }
}
