//! Prompt repository
//!
//! Routes CRUD to the relational store through the [`DatabaseClient`] when the
//! host is available and the migration has completed, and to the flat store
//! otherwise. When the host cannot be reached the call falls back to the flat
//! store; errors the relational store reports are returned to the caller.
//!
//! Every successful relational write is mirrored into the flat store so it
//! always holds a complete copy of the data.

use std::sync::Arc;

use crate::database::prompts::touch;
use crate::error::{RpcError, StoreError, SyncResult};
use crate::flat_store::{self, FlatStore, CATEGORIES_KEY, PROMPTS_KEY, SETTINGS_KEY};
use crate::models::{
    normalize_tags, now_millis, Category, CategoryPatch, MigrationStatus, Prompt, PromptPatch,
    Settings, SyncData, SyncSource, SENTINEL_CATEGORY_ID,
};
use crate::rpc::DatabaseClient;

/// Where reads and writes currently go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Relational,
    Flat,
}

/// A replica whose full state can be exported and replaced as a SyncData
pub trait LocalReplica: Send + Sync {
    fn export_snapshot(&self) -> SyncResult<SyncData>;

    /// Replace local prompts, categories and settings with the snapshot's
    fn apply_snapshot(&self, data: &SyncData) -> SyncResult<()>;
}

pub struct PromptRepository {
    client: DatabaseClient,
    flat: Arc<dyn FlatStore>,
}

impl PromptRepository {
    pub fn new(client: DatabaseClient, flat: Arc<dyn FlatStore>) -> Self {
        Self { client, flat }
    }

    pub fn client(&self) -> &DatabaseClient {
        &self.client
    }

    pub fn mode(&self) -> StorageMode {
        if !self.client.is_available() {
            return StorageMode::Flat;
        }
        match self.client.migration_status() {
            Ok(MigrationStatus::Completed) => StorageMode::Relational,
            Ok(_) => StorageMode::Flat,
            Err(e) => {
                tracing::warn!(error = %e, "could not read migration status, using flat store");
                StorageMode::Flat
            }
        }
    }

    /// Run `f` against the relational store when it is active. `Ok(None)`
    /// means the caller should use the flat store: either the store is not
    /// active or the host could not be reached. Failures reported by the store
    /// itself (constraint violations, missing rows) go back to the caller.
    fn relational<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&DatabaseClient) -> Result<T, RpcError>,
    ) -> SyncResult<Option<T>> {
        if self.mode() != StorageMode::Relational {
            return Ok(None);
        }
        match f(&self.client) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_unreachable() => {
                tracing::warn!(operation, error = %e, "relational store unreachable, falling back to flat store");
                Ok(None)
            }
            Err(e) => {
                tracing::error!(operation, error = %e, "relational store rejected operation");
                Err(e.into())
            }
        }
    }

    /// Relational write followed by a mirror into the flat store
    fn relational_write<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&DatabaseClient) -> Result<T, RpcError>,
    ) -> SyncResult<Option<T>> {
        let Some(value) = self.relational(operation, f)? else {
            return Ok(None);
        };
        if let Err(e) = self.mirror() {
            tracing::warn!(operation, error = %e, "failed to mirror relational write to flat store");
        }
        Ok(Some(value))
    }

    /// Copy the full relational state into the flat store
    pub fn mirror(&self) -> SyncResult<()> {
        let prompts = self.client.get_all_prompts()?;
        let categories = self.client.get_all_categories()?;
        let settings = self.client.get_all_settings()?;

        let store = self.flat.as_ref();
        flat_store::set_json(store, PROMPTS_KEY, &prompts)?;
        flat_store::set_json(store, CATEGORIES_KEY, &categories)?;
        flat_store::set_json(store, SETTINGS_KEY, &settings)?;
        tracing::debug!(prompts = prompts.len(), "mirrored relational store to flat store");
        Ok(())
    }

    // Prompts

    pub fn get_all_prompts(&self) -> SyncResult<Vec<Prompt>> {
        if let Some(prompts) = self.relational("get_all_prompts", |c| c.get_all_prompts())? {
            return Ok(prompts);
        }
        self.flat_prompts()
    }

    pub fn get_prompt(&self, id: &str) -> SyncResult<Option<Prompt>> {
        if let Some(prompt) = self.relational("get_prompt", |c| c.get_prompt(id))? {
            return Ok(prompt);
        }
        Ok(self.flat_prompts()?.into_iter().find(|p| p.id == id))
    }

    pub fn search_prompts(&self, query: &str) -> SyncResult<Vec<Prompt>> {
        if let Some(prompts) = self.relational("search_prompts", |c| c.search_prompts(query))? {
            return Ok(prompts);
        }
        let needle = query.to_lowercase();
        Ok(self
            .flat_prompts()?
            .into_iter()
            .filter(|p| {
                p.title.to_lowercase().contains(&needle)
                    || p.content.to_lowercase().contains(&needle)
                    || p.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .collect())
    }

    pub fn create_prompt(&self, prompt: Prompt) -> SyncResult<Prompt> {
        if let Some(created) = self.relational_write("create_prompt", |c| c.create_prompt(&prompt))? {
            return Ok(created);
        }

        let mut prompt = prompt;
        if prompt.id.trim().is_empty() {
            prompt.id = uuid::Uuid::new_v4().to_string();
        }
        let now = now_millis();
        prompt.created_at = now;
        prompt.updated_at = now;
        prompt.version = 1;
        prompt.tags = normalize_tags(&prompt.tags);

        let mut prompts = self.flat_prompts()?;
        prompts.retain(|p| p.id != prompt.id);
        prompts.push(prompt.clone());
        flat_store::set_json(self.flat.as_ref(), PROMPTS_KEY, &prompts)?;
        Ok(prompt)
    }

    pub fn update_prompt(&self, id: &str, patch: &PromptPatch) -> SyncResult<Prompt> {
        if let Some(updated) = self.relational_write("update_prompt", |c| c.update_prompt(id, patch))? {
            return Ok(updated);
        }

        let mut prompts = self.flat_prompts()?;
        let prompt = prompts
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| not_found("prompt", id))?;
        prompt.apply(patch);
        touch(prompt);
        let updated = prompt.clone();
        flat_store::set_json(self.flat.as_ref(), PROMPTS_KEY, &prompts)?;
        Ok(updated)
    }

    pub fn toggle_favorite(&self, id: &str) -> SyncResult<Prompt> {
        if let Some(updated) = self.relational_write("toggle_favorite", |c| c.toggle_favorite(id))? {
            return Ok(updated);
        }
        let current = self.get_prompt(id)?.ok_or_else(|| not_found("prompt", id))?;
        self.update_prompt(
            id,
            &PromptPatch {
                is_favorite: Some(!current.is_favorite),
                ..Default::default()
            },
        )
    }

    pub fn delete_prompt(&self, id: &str) -> SyncResult<bool> {
        if let Some(removed) = self.relational_write("delete_prompt", |c| c.delete_prompt(id))? {
            return Ok(removed);
        }

        let mut prompts = self.flat_prompts()?;
        let before = prompts.len();
        prompts.retain(|p| p.id != id);
        let removed = prompts.len() != before;
        if removed {
            flat_store::set_json(self.flat.as_ref(), PROMPTS_KEY, &prompts)?;
        }
        Ok(removed)
    }

    // Categories

    pub fn get_all_categories(&self) -> SyncResult<Vec<Category>> {
        if let Some(categories) = self.relational("get_all_categories", |c| c.get_all_categories())? {
            return Ok(categories);
        }
        self.flat_categories()
    }

    pub fn create_category(&self, category: Category) -> SyncResult<Category> {
        if let Some(created) =
            self.relational_write("create_category", |c| c.create_category(&category))?
        {
            return Ok(created);
        }

        let mut categories = self.flat_categories()?;
        categories.retain(|c| c.id != category.id);
        categories.push(category.clone());
        flat_store::set_json(self.flat.as_ref(), CATEGORIES_KEY, &categories)?;
        Ok(category)
    }

    pub fn update_category(&self, id: &str, patch: &CategoryPatch) -> SyncResult<Category> {
        if let Some(updated) =
            self.relational_write("update_category", |c| c.update_category(id, patch))?
        {
            return Ok(updated);
        }

        let mut categories = self.flat_categories()?;
        let category = categories
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("category", id))?;
        if let Some(ref name) = patch.name {
            category.name = name.clone();
        }
        if let Some(ref icon) = patch.icon {
            category.icon = icon.clone();
        }
        let updated = category.clone();
        flat_store::set_json(self.flat.as_ref(), CATEGORIES_KEY, &categories)?;
        Ok(updated)
    }

    /// Delete a category, re-pointing its prompts. Returns the re-pointed count.
    pub fn delete_category(&self, id: &str) -> SyncResult<usize> {
        if id == SENTINEL_CATEGORY_ID {
            return Err(StoreError::SentinelCategory.into());
        }
        if let Some(repointed) = self.relational_write("delete_category", |c| c.delete_category(id))? {
            return Ok(repointed);
        }

        let mut categories = self.flat_categories()?;
        let before = categories.len();
        categories.retain(|c| c.id != id);
        if categories.len() == before {
            return Err(not_found("category", id));
        }

        let mut prompts = self.flat_prompts()?;
        let mut repointed = 0;
        for prompt in prompts.iter_mut().filter(|p| p.category == id) {
            prompt.category = SENTINEL_CATEGORY_ID.to_string();
            repointed += 1;
        }

        flat_store::set_json(self.flat.as_ref(), PROMPTS_KEY, &prompts)?;
        flat_store::set_json(self.flat.as_ref(), CATEGORIES_KEY, &categories)?;
        Ok(repointed)
    }

    // Settings

    pub fn get_settings(&self) -> SyncResult<Settings> {
        if let Some(settings) = self.relational("get_all_settings", |c| c.get_all_settings())? {
            return Ok(settings);
        }
        Ok(flat_store::get_json(self.flat.as_ref(), SETTINGS_KEY)?.unwrap_or_default())
    }

    pub fn set_setting(&self, key: &str, value: serde_json::Value) -> SyncResult<()> {
        if self
            .relational_write("set_setting", |c| c.set_setting(key, &value))?
            .is_some()
        {
            return Ok(());
        }

        let mut settings: Settings =
            flat_store::get_json(self.flat.as_ref(), SETTINGS_KEY)?.unwrap_or_default();
        settings.insert(key.to_string(), value);
        flat_store::set_json(self.flat.as_ref(), SETTINGS_KEY, &settings)?;
        Ok(())
    }

    fn flat_prompts(&self) -> SyncResult<Vec<Prompt>> {
        Ok(flat_store::get_json(self.flat.as_ref(), PROMPTS_KEY)?.unwrap_or_default())
    }

    fn flat_categories(&self) -> SyncResult<Vec<Category>> {
        let categories: Option<Vec<Category>> = flat_store::get_json(self.flat.as_ref(), CATEGORIES_KEY)?;
        Ok(categories.unwrap_or_else(|| vec![Category::sentinel()]))
    }
}

impl LocalReplica for PromptRepository {
    /// Stamped with the latest prompt edit, so an untouched library does not
    /// look newer than a remote copy
    fn export_snapshot(&self) -> SyncResult<SyncData> {
        let prompts = self.get_all_prompts()?;
        let last_modified = prompts.iter().map(|p| p.updated_at).max().unwrap_or_default();
        Ok(SyncData::at(
            prompts,
            self.get_all_categories()?,
            self.get_settings()?,
            SyncSource::Primary,
            last_modified,
        ))
    }

    fn apply_snapshot(&self, data: &SyncData) -> SyncResult<()> {
        if self
            .relational_write("replace_all", |c| {
                c.replace_all(&data.prompts, &data.categories, &data.settings)
            })?
            .is_some()
        {
            tracing::info!(prompts = data.prompts.len(), "applied snapshot to relational store");
            return Ok(());
        }

        let store = self.flat.as_ref();
        flat_store::set_json(store, PROMPTS_KEY, &data.prompts)?;
        flat_store::set_json(store, CATEGORIES_KEY, &data.categories)?;
        flat_store::set_json(store, SETTINGS_KEY, &data.settings)?;
        tracing::info!(prompts = data.prompts.len(), "applied snapshot to flat store");
        Ok(())
    }
}

fn not_found(entity: &'static str, id: &str) -> crate::error::SyncError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
    .into()
}
