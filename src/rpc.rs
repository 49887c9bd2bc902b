//! Database client facade
//!
//! The UI side never touches the relational store directly. It calls named
//! operations on a [`PersistenceHost`] and gets back a uniform envelope:
//!
//! ```json
//! {"success": true, "data": [...]}
//! {"success": false, "error": "message"}
//! ```
//!
//! When no host was injected at startup the client reports itself unavailable
//! and callers route to the flat store instead.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::database::Database;
use crate::error::RpcError;
use crate::migration::{is_internal_setting, MigrationInfo, MigrationManager, MigrationReport};
use crate::models::{
    Category, CategoryPatch, MigrationStatus, Prompt, PromptPatch, Settings, SettingEntry, Tag,
};

/// Operation names understood by the persistence host
pub mod ops {
    pub const GET_ALL_PROMPTS: &str = "db-get-all-prompts";
    pub const GET_PROMPT: &str = "db-get-prompt";
    pub const CREATE_PROMPT: &str = "db-create-prompt";
    pub const UPDATE_PROMPT: &str = "db-update-prompt";
    pub const DELETE_PROMPT: &str = "db-delete-prompt";
    pub const SEARCH_PROMPTS: &str = "db-search-prompts";
    pub const TOGGLE_FAVORITE: &str = "db-toggle-favorite";

    pub const GET_ALL_CATEGORIES: &str = "db-get-all-categories";
    pub const CREATE_CATEGORY: &str = "db-create-category";
    pub const UPDATE_CATEGORY: &str = "db-update-category";
    pub const DELETE_CATEGORY: &str = "db-delete-category";
    pub const LOCALIZE_CATEGORIES: &str = "db-localize-categories";

    pub const GET_ALL_TAGS: &str = "db-get-all-tags";
    pub const CREATE_TAG: &str = "db-create-tag";
    pub const DELETE_TAG: &str = "db-delete-tag";
    pub const PRUNE_TAGS: &str = "db-prune-tags";

    pub const GET_SETTING: &str = "db-get-setting";
    pub const SET_SETTING: &str = "db-set-setting";
    pub const GET_ALL_SETTINGS: &str = "db-get-all-settings";
    pub const DELETE_SETTING: &str = "db-delete-setting";

    pub const REPLACE_ALL: &str = "db-replace-all";

    pub const GET_MIGRATION_STATUS: &str = "db-get-migration-status";
    pub const MIGRATE: &str = "db-migrate-from-localstorage";
    pub const ROLLBACK_MIGRATION: &str = "db-rollback-migration";
}

/// Uniform result envelope returned by every operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::err(format!("failed to encode result: {}", e)),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Decode the payload, turning `success: false` into an error
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        if !self.success {
            return Err(RpcError::Remote(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(serde_json::from_value(self.data.unwrap_or(Value::Null))?)
    }
}

/// The privileged side of the boundary
pub trait PersistenceHost: Send + Sync {
    /// Run a named operation with positional JSON arguments
    fn invoke(&self, operation: &str, args: &[Value]) -> RpcResponse;
}

/// In-process host that dispatches operations to the DAOs
pub struct LocalHost {
    db: Database,
    migration: MigrationManager,
}

impl LocalHost {
    pub fn new(db: Database, migration: MigrationManager) -> Self {
        Self { db, migration }
    }

    fn dispatch(&self, operation: &str, args: &[Value]) -> Result<Value, Box<dyn std::error::Error>> {
        let value = match operation {
            ops::GET_ALL_PROMPTS => encode(self.db.prompts().get_all()?),
            ops::GET_PROMPT => {
                let id: String = arg(args, 0)?;
                encode(self.db.prompts().get_by_id(&id)?)
            }
            ops::CREATE_PROMPT => {
                let prompt: Prompt = arg(args, 0)?;
                encode(self.db.prompts().create(prompt)?)
            }
            ops::UPDATE_PROMPT => {
                let id: String = arg(args, 0)?;
                let patch: PromptPatch = arg(args, 1)?;
                encode(self.db.prompts().update(&id, &patch)?)
            }
            ops::DELETE_PROMPT => {
                let id: String = arg(args, 0)?;
                encode(self.db.prompts().delete(&id)?)
            }
            ops::SEARCH_PROMPTS => {
                let query: String = arg(args, 0)?;
                encode(self.db.prompts().search(&query)?)
            }
            ops::TOGGLE_FAVORITE => {
                let id: String = arg(args, 0)?;
                encode(self.db.prompts().toggle_favorite(&id)?)
            }

            ops::GET_ALL_CATEGORIES => encode(self.db.categories().get_all()?),
            ops::CREATE_CATEGORY => {
                let category: Category = arg(args, 0)?;
                encode(self.db.categories().create(category)?)
            }
            ops::UPDATE_CATEGORY => {
                let id: String = arg(args, 0)?;
                let patch: CategoryPatch = arg(args, 1)?;
                encode(self.db.categories().update(&id, &patch)?)
            }
            ops::DELETE_CATEGORY => {
                let id: String = arg(args, 0)?;
                encode(self.db.categories().delete(&id)?)
            }
            ops::LOCALIZE_CATEGORIES => {
                let names: HashMap<String, String> = arg(args, 0)?;
                encode(self.db.categories().apply_localized_names(&names)?)
            }

            ops::GET_ALL_TAGS => encode(self.db.tags().get_all()?),
            ops::CREATE_TAG => {
                let name: String = arg(args, 0)?;
                encode(self.db.tags().get_or_create(&name)?)
            }
            ops::DELETE_TAG => {
                let id: i64 = arg(args, 0)?;
                encode(self.db.tags().delete(id)?)
            }
            ops::PRUNE_TAGS => encode(self.db.tags().prune_orphans()?),

            ops::GET_SETTING => {
                let key: String = arg(args, 0)?;
                encode(self.db.settings().get_entry(&key)?)
            }
            ops::SET_SETTING => {
                let key: String = arg(args, 0)?;
                let value: Value = arg(args, 1)?;
                self.db.settings().set(&key, &value)?;
                Value::Null
            }
            ops::GET_ALL_SETTINGS => {
                let mut settings = self.db.settings().get_all()?;
                settings.retain(|key, _| !is_internal_setting(key));
                encode(settings)
            }
            ops::DELETE_SETTING => {
                let key: String = arg(args, 0)?;
                encode(self.db.settings().delete(&key)?)
            }

            ops::REPLACE_ALL => {
                let prompts: Vec<Prompt> = arg(args, 0)?;
                let categories: Vec<Category> = arg(args, 1)?;
                let settings: Settings = arg(args, 2)?;
                self.db
                    .replace_contents(&prompts, &categories, &settings, is_internal_setting)?;
                Value::Null
            }

            ops::GET_MIGRATION_STATUS => encode(self.migration.migration_info()?),
            ops::MIGRATE => encode(self.migration.migrate()?),
            ops::ROLLBACK_MIGRATION => {
                self.migration.rollback()?;
                Value::Null
            }

            other => return Err(format!("unknown operation: {}", other).into()),
        };

        Ok(value)
    }
}

impl PersistenceHost for LocalHost {
    fn invoke(&self, operation: &str, args: &[Value]) -> RpcResponse {
        match self.dispatch(operation, args) {
            Ok(data) => RpcResponse::ok(data),
            Err(e) => {
                tracing::debug!(operation, error = %e, "rpc call failed");
                RpcResponse::err(e.to_string())
            }
        }
    }
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, String> {
    let raw = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|e| format!("invalid argument {}: {}", index, e))
}

fn encode<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Typed client over an optional persistence host
#[derive(Clone, Default)]
pub struct DatabaseClient {
    host: Option<Arc<dyn PersistenceHost>>,
}

impl DatabaseClient {
    pub fn new(host: Arc<dyn PersistenceHost>) -> Self {
        Self { host: Some(host) }
    }

    /// A client with no host behind it
    pub fn unavailable() -> Self {
        Self { host: None }
    }

    pub fn is_available(&self) -> bool {
        self.host.is_some()
    }

    /// Raw call; an unavailable host yields an error envelope, never a panic
    pub fn invoke(&self, operation: &str, args: &[Value]) -> RpcResponse {
        match &self.host {
            Some(host) => host.invoke(operation, args),
            None => RpcResponse::err(RpcError::Unavailable.to_string()),
        }
    }

    fn call<T: DeserializeOwned>(&self, operation: &str, args: &[Value]) -> Result<T, RpcError> {
        if !self.is_available() {
            return Err(RpcError::Unavailable);
        }
        self.invoke(operation, args).into_result()
    }

    pub fn get_all_prompts(&self) -> Result<Vec<Prompt>, RpcError> {
        self.call(ops::GET_ALL_PROMPTS, &[])
    }

    pub fn get_prompt(&self, id: &str) -> Result<Option<Prompt>, RpcError> {
        self.call(ops::GET_PROMPT, &[json!(id)])
    }

    pub fn create_prompt(&self, prompt: &Prompt) -> Result<Prompt, RpcError> {
        self.call(ops::CREATE_PROMPT, &[serde_json::to_value(prompt)?])
    }

    pub fn update_prompt(&self, id: &str, patch: &PromptPatch) -> Result<Prompt, RpcError> {
        self.call(ops::UPDATE_PROMPT, &[json!(id), serde_json::to_value(patch)?])
    }

    pub fn delete_prompt(&self, id: &str) -> Result<bool, RpcError> {
        self.call(ops::DELETE_PROMPT, &[json!(id)])
    }

    pub fn search_prompts(&self, query: &str) -> Result<Vec<Prompt>, RpcError> {
        self.call(ops::SEARCH_PROMPTS, &[json!(query)])
    }

    pub fn toggle_favorite(&self, id: &str) -> Result<Prompt, RpcError> {
        self.call(ops::TOGGLE_FAVORITE, &[json!(id)])
    }

    pub fn get_all_categories(&self) -> Result<Vec<Category>, RpcError> {
        self.call(ops::GET_ALL_CATEGORIES, &[])
    }

    pub fn create_category(&self, category: &Category) -> Result<Category, RpcError> {
        self.call(ops::CREATE_CATEGORY, &[serde_json::to_value(category)?])
    }

    pub fn update_category(&self, id: &str, patch: &CategoryPatch) -> Result<Category, RpcError> {
        self.call(ops::UPDATE_CATEGORY, &[json!(id), serde_json::to_value(patch)?])
    }

    /// Returns how many prompts were re-pointed to the sentinel category
    pub fn delete_category(&self, id: &str) -> Result<usize, RpcError> {
        self.call(ops::DELETE_CATEGORY, &[json!(id)])
    }

    pub fn localize_categories(&self, names: &HashMap<String, String>) -> Result<usize, RpcError> {
        self.call(ops::LOCALIZE_CATEGORIES, &[serde_json::to_value(names)?])
    }

    pub fn get_all_tags(&self) -> Result<Vec<Tag>, RpcError> {
        self.call(ops::GET_ALL_TAGS, &[])
    }

    pub fn create_tag(&self, name: &str) -> Result<Tag, RpcError> {
        self.call(ops::CREATE_TAG, &[json!(name)])
    }

    pub fn delete_tag(&self, id: i64) -> Result<bool, RpcError> {
        self.call(ops::DELETE_TAG, &[json!(id)])
    }

    pub fn prune_tags(&self) -> Result<usize, RpcError> {
        self.call(ops::PRUNE_TAGS, &[])
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<SettingEntry>, RpcError> {
        self.call(ops::GET_SETTING, &[json!(key)])
    }

    pub fn set_setting(&self, key: &str, value: &Value) -> Result<(), RpcError> {
        self.call::<Value>(ops::SET_SETTING, &[json!(key), value.clone()])
            .map(|_| ())
    }

    pub fn get_all_settings(&self) -> Result<Settings, RpcError> {
        self.call(ops::GET_ALL_SETTINGS, &[])
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool, RpcError> {
        self.call(ops::DELETE_SETTING, &[json!(key)])
    }

    /// Replace prompts, categories and settings wholesale
    pub fn replace_all(
        &self,
        prompts: &[Prompt],
        categories: &[Category],
        settings: &Settings,
    ) -> Result<(), RpcError> {
        self.call::<Value>(
            ops::REPLACE_ALL,
            &[
                serde_json::to_value(prompts)?,
                serde_json::to_value(categories)?,
                serde_json::to_value(settings)?,
            ],
        )
        .map(|_| ())
    }

    pub fn migration_info(&self) -> Result<MigrationInfo, RpcError> {
        self.call(ops::GET_MIGRATION_STATUS, &[])
    }

    pub fn migration_status(&self) -> Result<MigrationStatus, RpcError> {
        Ok(self.migration_info()?.status)
    }

    pub fn migrate(&self) -> Result<MigrationReport, RpcError> {
        self.call(ops::MIGRATE, &[])
    }

    pub fn rollback_migration(&self) -> Result<(), RpcError> {
        self.call::<Value>(ops::ROLLBACK_MIGRATION, &[]).map(|_| ())
    }
}
