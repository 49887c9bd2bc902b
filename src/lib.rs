//! Prompt Sync - prompt library persistence and synchronization
//!
//! Stores prompts, categories, tags and settings in an embedded relational
//! database, migrates them from the legacy flat store, and keeps them in sync
//! with a companion extension (shared file) and a cloud provider (WebDAV or
//! OneDrive).

pub mod checksum;
pub mod cloud;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod flat_store;
pub mod migration;
pub mod models;
pub mod repository;
pub mod rpc;
pub mod sync;
mod util;

// Re-export commonly used types
pub use config::AppConfig;
pub use database::Database;
pub use error::{CloudError, MigrationError, RpcError, StoreError, SyncError};
pub use events::{EventBus, SyncEvent};
pub use flat_store::{FlatStore, JsonFileStore, MemoryFlatStore};
pub use migration::{MigrationManager, MigrationReport};
pub use models::{Category, Prompt, PromptPatch, SyncData, SyncSource, Tag};
pub use repository::{LocalReplica, PromptRepository, StorageMode};
pub use rpc::{DatabaseClient, LocalHost, PersistenceHost, RpcResponse};
pub use sync::{CloudStorageManager, CompanionChannel, SyncOutcome};
