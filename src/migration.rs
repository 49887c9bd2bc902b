//! One-way migration from the flat store into the relational store.
//!
//! Status lives in the settings table:
//!
//! ```text
//!   pending ──migrate()──▶ completed ──rollback()──▶ rolled_back
//!      ▲                                                  │
//!      └──────────────────── migrate() ◀──────────────────┘
//! ```
//!
//! Everything the migration writes, including the `completed` status, goes
//! through one transaction. A failure anywhere leaves the status at its
//! previous value and the relational tables untouched, so `migrate()` can
//! simply be called again.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::database::{categories, prompts, settings, Database};
use crate::error::MigrationError;
use crate::flat_store::{self, FlatStore, CATEGORIES_KEY, PROMPTS_KEY, SETTINGS_KEY};
use crate::models::{now_millis, Category, MigrationStatus, Prompt, Settings, SENTINEL_CATEGORY_ID};
use crate::util::{file_timestamp, write_atomic};

pub const MIGRATION_STATUS_KEY: &str = "migration_status";
pub const MIGRATION_DATE_KEY: &str = "migration_date";
pub const MIGRATION_SOURCE_KEY: &str = "migration_source";

const MIGRATION_SOURCE: &str = "flat_store";

/// Settings keys owned by the migration bookkeeping, never synced or migrated
pub fn is_internal_setting(key: &str) -> bool {
    key.starts_with("migration_")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub status: MigrationStatus,
    pub date: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// The migration had already completed; nothing was written
    pub skipped: bool,
    pub categories: usize,
    pub prompts: usize,
    pub settings: usize,
    pub backup_path: Option<PathBuf>,
    /// Count mismatches found by the post-migration integrity check
    pub mismatches: Vec<String>,
}

#[derive(Clone)]
pub struct MigrationManager {
    db: Database,
    flat: Arc<dyn FlatStore>,
    backup_dir: PathBuf,
    #[cfg(test)]
    fail_before_status: bool,
}

impl MigrationManager {
    pub fn new(db: Database, flat: Arc<dyn FlatStore>, backup_dir: impl AsRef<Path>) -> Self {
        Self {
            db,
            flat,
            backup_dir: backup_dir.as_ref().to_path_buf(),
            #[cfg(test)]
            fail_before_status: false,
        }
    }

    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        Ok(self.migration_info()?.status)
    }

    pub fn migration_info(&self) -> Result<MigrationInfo, MigrationError> {
        let settings = self.db.settings();
        let read = |key: &str| -> Result<Option<String>, MigrationError> {
            Ok(settings
                .get(key)?
                .and_then(|v| v.as_str().map(str::to_string)))
        };

        Ok(MigrationInfo {
            status: read(MIGRATION_STATUS_KEY)?
                .map(|s| MigrationStatus::parse(&s))
                .unwrap_or(MigrationStatus::Pending),
            date: read(MIGRATION_DATE_KEY)?,
            source: read(MIGRATION_SOURCE_KEY)?,
        })
    }

    /// Copy flat-store data into the relational store. No-op once completed.
    pub fn migrate(&self) -> Result<MigrationReport, MigrationError> {
        let status = self.status()?;
        if status == MigrationStatus::Completed {
            tracing::info!("migration already completed, skipping");
            return Ok(MigrationReport {
                skipped: true,
                ..Default::default()
            });
        }

        let legacy_categories: Vec<Category> = self.read_legacy(CATEGORIES_KEY)?.unwrap_or_default();
        let mut legacy_prompts: Vec<Prompt> = self.read_legacy(PROMPTS_KEY)?.unwrap_or_default();
        let legacy_settings: Settings = self.read_legacy(SETTINGS_KEY)?.unwrap_or_default();

        let backup_path = self.write_backup()?;
        tracing::info!(
            from = %status,
            prompts = legacy_prompts.len(),
            categories = legacy_categories.len(),
            backup = %backup_path.display(),
            "starting migration"
        );

        // Prompts pointing at categories that will not exist are re-pointed
        // instead of failing the foreign key.
        let mut known: HashSet<String> = self
            .db
            .categories()
            .get_all()?
            .into_iter()
            .map(|c| c.id)
            .collect();
        known.extend(legacy_categories.iter().map(|c| c.id.clone()));
        for prompt in &mut legacy_prompts {
            if !known.contains(&prompt.category) {
                tracing::warn!(
                    prompt = %prompt.id,
                    category = %prompt.category,
                    "unknown category, re-pointing to sentinel"
                );
                prompt.category = SENTINEL_CATEGORY_ID.to_string();
            }
            prompt.clamp_timestamps();
        }

        let migrated_settings: Vec<(&String, &serde_json::Value)> = legacy_settings
            .iter()
            .filter(|(key, _)| !is_internal_setting(key))
            .collect();

        #[cfg(test)]
        let fail_before_status = self.fail_before_status;

        self.db.with_tx("migrate", |tx| {
            for category in &legacy_categories {
                categories::save(tx, category)?;
            }
            for prompt in &legacy_prompts {
                prompts::save(tx, prompt)?;
            }
            for (key, value) in &migrated_settings {
                settings::write(tx, key, value)?;
            }

            #[cfg(test)]
            if fail_before_status {
                return Err(rusqlite::Error::ToSqlConversionFailure(
                    "simulated crash before status write".into(),
                ));
            }

            settings::write(tx, MIGRATION_STATUS_KEY, &json!(MigrationStatus::Completed.as_str()))?;
            settings::write(tx, MIGRATION_DATE_KEY, &json!(now_millis().to_rfc3339()))?;
            settings::write(tx, MIGRATION_SOURCE_KEY, &json!(MIGRATION_SOURCE))?;
            Ok(())
        })?;

        let mut report = MigrationReport {
            skipped: false,
            categories: legacy_categories.len(),
            prompts: legacy_prompts.len(),
            settings: migrated_settings.len(),
            backup_path: Some(backup_path),
            mismatches: Vec::new(),
        };
        report.mismatches = self.verify(&legacy_prompts, &legacy_categories, &migrated_settings)?;

        tracing::info!(
            prompts = report.prompts,
            categories = report.categories,
            settings = report.settings,
            "migration completed"
        );
        Ok(report)
    }

    /// Clear every relational table except the status key and mark the
    /// migration `rolled_back`. The sentinel category is kept.
    pub fn rollback(&self) -> Result<(), MigrationError> {
        self.db.with_tx("rollback_migration", |tx| {
            tx.execute("DELETE FROM prompt_tags", [])?;
            tx.execute("DELETE FROM prompt_images", [])?;
            tx.execute("DELETE FROM prompts", [])?;
            tx.execute("DELETE FROM tags", [])?;
            tx.execute(
                "DELETE FROM categories WHERE id != ?1",
                [SENTINEL_CATEGORY_ID],
            )?;
            tx.execute("DELETE FROM settings WHERE key != ?1", [MIGRATION_STATUS_KEY])?;
            settings::write(tx, MIGRATION_STATUS_KEY, &json!(MigrationStatus::RolledBack.as_str()))?;
            settings::write(tx, MIGRATION_DATE_KEY, &json!(now_millis().to_rfc3339()))?;
            Ok(())
        })?;

        tracing::warn!("migration rolled back, relational tables cleared");
        Ok(())
    }

    fn read_legacy<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MigrationError> {
        flat_store::get_json(self.flat.as_ref(), key).map_err(|e| MigrationError::LegacyData {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn write_backup(&self) -> Result<PathBuf, MigrationError> {
        let entries = self.flat.entries()?;
        let path = self
            .backup_dir
            .join(format!("flatstore-backup-{}.json", file_timestamp()));
        let content = serde_json::to_vec_pretty(&entries)
            .map_err(|e| MigrationError::Backup(std::io::Error::other(e)))?;
        write_atomic(&path, &content).map_err(MigrationError::Backup)?;
        Ok(path)
    }

    /// Compare migrated rows against the source. Mismatches are logged, never fatal.
    fn verify(
        &self,
        source_prompts: &[Prompt],
        source_categories: &[Category],
        source_settings: &[(&String, &serde_json::Value)],
    ) -> Result<Vec<String>, MigrationError> {
        let mut mismatches = Vec::new();

        let stored_prompts: HashSet<String> =
            self.db.prompts().get_all()?.into_iter().map(|p| p.id).collect();
        let source_prompt_ids: HashSet<&str> = source_prompts.iter().map(|p| p.id.as_str()).collect();
        let migrated = source_prompt_ids
            .iter()
            .filter(|id| stored_prompts.contains(**id))
            .count();
        if migrated != source_prompt_ids.len() {
            mismatches.push(format!(
                "prompts: {} in source, {} migrated",
                source_prompt_ids.len(),
                migrated
            ));
        }

        let stored_categories: HashSet<String> =
            self.db.categories().get_all()?.into_iter().map(|c| c.id).collect();
        let source_category_ids: HashSet<&str> =
            source_categories.iter().map(|c| c.id.as_str()).collect();
        let migrated = source_category_ids
            .iter()
            .filter(|id| stored_categories.contains(**id))
            .count();
        if migrated != source_category_ids.len() {
            mismatches.push(format!(
                "categories: {} in source, {} migrated",
                source_category_ids.len(),
                migrated
            ));
        }

        let stored_settings = self.db.settings().get_all()?;
        let migrated = source_settings
            .iter()
            .filter(|(key, _)| stored_settings.contains_key(key.as_str()))
            .count();
        if migrated != source_settings.len() {
            mismatches.push(format!(
                "settings: {} in source, {} migrated",
                source_settings.len(),
                migrated
            ));
        }

        for mismatch in &mismatches {
            tracing::warn!(%mismatch, "migration integrity check failed");
        }
        Ok(mismatches)
    }
}
