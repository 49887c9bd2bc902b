//! Relational store
//!
//! One SQLite file holds prompts, categories, tags, prompt-tag links, prompt
//! images and the settings table. The DAOs in the submodules are the only code
//! that issues SQL. Every multi-table write runs inside a transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::models::{Category, Prompt, Settings, SENTINEL_CATEGORY_ID};

pub mod categories;
pub mod prompts;
pub mod schema;
pub mod settings;
pub mod tags;

pub use categories::CategoryDao;
pub use prompts::PromptDao;
pub use settings::SettingsDao;
pub use tags::TagDao;

/// Shared handle to the relational store.
///
/// Cloning is cheap; all clones share one connection, which keeps the file
/// single-writer within the process.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::operation("open", e))?;
        }

        let conn = Connection::open(&path).map_err(|e| StoreError::operation("open", e))?;
        Self::init(conn, Some(path))
    }

    /// In-memory database, used by tests and dry runs
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::operation("open", e))?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| StoreError::operation("init", e))?;
        conn.execute_batch(schema::SCHEMA)
            .map_err(|e| StoreError::operation("init", e))?;

        tracing::debug!(path = ?path, "relational store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Path of the database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn prompts(&self) -> PromptDao {
        PromptDao::new(self.clone())
    }

    pub fn categories(&self) -> CategoryDao {
        CategoryDao::new(self.clone())
    }

    pub fn tags(&self) -> TagDao {
        TagDao::new(self.clone())
    }

    pub fn settings(&self) -> SettingsDao {
        SettingsDao::new(self.clone())
    }

    /// Run a read or single-statement write
    pub(crate) fn with_conn<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(|e| StoreError::operation(operation, e))
    }

    /// Run `f` inside a transaction; commits on `Ok`, rolls back otherwise
    pub(crate) fn with_tx<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&Transaction) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock();
        run_tx(&mut conn, f).map_err(|e| StoreError::operation(operation, e))
    }

    /// Make the store hold exactly the given snapshot, in one transaction.
    ///
    /// Prompts and categories absent from the snapshot are removed (prompts in a
    /// removed category are re-pointed first). A prompt whose `updatedAt` is
    /// earlier than its `createdAt` is stored with `updatedAt = createdAt`. Settings keys for which `keep`
    /// returns true survive even when absent from the snapshot.
    pub fn replace_contents(
        &self,
        prompts: &[Prompt],
        categories: &[Category],
        settings: &Settings,
        keep: impl Fn(&str) -> bool,
    ) -> StoreResult<()> {
        let category_ids: HashSet<&str> = categories
            .iter()
            .map(|c| c.id.as_str())
            .chain(std::iter::once(SENTINEL_CATEGORY_ID))
            .collect();
        let prompt_ids: HashSet<&str> = prompts.iter().map(|p| p.id.as_str()).collect();

        self.with_tx("replace_contents", |tx| {
            for category in categories {
                categories::save(tx, category)?;
            }

            for prompt in prompts {
                let mut prompt = prompt.clone();
                if !category_ids.contains(prompt.category.as_str()) {
                    prompt.category = SENTINEL_CATEGORY_ID.to_string();
                }
                prompt.clamp_timestamps();
                prompts::save(tx, &prompt)?;
            }

            let stale_prompts = select_ids(tx, "SELECT id FROM prompts")?;
            for id in stale_prompts.iter().filter(|id| !prompt_ids.contains(id.as_str())) {
                tx.execute("DELETE FROM prompts WHERE id = ?1", [id])?;
            }

            let stale_categories = select_ids(tx, "SELECT id FROM categories")?;
            for id in stale_categories.iter().filter(|id| !category_ids.contains(id.as_str())) {
                categories::repoint_prompts(tx, id)?;
                tx.execute("DELETE FROM categories WHERE id = ?1", [id])?;
            }

            for (key, value) in settings {
                settings::write(tx, key, value)?;
            }
            let stale_settings = select_ids(tx, "SELECT key FROM settings")?;
            for key in stale_settings
                .iter()
                .filter(|key| !settings.contains_key(key.as_str()) && !keep(key))
            {
                tx.execute("DELETE FROM settings WHERE key = ?1", [key])?;
            }

            tx.execute(
                "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM prompt_tags)",
                [],
            )?;
            Ok(())
        })
    }

    /// Row counts per table, used for integrity checks and status output
    pub fn counts(&self) -> StoreResult<TableCounts> {
        self.with_conn("counts", |conn| {
            let count = |table: &str| -> rusqlite::Result<usize> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
            };
            Ok(TableCounts {
                prompts: count("prompts")?,
                categories: count("categories")?,
                tags: count("tags")?,
                prompt_tags: count("prompt_tags")?,
                prompt_images: count("prompt_images")?,
                settings: count("settings")?,
            })
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub prompts: usize,
    pub categories: usize,
    pub tags: usize,
    pub prompt_tags: usize,
    pub prompt_images: usize,
    pub settings: usize,
}

fn run_tx<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn select_ids(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_seeds_sentinel_category() {
        let db = Database::open_in_memory().unwrap();
        let counts = db.counts().unwrap();
        assert_eq!(counts.categories, 1);
        assert_eq!(counts.prompts, 0);
    }

    #[test]
    fn test_open_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/prompts.db");
        Database::open(&path).unwrap();
        let db = Database::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert_eq!(db.counts().unwrap().categories, 1);
    }

    #[test]
    fn test_replace_contents_mirrors_snapshot() {
        let db = Database::open_in_memory().unwrap();
        db.categories().create(Category::new("old", "Old")).unwrap();
        db.prompts().create(Prompt::new("Stale", "x").with_id("stale").with_tags(["gone"])).unwrap();
        db.settings().set("migration_status", &serde_json::json!("completed")).unwrap();
        db.settings().set("theme", &serde_json::json!("light")).unwrap();

        let prompts = vec![
            Prompt::new("Keep", "k").with_id("p1").with_category("code"),
            Prompt::new("Orphan", "o").with_id("p2").with_category("missing"),
        ];
        let categories = vec![Category::sentinel(), Category::new("code", "Code")];
        let mut settings = Settings::new();
        settings.insert("fontSize".into(), serde_json::json!(14));

        db.replace_contents(&prompts, &categories, &settings, |k| k.starts_with("migration_"))
            .unwrap();

        let counts = db.counts().unwrap();
        assert_eq!(counts.prompts, 2);
        assert_eq!(counts.categories, 2);
        assert_eq!(counts.tags, 0);
        assert_eq!(db.prompts().get_by_id("p2").unwrap().unwrap().category, SENTINEL_CATEGORY_ID);
        let stored = db.settings().get_all().unwrap();
        assert!(stored.contains_key("migration_status"));
        assert!(stored.contains_key("fontSize"));
        assert!(!stored.contains_key("theme"));
    }

    #[test]
    fn test_replace_contents_clamps_inverted_timestamps() {
        let db = Database::open_in_memory().unwrap();
        let mut skewed = Prompt::new("Skewed", "s").with_id("p1");
        skewed.updated_at = skewed.created_at - chrono::Duration::hours(2);

        db.replace_contents(&[skewed.clone()], &[Category::sentinel()], &Settings::new(), |_| false)
            .unwrap();

        let stored = db.prompts().get_by_id("p1").unwrap().unwrap();
        assert_eq!(stored.created_at, skewed.created_at);
        assert_eq!(stored.updated_at, skewed.created_at);
    }

    #[test]
    fn test_timestamp_format_roundtrip() {
        let now = crate::models::now_millis();
        let raw = format_ts(&now);
        assert!(raw.ends_with('Z'));
        assert_eq!(parse_ts(0, &raw).unwrap(), now);
    }
}
