//! Category DAO

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use super::{is_constraint_violation, Database};
use crate::error::{StoreError, StoreResult};
use crate::models::{Category, CategoryPatch, SENTINEL_CATEGORY_ID};

pub struct CategoryDao {
    db: Database,
}

impl CategoryDao {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_all(&self) -> StoreResult<Vec<Category>> {
        self.db.with_conn("get_all_categories", |conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, icon FROM categories ORDER BY sort_order, name")?;
            let rows = stmt.query_map([], row_to_category)?;
            rows.collect()
        })
    }

    pub fn get_by_id(&self, id: &str) -> StoreResult<Option<Category>> {
        self.db.with_conn("get_category", |conn| find(conn, id))
    }

    pub fn create(&self, category: Category) -> StoreResult<Category> {
        self.db.with_conn("create_category", |conn| insert(conn, &category))?;
        Ok(category)
    }

    pub fn update(&self, id: &str, patch: &CategoryPatch) -> StoreResult<Category> {
        let updated = self.db.with_tx("update_category", |tx| {
            let Some(mut category) = find(tx, id)? else {
                return Ok(None);
            };
            if let Some(ref name) = patch.name {
                category.name = name.clone();
            }
            if let Some(ref icon) = patch.icon {
                category.icon = icon.clone();
            }
            update(tx, &category)?;
            Ok(Some(category))
        })?;

        updated.ok_or_else(|| StoreError::NotFound {
            entity: "category",
            id: id.to_string(),
        })
    }

    /// Write a category exactly as given, inserting or updating in place
    pub fn upsert(&self, category: &Category) -> StoreResult<()> {
        self.db.with_tx("upsert_category", |tx| save(tx, category))
    }

    /// Delete a category after re-pointing every prompt that references it to
    /// the sentinel category. Returns the number of re-pointed prompts.
    pub fn delete(&self, id: &str) -> StoreResult<usize> {
        if id == SENTINEL_CATEGORY_ID {
            return Err(StoreError::SentinelCategory);
        }

        let (repointed, removed) = self.db.with_tx("delete_category", |tx| {
            let repointed = repoint_prompts(tx, id)?;
            let removed = tx.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
            Ok((repointed, removed))
        })?;

        if removed == 0 {
            return Err(StoreError::NotFound {
                entity: "category",
                id: id.to_string(),
            });
        }

        tracing::info!(id, repointed, "category deleted");
        Ok(repointed)
    }

    /// Swap display names after a language change. Ids never change.
    pub fn apply_localized_names(&self, names: &HashMap<String, String>) -> StoreResult<usize> {
        self.db.with_tx("localize_categories", |tx| {
            let mut changed = 0;
            for (id, name) in names {
                changed += tx.execute(
                    "UPDATE categories SET name = ?2 WHERE id = ?1",
                    params![id, name],
                )?;
            }
            Ok(changed)
        })
    }
}

fn row_to_category(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        icon: row.get(2)?,
    })
}

pub(crate) fn find(conn: &Connection, id: &str) -> rusqlite::Result<Option<Category>> {
    conn.query_row(
        "SELECT id, name, icon FROM categories WHERE id = ?1",
        params![id],
        row_to_category,
    )
    .optional()
}

fn insert(conn: &Connection, category: &Category) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO categories (id, name, icon, sort_order)
         VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(sort_order), 0) + 1 FROM categories))",
        params![category.id, category.name, category.icon],
    )?;
    Ok(())
}

fn update(conn: &Connection, category: &Category) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE categories SET name = ?2, icon = ?3 WHERE id = ?1",
        params![category.id, category.name, category.icon],
    )
}

/// Insert, falling back to update-in-place on a unique-constraint conflict
pub(crate) fn save(conn: &Connection, category: &Category) -> rusqlite::Result<()> {
    match insert(conn, category) {
        Ok(()) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            update(conn, category)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Point every prompt in `category_id` at the sentinel category
pub(crate) fn repoint_prompts(conn: &Connection, category_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE prompts SET category_id = ?2 WHERE category_id = ?1",
        params![category_id, SENTINEL_CATEGORY_ID],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Prompt;

    #[test]
    fn test_delete_repoints_prompts() {
        let db = Database::open_in_memory().unwrap();
        let categories = db.categories();
        let prompts = db.prompts();

        categories.create(Category::new("writing", "Writing")).unwrap();
        for i in 0..3 {
            prompts
                .create(Prompt::new(format!("P{}", i), "x").with_category("writing"))
                .unwrap();
        }
        prompts.create(Prompt::new("Other", "y")).unwrap();

        let repointed = categories.delete("writing").unwrap();

        assert_eq!(repointed, 3);
        assert_eq!(prompts.count().unwrap(), 4);
        assert_eq!(prompts.get_by_category(SENTINEL_CATEGORY_ID).unwrap().len(), 4);
        assert!(categories.get_by_id("writing").unwrap().is_none());
    }

    #[test]
    fn test_sentinel_is_protected() {
        let db = Database::open_in_memory().unwrap();
        let err = db.categories().delete(SENTINEL_CATEGORY_ID).unwrap_err();
        assert!(matches!(err, StoreError::SentinelCategory));
    }

    #[test]
    fn test_duplicate_create_fails_uniformly() {
        let db = Database::open_in_memory().unwrap();
        let categories = db.categories();
        categories.create(Category::new("code", "Code")).unwrap();
        let err = categories.create(Category::new("code", "Code again")).unwrap_err();
        assert!(matches!(err, StoreError::OperationFailed { operation: "create_category", .. }));
    }

    #[test]
    fn test_localized_names_keep_ids() {
        let db = Database::open_in_memory().unwrap();
        let categories = db.categories();
        categories.create(Category::new("code", "Code")).unwrap();

        let mut names = HashMap::new();
        names.insert("code".to_string(), "代码".to_string());
        names.insert(SENTINEL_CATEGORY_ID.to_string(), "通用".to_string());
        assert_eq!(categories.apply_localized_names(&names).unwrap(), 2);

        let code = categories.get_by_id("code").unwrap().unwrap();
        assert_eq!(code.name, "代码");
    }

    #[test]
    fn test_update_and_upsert() {
        let db = Database::open_in_memory().unwrap();
        let categories = db.categories();
        categories.create(Category::new("code", "Code")).unwrap();

        let updated = categories
            .update(
                "code",
                &CategoryPatch {
                    icon: Some(Some("💻".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.icon.as_deref(), Some("💻"));

        categories.upsert(&Category::new("code", "Programming")).unwrap();
        assert_eq!(categories.get_by_id("code").unwrap().unwrap().name, "Programming");
        assert_eq!(categories.get_all().unwrap().len(), 2);
    }
}
