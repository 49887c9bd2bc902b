//! Tag DAO
//!
//! Tags exist only through prompt links. A tag nobody references any more is
//! an orphan and can be pruned.

use rusqlite::{params, OptionalExtension, Row};

use super::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::Tag;

const SELECT_TAGS: &str = "SELECT t.id, t.name, COUNT(pt.prompt_id)
     FROM tags t
     LEFT JOIN prompt_tags pt ON pt.tag_id = t.id";

pub struct TagDao {
    db: Database,
}

impl TagDao {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_all(&self) -> StoreResult<Vec<Tag>> {
        self.db.with_conn("get_all_tags", |conn| {
            let mut stmt = conn.prepare(&format!("{} GROUP BY t.id ORDER BY t.name", SELECT_TAGS))?;
            let rows = stmt.query_map([], row_to_tag)?;
            rows.collect()
        })
    }

    pub fn get_by_name(&self, name: &str) -> StoreResult<Option<Tag>> {
        self.db.with_conn("get_tag", |conn| {
            conn.query_row(
                &format!("{} WHERE t.name = ?1 GROUP BY t.id", SELECT_TAGS),
                params![name.trim()],
                row_to_tag,
            )
            .optional()
        })
    }

    pub fn get_for_prompt(&self, prompt_id: &str) -> StoreResult<Vec<Tag>> {
        self.db.with_conn("get_prompt_tags", |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE t.id IN (SELECT tag_id FROM prompt_tags WHERE prompt_id = ?1)
                 GROUP BY t.id ORDER BY t.name",
                SELECT_TAGS
            ))?;
            let rows = stmt.query_map(params![prompt_id], row_to_tag)?;
            rows.collect()
        })
    }

    /// Insert-or-ignore on the unique name index, then return the row
    pub fn get_or_create(&self, name: &str) -> StoreResult<Tag> {
        let name = name.trim();
        self.db.with_conn("create_tag", |conn| {
            conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
            conn.query_row(
                &format!("{} WHERE t.name = ?1 GROUP BY t.id", SELECT_TAGS),
                params![name],
                row_to_tag,
            )
        })
    }

    /// Rename a tag. Renaming onto an existing name merges the links.
    pub fn rename(&self, from: &str, to: &str) -> StoreResult<Tag> {
        let to = to.trim().to_string();
        let found = self.db.with_tx("rename_tag", |tx| {
            let Some(old_id) = tx
                .query_row("SELECT id FROM tags WHERE name = ?1", params![from], |row| {
                    row.get::<_, i64>(0)
                })
                .optional()?
            else {
                return Ok(false);
            };

            tx.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![to])?;
            let new_id: i64 =
                tx.query_row("SELECT id FROM tags WHERE name = ?1", params![to], |row| row.get(0))?;
            if new_id != old_id {
                tx.execute(
                    "INSERT OR IGNORE INTO prompt_tags (prompt_id, tag_id)
                     SELECT prompt_id, ?2 FROM prompt_tags WHERE tag_id = ?1",
                    params![old_id, new_id],
                )?;
                tx.execute("DELETE FROM prompt_tags WHERE tag_id = ?1", params![old_id])?;
                tx.execute("DELETE FROM tags WHERE id = ?1", params![old_id])?;
            }
            Ok(true)
        })?;

        if !found {
            return Err(StoreError::NotFound {
                entity: "tag",
                id: from.to_string(),
            });
        }
        self.get_or_create(&to)
    }

    /// Delete a tag and all of its prompt links
    pub fn delete(&self, id: i64) -> StoreResult<bool> {
        self.db.with_tx("delete_tag", |tx| {
            tx.execute("DELETE FROM prompt_tags WHERE tag_id = ?1", params![id])?;
            let removed = tx.execute("DELETE FROM tags WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
    }

    /// Remove tags that no prompt references. Returns how many were removed.
    pub fn prune_orphans(&self) -> StoreResult<usize> {
        let removed = self.db.with_conn("prune_tags", |conn| {
            conn.execute(
                "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM prompt_tags)",
                [],
            )
        })?;
        if removed > 0 {
            tracing::debug!(removed, "pruned orphaned tags");
        }
        Ok(removed)
    }
}

fn row_to_tag(row: &Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        prompt_count: row.get(2)?,
    })
}
