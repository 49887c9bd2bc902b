//! Prompt DAO
//!
//! A prompt row, its tag links and its images are always written together in
//! one transaction. Tag links and images are replaced wholesale on every write
//! (delete-then-insert), never diffed.

use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension, Params, Row};

use super::{format_ts, is_constraint_violation, parse_ts, Database};
use crate::error::{StoreError, StoreResult};
use crate::models::{normalize_tags, now_millis, Prompt, PromptImage, PromptPatch};

const SELECT_PROMPTS: &str = "SELECT id, title, content, category_id, is_favorite, version, created_at, updated_at FROM prompts";

pub struct PromptDao {
    db: Database,
}

impl PromptDao {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_all(&self) -> StoreResult<Vec<Prompt>> {
        self.db.with_conn("get_all_prompts", |conn| {
            query(conn, &format!("{} ORDER BY updated_at DESC, id", SELECT_PROMPTS), [])
        })
    }

    pub fn get_by_id(&self, id: &str) -> StoreResult<Option<Prompt>> {
        self.db.with_conn("get_prompt", |conn| find(conn, id))
    }

    pub fn get_by_category(&self, category_id: &str) -> StoreResult<Vec<Prompt>> {
        self.db.with_conn("get_prompts_by_category", |conn| {
            query(
                conn,
                &format!("{} WHERE category_id = ?1 ORDER BY updated_at DESC, id", SELECT_PROMPTS),
                params![category_id],
            )
        })
    }

    /// Case-insensitive match on title, content or tag name
    pub fn search(&self, text: &str) -> StoreResult<Vec<Prompt>> {
        let pattern = format!("%{}%", text);
        self.db.with_conn("search_prompts", |conn| {
            query(
                conn,
                &format!(
                    "{} WHERE title LIKE ?1 OR content LIKE ?1 OR id IN (
                        SELECT pt.prompt_id FROM prompt_tags pt
                        JOIN tags t ON t.id = pt.tag_id
                        WHERE t.name LIKE ?1)
                     ORDER BY updated_at DESC, id",
                    SELECT_PROMPTS
                ),
                params![pattern],
            )
        })
    }

    pub fn count(&self) -> StoreResult<usize> {
        self.db.with_conn("count_prompts", |conn| {
            conn.query_row("SELECT COUNT(*) FROM prompts", [], |row| row.get(0))
        })
    }

    /// Insert a new prompt. Timestamps and version are assigned here.
    pub fn create(&self, mut prompt: Prompt) -> StoreResult<Prompt> {
        if prompt.id.trim().is_empty() {
            prompt.id = uuid::Uuid::new_v4().to_string();
        }
        let now = now_millis();
        prompt.created_at = now;
        prompt.updated_at = now;
        prompt.version = 1;
        prompt.tags = normalize_tags(&prompt.tags);

        self.db.with_tx("create_prompt", |tx| save(tx, &prompt))?;
        tracing::debug!(id = %prompt.id, "prompt created");
        Ok(prompt)
    }

    /// Apply a partial update. `createdAt` never moves; `updatedAt` always advances.
    pub fn update(&self, id: &str, patch: &PromptPatch) -> StoreResult<Prompt> {
        let updated = self.db.with_tx("update_prompt", |tx| {
            let Some(mut prompt) = find(tx, id)? else {
                return Ok(None);
            };
            prompt.apply(patch);
            touch(&mut prompt);
            save(tx, &prompt)?;
            Ok(Some(prompt))
        })?;

        updated.ok_or_else(|| StoreError::NotFound {
            entity: "prompt",
            id: id.to_string(),
        })
    }

    pub fn toggle_favorite(&self, id: &str) -> StoreResult<Prompt> {
        let current = self.get_by_id(id)?.ok_or_else(|| StoreError::NotFound {
            entity: "prompt",
            id: id.to_string(),
        })?;
        self.update(
            id,
            &PromptPatch {
                is_favorite: Some(!current.is_favorite),
                ..Default::default()
            },
        )
    }

    /// Write a prompt exactly as given, keeping its timestamps and version.
    /// Used when applying snapshots from another replica.
    pub fn upsert(&self, prompt: &Prompt) -> StoreResult<()> {
        self.db.with_tx("upsert_prompt", |tx| save(tx, prompt))
    }

    /// Returns `false` when no prompt had that id
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        self.db.with_tx("delete_prompt", |tx| {
            tx.execute("DELETE FROM prompt_tags WHERE prompt_id = ?1", params![id])?;
            tx.execute("DELETE FROM prompt_images WHERE prompt_id = ?1", params![id])?;
            let removed = tx.execute("DELETE FROM prompts WHERE id = ?1", params![id])?;
            Ok(removed > 0)
        })
    }
}

/// Bump version and move `updated_at` strictly forward
pub(crate) fn touch(prompt: &mut Prompt) {
    let now = now_millis();
    prompt.updated_at = if now > prompt.updated_at {
        now
    } else {
        prompt.updated_at + Duration::milliseconds(1)
    };
    prompt.version += 1;
}

fn row_to_prompt(row: &Row) -> rusqlite::Result<Prompt> {
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(Prompt {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        category: row.get(3)?,
        tags: Vec::new(),
        is_favorite: row.get::<_, i64>(4)? != 0,
        images: Vec::new(),
        version: row.get(5)?,
        created_at: parse_ts(6, &created_at)?,
        updated_at: parse_ts(7, &updated_at)?,
    })
}

fn query<P: Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<Vec<Prompt>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_prompt)?;
    let mut prompts = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    for prompt in &mut prompts {
        prompt.tags = load_tags(conn, &prompt.id)?;
        prompt.images = load_images(conn, &prompt.id)?;
    }
    Ok(prompts)
}

pub(crate) fn find(conn: &Connection, id: &str) -> rusqlite::Result<Option<Prompt>> {
    let prompt = conn
        .query_row(&format!("{} WHERE id = ?1", SELECT_PROMPTS), params![id], row_to_prompt)
        .optional()?;

    match prompt {
        Some(mut prompt) => {
            prompt.tags = load_tags(conn, &prompt.id)?;
            prompt.images = load_images(conn, &prompt.id)?;
            Ok(Some(prompt))
        }
        None => Ok(None),
    }
}

fn load_tags(conn: &Connection, prompt_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT t.name FROM prompt_tags pt
         JOIN tags t ON t.id = pt.tag_id
         WHERE pt.prompt_id = ?1
         ORDER BY t.name",
    )?;
    let rows = stmt.query_map(params![prompt_id], |row| row.get(0))?;
    rows.collect()
}

fn load_images(conn: &Connection, prompt_id: &str) -> rusqlite::Result<Vec<PromptImage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, data, caption FROM prompt_images WHERE prompt_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![prompt_id], |row| {
        Ok(PromptImage {
            id: row.get(0)?,
            data: row.get(1)?,
            caption: row.get(2)?,
        })
    })?;
    rows.collect()
}

fn insert_row(conn: &Connection, prompt: &Prompt) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO prompts (id, title, content, category_id, is_favorite, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            prompt.id,
            prompt.title,
            prompt.content,
            prompt.category,
            prompt.is_favorite as i64,
            prompt.version,
            format_ts(&prompt.created_at),
            format_ts(&prompt.updated_at),
        ],
    )?;
    Ok(())
}

fn update_row(conn: &Connection, prompt: &Prompt) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE prompts
         SET title = ?2, content = ?3, category_id = ?4, is_favorite = ?5,
             version = ?6, created_at = ?7, updated_at = ?8
         WHERE id = ?1",
        params![
            prompt.id,
            prompt.title,
            prompt.content,
            prompt.category,
            prompt.is_favorite as i64,
            prompt.version,
            format_ts(&prompt.created_at),
            format_ts(&prompt.updated_at),
        ],
    )
}

/// Replace the full tag-link set of a prompt
pub(crate) fn replace_tags(conn: &Connection, prompt_id: &str, tags: &[String]) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM prompt_tags WHERE prompt_id = ?1", params![prompt_id])?;

    for name in normalize_tags(tags) {
        conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
        conn.execute(
            "INSERT OR IGNORE INTO prompt_tags (prompt_id, tag_id)
             SELECT ?1, id FROM tags WHERE name = ?2",
            params![prompt_id, name],
        )?;
    }
    Ok(())
}

/// Replace the full image set of a prompt, preserving list order
pub(crate) fn replace_images(
    conn: &Connection,
    prompt_id: &str,
    images: &[PromptImage],
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM prompt_images WHERE prompt_id = ?1", params![prompt_id])?;

    for (position, image) in images.iter().enumerate() {
        conn.execute(
            "INSERT INTO prompt_images (id, prompt_id, position, data, caption)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![image.id, prompt_id, position as i64, image.data, image.caption],
        )?;
    }
    Ok(())
}

/// Insert the prompt row, falling back to update-in-place when the id exists,
/// then replace its tag links and images. Call inside a transaction.
pub(crate) fn save(conn: &Connection, prompt: &Prompt) -> rusqlite::Result<()> {
    match insert_row(conn, prompt) {
        Ok(()) => {}
        Err(e) if is_constraint_violation(&e) => {
            if update_row(conn, prompt)? == 0 {
                // Constraint was not the primary key (e.g. unknown category)
                return Err(e);
            }
        }
        Err(e) => return Err(e),
    }

    replace_tags(conn, &prompt.id, &prompt.tags)?;
    replace_images(conn, &prompt.id, &prompt.images)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    fn dao() -> (Database, PromptDao) {
        let db = Database::open_in_memory().unwrap();
        let dao = db.prompts();
        (db, dao)
    }

    #[test]
    fn test_create_and_get() {
        let (_db, dao) = dao();
        let mut prompt = Prompt::new("Translate", "Translate to Chinese")
            .with_id("p1")
            .with_tags(["zh", "basic"]);
        prompt.images.push(PromptImage::new("data:image/png;base64,AAAA"));

        let created = dao.create(prompt.clone()).unwrap();
        let fetched = dao.get_by_id("p1").unwrap().unwrap();

        assert_eq!(fetched, created);
        assert_eq!(fetched.title, prompt.title);
        assert_eq!(fetched.tags, vec!["basic", "zh"]);
        assert_eq!(fetched.images, prompt.images);
    }

    #[test]
    fn test_update_advances_updated_at() {
        let (_db, dao) = dao();
        let created = dao.create(Prompt::new("A", "a").with_id("p1")).unwrap();

        let patch = PromptPatch {
            title: Some("B".into()),
            ..Default::default()
        };
        let first = dao.update("p1", &patch).unwrap();
        let second = dao.update("p1", &patch).unwrap();

        assert_eq!(first.created_at, created.created_at);
        assert_eq!(second.created_at, created.created_at);
        assert!(first.updated_at > created.updated_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.version, 3);
    }

    #[test]
    fn test_update_missing_prompt() {
        let (_db, dao) = dao();
        let err = dao.update("nope", &PromptPatch::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_tags_replaced_not_merged() {
        let (db, dao) = dao();
        dao.create(Prompt::new("A", "a").with_id("p1").with_tags(["x", "y"])).unwrap();
        let updated = dao
            .update(
                "p1",
                &PromptPatch {
                    tags: Some(vec!["y".into(), "z".into()]),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.tags, vec!["y", "z"]);
        // "x" is orphaned, not deleted
        assert_eq!(db.counts().unwrap().tags, 3);
        assert_eq!(db.counts().unwrap().prompt_tags, 2);
    }

    #[test]
    fn test_unknown_category_fails_uniformly() {
        let (_db, dao) = dao();
        let err = dao
            .create(Prompt::new("A", "a").with_category("missing"))
            .unwrap_err();
        assert!(matches!(err, StoreError::OperationFailed { operation: "create_prompt", .. }));
    }

    #[test]
    fn test_search_and_category_filter() {
        let (db, dao) = dao();
        db.categories().create(Category::new("code", "Code")).unwrap();
        dao.create(Prompt::new("Refactor", "Clean up").with_id("p1").with_category("code")).unwrap();
        dao.create(Prompt::new("Poem", "Write verse").with_id("p2").with_tags(["creative"])).unwrap();

        assert_eq!(dao.get_by_category("code").unwrap().len(), 1);
        assert_eq!(dao.search("verse").unwrap()[0].id, "p2");
        assert_eq!(dao.search("creat").unwrap()[0].id, "p2");
        assert!(dao.search("nothing-matches").unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_links() {
        let (db, dao) = dao();
        dao.create(Prompt::new("A", "a").with_id("p1").with_tags(["x"])).unwrap();
        assert!(dao.delete("p1").unwrap());
        assert!(!dao.delete("p1").unwrap());
        assert_eq!(db.counts().unwrap().prompt_tags, 0);
    }

    #[test]
    fn test_toggle_favorite() {
        let (_db, dao) = dao();
        dao.create(Prompt::new("A", "a").with_id("p1")).unwrap();
        assert!(dao.toggle_favorite("p1").unwrap().is_favorite);
        assert!(!dao.toggle_favorite("p1").unwrap().is_favorite);
    }
}
