//! Settings DAO
//!
//! Each entry stores its JSON value together with the primitive type it was
//! written as, so a reader expecting a boolean notices when it gets a string.

use rusqlite::{params, Connection, OptionalExtension};

use super::{format_ts, Database};
use crate::error::{StoreError, StoreResult};
use crate::models::{now_millis, SettingEntry, SettingType, Settings};

pub struct SettingsDao {
    db: Database,
}

impl SettingsDao {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.get_entry(key)?.map(|entry| entry.value))
    }

    pub fn get_entry(&self, key: &str) -> StoreResult<Option<SettingEntry>> {
        let raw = self.db.with_conn("get_setting", |conn| {
            conn.query_row(
                "SELECT value, value_type FROM settings WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
        })?;

        let Some((value, value_type)) = raw else {
            return Ok(None);
        };

        let value: serde_json::Value = serde_json::from_str(&value)
            .map_err(|e| StoreError::operation("get_setting", e))?;
        let value_type = SettingType::parse(&value_type).unwrap_or_else(|| SettingType::of(&value));

        Ok(Some(SettingEntry {
            key: key.to_string(),
            value,
            value_type,
        }))
    }

    /// Read a value and check it was stored with the expected type
    pub fn get_typed(&self, key: &str, expected: SettingType) -> StoreResult<Option<serde_json::Value>> {
        let Some(entry) = self.get_entry(key)? else {
            return Ok(None);
        };

        let actual = SettingType::of(&entry.value);
        if entry.value_type != expected || actual != expected {
            return Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: entry.value_type.to_string(),
            });
        }
        Ok(Some(entry.value))
    }

    pub fn get_all(&self) -> StoreResult<Settings> {
        let rows = self.db.with_conn("get_all_settings", |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut settings = Settings::new();
        for (key, raw) in rows {
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    settings.insert(key, value);
                }
                Err(e) => tracing::warn!(key, error = %e, "skipping unreadable setting"),
            }
        }
        Ok(settings)
    }

    pub fn set(&self, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        self.db.with_conn("set_setting", |conn| write(conn, key, value))
    }

    /// Write many entries in one transaction
    pub fn set_many(&self, entries: &Settings) -> StoreResult<()> {
        self.db.with_tx("set_settings", |tx| {
            for (key, value) in entries {
                write(tx, key, value)?;
            }
            Ok(())
        })
    }

    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        self.db.with_conn("delete_setting", |conn| {
            Ok(conn.execute("DELETE FROM settings WHERE key = ?1", params![key])? > 0)
        })
    }
}

pub(crate) fn write(conn: &Connection, key: &str, value: &serde_json::Value) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value, value_type, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             value_type = excluded.value_type,
             updated_at = excluded.updated_at",
        params![
            key,
            value.to_string(),
            SettingType::of(value).as_str(),
            format_ts(&now_millis()),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.settings();
        settings.set("theme", &json!("dark")).unwrap();
        settings.set("fontSize", &json!(14)).unwrap();

        assert_eq!(settings.get("theme").unwrap(), Some(json!("dark")));
        let entry = settings.get_entry("fontSize").unwrap().unwrap();
        assert_eq!(entry.value_type, SettingType::Number);
        assert_eq!(settings.get_all().unwrap().len(), 2);
    }

    #[test]
    fn test_type_mismatch_detected() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.settings();
        settings.set("autoSync", &json!("yes")).unwrap();

        let err = settings.get_typed("autoSync", SettingType::Boolean).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));

        settings.set("autoSync", &json!(true)).unwrap();
        assert_eq!(
            settings.get_typed("autoSync", SettingType::Boolean).unwrap(),
            Some(json!(true))
        );
    }

    #[test]
    fn test_set_many_and_delete() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.settings();
        let mut entries = Settings::new();
        entries.insert("a".into(), json!(1));
        entries.insert("b".into(), json!({"nested": true}));
        settings.set_many(&entries).unwrap();

        assert_eq!(settings.get_all().unwrap(), entries);
        assert!(settings.delete("a").unwrap());
        assert!(!settings.delete("a").unwrap());
        assert_eq!(settings.get("a").unwrap(), None);
    }
}
