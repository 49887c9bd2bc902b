//! Flat store to relational store migration, end to end through the
//! persistence host and the repository

use std::sync::Arc;

use prompt_sync::flat_store::{self, CATEGORIES_KEY, PROMPTS_KEY, SETTINGS_KEY};
use prompt_sync::models::{Category, MigrationStatus, Prompt, Settings};
use prompt_sync::{
    Database, DatabaseClient, FlatStore, JsonFileStore, LocalHost, MigrationManager,
    PromptRepository, StorageMode,
};
use serde_json::json;

struct Fixture {
    _dir: tempfile::TempDir,
    db: Database,
    flat: Arc<dyn FlatStore>,
    repo: PromptRepository,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let flat: Arc<dyn FlatStore> = Arc::new(JsonFileStore::open(dir.path().join("flat.json")).unwrap());

    let prompts = vec![
        Prompt::new("Translate", "Translate to English")
            .with_id("p1")
            .with_tags(["zh", "basic"]),
        Prompt::new("Review", "Review this code")
            .with_id("p2")
            .with_category("code"),
        Prompt::new("Orphan", "Points at a category that is gone")
            .with_id("p3")
            .with_category("deleted"),
    ];
    let categories = vec![Category::sentinel(), Category::new("code", "Code")];
    let mut settings = Settings::new();
    settings.insert("theme".into(), json!("dark"));
    settings.insert("fontSize".into(), json!(14));

    flat_store::set_json(flat.as_ref(), PROMPTS_KEY, &prompts).unwrap();
    flat_store::set_json(flat.as_ref(), CATEGORIES_KEY, &categories).unwrap();
    flat_store::set_json(flat.as_ref(), SETTINGS_KEY, &settings).unwrap();

    let db = Database::open(dir.path().join("prompts.db")).unwrap();
    let migration = MigrationManager::new(db.clone(), flat.clone(), dir.path().join("backups"));
    let client = DatabaseClient::new(Arc::new(LocalHost::new(db.clone(), migration)));
    let repo = PromptRepository::new(client, flat.clone());

    Fixture {
        _dir: dir,
        db,
        flat,
        repo,
    }
}

#[test]
fn test_migration_switches_repository_to_relational() {
    let f = fixture();
    assert_eq!(f.repo.mode(), StorageMode::Flat);
    assert_eq!(f.repo.get_all_prompts().unwrap().len(), 3);

    let report = f.repo.client().migrate().unwrap();
    assert!(!report.skipped);
    assert_eq!(report.prompts, 3);
    assert!(report.mismatches.is_empty());
    assert!(report.backup_path.unwrap().exists());

    assert_eq!(f.repo.mode(), StorageMode::Relational);
    assert_eq!(f.repo.client().migration_status().unwrap(), MigrationStatus::Completed);

    let orphan = f.repo.get_prompt("p3").unwrap().unwrap();
    assert_eq!(orphan.category, "general");
    let translated = f.repo.get_prompt("p1").unwrap().unwrap();
    assert_eq!(translated.tags, vec!["basic", "zh"]);
}

#[test]
fn test_migration_twice_keeps_row_counts() {
    let f = fixture();
    f.repo.client().migrate().unwrap();
    let once = f.db.counts().unwrap();

    let report = f.repo.client().migrate().unwrap();
    assert!(report.skipped);
    assert_eq!(f.db.counts().unwrap(), once);
    assert_eq!(once.prompts, 3);
    assert_eq!(once.categories, 2);
}

#[test]
fn test_relational_writes_are_mirrored_to_flat_store() {
    let f = fixture();
    f.repo.client().migrate().unwrap();

    f.repo.create_prompt(Prompt::new("New", "n").with_id("p4")).unwrap();
    f.repo.set_setting("theme", json!("light")).unwrap();

    let mirrored: Vec<Prompt> = flat_store::get_json(f.flat.as_ref(), PROMPTS_KEY).unwrap().unwrap();
    assert!(mirrored.iter().any(|p| p.id == "p4"));
    let settings: Settings = flat_store::get_json(f.flat.as_ref(), SETTINGS_KEY).unwrap().unwrap();
    assert_eq!(settings.get("theme"), Some(&json!("light")));
    assert!(!settings.keys().any(|k| k.starts_with("migration_")));
}

#[test]
fn test_rollback_returns_to_flat_mode() {
    let f = fixture();
    f.repo.client().migrate().unwrap();
    f.repo.client().rollback_migration().unwrap();

    assert_eq!(f.repo.mode(), StorageMode::Flat);
    assert_eq!(f.db.prompts().count().unwrap(), 0);
    assert_eq!(f.repo.get_all_prompts().unwrap().len(), 3);

    let report = f.repo.client().migrate().unwrap();
    assert!(!report.skipped);
    assert_eq!(f.db.prompts().count().unwrap(), 3);
}
