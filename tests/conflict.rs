//! Conflict detection, resolution and checksum properties

use chrono::{Duration, TimeZone, Utc};
use prompt_sync::checksum;
use prompt_sync::models::{Category, Prompt, Settings, SyncData, SyncSource};
use prompt_sync::sync::conflict::{
    detect_conflict, merge, resolve, ConflictStrategy, DEFAULT_CONFLICT_WINDOW,
};
use prompt_sync::SyncError;

fn at(prompts: Vec<Prompt>, offset_ms: i64) -> SyncData {
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    SyncData::at(
        prompts,
        vec![Category::sentinel()],
        Settings::new(),
        SyncSource::Primary,
        base + Duration::milliseconds(offset_ms),
    )
}

#[test]
fn test_detection_is_symmetric_across_offsets() {
    let a = at(vec![Prompt::new("A", "a").with_id("a")], 0);
    for offset in [-2000, -1000, -999, -1, 0, 1, 500, 999, 1000, 5000] {
        let b = at(vec![Prompt::new("B", "b").with_id("b")], offset);
        let forward = detect_conflict(&a, &b, DEFAULT_CONFLICT_WINDOW);
        assert_eq!(forward, detect_conflict(&b, &a, DEFAULT_CONFLICT_WINDOW));
        assert_eq!(forward, offset.abs() < 1000, "offset {}", offset);
    }
}

#[test]
fn test_self_never_conflicts() {
    let a = at(vec![Prompt::new("A", "a")], 0);
    assert!(!detect_conflict(&a, &a, DEFAULT_CONFLICT_WINDOW));
}

#[test]
fn test_window_is_configurable() {
    let a = at(vec![Prompt::new("A", "a").with_id("a")], 0);
    let b = at(vec![Prompt::new("B", "b").with_id("b")], 3000);
    assert!(!detect_conflict(&a, &b, DEFAULT_CONFLICT_WINDOW));
    assert!(detect_conflict(&a, &b, std::time::Duration::from_secs(5)));
}

#[test]
fn test_merge_prefers_later_record_and_unions() {
    let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap();
    let mut x_local = Prompt::new("X local", "x").with_id("x");
    x_local.updated_at = t1;
    let mut x_remote = x_local.clone();
    x_remote.title = "X remote".into();
    x_remote.updated_at = t1 + Duration::minutes(5);

    let local = at(vec![x_local, Prompt::new("L", "l").with_id("l")], 300);
    let remote = at(vec![x_remote, Prompt::new("R", "r").with_id("r")], 0);

    let merged = merge(&local, &remote);
    let ids: Vec<&str> = merged.prompts.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["l", "r", "x"]);
    assert_eq!(merged.prompts.iter().find(|p| p.id == "x").unwrap().title, "X remote");
    assert_eq!(merged.source(), SyncSource::Primary);

    // Merging is order independent
    assert_eq!(merge(&remote, &local).checksum(), merged.checksum());
}

#[test]
fn test_strategies() {
    let local = at(vec![Prompt::new("L", "l").with_id("p")], 0);
    let remote = at(vec![Prompt::new("R", "r").with_id("p")], 400);

    let winner = resolve(&local, &remote, ConflictStrategy::Timestamp).unwrap();
    assert_eq!(winner.checksum(), remote.checksum());

    assert!(matches!(
        resolve(&local, &remote, ConflictStrategy::Manual),
        Err(SyncError::ConflictUnresolved { .. })
    ));
}

#[test]
fn test_checksum_ignores_noop_edits() {
    let prompt = Prompt::new("Translate", "t").with_id("p1").with_tags(["zh"]);
    let categories = vec![Category::sentinel()];
    let settings = Settings::new();
    let before = checksum::compute(std::slice::from_ref(&prompt), &categories, &settings);

    let mut toggled = prompt.clone();
    toggled.tags.push("basic".into());
    let during = checksum::compute(std::slice::from_ref(&toggled), &categories, &settings);
    toggled.tags.retain(|t| t != "basic");
    let after = checksum::compute(std::slice::from_ref(&toggled), &categories, &settings);

    assert_ne!(before, during);
    assert_eq!(before, after);
}
