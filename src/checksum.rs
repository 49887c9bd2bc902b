//! Snapshot checksums
//!
//! The checksum is the only divergence detector between replicas, so it is
//! computed over a canonical view: prompts and categories sorted by id, tags
//! normalized, and bookkeeping fields (version, createdAt, updatedAt) left
//! out. Two snapshots with the same content hash the same no matter when or
//! in what order they were assembled.

use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{normalize_tags, Category, Prompt, PromptImage, Settings};

#[derive(Serialize)]
struct CanonicalPrompt<'a> {
    id: &'a str,
    title: &'a str,
    content: &'a str,
    category: &'a str,
    tags: Vec<String>,
    is_favorite: bool,
    images: &'a [PromptImage],
}

#[derive(Serialize)]
struct Canonical<'a> {
    prompts: Vec<CanonicalPrompt<'a>>,
    categories: Vec<&'a Category>,
    settings: &'a Settings,
}

/// Compute the `sha256-<base64>` checksum of a dataset
pub fn compute(prompts: &[Prompt], categories: &[Category], settings: &Settings) -> String {
    let mut canonical_prompts: Vec<CanonicalPrompt> = prompts
        .iter()
        .map(|p| CanonicalPrompt {
            id: &p.id,
            title: &p.title,
            content: &p.content,
            category: &p.category,
            tags: normalize_tags(&p.tags),
            is_favorite: p.is_favorite,
            images: &p.images,
        })
        .collect();
    canonical_prompts.sort_by(|a, b| a.id.cmp(b.id));

    let mut canonical_categories: Vec<&Category> = categories.iter().collect();
    canonical_categories.sort_by(|a, b| a.id.cmp(&b.id));

    let canonical = Canonical {
        prompts: canonical_prompts,
        categories: canonical_categories,
        settings,
    };

    // Serializing plain structs, strings and BTreeMaps cannot fail
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!(
        "sha256-{}",
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> (Vec<Prompt>, Vec<Category>, Settings) {
        let p1 = Prompt::new("Translate", "Translate this").with_id("p1").with_tags(["zh", "basic"]);
        let p2 = Prompt::new("Summarize", "Summarize this").with_id("p2");
        let mut settings = Settings::new();
        settings.insert("theme".into(), json!("dark"));
        (vec![p1, p2], vec![Category::sentinel()], settings)
    }

    #[test]
    fn test_checksum_is_pure() {
        let (prompts, categories, settings) = sample();
        let a = compute(&prompts, &categories, &settings);
        let b = compute(&prompts.clone(), &categories.clone(), &settings.clone());
        assert_eq!(a, b);
        assert!(a.starts_with("sha256-"));
    }

    #[test]
    fn test_checksum_ignores_order() {
        let (mut prompts, categories, settings) = sample();
        let a = compute(&prompts, &categories, &settings);
        prompts.reverse();
        prompts[0].tags.reverse();
        assert_eq!(a, compute(&prompts, &categories, &settings));
    }

    #[test]
    fn test_tag_toggle_restores_checksum() {
        let (mut prompts, categories, settings) = sample();
        let original = compute(&prompts, &categories, &settings);

        prompts[0].tags.push("urgent".into());
        prompts[0].updated_at = chrono::Utc::now();
        prompts[0].version += 1;
        let toggled_on = compute(&prompts, &categories, &settings);
        assert_ne!(original, toggled_on);

        prompts[0].tags.retain(|t| t != "urgent");
        prompts[0].version += 1;
        assert_eq!(original, compute(&prompts, &categories, &settings));
    }

    #[test]
    fn test_settings_change_checksum() {
        let (prompts, categories, mut settings) = sample();
        let before = compute(&prompts, &categories, &settings);
        settings.insert("theme".into(), json!("light"));
        assert_ne!(before, compute(&prompts, &categories, &settings));
    }
}
