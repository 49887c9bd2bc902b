//! Data models shared by the store, the flat store and every sync replica.
//!
//! Field names serialize in camelCase so the JSON shape matches what the
//! companion extension and older flat-store dumps already use.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id of the category every orphaned prompt falls back to
pub const SENTINEL_CATEGORY_ID: &str = "general";

/// Format version written into every SyncData snapshot
pub const SYNC_DATA_VERSION: u32 = 1;

/// Open key to typed-value map
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Current time truncated to the millisecond precision stored on disk
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// An inline image attached to a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptImage {
    pub id: String,
    /// Inline payload (usually a data URL)
    pub data: String,
    #[serde(default)]
    pub caption: Option<String>,
}

impl PromptImage {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            data: data.into(),
            caption: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub images: Vec<PromptImage>,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default = "now_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now_millis")]
    pub updated_at: DateTime<Utc>,
}

fn default_category() -> String {
    SENTINEL_CATEGORY_ID.to_string()
}

fn default_version() -> i64 {
    1
}

impl Prompt {
    /// Create a new prompt with a freshly generated id
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            content: content.into(),
            category: default_category(),
            tags: Vec::new(),
            is_favorite: false,
            images: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.tags = normalize_tags(&self.tags);
        self
    }

    /// Apply a partial update. Timestamps and version are left to the caller.
    pub fn apply(&mut self, patch: &PromptPatch) {
        if let Some(ref title) = patch.title {
            self.title = title.clone();
        }
        if let Some(ref content) = patch.content {
            self.content = content.clone();
        }
        if let Some(ref category) = patch.category {
            self.category = category.clone();
        }
        if let Some(ref tags) = patch.tags {
            self.tags = normalize_tags(tags);
        }
        if let Some(is_favorite) = patch.is_favorite {
            self.is_favorite = is_favorite;
        }
        if let Some(ref images) = patch.images {
            self.images = images.clone();
        }
    }

    /// Pull `updated_at` up to `created_at` when a foreign copy has them inverted
    pub fn clamp_timestamps(&mut self) {
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
        }
    }
}

/// Partial update for a prompt; `None` leaves the field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub is_favorite: Option<bool>,
    pub images: Option<Vec<PromptImage>>,
}

/// Trim, drop empties, dedupe and sort. Tag order carries no meaning.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Stable across display-language changes
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: None,
        }
    }

    pub fn sentinel() -> Self {
        Self::new(SENTINEL_CATEGORY_ID, "General")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryPatch {
    pub name: Option<String>,
    pub icon: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: i64,
    pub name: String,
    /// Number of prompts currently linked to this tag
    pub prompt_count: usize,
}

/// Primitive type recorded next to every settings value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl SettingType {
    pub fn of(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::String(_) => SettingType::String,
            Value::Number(_) => SettingType::Number,
            Value::Bool(_) => SettingType::Boolean,
            Value::Object(_) => SettingType::Object,
            Value::Array(_) => SettingType::Array,
            Value::Null => SettingType::Null,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingType::String => "string",
            SettingType::Number => "number",
            SettingType::Boolean => "boolean",
            SettingType::Object => "object",
            SettingType::Array => "array",
            SettingType::Null => "null",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(SettingType::String),
            "number" => Some(SettingType::Number),
            "boolean" => Some(SettingType::Boolean),
            "object" => Some(SettingType::Object),
            "array" => Some(SettingType::Array),
            "null" => Some(SettingType::Null),
            _ => None,
        }
    }
}

impl std::fmt::Display for SettingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub value_type: SettingType,
}

/// Which replica produced a SyncData snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    Primary,
    Companion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub source: SyncSource,
    pub checksum: String,
}

/// The unit exchanged with every replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncData {
    pub version: u32,
    pub last_modified: DateTime<Utc>,
    pub prompts: Vec<Prompt>,
    pub categories: Vec<Category>,
    pub settings: Settings,
    pub sync_metadata: SyncMetadata,
}

impl SyncData {
    /// Build a checksummed snapshot stamped with the current time
    pub fn new(
        prompts: Vec<Prompt>,
        categories: Vec<Category>,
        settings: Settings,
        source: SyncSource,
    ) -> Self {
        Self::at(prompts, categories, settings, source, now_millis())
    }

    pub fn at(
        prompts: Vec<Prompt>,
        categories: Vec<Category>,
        settings: Settings,
        source: SyncSource,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let checksum = crate::checksum::compute(&prompts, &categories, &settings);
        Self {
            version: SYNC_DATA_VERSION,
            last_modified,
            prompts,
            categories,
            settings,
            sync_metadata: SyncMetadata { source, checksum },
        }
    }

    pub fn checksum(&self) -> &str {
        &self.sync_metadata.checksum
    }

    pub fn source(&self) -> SyncSource {
        self.sync_metadata.source
    }

    /// Whether the stored checksum still matches the payload
    pub fn checksum_is_current(&self) -> bool {
        crate::checksum::compute(&self.prompts, &self.categories, &self.settings)
            == self.sync_metadata.checksum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Completed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Completed => "completed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => MigrationStatus::Completed,
            "rolled_back" => MigrationStatus::RolledBack,
            _ => MigrationStatus::Pending,
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_defaults() {
        let prompt = Prompt::new("Translate", "Translate to English");
        assert_eq!(prompt.category, SENTINEL_CATEGORY_ID);
        assert_eq!(prompt.version, 1);
        assert!(prompt.updated_at >= prompt.created_at);
    }

    #[test]
    fn test_normalize_tags() {
        let tags = vec![" zh ".to_string(), "basic".to_string(), "zh".to_string(), "".to_string()];
        assert_eq!(normalize_tags(&tags), vec!["basic", "zh"]);
    }

    #[test]
    fn test_legacy_prompt_parses_with_defaults() {
        let json = r#"{"id":"p1","title":"Translate","content":"..."}"#;
        let prompt: Prompt = serde_json::from_str(json).unwrap();
        assert_eq!(prompt.category, "general");
        assert!(prompt.tags.is_empty());
        assert!(!prompt.is_favorite);
    }

    #[test]
    fn test_sync_data_shape() {
        let data = SyncData::new(vec![], vec![Category::sentinel()], Settings::new(), SyncSource::Primary);
        let json = serde_json::to_value(&data).unwrap();
        assert!(json.get("lastModified").is_some());
        assert_eq!(json["syncMetadata"]["source"], "primary");
        assert!(data.checksum_is_current());
    }

    #[test]
    fn test_setting_type_roundtrip() {
        for t in [SettingType::String, SettingType::Number, SettingType::Boolean, SettingType::Object] {
            assert_eq!(SettingType::parse(t.as_str()), Some(t));
        }
        assert_eq!(SettingType::of(&serde_json::json!(true)), SettingType::Boolean);
    }
}
