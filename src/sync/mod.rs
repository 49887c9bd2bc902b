//! Synchronization layer
//!
//! - `companion`: shared-file channel with the companion extension
//! - `conflict`: divergence detection and resolution strategies
//! - `settings`: persisted cloud sync settings
//! - `manager`: cloud storage manager and auto-sync scheduler

pub mod companion;
pub mod conflict;
pub mod manager;
pub mod settings;

pub use companion::{CompanionChannel, CompanionEvent};
pub use conflict::{detect_conflict, merge, resolve, ConflictChoice, ConflictStrategy};
pub use manager::{CloudStorageManager, SyncOutcome, SyncStatus};
pub use settings::{CloudProvider, CloudSyncSettings, OneDriveSettings, WebDavSettings};

use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::models::SyncData;

/// Parse a SyncData document received from another replica.
///
/// The payload is checked field by field before it is deserialized, so a
/// malformed document is rejected with a message naming the bad field. A
/// checksum that does not match the payload is recomputed.
pub fn parse_sync_data(bytes: &[u8]) -> SyncResult<SyncData> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| SyncError::InvalidData(format!("not JSON: {}", e)))?;
    validate_structure(&value)?;

    let mut data: SyncData =
        serde_json::from_value(value).map_err(|e| SyncError::InvalidData(e.to_string()))?;

    if !data.checksum_is_current() {
        let checksum = crate::checksum::compute(&data.prompts, &data.categories, &data.settings);
        tracing::warn!(
            stored = %data.sync_metadata.checksum,
            computed = %checksum,
            "sync data checksum does not match payload, recomputing"
        );
        data.sync_metadata.checksum = checksum;
    }
    Ok(data)
}

fn validate_structure(value: &Value) -> SyncResult<()> {
    let root = value
        .as_object()
        .ok_or_else(|| invalid("document is not an object"))?;

    require(root.get("version").is_some_and(Value::is_u64), "version")?;
    require(
        root.get("lastModified")
            .and_then(Value::as_str)
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
        "lastModified",
    )?;

    let prompts = root
        .get("prompts")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("prompts must be an array"))?;
    for (i, prompt) in prompts.iter().enumerate() {
        for field in ["id", "title", "content"] {
            require(
                prompt.get(field).is_some_and(Value::is_string),
                &format!("prompts[{}].{}", i, field),
            )?;
        }
    }

    let categories = root
        .get("categories")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("categories must be an array"))?;
    for (i, category) in categories.iter().enumerate() {
        for field in ["id", "name"] {
            require(
                category.get(field).is_some_and(Value::is_string),
                &format!("categories[{}].{}", i, field),
            )?;
        }
    }

    require(root.get("settings").is_some_and(Value::is_object), "settings")?;

    let metadata = root
        .get("syncMetadata")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("syncMetadata must be an object"))?;
    require(
        metadata
            .get("source")
            .and_then(Value::as_str)
            .is_some_and(|s| s == "primary" || s == "companion"),
        "syncMetadata.source",
    )?;
    require(
        metadata.get("checksum").is_some_and(Value::is_string),
        "syncMetadata.checksum",
    )?;
    Ok(())
}

fn require(ok: bool, field: &str) -> SyncResult<()> {
    if ok {
        Ok(())
    } else {
        Err(invalid(&format!("missing or mistyped field '{}'", field)))
    }
}

fn invalid(message: &str) -> SyncError {
    SyncError::InvalidData(message.to_string())
}
