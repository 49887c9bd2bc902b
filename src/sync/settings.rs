//! Persisted cloud sync settings
//!
//! One camelCase JSON blob in the flat store, shared with the UI:
//!
//! ```json
//! {"enabled": true, "provider": "webdav", "autoSync": true,
//!  "syncIntervalMinutes": 30, "lastSyncTime": "...",
//!  "webdav": {"url": "...", "username": "...", "password": "...", "remotePath": "/prompts"}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::flat_store::{self, FlatStore, CLOUD_SYNC_KEY};
use crate::sync::conflict::ConflictStrategy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    #[default]
    None,
    Webdav,
    Onedrive,
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CloudProvider::None => "none",
            CloudProvider::Webdav => "webdav",
            CloudProvider::Onedrive => "onedrive",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDavSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneDriveSettings {
    pub client_id: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
}

fn default_remote_path() -> String {
    "/PromptSync".to_string()
}

fn default_interval() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSyncSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: CloudProvider,
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default = "default_interval")]
    pub sync_interval_minutes: u64,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Checksum both sides agreed on after the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_checksum: Option<String>,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdav: Option<WebDavSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onedrive: Option<OneDriveSettings>,
}

impl Default for CloudSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: CloudProvider::None,
            auto_sync: false,
            sync_interval_minutes: default_interval(),
            last_sync_time: None,
            last_sync_checksum: None,
            conflict_strategy: ConflictStrategy::default(),
            webdav: None,
            onedrive: None,
        }
    }
}

impl CloudSyncSettings {
    /// Read from the flat store; missing or unreadable settings yield defaults
    pub fn load(store: &dyn FlatStore) -> Self {
        match flat_store::get_json(store, CLOUD_SYNC_KEY) {
            Ok(Some(settings)) => settings,
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable cloud sync settings, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, store: &dyn FlatStore) -> SyncResult<()> {
        flat_store::set_json(store, CLOUD_SYNC_KEY, self)?;
        Ok(())
    }

    /// Remote directory of the active provider
    pub fn remote_path(&self) -> Option<&str> {
        match self.provider {
            CloudProvider::Webdav => self.webdav.as_ref().map(|w| w.remote_path.as_str()),
            CloudProvider::Onedrive => self.onedrive.as_ref().map(|o| o.remote_path.as_str()),
            CloudProvider::None => None,
        }
    }

    /// Whether a client can be built from these settings
    pub fn is_configured(&self) -> bool {
        match self.provider {
            CloudProvider::Webdav => self.webdav.is_some(),
            CloudProvider::Onedrive => self.onedrive.is_some(),
            CloudProvider::None => false,
        }
    }

    /// Same enabled flag, provider and credentials
    pub fn same_connection(&self, other: &Self) -> bool {
        self.enabled == other.enabled
            && self.provider == other.provider
            && self.webdav == other.webdav
            && self.onedrive == other.onedrive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat_store::MemoryFlatStore;

    #[test]
    fn test_wire_shape() {
        let settings = CloudSyncSettings {
            enabled: true,
            provider: CloudProvider::Webdav,
            webdav: Some(WebDavSettings {
                url: "https://dav.example.com".into(),
                username: "me".into(),
                password: "secret".into(),
                remote_path: "/prompts".into(),
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["provider"], "webdav");
        assert_eq!(json["syncIntervalMinutes"], 30);
        assert_eq!(json["webdav"]["remotePath"], "/prompts");
        assert_eq!(json["conflictStrategy"], "timestamp");
        assert!(json.get("onedrive").is_none());
    }

    #[test]
    fn test_load_and_save() {
        let store = MemoryFlatStore::new();
        assert_eq!(CloudSyncSettings::load(&store), CloudSyncSettings::default());

        store
            .set(CLOUD_SYNC_KEY, r#"{"enabled":true,"provider":"onedrive","onedrive":{"clientId":"abc"}}"#)
            .unwrap();
        let mut settings = CloudSyncSettings::load(&store);
        assert_eq!(settings.provider, CloudProvider::Onedrive);
        assert_eq!(settings.remote_path(), Some("/PromptSync"));
        assert!(settings.is_configured());

        settings.auto_sync = true;
        settings.save(&store).unwrap();
        assert!(CloudSyncSettings::load(&store).auto_sync);
    }

    #[test]
    fn test_unreadable_settings_fall_back() {
        let store = MemoryFlatStore::new();
        store.set(CLOUD_SYNC_KEY, "garbage").unwrap();
        assert!(!CloudSyncSettings::load(&store).enabled);
    }
}
