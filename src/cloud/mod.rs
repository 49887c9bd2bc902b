//! Cloud storage clients
//!
//! Both backends speak the same small file-object protocol. The manager holds
//! a [`CloudClient`], built from the persisted settings and rebuilt whenever
//! they change.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::error::{CloudError, CloudResult};
use crate::sync::settings::{CloudProvider, CloudSyncSettings};

pub mod onedrive;
pub mod webdav;

pub use onedrive::{OAuthTokens, OneDriveClient};
pub use webdav::WebDavClient;

/// Metadata of a remote file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
}

/// Operations every backend provides. Paths are absolute remote paths with
/// `/` separators, e.g. `/PromptSync/data.json`.
#[allow(async_fn_in_trait)]
pub trait CloudStorage {
    async fn test_connection(&self) -> CloudResult<()>;

    /// Write `content`, creating missing parent directories first
    async fn upload_file(&self, path: &str, content: &[u8]) -> CloudResult<()>;

    /// Fails with [`CloudError::NotFound`] when the file does not exist
    async fn download_file(&self, path: &str) -> CloudResult<Vec<u8>>;

    async fn file_exists(&self, path: &str) -> CloudResult<bool> {
        Ok(self.get_file_info(path).await?.is_some())
    }

    async fn get_file_info(&self, path: &str) -> CloudResult<Option<FileInfo>>;

    async fn list_directory(&self, path: &str) -> CloudResult<Vec<FileInfo>>;

    async fn delete_file(&self, path: &str) -> CloudResult<()>;

    /// Create a directory; succeeds when it already exists
    async fn create_directory(&self, path: &str) -> CloudResult<()>;
}

/// The configured backend
pub enum CloudClient {
    WebDav(WebDavClient),
    OneDrive(OneDriveClient),
}

impl CloudClient {
    /// Build the client for the active provider
    pub fn from_settings(settings: &CloudSyncSettings, timeout: Duration) -> CloudResult<Self> {
        match settings.provider {
            CloudProvider::Webdav => {
                let webdav = settings.webdav.as_ref().ok_or(CloudError::NotConfigured)?;
                Ok(CloudClient::WebDav(WebDavClient::new(webdav, timeout)?))
            }
            CloudProvider::Onedrive => {
                let onedrive = settings.onedrive.as_ref().ok_or(CloudError::NotConfigured)?;
                Ok(CloudClient::OneDrive(OneDriveClient::new(onedrive, timeout)?))
            }
            CloudProvider::None => Err(CloudError::NotConfigured),
        }
    }

    pub fn provider(&self) -> CloudProvider {
        match self {
            CloudClient::WebDav(_) => CloudProvider::Webdav,
            CloudClient::OneDrive(_) => CloudProvider::Onedrive,
        }
    }

    /// Tokens refreshed since the last call, if any. Always `None` for WebDAV.
    pub fn take_refreshed_tokens(&self) -> Option<OAuthTokens> {
        match self {
            CloudClient::WebDav(_) => None,
            CloudClient::OneDrive(client) => client.take_refreshed(),
        }
    }
}

impl CloudStorage for CloudClient {
    async fn test_connection(&self) -> CloudResult<()> {
        match self {
            CloudClient::WebDav(c) => c.test_connection().await,
            CloudClient::OneDrive(c) => c.test_connection().await,
        }
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> CloudResult<()> {
        match self {
            CloudClient::WebDav(c) => c.upload_file(path, content).await,
            CloudClient::OneDrive(c) => c.upload_file(path, content).await,
        }
    }

    async fn download_file(&self, path: &str) -> CloudResult<Vec<u8>> {
        match self {
            CloudClient::WebDav(c) => c.download_file(path).await,
            CloudClient::OneDrive(c) => c.download_file(path).await,
        }
    }

    async fn file_exists(&self, path: &str) -> CloudResult<bool> {
        match self {
            CloudClient::WebDav(c) => c.file_exists(path).await,
            CloudClient::OneDrive(c) => c.file_exists(path).await,
        }
    }

    async fn get_file_info(&self, path: &str) -> CloudResult<Option<FileInfo>> {
        match self {
            CloudClient::WebDav(c) => c.get_file_info(path).await,
            CloudClient::OneDrive(c) => c.get_file_info(path).await,
        }
    }

    async fn list_directory(&self, path: &str) -> CloudResult<Vec<FileInfo>> {
        match self {
            CloudClient::WebDav(c) => c.list_directory(path).await,
            CloudClient::OneDrive(c) => c.list_directory(path).await,
        }
    }

    async fn delete_file(&self, path: &str) -> CloudResult<()> {
        match self {
            CloudClient::WebDav(c) => c.delete_file(path).await,
            CloudClient::OneDrive(c) => c.delete_file(path).await,
        }
    }

    async fn create_directory(&self, path: &str) -> CloudResult<()> {
        match self {
            CloudClient::WebDav(c) => c.create_directory(path).await,
            CloudClient::OneDrive(c) => c.create_directory(path).await,
        }
    }
}

/// Non-empty segments of a remote path
pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// `/a/b/c.json` → `["/a", "/a/b"]`
pub(crate) fn parent_dirs(path: &str) -> Vec<String> {
    let parts = segments(path);
    let mut dirs = Vec::new();
    let mut current = String::new();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(part);
        dirs.push(current.clone());
    }
    dirs
}

/// Join a remote directory and a file name with exactly one separator
pub fn join_remote(dir: &str, name: &str) -> String {
    let mut parts = segments(dir);
    parts.extend(segments(name));
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_dirs() {
        assert_eq!(parent_dirs("/a/b/c.json"), vec!["/a", "/a/b"]);
        assert!(parent_dirs("/c.json").is_empty());
        assert!(parent_dirs("/").is_empty());
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/PromptSync/", "data.json"), "/PromptSync/data.json");
        assert_eq!(join_remote("", "/data.json"), "/data.json");
        assert_eq!(join_remote("a//b", "c"), "/a/b/c");
    }

    #[test]
    fn test_unconfigured_provider() {
        let settings = CloudSyncSettings::default();
        assert!(matches!(
            CloudClient::from_settings(&settings, Duration::from_secs(5)),
            Err(CloudError::NotConfigured)
        ));
    }
}
