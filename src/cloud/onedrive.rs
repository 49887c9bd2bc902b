//! OneDrive client (Microsoft Graph, OAuth2)
//!
//! Files are addressed by path: `/root:{path}:/content` for content and
//! `/root:{path}:/children` for folder listings. Before every call the
//! access token is checked for expiry and refreshed when a refresh token is
//! held. A `401` answer triggers one refresh and exactly one retry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

use super::{parent_dirs, segments, CloudStorage, FileInfo};
use crate::error::{CloudError, CloudResult};
use crate::sync::settings::OneDriveSettings;

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0/me/drive";
pub const AUTHORIZE_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
pub const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
pub const SCOPES: &str = "Files.ReadWrite offline_access";

/// Tokens are treated as expired this long before their actual expiry
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthTokens {
    pub fn is_expired(&self) -> bool {
        if self.access_token.is_none() {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => expires_at - ChronoDuration::seconds(EXPIRY_SKEW_SECS) <= Utc::now(),
            None => false,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_tokens(self, previous_refresh: Option<String>) -> OAuthTokens {
        OAuthTokens {
            access_token: Some(self.access_token),
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self.expires_in.map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
}

impl From<DriveItem> for FileInfo {
    fn from(item: DriveItem) -> Self {
        FileInfo {
            name: item.name,
            size: item.size,
            last_modified: item.last_modified_date_time,
            is_directory: item.folder.is_some(),
        }
    }
}

#[derive(Deserialize)]
struct Children {
    value: Vec<DriveItem>,
}

pub struct OneDriveClient {
    client: Client,
    client_id: String,
    base_url: Url,
    token_url: String,
    tokens: Mutex<OAuthTokens>,
    refreshed: AtomicBool,
}

impl OneDriveClient {
    pub fn new(settings: &OneDriveSettings, timeout: Duration) -> CloudResult<Self> {
        if settings.access_token.is_none() && settings.refresh_token.is_none() {
            return Err(CloudError::NotConfigured);
        }

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            client_id: settings.client_id.clone(),
            base_url: parse_url(GRAPH_BASE_URL)?,
            token_url: TOKEN_URL.to_string(),
            tokens: Mutex::new(OAuthTokens {
                access_token: settings.access_token.clone(),
                refresh_token: settings.refresh_token.clone(),
                expires_at: settings.expires_at,
            }),
            refreshed: AtomicBool::new(false),
        })
    }

    /// Point the client at other Graph and token endpoints
    pub fn with_endpoints(mut self, base_url: &str, token_url: &str) -> CloudResult<Self> {
        self.base_url = parse_url(base_url)?;
        self.token_url = token_url.to_string();
        Ok(self)
    }

    pub fn tokens(&self) -> OAuthTokens {
        self.tokens.lock().clone()
    }

    /// Current tokens if they were refreshed since the last call
    pub fn take_refreshed(&self) -> Option<OAuthTokens> {
        if self.refreshed.swap(false, Ordering::SeqCst) {
            Some(self.tokens())
        } else {
            None
        }
    }

    /// Graph URL for a drive item. `suffix` is `content`, `children` or empty.
    fn item_url(&self, path: &str, suffix: &str) -> CloudResult<Url> {
        let parts = segments(path);
        let mut url = self.base_url.clone();
        {
            let mut segs = url.path_segments_mut().map_err(|_| CloudError::InvalidUrl {
                url: self.base_url.to_string(),
                message: "not a base URL".to_string(),
            })?;
            segs.pop_if_empty();
            match parts.split_last() {
                None => {
                    segs.push("root");
                }
                Some((last, init)) => {
                    segs.push("root:");
                    segs.extend(init.iter().copied());
                    if suffix.is_empty() {
                        segs.push(last);
                    } else {
                        segs.push(&format!("{}:", last));
                    }
                }
            }
            if !suffix.is_empty() {
                segs.push(suffix);
            }
        }
        Ok(url)
    }

    async fn refresh(&self) -> CloudResult<()> {
        let refresh_token = self
            .tokens
            .lock()
            .refresh_token
            .clone()
            .ok_or_else(|| CloudError::TokenRefresh("no refresh token".to_string()))?;

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("scope", SCOPES),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(status, "token refresh rejected");
            return Err(CloudError::TokenRefresh(format!("HTTP {}: {}", status, message)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| CloudError::TokenRefresh(e.to_string()))?;
        *self.tokens.lock() = body.into_tokens(Some(refresh_token));
        self.refreshed.store(true, Ordering::SeqCst);
        tracing::info!("onedrive access token refreshed");
        Ok(())
    }

    async fn access_token(&self) -> CloudResult<String> {
        let (expired, can_refresh) = {
            let tokens = self.tokens.lock();
            (tokens.is_expired(), tokens.refresh_token.is_some())
        };
        if expired && can_refresh {
            self.refresh().await?;
        }
        self.tokens
            .lock()
            .access_token
            .clone()
            .ok_or(CloudError::Credentials { status: 401 })
    }

    /// Send an authenticated request. On 401 the token is refreshed and the
    /// request is sent exactly once more.
    async fn send<F>(&self, build: F) -> CloudResult<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if self.tokens.lock().refresh_token.is_none() {
            return Ok(response);
        }
        tracing::debug!("graph request unauthorized, refreshing token and retrying once");
        self.refresh().await?;
        let token = self.access_token().await?;
        Ok(build(&token).send().await?)
    }

    async fn create_folder(&self, path: &str) -> CloudResult<()> {
        let parts = segments(path);
        let Some((name, parent)) = parts.split_last() else {
            return Ok(());
        };
        let parent_path = format!("/{}", parent.join("/"));
        let url = self.item_url(&parent_path, "children")?;
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });

        let response = self
            .send(|token| self.client.post(url.clone()).bearer_auth(token).json(&body))
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Ok(()),
            _ => {
                check(response, path).await?;
                Ok(())
            }
        }
    }
}

impl CloudStorage for OneDriveClient {
    async fn test_connection(&self) -> CloudResult<()> {
        let url = self.base_url.clone();
        let response = self
            .send(|token| self.client.get(url.clone()).bearer_auth(token))
            .await?;
        check(response, "/").await?;
        Ok(())
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> CloudResult<()> {
        // Ancestors come shallowest first, so each level is created once
        for dir in parent_dirs(path) {
            self.create_folder(&dir).await?;
        }

        let url = self.item_url(path, "content")?;
        let response = self
            .send(|token| {
                self.client
                    .put(url.clone())
                    .bearer_auth(token)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(content.to_vec())
            })
            .await?;
        check(response, path).await?;
        tracing::debug!(path, bytes = content.len(), "onedrive upload complete");
        Ok(())
    }

    async fn download_file(&self, path: &str) -> CloudResult<Vec<u8>> {
        let url = self.item_url(path, "content")?;
        let response = self
            .send(|token| self.client.get(url.clone()).bearer_auth(token))
            .await?;
        let response = check(response, path).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn get_file_info(&self, path: &str) -> CloudResult<Option<FileInfo>> {
        let url = self.item_url(path, "")?;
        let response = self
            .send(|token| self.client.get(url.clone()).bearer_auth(token))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let item: DriveItem = check(response, path)
            .await?
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
        Ok(Some(item.into()))
    }

    async fn list_directory(&self, path: &str) -> CloudResult<Vec<FileInfo>> {
        let url = self.item_url(path, "children")?;
        let response = self
            .send(|token| self.client.get(url.clone()).bearer_auth(token))
            .await?;
        let children: Children = check(response, path)
            .await?
            .json()
            .await
            .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
        Ok(children.value.into_iter().map(FileInfo::from).collect())
    }

    async fn delete_file(&self, path: &str) -> CloudResult<()> {
        let url = self.item_url(path, "")?;
        let response = self
            .send(|token| self.client.delete(url.clone()).bearer_auth(token))
            .await?;
        check(response, path).await?;
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> CloudResult<()> {
        for dir in parent_dirs(path) {
            self.create_folder(&dir).await?;
        }
        self.create_folder(path).await
    }
}

fn parse_url(raw: &str) -> CloudResult<Url> {
    Url::parse(raw).map_err(|e| CloudError::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })
}

async fn check(response: Response, path: &str) -> CloudResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    tracing::debug!(path, status = status.as_u16(), "graph request failed");
    Err(CloudError::from_status(status.as_u16(), message, path))
}

/// URL the user opens to grant access
pub fn authorization_url(client_id: &str, redirect_uri: &str) -> CloudResult<String> {
    let url = Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("client_id", client_id),
            ("response_type", "code"),
            ("redirect_uri", redirect_uri),
            ("response_mode", "query"),
            ("scope", SCOPES),
        ],
    )
    .map_err(|e| CloudError::InvalidUrl {
        url: AUTHORIZE_URL.to_string(),
        message: e.to_string(),
    })?;
    Ok(url.into())
}

/// Exchange an authorization code for tokens
pub async fn exchange_code(
    client_id: &str,
    code: &str,
    redirect_uri: &str,
    token_url: &str,
    timeout: Duration,
) -> CloudResult<OAuthTokens> {
    let client = Client::builder().timeout(timeout).build()?;
    let response = client
        .post(token_url)
        .form(&[
            ("client_id", client_id),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("scope", SCOPES),
        ])
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        return Err(CloudError::TokenRefresh(format!("HTTP {}: {}", status, message)));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
    Ok(body.into_tokens(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OneDriveClient {
        OneDriveClient::new(
            &OneDriveSettings {
                client_id: "client".into(),
                access_token: Some("token".into()),
                refresh_token: Some("refresh".into()),
                expires_at: None,
                remote_path: "/PromptSync".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_item_urls() {
        let c = client();
        assert_eq!(
            c.item_url("/PromptSync/data.json", "content").unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/me/drive/root:/PromptSync/data.json:/content"
        );
        assert_eq!(
            c.item_url("/PromptSync", "children").unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/me/drive/root:/PromptSync:/children"
        );
        assert_eq!(
            c.item_url("/My Prompts/a.json", "").unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/me/drive/root:/My%20Prompts/a.json"
        );
        assert_eq!(
            c.item_url("/", "children").unwrap().as_str(),
            "https://graph.microsoft.com/v1.0/me/drive/root/children"
        );
    }

    #[test]
    fn test_token_expiry() {
        let mut tokens = OAuthTokens {
            access_token: Some("a".into()),
            refresh_token: None,
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        };
        assert!(!tokens.is_expired());
        tokens.expires_at = Some(Utc::now() + ChronoDuration::seconds(10));
        assert!(tokens.is_expired());
        tokens.expires_at = None;
        assert!(!tokens.is_expired());
        tokens.access_token = None;
        assert!(tokens.is_expired());
    }

    #[test]
    fn test_requires_some_token() {
        let result = OneDriveClient::new(
            &OneDriveSettings {
                client_id: "client".into(),
                access_token: None,
                refresh_token: None,
                expires_at: None,
                remote_path: "/".into(),
            },
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(CloudError::NotConfigured)));
    }

    #[test]
    fn test_authorization_url() {
        let url = authorization_url("abc", "http://localhost:8400/callback").unwrap();
        assert!(url.starts_with(AUTHORIZE_URL));
        assert!(url.contains("client_id=abc"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("offline_access"));
    }
}
