//! WebDAV client (Basic auth)
//!
//! | Operation | Request |
//! |---|---|
//! | stat | `PROPFIND` Depth 0 |
//! | list | `PROPFIND` Depth 1 on the collection |
//! | read / write | `GET` / `PUT` |
//! | mkdir | `MKCOL` (405 means it already exists) |
//! | delete | `DELETE` |

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use url::Url;

use super::{parent_dirs, segments, CloudStorage, FileInfo};
use crate::error::{CloudError, CloudResult};
use crate::sync::settings::WebDavSettings;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
  </d:prop>
</d:propfind>"#;

pub struct WebDavClient {
    client: Client,
    base: Url,
    username: String,
    password: String,
    parser: MultistatusParser,
}

impl WebDavClient {
    pub fn new(settings: &WebDavSettings, timeout: Duration) -> CloudResult<Self> {
        let mut base = Url::parse(&settings.url).map_err(|e| CloudError::InvalidUrl {
            url: settings.url.clone(),
            message: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(CloudError::InvalidUrl {
                url: settings.url.clone(),
                message: "not a base URL".to_string(),
            });
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base,
            username: settings.username.clone(),
            password: settings.password.clone(),
            parser: MultistatusParser::new()?,
        })
    }

    /// URL of a remote path below the base; `collection` adds a trailing slash
    fn url(&self, path: &str, collection: bool) -> CloudResult<Url> {
        let mut url = self.base.clone();
        {
            let mut parts = url.path_segments_mut().map_err(|_| CloudError::InvalidUrl {
                url: self.base.to_string(),
                message: "not a base URL".to_string(),
            })?;
            parts.pop_if_empty();
            parts.extend(segments(path));
            if collection {
                parts.push("");
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn propfind(&self, path: &str, depth: u8, collection: bool) -> CloudResult<Option<String>> {
        let url = self.url(path, collection)?;
        let response = self
            .request(dav_method("PROPFIND")?, url)
            .header("Depth", depth.to_string())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/xml; charset=utf-8"))
            .body(PROPFIND_BODY)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, path).await?;
        Ok(Some(response.text().await?))
    }
}

impl CloudStorage for WebDavClient {
    async fn test_connection(&self) -> CloudResult<()> {
        match self.propfind("/", 0, true).await? {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound(self.base.to_string())),
        }
    }

    async fn upload_file(&self, path: &str, content: &[u8]) -> CloudResult<()> {
        for dir in parent_dirs(path) {
            self.create_directory(&dir).await?;
        }

        let response = self
            .request(Method::PUT, self.url(path, false)?)
            .body(content.to_vec())
            .send()
            .await?;
        check(response, path).await?;
        tracing::debug!(path, bytes = content.len(), "webdav upload complete");
        Ok(())
    }

    async fn download_file(&self, path: &str) -> CloudResult<Vec<u8>> {
        let response = self
            .request(Method::GET, self.url(path, false)?)
            .send()
            .await?;
        let response = check(response, path).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn get_file_info(&self, path: &str) -> CloudResult<Option<FileInfo>> {
        let Some(body) = self.propfind(path, 0, false).await? else {
            return Ok(None);
        };
        Ok(self.parser.parse(&body).into_iter().next().map(|(_, info)| info))
    }

    async fn list_directory(&self, path: &str) -> CloudResult<Vec<FileInfo>> {
        let Some(body) = self.propfind(path, 1, true).await? else {
            return Err(CloudError::NotFound(path.to_string()));
        };

        // The collection itself comes back as one of the responses
        let own = self.url(path, true)?;
        Ok(self
            .parser
            .parse(&body)
            .into_iter()
            .filter(|(href, _)| {
                let href_path = self.base.join(href).map(|u| u.path().to_string()).unwrap_or_default();
                href_path.trim_end_matches('/') != own.path().trim_end_matches('/')
            })
            .map(|(_, info)| info)
            .collect())
    }

    async fn delete_file(&self, path: &str) -> CloudResult<()> {
        let response = self
            .request(Method::DELETE, self.url(path, false)?)
            .send()
            .await?;
        check(response, path).await?;
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> CloudResult<()> {
        let response = self
            .request(dav_method("MKCOL")?, self.url(path, true)?)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                tracing::debug!(path, "webdav collection created");
                Ok(())
            }
            // Collection already exists
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            _ => {
                check(response, path).await?;
                Ok(())
            }
        }
    }
}

fn dav_method(name: &str) -> CloudResult<Method> {
    Method::from_bytes(name.as_bytes()).map_err(|e| CloudError::InvalidResponse(e.to_string()))
}

/// Pass through 2xx responses, classify everything else
async fn check(response: Response, path: &str) -> CloudResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    tracing::debug!(path, status = status.as_u16(), "webdav request failed");
    Err(CloudError::from_status(status.as_u16(), message, path))
}

/// Extracts entries from a `207 Multi-Status` body. Namespace prefixes vary
/// between servers (`d:`, `D:`, `lp1:`, none), so tags are matched with any
/// prefix.
struct MultistatusParser {
    response: Regex,
    href: Regex,
    length: Regex,
    modified: Regex,
    collection: Regex,
}

impl MultistatusParser {
    fn new() -> CloudResult<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern).map_err(|e| CloudError::InvalidResponse(e.to_string()))
        };
        Ok(Self {
            response: build(r"(?is)<(?:[a-z0-9_]+:)?response\b[^>]*>(.*?)</(?:[a-z0-9_]+:)?response>")?,
            href: build(r"(?is)<(?:[a-z0-9_]+:)?href\b[^>]*>(.*?)</(?:[a-z0-9_]+:)?href>")?,
            length: build(
                r"(?is)<(?:[a-z0-9_]+:)?getcontentlength\b[^>]*>\s*(\d+)\s*</(?:[a-z0-9_]+:)?getcontentlength>",
            )?,
            modified: build(
                r"(?is)<(?:[a-z0-9_]+:)?getlastmodified\b[^>]*>(.*?)</(?:[a-z0-9_]+:)?getlastmodified>",
            )?,
            collection: build(r"(?is)<(?:[a-z0-9_]+:)?collection\b")?,
        })
    }

    /// `(href, info)` per response block, in document order
    fn parse(&self, body: &str) -> Vec<(String, FileInfo)> {
        self.response
            .captures_iter(body)
            .filter_map(|block| {
                let block = block.get(1)?.as_str();
                let href = self.href.captures(block)?.get(1)?.as_str().trim().to_string();

                let size = self
                    .length
                    .captures(block)
                    .and_then(|c| c.get(1)?.as_str().parse().ok())
                    .unwrap_or(0);
                let last_modified = self
                    .modified
                    .captures(block)
                    .and_then(|c| DateTime::parse_from_rfc2822(c.get(1)?.as_str().trim()).ok())
                    .map(|dt| dt.with_timezone(&Utc));

                let info = FileInfo {
                    name: name_from_href(&href),
                    size,
                    last_modified,
                    is_directory: self.collection.is_match(block),
                };
                Some((href, info))
            })
            .collect()
    }
}

fn name_from_href(href: &str) -> String {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    percent_decode_str(last).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/PromptSync/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/></D:resourcetype>
      <D:getlastmodified>Mon, 05 Jan 2026 10:00:00 GMT</D:getlastmodified>
    </D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/PromptSync/prompt%20data.json</D:href>
    <D:propstat><D:prop>
      <D:resourcetype/>
      <D:getcontentlength>1234</D:getcontentlength>
      <D:getlastmodified>Mon, 05 Jan 2026 10:30:00 GMT</D:getlastmodified>
    </D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat>
  </D:response>
</D:multistatus>"#;

    fn client(url: &str) -> WebDavClient {
        WebDavClient::new(
            &WebDavSettings {
                url: url.to_string(),
                username: "user".into(),
                password: "pass".into(),
                remote_path: "/PromptSync".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_multistatus() {
        let parser = MultistatusParser::new().unwrap();
        let entries = parser.parse(LISTING);
        assert_eq!(entries.len(), 2);

        let (_, dir) = &entries[0];
        assert!(dir.is_directory);
        assert_eq!(dir.name, "PromptSync");

        let (href, file) = &entries[1];
        assert_eq!(href, "/dav/PromptSync/prompt%20data.json");
        assert_eq!(file.name, "prompt data.json");
        assert_eq!(file.size, 1234);
        assert!(!file.is_directory);
        assert_eq!(
            file.last_modified.unwrap().to_rfc3339(),
            "2026-01-05T10:30:00+00:00"
        );
    }

    #[test]
    fn test_unprefixed_namespace() {
        let parser = MultistatusParser::new().unwrap();
        let body = r#"<multistatus xmlns="DAV:"><response><href>/a.json</href>
            <propstat><prop><getcontentlength>7</getcontentlength></prop></propstat></response></multistatus>"#;
        let entries = parser.parse(body);
        assert_eq!(entries[0].1.size, 7);
        assert_eq!(entries[0].1.name, "a.json");
    }

    #[test]
    fn test_url_building() {
        let c = client("https://dav.example.com/remote.php/dav/files/me");
        assert_eq!(
            c.url("/PromptSync/my file.json", false).unwrap().as_str(),
            "https://dav.example.com/remote.php/dav/files/me/PromptSync/my%20file.json"
        );
        assert_eq!(
            c.url("/PromptSync", true).unwrap().as_str(),
            "https://dav.example.com/remote.php/dav/files/me/PromptSync/"
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = WebDavClient::new(
            &WebDavSettings {
                url: "not a url".into(),
                username: String::new(),
                password: String::new(),
                remote_path: "/".into(),
            },
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(CloudError::InvalidUrl { .. })));
    }

    #[test]
    fn test_name_from_href_decodes_escapes() {
        assert_eq!(name_from_href("/dav/PromptSync/my%20prompts.json"), "my prompts.json");
        assert_eq!(name_from_href("/dav/Prompt%20Sync/?rev=2"), "Prompt Sync");
        assert_eq!(name_from_href("/dav/100%25"), "100%");
    }
}
