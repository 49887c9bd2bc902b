//! OneDrive client against a mock Graph drive and token endpoint

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;

use prompt_sync::cloud::{CloudStorage, OneDriveClient};
use prompt_sync::sync::settings::OneDriveSettings;
use prompt_sync::CloudError;

const DRIVE: &str = "/v1.0/me/drive";

#[derive(Clone, Default)]
struct MockGraph {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    folders: Arc<Mutex<Vec<String>>>,
    folder_requests: Arc<AtomicUsize>,
    token_requests: Arc<AtomicUsize>,
    /// Set to reject every refresh
    refresh_fails: Arc<Mutex<bool>>,
}

async fn token(State(graph): State<MockGraph>, Form(form): Form<BTreeMap<String, String>>) -> Response {
    graph.token_requests.fetch_add(1, Ordering::SeqCst);
    if *graph.refresh_fails.lock()
        || form.get("grant_type").map(String::as_str) != Some("refresh_token")
        || form.get("refresh_token").map(String::as_str) != Some("refresh-1")
    {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))).into_response();
    }
    Json(json!({
        "access_token": "fresh",
        "refresh_token": "refresh-2",
        "expires_in": 3600,
    }))
    .into_response()
}

async fn drive(
    State(graph): State<MockGraph>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let bearer = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if bearer != Some("Bearer fresh") {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Some(rest) = uri.path().strip_prefix(DRIVE) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if rest.is_empty() {
        return Json(json!({"id": "drive", "driveType": "personal"})).into_response();
    }

    let (item, suffix) = if rest == "/root/children" {
        ("".to_string(), "children")
    } else if let Some(inner) = rest.strip_prefix("/root:") {
        if let Some(p) = inner.strip_suffix(":/content") {
            (p.to_string(), "content")
        } else if let Some(p) = inner.strip_suffix(":/children") {
            (p.to_string(), "children")
        } else {
            (inner.to_string(), "")
        }
    } else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match (method, suffix) {
        (Method::POST, "children") => {
            graph.folder_requests.fetch_add(1, Ordering::SeqCst);
            let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let name = request["name"].as_str().unwrap_or_default();
            let folder = format!("{}/{}", item, name);
            let mut folders = graph.folders.lock();
            if folders.contains(&folder) {
                return StatusCode::CONFLICT.into_response();
            }
            folders.push(folder);
            (StatusCode::CREATED, Json(json!({"name": name, "folder": {}}))).into_response()
        }
        (Method::PUT, "content") => {
            graph.files.lock().insert(item.clone(), body.to_vec());
            (StatusCode::CREATED, Json(json!({"name": item}))).into_response()
        }
        (Method::GET, "content") => match graph.files.lock().get(&item) {
            Some(content) => (StatusCode::OK, content.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        (Method::GET, "children") => {
            let files = graph.files.lock();
            let value: Vec<_> = files
                .iter()
                .filter_map(|(path, content)| {
                    let (parent, name) = path.rsplit_once('/')?;
                    (parent == item).then(|| json!({"name": name, "size": content.len(), "file": {}}))
                })
                .collect();
            Json(json!({ "value": value })).into_response()
        }
        (Method::GET, "") => match graph.files.lock().get(&item) {
            Some(content) => Json(json!({
                "name": item.rsplit('/').next().unwrap_or_default(),
                "size": content.len(),
                "lastModifiedDateTime": "2026-01-05T10:30:00Z",
                "file": {},
            }))
            .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        (Method::DELETE, "") => match graph.files.lock().remove(&item) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn serve() -> (String, MockGraph) {
    let graph = MockGraph::default();
    let app = Router::new()
        .route("/token", post(token))
        .fallback(drive)
        .with_state(graph.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), graph)
}

fn client(base: &str, access_token: &str, expires_in_secs: Option<i64>) -> OneDriveClient {
    let settings = OneDriveSettings {
        client_id: "client-id".into(),
        access_token: Some(access_token.into()),
        refresh_token: Some("refresh-1".into()),
        expires_at: expires_in_secs.map(|s| Utc::now() + ChronoDuration::seconds(s)),
        remote_path: "/PromptSync".into(),
    };
    OneDriveClient::new(&settings, Duration::from_secs(5))
        .unwrap()
        .with_endpoints(&format!("{}{}", base, DRIVE), &format!("{}/token", base))
        .unwrap()
}

#[tokio::test]
async fn test_unauthorized_call_refreshes_and_retries_once() {
    let (base, graph) = serve().await;
    let client = client(&base, "stale", None);

    client.test_connection().await.unwrap();

    assert_eq!(graph.token_requests.load(Ordering::SeqCst), 1);
    let tokens = client.tokens();
    assert_eq!(tokens.access_token.as_deref(), Some("fresh"));
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-2"));
    assert!(tokens.expires_at.is_some());

    assert!(client.take_refreshed().is_some());
    assert!(client.take_refreshed().is_none());
}

#[tokio::test]
async fn test_expired_token_is_refreshed_before_the_call() {
    let (base, graph) = serve().await;
    let client = client(&base, "stale", Some(-30));

    assert!(!client.file_exists("/PromptSync/missing.json").await.unwrap());
    assert_eq!(graph.token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(client.tokens().access_token.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn test_failed_refresh_surfaces() {
    let (base, graph) = serve().await;
    *graph.refresh_fails.lock() = true;
    let client = client(&base, "stale", None);

    let err = client.test_connection().await.unwrap_err();
    assert!(matches!(err, CloudError::TokenRefresh(_)));
    assert!(client.take_refreshed().is_none());
}

#[tokio::test]
async fn test_file_roundtrip() {
    let (base, graph) = serve().await;
    let client = client(&base, "fresh", Some(3600));
    let path = "/PromptSync/prompt-sync-data.json";
    let body = br#"{"hello":"world"}"#;

    assert!(client.get_file_info(path).await.unwrap().is_none());
    client.upload_file(path, body).await.unwrap();
    assert_eq!(graph.folders.lock().as_slice(), ["/PromptSync".to_string()]);

    // Second upload finds the folder already there
    client.upload_file(path, body).await.unwrap();

    let info = client.get_file_info(path).await.unwrap().unwrap();
    assert_eq!(info.name, "prompt-sync-data.json");
    assert_eq!(info.size, body.len() as u64);
    assert!(info.last_modified.is_some());

    assert_eq!(client.download_file(path).await.unwrap(), body.to_vec());

    let listing = client.list_directory("/PromptSync").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert!(!listing[0].is_directory);

    client.delete_file(path).await.unwrap();
    assert!(matches!(
        client.download_file(path).await,
        Err(CloudError::NotFound(_))
    ));
    assert_eq!(graph.token_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_nested_upload_creates_each_folder_once() {
    let (base, graph) = serve().await;
    let client = client(&base, "fresh", Some(3600));

    client.upload_file("/A/B/C/prompt-sync-data.json", b"{}").await.unwrap();

    assert_eq!(graph.folder_requests.load(Ordering::SeqCst), 3);
    assert_eq!(
        graph.folders.lock().as_slice(),
        ["/A".to_string(), "/A/B".to_string(), "/A/B/C".to_string()]
    );
    assert_eq!(
        client.download_file("/A/B/C/prompt-sync-data.json").await.unwrap(),
        b"{}".to_vec()
    );
}
