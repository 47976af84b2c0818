//! GitHub Gist backend.

use super::{RemoteObject, RemoteStore};
use crate::{preview, Result, VaultError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("gistvault/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Deserialize)]
struct GistResponse {
    id: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    files: BTreeMap<String, GistFile>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    raw_url: Option<String>,
}

/// HTTP client for the Gist REST API.
pub struct GistClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl GistClient {
    pub fn new(api_base: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| VaultError::Network(e.to_string()))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header(header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<GistResponse> {
        let resp = builder
            .send()
            .await
            .map_err(|e| VaultError::Network(format!("{}: {}", what, e)))?;
        let resp = check_status(resp, what).await?;
        resp.json()
            .await
            .map_err(|e| VaultError::Network(format!("{}: invalid response: {}", what, e)))
    }

    /// Fill in contents the API elided because the file was too large.
    async fn into_object(&self, gist: GistResponse) -> Result<RemoteObject> {
        let mut files = BTreeMap::new();
        for (name, file) in gist.files {
            let content = match (file.truncated, file.raw_url) {
                (true, Some(raw_url)) => Some(self.fetch_raw(&raw_url).await?),
                _ => file.content,
            };
            files.insert(name, content);
        }

        Ok(RemoteObject {
            id: gist.id,
            updated_at: gist.updated_at,
            description: gist.description.unwrap_or_default(),
            files,
        })
    }

    async fn fetch_raw(&self, raw_url: &str) -> Result<String> {
        debug!("Fetching truncated gist file");
        let resp = self
            .client
            .get(raw_url)
            .send()
            .await
            .map_err(|e| VaultError::Network(format!("raw file: {}", e)))?;
        let resp = check_status(resp, "raw file").await?;
        resp.text()
            .await
            .map_err(|e| VaultError::Network(format!("raw file: {}", e)))
    }
}

fn summary(gist: GistResponse) -> RemoteObject {
    RemoteObject {
        id: gist.id,
        updated_at: gist.updated_at,
        description: gist.description.unwrap_or_default(),
        files: gist.files.into_keys().map(|name| (name, None)).collect(),
    }
}

async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let detail = format!("{} returned {}: {}", what, status, preview(&body, 120));
    match status {
        StatusCode::NOT_FOUND => Err(VaultError::RemoteNotFound(detail)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(VaultError::RemoteAuth(detail)),
        _ => Err(VaultError::Network(detail)),
    }
}

#[async_trait]
impl RemoteStore for GistClient {
    async fn list_objects(&self, page: u32, per_page: u32) -> Result<Vec<RemoteObject>> {
        let what = "list gists";
        let resp = self
            .request(reqwest::Method::GET, "/gists")
            .query(&[("per_page", per_page), ("page", page)])
            .send()
            .await
            .map_err(|e| VaultError::Network(format!("{}: {}", what, e)))?;
        let resp = check_status(resp, what).await?;
        let gists: Vec<GistResponse> = resp
            .json()
            .await
            .map_err(|e| VaultError::Network(format!("{}: invalid response: {}", what, e)))?;

        debug!(page, count = gists.len(), "Listed gists");
        Ok(gists.into_iter().map(summary).collect())
    }

    async fn get_object(&self, id: &str) -> Result<RemoteObject> {
        let gist = self
            .send(
                self.request(reqwest::Method::GET, &format!("/gists/{}", id)),
                "get gist",
            )
            .await?;
        self.into_object(gist).await
    }

    async fn create_object(
        &self,
        description: &str,
        filename: &str,
        content: &str,
    ) -> Result<RemoteObject> {
        let body = serde_json::json!({
            "description": description,
            "public": false,
            "files": { filename: { "content": content } },
        });
        let gist = self
            .send(
                self.request(reqwest::Method::POST, "/gists").json(&body),
                "create gist",
            )
            .await?;
        debug!(id = %gist.id, "Created gist");
        self.into_object(gist).await
    }

    async fn update_object(&self, id: &str, filename: &str, content: &str) -> Result<RemoteObject> {
        let body = serde_json::json!({
            "files": { filename: { "content": content } },
        });
        let gist = self
            .send(
                self.request(reqwest::Method::PATCH, &format!("/gists/{}", id))
                    .json(&body),
                "update gist",
            )
            .await?;
        debug!(id = %gist.id, "Updated gist");
        self.into_object(gist).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, PATCH, POST};
    use httpmock::MockServer;
    use serde_json::json;

    const FILE: &str = "gistvault-backup.txt";

    #[tokio::test]
    async fn test_list_sends_auth_and_pagination() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/gists")
                    .query_param("per_page", "100")
                    .query_param("page", "1")
                    .header("authorization", "Bearer ghp_test")
                    .header("accept", ACCEPT);
                then.status(200).json_body(json!([
                    {
                        "id": "a1",
                        "updated_at": "2024-05-01T10:00:00Z",
                        "description": "backup",
                        "files": { FILE: { "filename": FILE, "raw_url": "x" } }
                    },
                    {
                        "id": "b2",
                        "updated_at": "2024-05-02T10:00:00Z",
                        "description": null,
                        "files": { "notes.md": { "filename": "notes.md" } }
                    }
                ]));
            })
            .await;

        let client = GistClient::new(&server.base_url(), "ghp_test").unwrap();
        let objects = client.list_objects(1, 100).await.unwrap();

        list.assert_async().await;
        assert_eq!(objects.len(), 2);
        assert!(objects[0].has_file(FILE));
        assert_eq!(objects[0].file_content(FILE), None);
        assert_eq!(objects[1].description, "");
    }

    #[tokio::test]
    async fn test_get_fetches_truncated_content() {
        let server = MockServer::start_async().await;
        let raw_url = format!("{}/raw/a1/{}", server.base_url(), FILE);
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gists/a1");
                then.status(200).json_body(json!({
                    "id": "a1",
                    "updated_at": "2024-05-01T10:00:00Z",
                    "files": { FILE: {
                        "content": "v2:partial",
                        "truncated": true,
                        "raw_url": raw_url
                    } }
                }));
            })
            .await;
        let raw = server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/raw/a1/{}", FILE));
                then.status(200).body("v2:full:content");
            })
            .await;

        let client = GistClient::new(&server.base_url(), "t").unwrap();
        let object = client.get_object("a1").await.unwrap();

        raw.assert_async().await;
        assert_eq!(object.file_content(FILE), Some("v2:full:content"));
    }

    #[tokio::test]
    async fn test_create_is_private() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST).path("/gists").json_body(json!({
                    "description": "GistVault backup",
                    "public": false,
                    "files": { FILE: { "content": "v2:a:b" } }
                }));
                then.status(201).json_body(json!({
                    "id": "new1",
                    "updated_at": "2024-05-03T10:00:00Z",
                    "description": "GistVault backup",
                    "files": { FILE: { "content": "v2:a:b" } }
                }));
            })
            .await;

        let client = GistClient::new(&server.base_url(), "t").unwrap();
        let object = client
            .create_object("GistVault backup", FILE, "v2:a:b")
            .await
            .unwrap();

        create.assert_async().await;
        assert_eq!(object.id, "new1");
        assert_eq!(object.file_content(FILE), Some("v2:a:b"));
    }

    #[tokio::test]
    async fn test_update_maps_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path("/gists/gone");
                then.status(404).json_body(json!({ "message": "Not Found" }));
            })
            .await;

        let client = GistClient::new(&server.base_url(), "t").unwrap();
        let err = client.update_object("gone", FILE, "v2:a:b").await.unwrap_err();
        assert!(matches!(err, VaultError::RemoteNotFound(_)));
    }

    #[tokio::test]
    async fn test_auth_and_server_errors_are_distinguished() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gists/denied");
                then.status(401).json_body(json!({ "message": "Bad credentials" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gists/broken");
                then.status(502).body("bad gateway");
            })
            .await;

        let client = GistClient::new(&server.base_url(), "t").unwrap();
        assert!(matches!(
            client.get_object("denied").await,
            Err(VaultError::RemoteAuth(_))
        ));
        let err = client.get_object("broken").await.unwrap_err();
        assert!(matches!(err, VaultError::Network(_)));
        assert!(err.is_transient());
    }
}
