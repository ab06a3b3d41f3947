//! Server transport.
//!
//! The engine only needs three calls. Everything else about HTTP
//! (token minting, refresh, retries) belongs to the embedding
//! application. The trait seam lets tests run against an in-memory
//! server.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;

use crate::error::{Result, SyncError};
use crate::protocol::{DownloadResponse, SnapshotResponse, UploadRequest, UploadResponse};

#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a batch of local changes; the response carries one verdict
    /// per change, positionally.
    async fn upload(&self, req: &UploadRequest) -> Result<UploadResponse>;

    /// GET server changes strictly after `after`.
    async fn download(&self, after: i64, limit: u32, include_self: bool)
    -> Result<DownloadResponse>;

    /// GET one page of the snapshot stream.
    async fn snapshot(
        &self,
        cursor: Option<&str>,
        limit: u32,
        include_self: bool,
    ) -> Result<SnapshotResponse>;
}

/// Bearer-token HTTP transport against the sync endpoints.
pub struct HttpTransport {
    base_url: String,
    token: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            http,
        })
    }

    /// Install or replace the bearer token. The engine never mints or
    /// verifies it.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().expect("token lock poisoned") = Some(token.into());
    }

    pub fn clear_token(&self) {
        *self.token.write().expect("token lock poisoned") = None;
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = self.token.read().expect("token lock poisoned").as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SyncError::Auth(format!("invalid bearer token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn handle<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => SyncError::Auth(format!("{status}: {body}")),
                _ => SyncError::Transport(format!("{status}: {body}")),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Protocol(format!("malformed server response: {e}")))
    }
}

fn request_error(e: reqwest::Error) -> SyncError {
    SyncError::Transport(e.to_string())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(&self, req: &UploadRequest) -> Result<UploadResponse> {
        let url = format!("{}/sync/upload", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(req)
            .send()
            .await
            .map_err(request_error)?;
        self.handle(response).await
    }

    async fn download(
        &self,
        after: i64,
        limit: u32,
        include_self: bool,
    ) -> Result<DownloadResponse> {
        let url = format!(
            "{}/sync/download?after={after}&limit={limit}&include_self={include_self}",
            self.base_url
        );
        let response = self
            .http
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(request_error)?;
        self.handle(response).await
    }

    async fn snapshot(
        &self,
        cursor: Option<&str>,
        limit: u32,
        include_self: bool,
    ) -> Result<SnapshotResponse> {
        let mut url = format!(
            "{}/sync/snapshot?limit={limit}&include_self={include_self}",
            self.base_url
        );
        if let Some(cursor) = cursor {
            url.push_str("&cursor=");
            url.push_str(cursor);
        }
        let response = self
            .http
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(request_error)?;
        self.handle(response).await
    }
}
