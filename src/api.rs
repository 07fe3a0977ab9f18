//! Remote side of the multipart protocol.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::ETAG;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::{config::UploaderConfig, models::ETagPart, session::SessionHandle};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitUploadRequest {
    pub file_type: String,
    pub file_name: String,
    pub file_size: u64,
    /// Set when resuming so the remote keeps the existing session.
    pub key: Option<String>,
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitUploadResponse {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignPartRequest {
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresignPartResponse {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteUploadRequest {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub parent_folder_id: Option<Uuid>,
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<ETagPart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortUploadRequest {
    pub key: String,
    pub upload_id: String,
}

#[async_trait]
pub trait UploadApi: Send + Sync + 'static {
    async fn init_upload(&self, request: &InitUploadRequest) -> ApiResult<InitUploadResponse>;

    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> ApiResult<Option<String>>;

    /// PUTs one chunk to a presigned URL and returns its ETag, if the
    /// response carried one.
    async fn put_part(&self, url: &str, bytes: Bytes) -> ApiResult<Option<String>>;

    async fn complete_upload(&self, request: &CompleteUploadRequest) -> ApiResult<bool>;

    async fn abort_upload(&self, key: &str, upload_id: &str) -> ApiResult<()>;
}

/// Strips whitespace and the surrounding quotes of an ETag header value.
pub fn normalize_etag(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('"');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// [`UploadApi`] over the drive's JSON endpoints.
pub struct HttpUploadApi {
    client: Client,
    base_url: Url,
    session: SessionHandle,
}

impl HttpUploadApi {
    pub fn new(base_url: Url, session: SessionHandle, timeout: Duration) -> ApiResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: with_trailing_slash(base_url),
            session,
        })
    }

    pub fn from_config(config: &UploaderConfig, session: SessionHandle) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.api_base_url)?;
        Ok(Self::new(
            base_url,
            session,
            Duration::from_secs(config.http_timeout_secs),
        )?)
    }

    fn endpoint(&self, path: &str) -> ApiResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> ApiResult<Response> {
        let mut request = self.client.post(self.endpoint(path)?).json(body);
        if let Some(token) = self.session.access_token() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        ensure_success(response).await
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> ApiResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self.post(path, body).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn init_upload(&self, request: &InitUploadRequest) -> ApiResult<InitUploadResponse> {
        self.post_json("api/uploads/init", request).await
    }

    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> ApiResult<Option<String>> {
        let request = PresignPartRequest {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            part_number,
        };
        let response: PresignPartResponse = self.post_json("api/uploads/presign", &request).await?;
        Ok(response.url.filter(|url| !url.is_empty()))
    }

    async fn put_part(&self, url: &str, bytes: Bytes) -> ApiResult<Option<String>> {
        let response = self.client.put(url).body(bytes).send().await?;
        let response = ensure_success(response).await?;
        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .and_then(normalize_etag))
    }

    async fn complete_upload(&self, request: &CompleteUploadRequest) -> ApiResult<bool> {
        let response: CompleteUploadResponse =
            self.post_json("api/uploads/complete", request).await?;
        Ok(response.success)
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> ApiResult<()> {
        let request = AbortUploadRequest {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        };
        self.post("api/uploads/abort", &request).await?;
        Ok(())
    }
}

async fn ensure_success(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
