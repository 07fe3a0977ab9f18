use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use drive_uploads::api::{
    ApiError, ApiResult, CompleteUploadRequest, InitUploadRequest, InitUploadResponse, UploadApi,
};
use drive_uploads::session::{Session, SessionHandle};
use drive_uploads::store::{MemoryUploadStore, SqliteUploadStore, UploadStore};
use drive_uploads::{ManagerOptions, NewUpload, UploadManager, UploadRecord};
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Init {
        file_name: String,
        key: Option<String>,
    },
    Presign {
        upload_id: String,
        part_number: u32,
    },
    Put {
        upload_id: String,
        part_number: u32,
        len: usize,
    },
    Complete {
        upload_id: String,
        parts: Vec<u32>,
    },
    Abort {
        key: String,
        upload_id: String,
    },
}

/// In-memory stand-in for the drive's upload endpoints.
#[derive(Default)]
pub struct FakeApi {
    calls: Mutex<Vec<ApiCall>>,
    sessions: Mutex<HashMap<String, String>>,
    failing_files: Mutex<HashSet<String>>,
    held_part: Mutex<Option<u32>>,
    put_delay: Mutex<Option<Duration>>,
    next_upload: AtomicUsize,
    failed_puts_left: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Signalled when a PUT reaches the held part.
    pub held: Notify,
}

#[allow(dead_code)]
impl FakeApi {
    pub async fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().await.clone()
    }

    pub async fn presigned_parts(&self) -> Vec<u32> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Presign { part_number, .. } => Some(part_number),
                _ => None,
            })
            .collect()
    }

    pub async fn completions(&self) -> Vec<Vec<u32>> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Complete { parts, .. } => Some(parts),
                _ => None,
            })
            .collect()
    }

    /// Every PUT of an upload started for `file_name` fails.
    pub async fn fail_file(&self, file_name: &str) {
        self.failing_files.lock().await.insert(file_name.to_string());
    }

    /// The next `count` PUTs fail regardless of the upload.
    pub fn fail_next_puts(&self, count: usize) {
        self.failed_puts_left.store(count, Ordering::SeqCst);
    }

    /// PUTs of `part_number` never finish.
    pub async fn hold_part(&self, part_number: u32) {
        *self.held_part.lock().await = Some(part_number);
    }

    pub async fn release_parts(&self) {
        *self.held_part.lock().await = None;
    }

    pub async fn delay_puts(&self, delay: Duration) {
        *self.put_delay.lock().await = Some(delay);
    }

    pub fn max_concurrent_puts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn record(&self, call: ApiCall) {
        self.calls.lock().await.push(call);
    }

    async fn put(&self, upload_id: &str, part_number: u32) -> ApiResult<Option<String>> {
        if *self.held_part.lock().await == Some(part_number) {
            self.held.notify_one();
            std::future::pending::<()>().await;
        }
        let delay = *self.put_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let file_name = self.sessions.lock().await.get(upload_id).cloned();
        let failing = match &file_name {
            Some(file_name) => self.failing_files.lock().await.contains(file_name),
            None => true,
        };
        let forced = self
            .failed_puts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing || forced {
            return Err(ApiError::Status {
                status: 500,
                body: "storage unavailable".into(),
            });
        }
        Ok(Some(format!("etag-{upload_id}-{part_number}")))
    }
}

/// Decrements the in-flight counter when a PUT ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UploadApi for FakeApi {
    async fn init_upload(&self, request: &InitUploadRequest) -> ApiResult<InitUploadResponse> {
        self.record(ApiCall::Init {
            file_name: request.file_name.clone(),
            key: request.key.clone(),
        })
        .await;

        let (key, upload_id) = match (&request.key, &request.upload_id) {
            (Some(key), Some(upload_id)) => (key.clone(), upload_id.clone()),
            _ => {
                let n = self.next_upload.fetch_add(1, Ordering::SeqCst);
                (
                    format!("uploads/{}", request.file_name),
                    format!("upload-{n}"),
                )
            }
        };
        self.sessions
            .lock()
            .await
            .insert(upload_id.clone(), request.file_name.clone());

        Ok(InitUploadResponse {
            key: Some(key),
            upload_id: Some(upload_id),
        })
    }

    async fn presign_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> ApiResult<Option<String>> {
        self.record(ApiCall::Presign {
            upload_id: upload_id.to_string(),
            part_number,
        })
        .await;
        Ok(Some(format!("https://bucket.test/{upload_id}/{part_number}")))
    }

    async fn put_part(&self, url: &str, bytes: Bytes) -> ApiResult<Option<String>> {
        let (upload_id, part_number) = url
            .strip_prefix("https://bucket.test/")
            .and_then(|rest| rest.split_once('/'))
            .and_then(|(upload_id, part)| Some((upload_id.to_string(), part.parse::<u32>().ok()?)))
            .ok_or_else(|| ApiError::Status {
                status: 404,
                body: format!("unknown url {url}"),
            })?;
        self.record(ApiCall::Put {
            upload_id: upload_id.clone(),
            part_number,
            len: bytes.len(),
        })
        .await;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        self.put(&upload_id, part_number).await
    }

    async fn complete_upload(&self, request: &CompleteUploadRequest) -> ApiResult<bool> {
        self.record(ApiCall::Complete {
            upload_id: request.upload_id.clone(),
            parts: request.parts.iter().map(|part| part.part_number).collect(),
        })
        .await;
        Ok(true)
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> ApiResult<()> {
        self.record(ApiCall::Abort {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
        .await;
        Ok(())
    }
}

pub struct TestUploader {
    pub manager: Arc<UploadManager>,
    pub store: Arc<dyn UploadStore>,
    pub api: Arc<FakeApi>,
    pub owner_id: Uuid,
}

#[allow(dead_code)]
impl TestUploader {
    pub fn new(concurrency: usize) -> Self {
        Self::with_store(Arc::new(MemoryUploadStore::new()), concurrency)
    }

    pub fn with_store(store: Arc<dyn UploadStore>, concurrency: usize) -> Self {
        let owner_id = Uuid::new_v4();
        let session = SessionHandle::new(Some(Session {
            user_id: owner_id,
            access_token: Some("test-token".into()),
        }));
        Self::with_session(store, session, concurrency, owner_id)
    }

    pub fn signed_out(concurrency: usize) -> Self {
        Self::with_session(
            Arc::new(MemoryUploadStore::new()),
            SessionHandle::default(),
            concurrency,
            Uuid::nil(),
        )
    }

    fn with_session(
        store: Arc<dyn UploadStore>,
        session: SessionHandle,
        concurrency: usize,
        owner_id: Uuid,
    ) -> Self {
        let api = Arc::new(FakeApi::default());
        let api_for_manager: Arc<dyn UploadApi> = api.clone();
        let manager = UploadManager::new(
            store.clone(),
            api_for_manager,
            session,
            ManagerOptions {
                concurrency,
                ..ManagerOptions::default()
            },
        );
        Self {
            manager,
            store,
            api,
            owner_id,
        }
    }

    pub async fn add(&self, file_name: &str, size: usize) -> Result<UploadRecord> {
        let record = self
            .manager
            .add_upload(NewUpload {
                file_name: file_name.to_string(),
                file_type: "application/octet-stream".to_string(),
                bytes: Bytes::from(vec![0xAB; size]),
                parent_folder_id: None,
            })
            .await?;
        Ok(record)
    }

    pub async fn record(&self, id: Uuid) -> Result<UploadRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("upload {id} missing"))
    }

    pub async fn wait_idle(&self) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(10), self.manager.wait_idle())
            .await
            .context("uploads did not settle")??;
        Ok(())
    }
}

#[allow(dead_code)]
pub fn open_sqlite(dir: &TempDir) -> Result<SqliteUploadStore> {
    let path = dir.path().join("uploads.sqlite3");
    SqliteUploadStore::open(path.to_string_lossy().as_ref(), 2)
}
