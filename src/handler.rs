//! Executes the multipart protocol for one upload record.
//!
//! Steps: expiry check, init (reusing a known remote session), one
//! presign + PUT per missing chunk, then complete. Progress is written
//! after every confirmed part so a restart resumes at the first part
//! without an ETag. Cancellation leaves the record in `pause`; any other
//! failure is persisted as `error` with its message.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    api::{CompleteUploadRequest, InitUploadRequest, UploadApi},
    error::{UploadError, UploadResult},
    models::{progress_for, ETagPart, UploadPatch, UploadRecord, UploadStatus},
    store::{StoreError, UploadStore},
};

pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;

/// One-shot listeners for status changes, scoped by run.
///
/// Every queued execution of an upload gets a run number from
/// [`StatusWatchers::schedule`]. A listener registered for run `n` only
/// hears statuses written by run `n` or later, so the pause written by an
/// aborted run never reaches someone waiting on its replacement.
#[derive(Default)]
pub struct StatusWatchers {
    uploads: Mutex<HashMap<Uuid, RunState>>,
}

#[derive(Default)]
struct RunState {
    latest: u64,
    last: Option<(u64, UploadStatus)>,
    waiting: Vec<(u64, oneshot::Sender<UploadStatus>)>,
}

impl StatusWatchers {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RunState>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the next run number to `enqueue`. Returns that number when the
    /// run was accepted, or the number of the run already registered for
    /// `id` when it was not.
    pub fn schedule(&self, id: Uuid, enqueue: impl FnOnce(u64) -> bool) -> u64 {
        let mut uploads = self.lock();
        let state = uploads.entry(id).or_default();
        let run = state.latest + 1;
        if enqueue(run) {
            state.latest = run;
        }
        state.latest
    }

    /// Resolves with the next status written by run `from_run` or later. If
    /// such a run already wrote one, resolves with the latest of those.
    pub fn watch(&self, id: Uuid, from_run: u64) -> oneshot::Receiver<UploadStatus> {
        let (sender, receiver) = oneshot::channel();
        let mut uploads = self.lock();
        let state = uploads.entry(id).or_default();
        match state.last {
            Some((run, status)) if run >= from_run => {
                let _ = sender.send(status);
            }
            _ => state.waiting.push((from_run, sender)),
        }
        receiver
    }

    pub fn notify(&self, id: Uuid, run: u64, status: UploadStatus) {
        let mut uploads = self.lock();
        let state = uploads.entry(id).or_default();
        if state.last.map_or(true, |(last_run, _)| run >= last_run) {
            state.last = Some((run, status));
        }
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiting)
            .into_iter()
            .partition(|(from_run, _)| *from_run <= run);
        state.waiting = pending;
        for (_, sender) in ready {
            let _ = sender.send(status);
        }
    }

    /// Notifies on behalf of the most recently scheduled run.
    pub fn notify_latest(&self, id: Uuid, status: UploadStatus) {
        let run = self.lock().get(&id).map_or(0, |state| state.latest);
        self.notify(id, run, status);
    }

    /// Drops every listener of `id`; their receivers resolve with an error.
    pub fn forget(&self, id: Uuid) {
        self.lock().remove(&id);
    }
}

pub struct UploadHandler {
    store: Arc<dyn UploadStore>,
    api: Arc<dyn UploadApi>,
    watchers: Arc<StatusWatchers>,
    max_age: Duration,
}

impl UploadHandler {
    pub fn new(
        store: Arc<dyn UploadStore>,
        api: Arc<dyn UploadApi>,
        watchers: Arc<StatusWatchers>,
        max_age: Duration,
    ) -> Self {
        Self {
            store,
            api,
            watchers,
            max_age,
        }
    }

    /// Runs the upload as run number `run` and persists how it ended.
    /// Protocol failures are recorded on the upload rather than returned;
    /// the returned status is the one the record was left in.
    pub async fn execute(
        &self,
        id: Uuid,
        run: u64,
        token: CancellationToken,
    ) -> UploadResult<UploadStatus> {
        let mut remote = None;
        match self.run(id, run, &token, &mut remote).await {
            Ok(()) => Ok(UploadStatus::Done),
            Err(UploadError::NotFound(missing)) => {
                debug!(upload_id = %missing, "upload record disappeared; nothing to settle");
                Err(UploadError::NotFound(missing))
            }
            Err(err) if err.is_abort() || token.is_cancelled() => {
                info!(upload_id = %id, "upload paused");
                self.settle(id, run, UploadPatch::clean_status(UploadStatus::Pause), remote)
                    .await
            }
            Err(err) => {
                error!(upload_id = %id, error = %err, "upload failed");
                self.settle(id, run, UploadPatch::failed(err.to_string()), remote)
                    .await
            }
        }
    }

    async fn run(
        &self,
        id: Uuid,
        run: u64,
        token: &CancellationToken,
        remote: &mut Option<RemoteSession>,
    ) -> UploadResult<()> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(UploadError::NotFound(id))?;

        if record.status == UploadStatus::Done {
            debug!(upload_id = %id, "upload already done");
            return Ok(());
        }

        if record.is_expired(self.max_age, Utc::now()) {
            return Err(UploadError::Expired {
                days: self.max_age.num_days(),
            });
        }

        let blob = self
            .store
            .get_blob(id)
            .await?
            .ok_or(UploadError::MissingChunks(id))?;
        if blob.chunks.len() != record.total_chunks as usize {
            return Err(UploadError::MissingChunks(id));
        }

        ensure_running(token)?;
        let request = InitUploadRequest {
            file_type: record.file_type.clone(),
            file_name: record.file_name.clone(),
            file_size: record.file_size,
            key: record.remote_key.clone(),
            upload_id: record.remote_upload_id.clone(),
        };
        let response = cancellable(token, self.api.init_upload(&request))
            .await?
            .map_err(|err| UploadError::Init(err.to_string()))?;
        let (key, upload_id) = match (response.key, response.upload_id) {
            (Some(key), Some(upload_id)) if !key.is_empty() && !upload_id.is_empty() => {
                (key, upload_id)
            }
            _ => {
                return Err(UploadError::Init(
                    "remote did not return a key and upload id".into(),
                ))
            }
        };
        *remote = Some(RemoteSession {
            key: key.clone(),
            upload_id: upload_id.clone(),
        });
        ensure_running(token)?;

        let mut patch = UploadPatch {
            status: Some(UploadStatus::Uploading),
            remote_key: Some(Some(key.clone())),
            remote_upload_id: Some(Some(upload_id.clone())),
            error: Some(None),
            ..UploadPatch::default()
        };
        let same_session = record.remote_key.as_deref() == Some(key.as_str())
            && record.remote_upload_id.as_deref() == Some(upload_id.as_str());
        let mut etags = confirmed_parts(&record);
        if !same_session && !etags.is_empty() {
            warn!(
                upload_id = %id,
                confirmed_parts = etags.len(),
                "remote started a new session; restarting from the first part"
            );
            etags.clear();
        }
        let start = etags.len() as u32;
        if start != record.chunk_index || etags.len() != record.etags.len() {
            patch.chunk_index = Some(start);
            patch.etags = Some(etags.clone());
            patch.progress = Some(progress_for(start, record.total_chunks));
        }
        let mut record = self.transition(&record, run, patch).await?;

        info!(
            upload_id = %id,
            file_name = %record.file_name,
            total_chunks = record.total_chunks,
            start_chunk = start,
            "upload started"
        );

        for index in start..record.total_chunks {
            ensure_running(token)?;
            let part_number = index + 1;

            let url = cancellable(token, self.api.presign_part(&key, &upload_id, part_number))
                .await?
                .map_err(|err| UploadError::Presign {
                    part_number,
                    reason: err.to_string(),
                })?
                .ok_or_else(|| UploadError::Presign {
                    part_number,
                    reason: "no url returned".into(),
                })?;

            let chunk = blob.chunks[index as usize].clone();
            let etag = cancellable(token, self.api.put_part(&url, chunk))
                .await?
                .map_err(|err| UploadError::ChunkUpload {
                    part_number,
                    reason: err.to_string(),
                })?
                .ok_or(UploadError::ETagMissing { part_number })?;

            ensure_running(token)?;
            etags.push(ETagPart { part_number, etag });
            record = self
                .store
                .update(
                    id,
                    UploadPatch {
                        chunk_index: Some(part_number),
                        etags: Some(etags.clone()),
                        progress: Some(progress_for(part_number, record.total_chunks)),
                        ..UploadPatch::default()
                    },
                )
                .await
                .map_err(|err| not_found_as_missing(id, err))?;
            debug!(
                upload_id = %id,
                part_number,
                progress = record.progress,
                "part uploaded"
            );
        }

        ensure_running(token)?;
        let record = self
            .transition(
                &record,
                run,
                UploadPatch {
                    status: Some(UploadStatus::Finishing),
                    chunk_index: Some(record.total_chunks),
                    progress: Some(progress_for(record.total_chunks, record.total_chunks)),
                    ..UploadPatch::default()
                },
            )
            .await?;

        let request = CompleteUploadRequest {
            file_name: record.file_name.clone(),
            file_type: record.file_type.clone(),
            file_size: record.file_size,
            parent_folder_id: record.parent_folder_id,
            key,
            upload_id,
            parts: etags,
        };
        let completed = cancellable(token, self.api.complete_upload(&request))
            .await?
            .map_err(|err| UploadError::Complete(err.to_string()))?;
        if !completed {
            return Err(UploadError::Complete("remote rejected the upload".into()));
        }

        // The remote file exists now; a late abort must not undo that.
        self.transition(
            &record,
            run,
            UploadPatch {
                status: Some(UploadStatus::Done),
                progress: Some(100),
                error: Some(None),
                ..UploadPatch::default()
            },
        )
        .await?;
        info!(upload_id = %id, file_name = %record.file_name, "upload done");
        Ok(())
    }

    async fn transition(
        &self,
        current: &UploadRecord,
        run: u64,
        patch: UploadPatch,
    ) -> UploadResult<UploadRecord> {
        if let Some(next) = patch.status {
            if !current.status.can_transition_to(next) {
                return Err(UploadError::InvalidTransition {
                    from: current.status,
                    to: next,
                });
            }
        }
        let updated = self
            .store
            .update(current.id, patch)
            .await
            .map_err(|err| not_found_as_missing(current.id, err))?;
        self.watchers.notify(updated.id, run, updated.status);
        Ok(updated)
    }

    /// Writes the final status of a run against the latest stored state.
    /// A remote session opened by this run is kept on the record so a later
    /// resume or removal can reach it.
    async fn settle(
        &self,
        id: Uuid,
        run: u64,
        mut patch: UploadPatch,
        remote: Option<RemoteSession>,
    ) -> UploadResult<UploadStatus> {
        let Some(current) = self.store.get(id).await? else {
            debug!(upload_id = %id, "upload removed before its outcome was recorded");
            return Err(UploadError::NotFound(id));
        };
        if let Some(remote) = remote {
            remote.keep_on(&current, &mut patch);
        }
        match self.transition(&current, run, patch).await {
            Ok(updated) => Ok(updated.status),
            Err(UploadError::InvalidTransition { from, to }) => {
                warn!(upload_id = %id, %from, %to, "ignoring status change");
                Ok(current.status)
            }
            Err(err) => Err(err),
        }
    }
}

/// Multipart session returned by a successful init.
struct RemoteSession {
    key: String,
    upload_id: String,
}

impl RemoteSession {
    /// Records the session unless it is already stored. Parts confirmed for
    /// an older session are dropped with it.
    fn keep_on(self, current: &UploadRecord, patch: &mut UploadPatch) {
        if current.remote_key.as_deref() == Some(self.key.as_str())
            && current.remote_upload_id.as_deref() == Some(self.upload_id.as_str())
        {
            return;
        }
        patch.remote_key = Some(Some(self.key));
        patch.remote_upload_id = Some(Some(self.upload_id));
        patch.chunk_index = Some(0);
        patch.etags = Some(Vec::new());
        patch.progress = Some(0);
    }
}

fn not_found_as_missing(id: Uuid, err: StoreError) -> UploadError {
    match err {
        StoreError::NotFound(_) => UploadError::NotFound(id),
        other => UploadError::Store(other),
    }
}

/// Leading ETags that form the gap-free sequence `1..=n` and agree with the
/// stored `chunk_index`.
fn confirmed_parts(record: &UploadRecord) -> Vec<ETagPart> {
    record
        .etags
        .iter()
        .take(record.chunk_index as usize)
        .enumerate()
        .take_while(|(index, part)| part.part_number == *index as u32 + 1)
        .map(|(_, part)| part.clone())
        .collect()
}

fn ensure_running(token: &CancellationToken) -> UploadResult<()> {
    if token.is_cancelled() {
        Err(UploadError::Aborted)
    } else {
        Ok(())
    }
}

/// Races `future` against cancellation; the future is dropped on abort,
/// which also tears down an in-flight HTTP request.
async fn cancellable<T>(
    token: &CancellationToken,
    future: impl Future<Output = T>,
) -> UploadResult<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(UploadError::Aborted),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::api::{ApiError, ApiResult, InitUploadResponse};
    use crate::models::{FileBlobRecord, CHUNK_SIZE};
    use crate::store::MemoryUploadStore;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Init { key: Option<String> },
        Presign(u32),
        Put(u32),
        Complete(Vec<u32>),
    }

    #[derive(Default)]
    struct ScriptedApi {
        calls: Mutex<Vec<Call>>,
        missing_etag_for: Option<u32>,
        failing_put_for: Option<u32>,
        reject_complete: bool,
        omit_upload_id: bool,
        cancel_during_put: Option<(u32, CancellationToken)>,
        cancel_after_init: Option<CancellationToken>,
    }

    impl ScriptedApi {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn part_of(url: &str) -> u32 {
        url.rsplit('/').next().unwrap().parse().unwrap()
    }

    #[async_trait]
    impl UploadApi for ScriptedApi {
        async fn init_upload(&self, request: &InitUploadRequest) -> ApiResult<InitUploadResponse> {
            self.record(Call::Init {
                key: request.key.clone(),
            });
            if let Some(token) = &self.cancel_after_init {
                token.cancel();
            }
            Ok(InitUploadResponse {
                key: Some(request.key.clone().unwrap_or_else(|| "remote/key".into())),
                upload_id: (!self.omit_upload_id).then(|| {
                    request
                        .upload_id
                        .clone()
                        .unwrap_or_else(|| "remote-upload".into())
                }),
            })
        }

        async fn presign_part(
            &self,
            _key: &str,
            _upload_id: &str,
            part_number: u32,
        ) -> ApiResult<Option<String>> {
            self.record(Call::Presign(part_number));
            Ok(Some(format!("https://bucket.test/parts/{part_number}")))
        }

        async fn put_part(&self, url: &str, _bytes: Bytes) -> ApiResult<Option<String>> {
            let part_number = part_of(url);
            self.record(Call::Put(part_number));
            if let Some((cancel_at, token)) = &self.cancel_during_put {
                if *cancel_at == part_number {
                    token.cancel();
                    tokio::time::sleep(StdDuration::from_secs(5)).await;
                }
            }
            if self.failing_put_for == Some(part_number) {
                return Err(ApiError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            if self.missing_etag_for == Some(part_number) {
                return Ok(None);
            }
            Ok(Some(format!("etag-{part_number}")))
        }

        async fn complete_upload(&self, request: &CompleteUploadRequest) -> ApiResult<bool> {
            self.record(Call::Complete(
                request.parts.iter().map(|part| part.part_number).collect(),
            ));
            Ok(!self.reject_complete)
        }

        async fn abort_upload(&self, _key: &str, _upload_id: &str) -> ApiResult<()> {
            Ok(())
        }
    }

    async fn seed(store: &MemoryUploadStore, chunks: u64) -> UploadRecord {
        let size = chunks * CHUNK_SIZE;
        let record = UploadRecord::new(
            Uuid::new_v4(),
            None,
            "video.mp4",
            "video/mp4",
            size,
        );
        store
            .add_blob(&FileBlobRecord::from_bytes(
                record.id,
                Bytes::from(vec![0u8; size as usize]),
            ))
            .await
            .unwrap();
        store.add(&record).await.unwrap();
        record
    }

    fn handler(store: Arc<MemoryUploadStore>, api: Arc<ScriptedApi>) -> UploadHandler {
        UploadHandler::new(
            store,
            api,
            Arc::new(StatusWatchers::default()),
            Duration::days(DEFAULT_MAX_AGE_DAYS),
        )
    }

    #[tokio::test]
    async fn uploads_every_part_in_order() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi::default());
        let record = seed(&store, 3).await;

        let status = handler(store.clone(), api.clone())
            .execute(record.id, 1, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, UploadStatus::Done);

        assert_eq!(
            api.calls(),
            vec![
                Call::Init { key: None },
                Call::Presign(1),
                Call::Put(1),
                Call::Presign(2),
                Call::Put(2),
                Call::Presign(3),
                Call::Put(3),
                Call::Complete(vec![1, 2, 3]),
            ]
        );

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Done);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.chunk_index, 3);
        assert_eq!(stored.remote_key.as_deref(), Some("remote/key"));
        assert_eq!(stored.etags.len(), 3);
    }

    #[tokio::test]
    async fn resumes_after_the_last_confirmed_part() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi::default());
        let record = seed(&store, 5).await;
        store
            .update(
                record.id,
                UploadPatch {
                    status: Some(UploadStatus::Pause),
                    chunk_index: Some(2),
                    remote_key: Some(Some("remote/key".into())),
                    remote_upload_id: Some(Some("remote-upload".into())),
                    etags: Some(vec![
                        ETagPart {
                            part_number: 1,
                            etag: "etag-1".into(),
                        },
                        ETagPart {
                            part_number: 2,
                            etag: "etag-2".into(),
                        },
                    ]),
                    ..UploadPatch::default()
                },
            )
            .await
            .unwrap();

        handler(store.clone(), api.clone())
            .execute(record.id, 1, CancellationToken::new())
            .await
            .unwrap();

        let calls = api.calls();
        assert_eq!(
            calls[0],
            Call::Init {
                key: Some("remote/key".into())
            }
        );
        assert!(!calls.contains(&Call::Presign(1)));
        assert!(!calls.contains(&Call::Presign(2)));
        assert!(!calls.contains(&Call::Put(1)));
        assert_eq!(calls.last(), Some(&Call::Complete(vec![1, 2, 3, 4, 5])));
    }

    #[tokio::test]
    async fn expired_uploads_fail_without_network_calls() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi::default());
        let mut record = seed(&store, 1).await;
        record.created_at = (Utc::now() - Duration::days(8)).timestamp();
        store.delete(record.id).await.unwrap();
        store.add(&record).await.unwrap();

        let status = handler(store.clone(), api.clone())
            .execute(record.id, 1, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, UploadStatus::Error);
        assert!(api.calls().is_empty());
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert!(stored.error.unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn missing_etag_is_a_hard_failure() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi {
            missing_etag_for: Some(2),
            ..ScriptedApi::default()
        });
        let record = seed(&store, 3).await;

        let status = handler(store.clone(), api.clone())
            .execute(record.id, 1, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, UploadStatus::Error);

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.chunk_index, 1);
        assert_eq!(stored.etags.len(), 1);
        assert_eq!(stored.error.as_deref(), Some("no ETag returned for part 2"));
        assert!(!api.calls().contains(&Call::Presign(3)));
    }

    #[tokio::test]
    async fn failed_put_reports_the_part_number() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi {
            failing_put_for: Some(1),
            ..ScriptedApi::default()
        });
        let record = seed(&store, 2).await;

        handler(store.clone(), api)
            .execute(record.id, 1, CancellationToken::new())
            .await
            .unwrap();
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Error);
        assert!(stored
            .error
            .unwrap()
            .starts_with("failed to upload part 1"));
    }

    #[tokio::test]
    async fn init_without_upload_id_fails() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi {
            omit_upload_id: true,
            ..ScriptedApi::default()
        });
        let record = seed(&store, 1).await;

        handler(store.clone(), api.clone())
            .execute(record.id, 1, CancellationToken::new())
            .await
            .unwrap();
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Error);
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn rejected_completion_is_an_error() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi {
            reject_complete: true,
            ..ScriptedApi::default()
        });
        let record = seed(&store, 1).await;

        let status = handler(store.clone(), api)
            .execute(record.id, 1, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status, UploadStatus::Error);
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.chunk_index, 1);
    }

    #[tokio::test]
    async fn abort_mid_chunk_pauses_without_sending_later_parts() {
        let store = Arc::new(MemoryUploadStore::new());
        let token = CancellationToken::new();
        let api = Arc::new(ScriptedApi {
            cancel_during_put: Some((2, token.clone())),
            ..ScriptedApi::default()
        });
        let record = seed(&store, 4).await;

        let status = tokio::time::timeout(
            StdDuration::from_secs(1),
            handler(store.clone(), api.clone()).execute(record.id, 1, token),
        )
        .await
        .expect("abort interrupted the in-flight request")
        .unwrap();
        assert_eq!(status, UploadStatus::Pause);

        let calls = api.calls();
        assert_eq!(calls.last(), Some(&Call::Put(2)));
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Pause);
        assert_eq!(stored.error, None);
        assert_eq!(stored.chunk_index, 1);
        assert_eq!(stored.etags.len(), 1);
    }

    #[tokio::test]
    async fn new_remote_session_restarts_from_first_part() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi::default());
        let record = seed(&store, 2).await;
        store
            .update(
                record.id,
                UploadPatch {
                    status: Some(UploadStatus::Error),
                    chunk_index: Some(1),
                    etags: Some(vec![ETagPart {
                        part_number: 1,
                        etag: "stale".into(),
                    }]),
                    ..UploadPatch::default()
                },
            )
            .await
            .unwrap();

        handler(store.clone(), api.clone())
            .execute(record.id, 1, CancellationToken::new())
            .await
            .unwrap();
        assert!(api.calls().contains(&Call::Put(1)));
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.etags[0].etag, "etag-1");
        assert_eq!(stored.status, UploadStatus::Done);
    }

    #[tokio::test]
    async fn abort_right_after_init_keeps_the_remote_session() {
        let store = Arc::new(MemoryUploadStore::new());
        let token = CancellationToken::new();
        let api = Arc::new(ScriptedApi {
            cancel_after_init: Some(token.clone()),
            ..ScriptedApi::default()
        });
        let record = seed(&store, 2).await;

        let status = handler(store.clone(), api.clone())
            .execute(record.id, 1, token)
            .await
            .unwrap();
        assert_eq!(status, UploadStatus::Pause);
        assert_eq!(api.calls(), vec![Call::Init { key: None }]);

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Pause);
        assert_eq!(stored.remote_key.as_deref(), Some("remote/key"));
        assert_eq!(stored.remote_upload_id.as_deref(), Some("remote-upload"));
        assert_eq!(stored.chunk_index, 0);
    }

    #[tokio::test]
    async fn watchers_hear_status_changes() {
        let store = Arc::new(MemoryUploadStore::new());
        let api = Arc::new(ScriptedApi::default());
        let watchers = Arc::new(StatusWatchers::default());
        let record = seed(&store, 1).await;
        let first = watchers.watch(record.id, 1);

        UploadHandler::new(
            store,
            api,
            watchers.clone(),
            Duration::days(DEFAULT_MAX_AGE_DAYS),
        )
        .execute(record.id, 1, CancellationToken::new())
        .await
        .unwrap();
        assert_eq!(first.await.unwrap(), UploadStatus::Uploading);

        // A late listener gets the latest status of the run it asked for.
        let late = watchers.watch(record.id, 1);
        assert_eq!(late.await.unwrap(), UploadStatus::Done);
    }

    #[tokio::test]
    async fn watchers_skip_statuses_of_earlier_runs() {
        let watchers = StatusWatchers::default();
        let id = Uuid::new_v4();
        assert_eq!(watchers.schedule(id, |_| true), 1);
        assert_eq!(watchers.schedule(id, |_| true), 2);
        // A rejected run leaves the registered one in place.
        assert_eq!(watchers.schedule(id, |_| false), 2);

        let mut next = watchers.watch(id, 2);
        watchers.notify(id, 1, UploadStatus::Pause);
        assert!(next.try_recv().is_err());

        watchers.notify(id, 2, UploadStatus::Uploading);
        assert_eq!(next.await.unwrap(), UploadStatus::Uploading);

        watchers.notify_latest(id, UploadStatus::Pause);
        assert_eq!(
            watchers.watch(id, 2).await.unwrap(),
            UploadStatus::Pause
        );
    }
}
