//! Orchestrates persisted uploads against the task queue.
//!
//! The manager owns startup reconciliation, the scheduler that enqueues
//! every `pending` record, and the add/retry/cancel/remove operations. It
//! listens to the store's change events and republishes the full record
//! list to subscribers after every change.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use chrono::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    api::UploadApi,
    config::UploaderConfig,
    error::{UploadError, UploadResult},
    handler::{StatusWatchers, UploadHandler, DEFAULT_MAX_AGE_DAYS},
    models::{FileBlobRecord, UploadPatch, UploadRecord, UploadStatus},
    queue::{TaskPhase, TaskQueue},
    session::SessionHandle,
    store::{StoreTable, UploadStore},
    thumbnails::generate_thumbnail,
};

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub concurrency: usize,
    pub max_age: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
        }
    }
}

impl From<&UploaderConfig> for ManagerOptions {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            concurrency: config.upload_concurrency,
            max_age: Duration::days(config.upload_expiry_days),
        }
    }
}

/// A file handed to [`UploadManager::add_upload`].
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub file_name: String,
    pub file_type: String,
    pub bytes: Bytes,
    pub parent_folder_id: Option<Uuid>,
}

/// Badge counts over a record list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub total: usize,
    pub in_progress: usize,
    pub paused: usize,
    pub failed: usize,
    pub done: usize,
}

impl UploadSummary {
    pub fn from_records(records: &[UploadRecord]) -> Self {
        records
            .iter()
            .fold(Self::default(), |mut summary, record| {
                summary.total += 1;
                match record.status {
                    UploadStatus::Pending | UploadStatus::Uploading | UploadStatus::Finishing => {
                        summary.in_progress += 1
                    }
                    UploadStatus::Pause => summary.paused += 1,
                    UploadStatus::Error => summary.failed += 1,
                    UploadStatus::Done => summary.done += 1,
                }
                summary
            })
    }
}

/// What a queued upload task needs to run.
#[derive(Clone)]
struct UploadTask {
    handler: Arc<UploadHandler>,
    store: Arc<dyn UploadStore>,
    watchers: Arc<StatusWatchers>,
}

impl UploadTask {
    async fn run(self, id: Uuid, run: u64, token: CancellationToken) -> anyhow::Result<()> {
        let outcome = self.handler.execute(id, run, token).await;

        // Wake anyone waiting on this upload even when the run ended
        // without writing a status.
        match self.store.get(id).await {
            Ok(Some(record)) => self.watchers.notify(id, run, record.status),
            Ok(None) => self.watchers.forget(id),
            Err(err) => warn!(upload_id = %id, error = %err, "failed to read upload after run"),
        }

        match outcome {
            Ok(status) => {
                debug!(upload_id = %id, %status, "upload task finished");
                Ok(())
            }
            Err(UploadError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

pub struct UploadManager {
    store: Arc<dyn UploadStore>,
    api: Arc<dyn UploadApi>,
    session: SessionHandle,
    queue: TaskQueue<Uuid>,
    watchers: Arc<StatusWatchers>,
    task: UploadTask,
    records: watch::Sender<Vec<UploadRecord>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl UploadManager {
    pub fn new(
        store: Arc<dyn UploadStore>,
        api: Arc<dyn UploadApi>,
        session: SessionHandle,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let watchers = Arc::new(StatusWatchers::default());
        let handler = Arc::new(UploadHandler::new(
            store.clone(),
            api.clone(),
            watchers.clone(),
            options.max_age,
        ));
        let (records, _) = watch::channel(Vec::new());

        Arc::new(Self {
            task: UploadTask {
                handler,
                store: store.clone(),
                watchers: watchers.clone(),
            },
            store,
            api,
            session,
            queue: TaskQueue::new(options.concurrency),
            watchers,
            records,
            listener: Mutex::new(None),
        })
    }

    /// Reconciles interrupted uploads, starts following store changes and
    /// schedules everything that is pending.
    pub async fn start(self: &Arc<Self>) -> UploadResult<()> {
        self.spawn_listener();
        let recovered = self.fix_back().await?;
        let scheduled = self.sync().await?;
        info!(
            recovered,
            scheduled,
            concurrency = self.queue.concurrency(),
            "upload manager started"
        );
        Ok(())
    }

    fn spawn_listener(self: &Arc<Self>) {
        let mut events = self.store.subscribe();
        let manager: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                let mut relevant = match events.recv().await {
                    Ok(event) => event.table == StoreTable::Uploads,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "store events lagged; resyncing");
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
                // Collapse a burst of events into a single re-read.
                loop {
                    match events.try_recv() {
                        Ok(event) => relevant |= event.table == StoreTable::Uploads,
                        Err(TryRecvError::Lagged(_)) => relevant = true,
                        Err(_) => break,
                    }
                }
                if !relevant {
                    continue;
                }

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(err) = manager.sync().await {
                    warn!(error = %err, "failed to refresh uploads");
                }
            }
        });

        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn sync(&self) -> UploadResult<usize> {
        self.refresh().await?;
        self.start_upload().await
    }

    /// Re-reads every record and republishes the list.
    pub async fn refresh(&self) -> UploadResult<()> {
        let records = self.store.get_all(None).await?;
        self.records.send_replace(records);
        Ok(())
    }

    /// Forces every record left in an indeterminate state back to `pending`.
    pub async fn fix_back(&self) -> UploadResult<usize> {
        let stale = self
            .store
            .get_all(Some(&|record: &UploadRecord| {
                record.status.needs_recovery()
                    && (record.status != UploadStatus::Pending || record.error.is_some())
            }))
            .await?;

        let mut recovered = 0;
        for record in stale {
            if self.queue.has(&record.id) {
                continue;
            }
            self.store
                .update(record.id, UploadPatch::clean_status(UploadStatus::Pending))
                .await?;
            info!(
                upload_id = %record.id,
                from = %record.status,
                chunk_index = record.chunk_index,
                "requeued interrupted upload"
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Enqueues every `pending` record the queue is not already tracking.
    pub async fn start_upload(&self) -> UploadResult<usize> {
        let pending = self
            .store
            .get_all(Some(&|record: &UploadRecord| {
                record.status == UploadStatus::Pending
            }))
            .await?;

        let mut scheduled = 0;
        for record in pending {
            if !self.queue.has(&record.id) && self.enqueue(record.id).1 {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Queues a run of `id`. Returns the run now registered for the upload
    /// and whether this call added it.
    fn enqueue(&self, id: Uuid) -> (u64, bool) {
        let mut added = false;
        let run = self.watchers.schedule(id, |run| {
            added = self
                .queue
                .add(id, self.task.clone(), move |task, token| task.run(id, run, token));
            added
        });
        (run, added)
    }

    pub async fn add_upload(&self, upload: NewUpload) -> UploadResult<UploadRecord> {
        let session = self.session.current().ok_or(UploadError::Session)?;
        let NewUpload {
            file_name,
            file_type,
            bytes,
            parent_folder_id,
        } = upload;

        let record = UploadRecord::new(
            session.user_id,
            parent_folder_id,
            file_name,
            file_type,
            bytes.len() as u64,
        );
        let blob = FileBlobRecord::from_bytes(record.id, bytes.clone());

        self.store.add_blob(&blob).await?;
        if let Err(err) = self.store.add(&record).await {
            if let Err(rollback) = self.store.delete_blob(record.id).await {
                warn!(
                    upload_id = %record.id,
                    error = %rollback,
                    "failed to roll back chunks of rejected upload"
                );
            }
            return Err(err.into());
        }

        info!(
            upload_id = %record.id,
            file_name = %record.file_name,
            file_size = record.file_size,
            total_chunks = record.total_chunks,
            "upload added"
        );

        if record.is_image() {
            self.spawn_thumbnail(record.id, bytes);
        }

        self.start_upload().await?;
        Ok(record)
    }

    /// Reads `path` from disk and adds it with a MIME type guessed from its
    /// extension.
    pub async fn add_file(
        &self,
        path: impl AsRef<Path>,
        parent_folder_id: Option<Uuid>,
    ) -> UploadResult<UploadRecord> {
        if self.session.current().is_none() {
            return Err(UploadError::Session);
        }
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let file_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        self.add_upload(NewUpload {
            file_name,
            file_type,
            bytes: Bytes::from(bytes),
            parent_folder_id,
        })
        .await
    }

    fn spawn_thumbnail(&self, id: Uuid, bytes: Bytes) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let generated = tokio::task::spawn_blocking(move || generate_thumbnail(&bytes)).await;
            let thumbnail = match generated {
                Ok(Ok(thumbnail)) => thumbnail,
                Ok(Err(err)) => {
                    warn!(upload_id = %id, error = %err, "thumbnail generation failed");
                    return;
                }
                Err(err) => {
                    warn!(upload_id = %id, error = %err, "thumbnail task failed");
                    return;
                }
            };

            let patch = UploadPatch {
                thumbnail: Some(Some(thumbnail.png_bytes)),
                ..UploadPatch::default()
            };
            match store.update(id, patch).await {
                Ok(_) => debug!(
                    upload_id = %id,
                    width = thumbnail.width,
                    height = thumbnail.height,
                    "thumbnail stored"
                ),
                Err(err) => debug!(upload_id = %id, error = %err, "thumbnail not stored"),
            }
        });
    }

    /// Re-enqueues an upload and resolves with the first status the retried
    /// run moves it to. Statuses still written by an aborted earlier run are
    /// not reported.
    pub async fn retry_upload(&self, id: Uuid) -> UploadResult<UploadStatus> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(UploadError::NotFound(id))?;
        if record.status == UploadStatus::Done {
            return Ok(UploadStatus::Done);
        }

        let (run, added) = self.enqueue(id);
        if added {
            info!(upload_id = %id, run, from = %record.status, "upload retried");
        }
        let changed = self.watchers.watch(id, run);

        if self.queue.start_until_run(&id).await.is_err() {
            return self.current_status(id).await;
        }
        match changed.await {
            Ok(status) => Ok(status),
            Err(_) => self.current_status(id).await,
        }
    }

    async fn current_status(&self, id: Uuid) -> UploadResult<UploadStatus> {
        self.store
            .get(id)
            .await?
            .map(|record| record.status)
            .ok_or(UploadError::NotFound(id))
    }

    /// Stops an upload and leaves it resumable. A running upload is paused
    /// by its handler once it observes the abort.
    pub async fn cancel_upload(&self, id: Uuid) -> UploadResult<()> {
        if let Some(TaskPhase::Running) = self.queue.abort(&id) {
            info!(upload_id = %id, "upload cancelled");
            return Ok(());
        }

        let record = self
            .store
            .get(id)
            .await?
            .ok_or(UploadError::NotFound(id))?;
        if record.status != UploadStatus::Pause
            && record.status.can_transition_to(UploadStatus::Pause)
        {
            self.store
                .update(id, UploadPatch::clean_status(UploadStatus::Pause))
                .await?;
            self.watchers.notify_latest(id, UploadStatus::Pause);
        }
        // The scheduler may have picked the record up again before it left
        // `pending`.
        self.queue.abort(&id);
        info!(upload_id = %id, "upload cancelled");
        Ok(())
    }

    /// Cancels the upload, asks the remote to drop its multipart session
    /// and deletes both local records.
    pub async fn remove_upload(&self, id: Uuid) -> UploadResult<()> {
        // Let an aborted run record the remote session it may have opened.
        if let Some(TaskPhase::Running) = self.queue.abort(&id) {
            self.queue.wait_stopped(&id).await;
        }

        if let Some(record) = self.store.get(id).await? {
            if record.status != UploadStatus::Done {
                if let (Some(key), Some(upload_id)) =
                    (&record.remote_key, &record.remote_upload_id)
                {
                    if let Err(err) = self.api.abort_upload(key, upload_id).await {
                        warn!(upload_id = %id, error = %err, "failed to abort remote upload");
                    }
                }
            }
            self.store.delete(id).await?;
        }
        self.store.delete_blob(id).await?;
        self.watchers.forget(id);

        info!(upload_id = %id, "upload removed");
        Ok(())
    }

    /// Deletes every finished upload together with its chunks.
    pub async fn purge_completed(&self) -> UploadResult<usize> {
        let done = self
            .store
            .get_all(Some(&|record: &UploadRecord| {
                record.status == UploadStatus::Done
            }))
            .await?;

        for record in &done {
            self.store.delete(record.id).await?;
            self.store.delete_blob(record.id).await?;
            self.watchers.forget(record.id);
        }
        if !done.is_empty() {
            info!(purged = done.len(), "completed uploads purged");
        }
        Ok(done.len())
    }

    /// Latest published record list.
    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.records.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<UploadRecord>> {
        self.records.subscribe()
    }

    pub fn queue(&self) -> &TaskQueue<Uuid> {
        &self.queue
    }

    /// Resolves once nothing is queued or running and no pending record is
    /// left to schedule.
    pub async fn wait_idle(&self) -> UploadResult<()> {
        loop {
            self.queue.wait_idle().await;
            if self.start_upload().await? == 0 && self.queue.is_empty() {
                return self.refresh().await;
            }
        }
    }

    /// Stops following the store, pauses every active upload and waits for
    /// the running handlers to exit.
    pub async fn shutdown(&self) -> UploadResult<()> {
        self.stop_listener();

        let active = self
            .store
            .get_all(Some(&|record: &UploadRecord| {
                matches!(
                    record.status,
                    UploadStatus::Pending | UploadStatus::Uploading | UploadStatus::Finishing
                )
            }))
            .await?;
        for record in &active {
            self.cancel_upload(record.id).await?;
        }
        self.queue.clear();
        self.queue.wait_idle().await;
        self.refresh().await?;

        info!(paused = active.len(), "upload manager stopped");
        Ok(())
    }

    fn stop_listener(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.stop_listener();
        self.queue.clear();
    }
}
