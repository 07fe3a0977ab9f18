//! Durable local store for upload metadata and chunk payloads.
//!
//! Metadata (`uploads`) and raw chunks (blobs) are kept in two tables keyed
//! by the same upload id so that the frequent progress writes never touch
//! the large write-once payload.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{FileBlobRecord, UploadPatch, UploadRecord};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryUploadStore;
pub use sqlite::SqliteUploadStore;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} already exists")]
    DuplicateKey(Uuid),
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTable {
    Uploads,
    Blobs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Added,
    Updated,
    Deleted,
}

/// Emitted exactly once for every mutating call that changed the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreEvent {
    pub table: StoreTable,
    pub id: Uuid,
    pub kind: StoreEventKind,
}

pub type UploadFilter<'a> = &'a (dyn Fn(&UploadRecord) -> bool + Send + Sync);

#[async_trait]
pub trait UploadStore: Send + Sync + 'static {
    async fn get(&self, id: Uuid) -> StoreResult<Option<UploadRecord>>;

    /// Records ordered by creation time, oldest first.
    async fn get_all(&self, filter: Option<UploadFilter<'_>>) -> StoreResult<Vec<UploadRecord>>;

    async fn add(&self, record: &UploadRecord) -> StoreResult<()>;

    /// Merges `patch` into the stored record and returns the result.
    async fn update(&self, id: Uuid, patch: UploadPatch) -> StoreResult<UploadRecord>;

    /// Removes the record; deleting a missing id is a no-op without an event.
    async fn delete(&self, id: Uuid) -> StoreResult<()>;

    async fn get_blob(&self, id: Uuid) -> StoreResult<Option<FileBlobRecord>>;

    async fn add_blob(&self, blob: &FileBlobRecord) -> StoreResult<()>;

    async fn delete_blob(&self, id: Uuid) -> StoreResult<()>;

    /// Subscribes to mutation events; dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub(crate) fn emit(&self, table: StoreTable, id: Uuid, kind: StoreEventKind) {
        // No subscribers is fine.
        let _ = self.sender.send(StoreEvent { table, id, kind });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn apply_filter(
    records: Vec<UploadRecord>,
    filter: Option<UploadFilter<'_>>,
) -> Vec<UploadRecord> {
    match filter {
        Some(predicate) => records.into_iter().filter(|record| predicate(record)).collect(),
        None => records,
    }
}
