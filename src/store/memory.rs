use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::models::{FileBlobRecord, UploadPatch, UploadRecord};

use super::{
    apply_filter, EventBus, StoreError, StoreEvent, StoreEventKind, StoreResult, StoreTable,
    UploadFilter, UploadStore,
};

/// In-process [`UploadStore`]; contents are lost when it is dropped.
#[derive(Default)]
pub struct MemoryUploadStore {
    uploads: RwLock<HashMap<Uuid, UploadRecord>>,
    blobs: RwLock<HashMap<Uuid, FileBlobRecord>>,
    events: EventBus,
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadStore for MemoryUploadStore {
    async fn get(&self, id: Uuid) -> StoreResult<Option<UploadRecord>> {
        Ok(self.uploads.read().await.get(&id).cloned())
    }

    async fn get_all(&self, filter: Option<UploadFilter<'_>>) -> StoreResult<Vec<UploadRecord>> {
        let mut records: Vec<UploadRecord> = self.uploads.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(apply_filter(records, filter))
    }

    async fn add(&self, record: &UploadRecord) -> StoreResult<()> {
        {
            let mut uploads = self.uploads.write().await;
            if uploads.contains_key(&record.id) {
                return Err(StoreError::DuplicateKey(record.id));
            }
            uploads.insert(record.id, record.clone());
        }
        self.events
            .emit(StoreTable::Uploads, record.id, StoreEventKind::Added);
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: UploadPatch) -> StoreResult<UploadRecord> {
        let updated = {
            let mut uploads = self.uploads.write().await;
            let record = uploads.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            record.apply(&patch);
            record.clone()
        };
        self.events
            .emit(StoreTable::Uploads, id, StoreEventKind::Updated);
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let removed = self.uploads.write().await.remove(&id);
        if removed.is_some() {
            self.events
                .emit(StoreTable::Uploads, id, StoreEventKind::Deleted);
        }
        Ok(())
    }

    async fn get_blob(&self, id: Uuid) -> StoreResult<Option<FileBlobRecord>> {
        Ok(self.blobs.read().await.get(&id).cloned())
    }

    async fn add_blob(&self, blob: &FileBlobRecord) -> StoreResult<()> {
        {
            let mut blobs = self.blobs.write().await;
            if blobs.contains_key(&blob.file_id) {
                return Err(StoreError::DuplicateKey(blob.file_id));
            }
            blobs.insert(blob.file_id, blob.clone());
        }
        self.events
            .emit(StoreTable::Blobs, blob.file_id, StoreEventKind::Added);
        Ok(())
    }

    async fn delete_blob(&self, id: Uuid) -> StoreResult<()> {
        let removed = self.blobs.write().await.remove(&id);
        if removed.is_some() {
            self.events
                .emit(StoreTable::Blobs, id, StoreEventKind::Deleted);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
