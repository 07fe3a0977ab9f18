use async_trait::async_trait;
use bytes::Bytes;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use tokio::sync::broadcast;
use tokio::task;
use uuid::Uuid;

use crate::{
    db::{self, SqlitePool},
    models::{
        FileBlobRecord, UploadBlobRow, UploadChangeset, UploadChunkRow, UploadPatch,
        UploadRecord, UploadRow,
    },
    schema::{upload_blobs, upload_chunks, uploads},
};

use super::{
    apply_filter, EventBus, StoreError, StoreEvent, StoreEventKind, StoreResult, StoreTable,
    UploadFilter, UploadStore,
};

/// [`UploadStore`] persisted in a SQLite file through a diesel pool.
#[derive(Clone)]
pub struct SqliteUploadStore {
    pool: SqlitePool,
    events: EventBus,
}

impl SqliteUploadStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            events: EventBus::new(),
        }
    }

    pub fn open(database_path: &str, max_pool_size: u32) -> anyhow::Result<Self> {
        let pool = db::init_pool_with_size(database_path, max_pool_size)?;
        Ok(Self::new(pool))
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl UploadStore for SqliteUploadStore {
    async fn get(&self, id: Uuid) -> StoreResult<Option<UploadRecord>> {
        let row = self
            .with_conn(move |conn| {
                Ok(uploads::table
                    .find(id.to_string())
                    .first::<UploadRow>(conn)
                    .optional()?)
            })
            .await?;
        row.map(row_to_record).transpose()
    }

    async fn get_all(&self, filter: Option<UploadFilter<'_>>) -> StoreResult<Vec<UploadRecord>> {
        let rows = self
            .with_conn(|conn| {
                Ok(uploads::table
                    .order((uploads::created_at.asc(), uploads::id.asc()))
                    .load::<UploadRow>(conn)?)
            })
            .await?;
        let records = rows
            .into_iter()
            .map(row_to_record)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(apply_filter(records, filter))
    }

    async fn add(&self, record: &UploadRecord) -> StoreResult<()> {
        let id = record.id;
        let row = record_to_row(record)?;
        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let existing: i64 = uploads::table
                    .find(&row.id)
                    .count()
                    .get_result(conn)?;
                if existing > 0 {
                    return Err(StoreError::DuplicateKey(id));
                }
                diesel::insert_into(uploads::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(())
            })
        })
        .await?;
        self.events
            .emit(StoreTable::Uploads, id, StoreEventKind::Added);
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: UploadPatch) -> StoreResult<UploadRecord> {
        let changeset = patch_to_changeset(&patch)?;
        let empty = patch.is_empty();
        let row = self
            .with_conn(move |conn| {
                let key = id.to_string();
                conn.transaction::<_, StoreError, _>(|conn| {
                    if !empty {
                        let changed = diesel::update(uploads::table.find(&key))
                            .set(&changeset)
                            .execute(conn)?;
                        if changed == 0 {
                            return Err(StoreError::NotFound(id));
                        }
                    }
                    uploads::table
                        .find(&key)
                        .first::<UploadRow>(conn)
                        .optional()?
                        .ok_or(StoreError::NotFound(id))
                })
            })
            .await?;
        let record = row_to_record(row)?;
        self.events
            .emit(StoreTable::Uploads, id, StoreEventKind::Updated);
        Ok(record)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let removed = self
            .with_conn(move |conn| {
                Ok(diesel::delete(uploads::table.find(id.to_string())).execute(conn)?)
            })
            .await?;
        if removed > 0 {
            self.events
                .emit(StoreTable::Uploads, id, StoreEventKind::Deleted);
        }
        Ok(())
    }

    async fn get_blob(&self, id: Uuid) -> StoreResult<Option<FileBlobRecord>> {
        let loaded = self
            .with_conn(move |conn| {
                let key = id.to_string();
                let header = upload_blobs::table
                    .find(&key)
                    .first::<UploadBlobRow>(conn)
                    .optional()?;
                let Some(header) = header else {
                    return Ok(None);
                };
                let chunks = upload_chunks::table
                    .filter(upload_chunks::file_id.eq(&key))
                    .order(upload_chunks::chunk_index.asc())
                    .load::<UploadChunkRow>(conn)?;
                Ok(Some((header, chunks)))
            })
            .await?;

        let Some((header, chunks)) = loaded else {
            return Ok(None);
        };
        if chunks.len() != header.chunk_count as usize {
            return Err(StoreError::Corrupt(format!(
                "blob {id} has {} of {} chunks",
                chunks.len(),
                header.chunk_count
            )));
        }
        Ok(Some(FileBlobRecord {
            file_id: id,
            chunks: chunks
                .into_iter()
                .map(|chunk| Bytes::from(chunk.data))
                .collect(),
        }))
    }

    async fn add_blob(&self, blob: &FileBlobRecord) -> StoreResult<()> {
        let id = blob.file_id;
        let key = id.to_string();
        let header = UploadBlobRow {
            file_id: key.clone(),
            chunk_count: to_i32(blob.chunks.len() as u64, "chunk_count")?,
        };
        let rows = blob
            .chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                Ok(UploadChunkRow {
                    file_id: key.clone(),
                    chunk_index: to_i32(index as u64, "chunk_index")?,
                    data: chunk.to_vec(),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        self.with_conn(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let existing: i64 = upload_blobs::table
                    .find(&header.file_id)
                    .count()
                    .get_result(conn)?;
                if existing > 0 {
                    return Err(StoreError::DuplicateKey(id));
                }
                diesel::insert_into(upload_blobs::table)
                    .values(&header)
                    .execute(conn)?;
                for row in &rows {
                    diesel::insert_into(upload_chunks::table)
                        .values(row)
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await?;
        self.events.emit(StoreTable::Blobs, id, StoreEventKind::Added);
        Ok(())
    }

    async fn delete_blob(&self, id: Uuid) -> StoreResult<()> {
        let removed = self
            .with_conn(move |conn| {
                let key = id.to_string();
                conn.transaction::<_, StoreError, _>(|conn| {
                    diesel::delete(upload_chunks::table.filter(upload_chunks::file_id.eq(&key)))
                        .execute(conn)?;
                    Ok(diesel::delete(upload_blobs::table.find(&key)).execute(conn)?)
                })
            })
            .await?;
        if removed > 0 {
            self.events
                .emit(StoreTable::Blobs, id, StoreEventKind::Deleted);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

fn to_i32(value: u64, field: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} out of range: {value}")))
}

fn record_to_row(record: &UploadRecord) -> StoreResult<UploadRow> {
    Ok(UploadRow {
        id: record.id.to_string(),
        owner_id: record.owner_id.to_string(),
        status: record.status.as_str().to_string(),
        parent_folder_id: record.parent_folder_id.map(|id| id.to_string()),
        file_name: record.file_name.clone(),
        file_type: record.file_type.clone(),
        file_size: i64::try_from(record.file_size)
            .map_err(|_| StoreError::Corrupt(format!("file_size out of range: {}", record.file_size)))?,
        chunk_index: to_i32(u64::from(record.chunk_index), "chunk_index")?,
        total_chunks: to_i32(u64::from(record.total_chunks), "total_chunks")?,
        remote_key: record.remote_key.clone(),
        remote_upload_id: record.remote_upload_id.clone(),
        etags: serde_json::to_string(&record.etags)?,
        progress: i32::from(record.progress),
        error: record.error.clone(),
        created_at: record.created_at,
        thumbnail: record.thumbnail.clone(),
    })
}

fn row_to_record(row: UploadRow) -> StoreResult<UploadRecord> {
    let parse_uuid = |value: &str, field: &str| {
        Uuid::parse_str(value)
            .map_err(|err| StoreError::Corrupt(format!("invalid {field} `{value}`: {err}")))
    };
    let to_u32 = |value: i32, field: &str| {
        u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {field}: {value}")))
    };

    Ok(UploadRecord {
        id: parse_uuid(&row.id, "id")?,
        owner_id: parse_uuid(&row.owner_id, "owner_id")?,
        status: row
            .status
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("{err}")))?,
        parent_folder_id: row
            .parent_folder_id
            .as_deref()
            .map(|value| parse_uuid(value, "parent_folder_id"))
            .transpose()?,
        file_name: row.file_name,
        file_type: row.file_type,
        file_size: u64::try_from(row.file_size)
            .map_err(|_| StoreError::Corrupt(format!("negative file_size: {}", row.file_size)))?,
        chunk_index: to_u32(row.chunk_index, "chunk_index")?,
        total_chunks: to_u32(row.total_chunks, "total_chunks")?,
        remote_key: row.remote_key,
        remote_upload_id: row.remote_upload_id,
        etags: serde_json::from_str(&row.etags)?,
        progress: row.progress.clamp(0, 100) as u8,
        error: row.error,
        created_at: row.created_at,
        thumbnail: row.thumbnail,
    })
}

fn patch_to_changeset(patch: &UploadPatch) -> StoreResult<UploadChangeset> {
    Ok(UploadChangeset {
        status: patch.status.map(|status| status.as_str().to_string()),
        chunk_index: patch
            .chunk_index
            .map(|index| to_i32(u64::from(index), "chunk_index"))
            .transpose()?,
        remote_key: patch.remote_key.clone(),
        remote_upload_id: patch.remote_upload_id.clone(),
        etags: patch
            .etags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        progress: patch.progress.map(i32::from),
        error: patch.error.clone(),
        thumbnail: patch.thumbnail.clone(),
    })
}
