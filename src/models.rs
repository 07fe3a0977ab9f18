use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::schema::{upload_blobs, upload_chunks, uploads};

/// Size of every chunk but the last one.
pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Finishing,
    Done,
    Error,
    Pause,
}

#[derive(Debug, Error)]
#[error("unknown upload status `{0}`")]
pub struct UnknownStatus(pub String);

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Finishing => "finishing",
            UploadStatus::Done => "done",
            UploadStatus::Error => "error",
            UploadStatus::Pause => "pause",
        }
    }

    /// Statuses that cannot be trusted after the process went away and are
    /// forced back to `pending` on startup.
    pub fn needs_recovery(self) -> bool {
        matches!(
            self,
            UploadStatus::Finishing
                | UploadStatus::Pending
                | UploadStatus::Uploading
                | UploadStatus::Error
        )
    }

    /// Whether a record may move from `self` to `next`. Rewriting the
    /// current status is always allowed except out of `done`, which is final.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (Done, _) => false,
            (Pending, Uploading | Error | Pause) => true,
            (Uploading, Finishing | Pause | Error | Pending) => true,
            (Finishing, Done | Pause | Error | Pending) => true,
            (Pause, Uploading | Error | Pending) => true,
            (Error, Uploading | Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(UploadStatus::Pending),
            "uploading" => Ok(UploadStatus::Uploading),
            "finishing" => Ok(UploadStatus::Finishing),
            "done" => Ok(UploadStatus::Done),
            "error" => Ok(UploadStatus::Error),
            "pause" => Ok(UploadStatus::Pause),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A confirmed part of a remote multipart session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ETagPart {
    pub part_number: u32,
    pub etag: String,
}

/// Metadata of one upload. Raw bytes live in the matching [`FileBlobRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: UploadStatus,
    pub parent_folder_id: Option<Uuid>,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub remote_key: Option<String>,
    pub remote_upload_id: Option<String>,
    pub etags: Vec<ETagPart>,
    pub progress: u8,
    pub error: Option<String>,
    /// Epoch seconds.
    pub created_at: i64,
    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
}

impl UploadRecord {
    pub fn new(
        owner_id: Uuid,
        parent_folder_id: Option<Uuid>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            status: UploadStatus::Pending,
            parent_folder_id,
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_size,
            chunk_index: 0,
            total_chunks: total_chunks_for(file_size),
            remote_key: None,
            remote_upload_id: None,
            etags: Vec::new(),
            progress: 0,
            error: None,
            created_at: Utc::now().timestamp(),
            thumbnail: None,
        }
    }

    pub fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.timestamp() - self.created_at > max_age.num_seconds()
    }

    pub fn is_image(&self) -> bool {
        self.file_type.starts_with("image/")
    }

    pub fn apply(&mut self, patch: &UploadPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(chunk_index) = patch.chunk_index {
            self.chunk_index = chunk_index;
        }
        if let Some(remote_key) = &patch.remote_key {
            self.remote_key = remote_key.clone();
        }
        if let Some(remote_upload_id) = &patch.remote_upload_id {
            self.remote_upload_id = remote_upload_id.clone();
        }
        if let Some(etags) = &patch.etags {
            self.etags = etags.clone();
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(error) = &patch.error {
            self.error = error.clone();
        }
        if let Some(thumbnail) = &patch.thumbnail {
            self.thumbnail = thumbnail.clone();
        }
    }
}

/// Partial update of an [`UploadRecord`]. `None` leaves a field untouched;
/// for nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadPatch {
    pub status: Option<UploadStatus>,
    pub chunk_index: Option<u32>,
    pub remote_key: Option<Option<String>>,
    pub remote_upload_id: Option<Option<String>>,
    pub etags: Option<Vec<ETagPart>>,
    pub progress: Option<u8>,
    pub error: Option<Option<String>>,
    pub thumbnail: Option<Option<Vec<u8>>>,
}

impl UploadPatch {
    pub fn status(status: UploadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Sets `status` and clears any stale error message.
    pub fn clean_status(status: UploadStatus) -> Self {
        Self {
            status: Some(status),
            error: Some(None),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(UploadStatus::Error),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Write-once chunk payload of an upload, addressed by the upload id.
#[derive(Debug, Clone, PartialEq)]
pub struct FileBlobRecord {
    pub file_id: Uuid,
    pub chunks: Vec<Bytes>,
}

impl FileBlobRecord {
    pub fn from_bytes(file_id: Uuid, bytes: Bytes) -> Self {
        Self {
            file_id,
            chunks: split_into_chunks(&bytes),
        }
    }
}

pub fn total_chunks_for(file_size: u64) -> u32 {
    file_size.div_ceil(CHUNK_SIZE) as u32
}

pub fn progress_for(chunk_index: u32, total_chunks: u32) -> u8 {
    if total_chunks == 0 {
        return 0;
    }
    let ratio = f64::from(chunk_index.min(total_chunks)) / f64::from(total_chunks);
    (ratio * 100.0).round() as u8
}

pub fn split_into_chunks(bytes: &Bytes) -> Vec<Bytes> {
    let size = bytes.len() as u64;
    (0..u64::from(total_chunks_for(size)))
        .map(|index| {
            let start = index * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(size);
            bytes.slice(start as usize..end as usize)
        })
        .collect()
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = uploads)]
pub struct UploadRow {
    pub id: String,
    pub owner_id: String,
    pub status: String,
    pub parent_folder_id: Option<String>,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub remote_key: Option<String>,
    pub remote_upload_id: Option<String>,
    pub etags: String,
    pub progress: i32,
    pub error: Option<String>,
    pub created_at: i64,
    pub thumbnail: Option<Vec<u8>>,
}

#[derive(Debug, Default, AsChangeset)]
#[diesel(table_name = uploads)]
pub struct UploadChangeset {
    pub status: Option<String>,
    pub chunk_index: Option<i32>,
    pub remote_key: Option<Option<String>>,
    pub remote_upload_id: Option<Option<String>>,
    pub etags: Option<String>,
    pub progress: Option<i32>,
    pub error: Option<Option<String>>,
    pub thumbnail: Option<Option<Vec<u8>>>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = upload_blobs)]
pub struct UploadBlobRow {
    pub file_id: String,
    pub chunk_count: i32,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = upload_chunks)]
pub struct UploadChunkRow {
    pub file_id: String,
    pub chunk_index: i32,
    pub data: Vec<u8>,
}
