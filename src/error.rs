use thiserror::Error;
use uuid::Uuid;

use crate::{models::UploadStatus, store::StoreError};

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no active session")]
    Session,
    #[error("failed to initialize upload: {0}")]
    Init(String),
    #[error("failed to presign part {part_number}: {reason}")]
    Presign { part_number: u32, reason: String },
    #[error("failed to upload part {part_number}: {reason}")]
    ChunkUpload { part_number: u32, reason: String },
    #[error("no ETag returned for part {part_number}")]
    ETagMissing { part_number: u32 },
    #[error("failed to complete upload: {0}")]
    Complete(String),
    #[error("upload expired after {days} days")]
    Expired { days: i64 },
    #[error("upload aborted")]
    Aborted,
    #[error("upload {0} not found")]
    NotFound(Uuid),
    #[error("stored chunks for upload {0} are missing or incomplete")]
    MissingChunks(Uuid),
    #[error("cannot move upload from {from} to {to}")]
    InvalidTransition { from: UploadStatus, to: UploadStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Cancellation is not a failure; it leaves the upload resumable.
    pub fn is_abort(&self) -> bool {
        matches!(self, UploadError::Aborted)
    }
}
