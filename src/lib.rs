pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod manager;
pub mod models;
pub mod queue;
pub mod schema;
pub mod session;
pub mod store;
pub mod thumbnails;

pub use api::{HttpUploadApi, UploadApi};
pub use error::{UploadError, UploadResult};
pub use manager::{ManagerOptions, NewUpload, UploadManager, UploadSummary};
pub use models::{UploadRecord, UploadStatus, CHUNK_SIZE};
pub use queue::TaskQueue;
pub use store::{MemoryUploadStore, SqliteUploadStore, UploadStore};
