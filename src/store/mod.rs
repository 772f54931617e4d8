//! Content-addressed blob storage for job inputs, results and evidence.

mod http;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::ContentRef;
pub use http::HttpStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content not found: {0}")]
    NotFound(ContentRef),

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    RefMismatch {
        expected: ContentRef,
        actual: ContentRef,
    },

    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a retry might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Http(_) | StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `bytes`; the returned reference is their SHA-256.
    async fn put(&self, bytes: &[u8]) -> StoreResult<ContentRef>;

    async fn get(&self, content: &ContentRef) -> StoreResult<Vec<u8>>;
}
