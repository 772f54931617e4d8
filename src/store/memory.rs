use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ContentStore, StoreError, StoreResult};
use crate::ids::ContentRef;

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<ContentRef, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn put(&self, bytes: &[u8]) -> StoreResult<ContentRef> {
        self.check()?;
        let content = ContentRef::of(bytes);
        self.blobs
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?
            .insert(content.clone(), bytes.to_vec());
        Ok(content)
    }

    async fn get(&self, content: &ContentRef) -> StoreResult<Vec<u8>> {
        self.check()?;
        self.blobs
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))?
            .get(content)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(content.clone()))
    }
}
