//! Persistence of counter state
//!
//! The counter saves a single opaque record: its configuration, the lifetime
//! counter, and the window boundaries. Buffered events are deliberately not
//! part of it and are lost across restarts.
//!
//! ```text
//! PersistedState ──encode──► {"checksum":"..","state":{..}} ──write──► BlobStore
//!                                                                     ├─ SqliteBlobStore
//!                                                                     └─ MemoryBlobStore
//! ```

mod snapshot;
mod sqlite;

pub use snapshot::{PersistedState, SNAPSHOT_VERSION};
pub use sqlite::SqliteBlobStore;

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Save/restore primitive for a single opaque record
pub trait BlobStore {
    /// Read the stored record, or `None` if nothing was ever written
    fn read(&mut self) -> Result<Option<Vec<u8>>>;

    /// Replace the stored record
    fn write(&mut self, blob: &[u8]) -> Result<()>;
}

impl<T: BlobStore + ?Sized> BlobStore for Box<T> {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).read()
    }

    fn write(&mut self, blob: &[u8]) -> Result<()> {
        (**self).write(blob)
    }
}

/// In-memory blob store
///
/// Clones share the same record, which lets a test inspect what a counter
/// persisted or hand the record to a second counter.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record, if any
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok().and_then(|blob| blob.clone())
    }

    /// Overwrite the record directly
    pub fn set_contents(&self, blob: Option<Vec<u8>>) {
        if let Ok(mut slot) = self.blob.lock() {
            *slot = blob;
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        let blob = self
            .blob
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))?;
        Ok(blob.clone())
    }

    fn write(&mut self, blob: &[u8]) -> Result<()> {
        let mut slot = self
            .blob
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))?;
        *slot = Some(blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_starts_empty() {
        let mut store = MemoryBlobStore::new();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_memory_store_clones_share_record() {
        let mut store = MemoryBlobStore::new();
        let observer = store.clone();

        store.write(b"hello").unwrap();
        assert_eq!(observer.contents().as_deref(), Some(&b"hello"[..]));

        observer.set_contents(None);
        assert!(store.read().unwrap().is_none());
    }
}
