//! In-memory backend.

use crate::backend::{check_range, StorageBackend};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A log held in memory.
///
/// Cloning yields a handle onto the same buffer, so a test can drop a replica
/// and reopen another one over the bytes it left behind.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log pre-filled with `bytes`, e.g. a damaged log for recovery tests.
    #[must_use]
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Returns a copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Overwrites one byte in place. Only used to simulate corruption.
    pub fn corrupt_byte(&self, offset: usize, value: u8) {
        if let Some(byte) = self.bytes.write().get_mut(offset) {
            *byte = value;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        check_range(offset, len, bytes.len() as u64)?;
        let start = offset as usize;
        Ok(bytes[start..start + len].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.write();
        let offset = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        let size = bytes.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        bytes.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn appends_are_contiguous() {
        let mut log = InMemoryBackend::new();
        assert!(log.is_empty().unwrap());
        assert_eq!(log.append(b"clock").unwrap(), 0);
        assert_eq!(log.append(b"msg").unwrap(), 5);
        assert_eq!(log.size().unwrap(), 8);
        assert_eq!(log.read_at(5, 3).unwrap(), b"msg");
    }

    #[test]
    fn clones_share_bytes() {
        let mut writer = InMemoryBackend::new();
        let reader = writer.clone();
        writer.append(b"shared").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"shared");
    }

    #[test]
    fn read_past_end_is_rejected() {
        let mut log = InMemoryBackend::new();
        log.append(b"abc").unwrap();
        let err = log.read_at(2, 4).unwrap_err();
        assert!(err.is_bounds());
    }

    #[test]
    fn truncate_drops_tail() {
        let mut log = InMemoryBackend::with_bytes(b"complete|torn".to_vec());
        log.truncate(8).unwrap();
        assert_eq!(log.snapshot(), b"complete");
        assert!(matches!(
            log.truncate(9),
            Err(StorageError::InvalidTruncate { requested: 9, size: 8 })
        ));
    }

    #[test]
    fn corrupt_byte_ignores_out_of_range() {
        let log = InMemoryBackend::with_bytes(vec![1, 2, 3]);
        log.corrupt_byte(1, 0xFF);
        log.corrupt_byte(10, 0xFF);
        assert_eq!(log.snapshot(), vec![1, 0xFF, 3]);
    }

    proptest! {
        #[test]
        fn read_all_is_concatenation(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 0..16)) {
            let mut log = InMemoryBackend::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                let offset = log.append(chunk).unwrap();
                prop_assert_eq!(offset, expected.len() as u64);
                expected.extend_from_slice(chunk);
            }
            prop_assert_eq!(log.read_all().unwrap(), expected);
        }
    }
}
