use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;

use crate::constants::{DEFAULT_DIMENSION, DEFAULT_LOCK_WAIT};
use crate::embedding::{Enrollment, validate_embedding};
use crate::error::{CoreError, Result};
use crate::identity::IdentityKey;
use crate::time::now_iso8601;

/// Holds at most one enrolled embedding per identity.
///
/// Implementations must be safe for concurrent use. A concurrent
/// [`scan_all`](EmbeddingStore::scan_all) observes either the old or the new
/// enrollment of an identity in full, never a mix of the two.
pub trait EmbeddingStore: Send + Sync {
    /// Expected embedding length.
    fn dimension(&self) -> usize;

    /// Replaces any existing enrollment for `identity`.
    fn enroll(&self, identity: &IdentityKey, embedding: Vec<f32>, image: Vec<u8>) -> Result<()>;

    /// Deletes the enrollment. Returns whether one existed; absence is not an error.
    fn remove(&self, identity: &IdentityKey) -> Result<bool>;

    /// Clears every enrollment. Returns how many were removed.
    fn remove_all(&self) -> Result<usize>;

    /// Snapshot of all enrollments, sorted by identity key ascending.
    fn scan_all(&self) -> Result<Vec<Enrollment>>;

    fn get(&self, identity: &IdentityKey) -> Result<Option<Enrollment>>;

    fn len(&self) -> Result<usize> {
        Ok(self.scan_all()?.len())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory [`EmbeddingStore`].
///
/// Enrollments are built and validated outside the lock; the write lock only
/// covers publishing the finished value into the map.
pub struct MemoryEmbeddingStore {
    entries: RwLock<BTreeMap<IdentityKey, Enrollment>>,
    dimension: usize,
    lock_wait: Duration,
}

impl MemoryEmbeddingStore {
    pub fn new(dimension: usize) -> Self {
        Self::with_lock_wait(dimension, DEFAULT_LOCK_WAIT)
    }

    /// Panics if `dimension` is 0.
    pub fn with_lock_wait(dimension: usize, lock_wait: Duration) -> Self {
        assert!(dimension > 0, "roll-core: embedding dimension must be positive");
        Self {
            entries: RwLock::new(BTreeMap::new()),
            dimension,
            lock_wait,
        }
    }

    fn contention() -> CoreError {
        CoreError::Contention("embedding store".into())
    }
}

impl Default for MemoryEmbeddingStore {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl EmbeddingStore for MemoryEmbeddingStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn enroll(&self, identity: &IdentityKey, embedding: Vec<f32>, image: Vec<u8>) -> Result<()> {
        validate_embedding(&embedding, self.dimension)?;
        let enrollment = Enrollment::new(identity.clone(), embedding, image, now_iso8601());

        let mut entries = self
            .entries
            .try_write_for(self.lock_wait)
            .ok_or_else(Self::contention)?;
        entries.insert(identity.clone(), enrollment);
        Ok(())
    }

    fn remove(&self, identity: &IdentityKey) -> Result<bool> {
        let mut entries = self
            .entries
            .try_write_for(self.lock_wait)
            .ok_or_else(Self::contention)?;
        Ok(entries.remove(identity).is_some())
    }

    fn remove_all(&self) -> Result<usize> {
        let mut entries = self
            .entries
            .try_write_for(self.lock_wait)
            .ok_or_else(Self::contention)?;
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    fn scan_all(&self) -> Result<Vec<Enrollment>> {
        let entries = self
            .entries
            .try_read_for(self.lock_wait)
            .ok_or_else(Self::contention)?;
        Ok(entries.values().cloned().collect())
    }

    fn get(&self, identity: &IdentityKey) -> Result<Option<Enrollment>> {
        let entries = self
            .entries
            .try_read_for(self.lock_wait)
            .ok_or_else(Self::contention)?;
        Ok(entries.get(identity).cloned())
    }

    fn len(&self) -> Result<usize> {
        let entries = self
            .entries
            .try_read_for(self.lock_wait)
            .ok_or_else(Self::contention)?;
        Ok(entries.len())
    }
}
