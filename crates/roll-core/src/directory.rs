use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;

use crate::constants::DEFAULT_LOCK_WAIT;
use crate::error::{CoreError, Result};
use crate::identity::{Identity, IdentityKey};

/// Lookup of known identities, owned by the calling system.
///
/// The enrollment manager only attaches embeddings to identities found here.
pub trait IdentityDirectory: Send + Sync {
    fn lookup(&self, key: &IdentityKey) -> Result<Option<Identity>>;

    /// All identities, sorted by key.
    fn list(&self) -> Result<Vec<Identity>>;
}

/// In-memory [`IdentityDirectory`] for tests and embedding in other hosts.
pub struct MemoryDirectory {
    identities: RwLock<BTreeMap<IdentityKey, Identity>>,
    lock_wait: Duration,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            identities: RwLock::new(BTreeMap::new()),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Adds or renames an identity.
    pub fn insert(&self, identity: Identity) -> Result<()> {
        let mut identities = self
            .identities
            .try_write_for(self.lock_wait)
            .ok_or_else(|| CoreError::Contention("identity directory".into()))?;
        identities.insert(identity.key.clone(), identity);
        Ok(())
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityDirectory for MemoryDirectory {
    fn lookup(&self, key: &IdentityKey) -> Result<Option<Identity>> {
        let identities = self
            .identities
            .try_read_for(self.lock_wait)
            .ok_or_else(|| CoreError::Contention("identity directory".into()))?;
        Ok(identities.get(key).cloned())
    }

    fn list(&self) -> Result<Vec<Identity>> {
        let identities = self
            .identities
            .try_read_for(self.lock_wait)
            .ok_or_else(|| CoreError::Contention("identity directory".into()))?;
        Ok(identities.values().cloned().collect())
    }
}
