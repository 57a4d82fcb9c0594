//! Persistent-storage provider.
//!
//! The core never touches a filesystem or flash directly. Well-known blobs
//! are addressed by small ids; the application supplies whatever storage
//! it has (file, NVS partition, EEPROM). Only the auto-device-number table
//! is written by the core itself - the other ids are defined here because
//! the wire protocol references them (certificate copy on handshake).

use std::collections::HashMap;

use crate::error::FabricError;

/// Identifier of a well-known persistent blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub u8);

impl BlobId {
    /// Wifi / network configuration of the node.
    pub const NETWORK_CONFIG: Self = Self(1);
    /// Account / user configuration.
    pub const ACCOUNT_CONFIG: Self = Self(2);
    /// Client certificate chain.
    pub const CLIENT_CERT_CHAIN: Self = Self(3);
    /// Trust certificate copied during the pre-protocol handshake.
    pub const TRUST_CERT: Self = Self(4);
    /// Automatic device-number reservation table.
    pub const AUTO_DEVICE_TABLE: Self = Self(5);
}

/// Storage provider for well-known blobs.
pub trait Persistent: Send {
    /// Load a blob. `Ok(None)` when it has never been saved.
    ///
    /// # Errors
    ///
    /// - [`FabricError::Failed`] on storage faults
    fn load(&mut self, id: BlobId) -> Result<Option<Vec<u8>>, FabricError>;

    /// Save a blob. `commit` requests immediate durability where the
    /// backing store distinguishes that.
    ///
    /// # Errors
    ///
    /// - [`FabricError::Failed`] on storage faults
    /// - [`FabricError::OutOfBuffer`] when the store cannot hold the blob
    fn save(&mut self, id: BlobId, data: &[u8], commit: bool) -> Result<(), FabricError>;
}

/// In-memory provider for tests and diskless deployments.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blobs: HashMap<BlobId, Vec<u8>>,
}

impl MemoryPersistence {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistent for MemoryPersistence {
    fn load(&mut self, id: BlobId) -> Result<Option<Vec<u8>>, FabricError> {
        Ok(self.blobs.get(&id).cloned())
    }

    fn save(&mut self, id: BlobId, data: &[u8], _commit: bool) -> Result<(), FabricError> {
        self.blobs.insert(id, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let mut store = MemoryPersistence::new();
        assert_eq!(store.load(BlobId::AUTO_DEVICE_TABLE).unwrap(), None);
        store.save(BlobId::AUTO_DEVICE_TABLE, b"table", true).unwrap();
        assert_eq!(
            store.load(BlobId::AUTO_DEVICE_TABLE).unwrap().as_deref(),
            Some(&b"table"[..])
        );
    }
}
