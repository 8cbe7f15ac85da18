//! Persisted wallet payloads
//!
//! One record per identity under `wallet:<guid>`, bincode encoded. The payload
//! version gates the HD upgrade: version 2 wallets have no seed, version 3 do.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::account::registry::RegistryTable;
use crate::account::types::Identity;
use crate::error::WalletError;
use crate::external::{MetadataError, MetadataStore};
use crate::secret::SealedSecrets;

pub const PAYLOAD_VERSION_LEGACY: u32 = 2;
pub const PAYLOAD_VERSION_HD: u32 = 3;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WalletPayload {
    pub version: u32,
    pub identity: Identity,
    pub secrets: SealedSecrets,
    pub accounts: RegistryTable,
}

impl WalletPayload {
    pub fn is_hd(&self) -> bool {
        self.version >= PAYLOAD_VERSION_HD
    }
}

pub trait PayloadStore: Send + Sync {
    fn load(&self, guid: &str) -> Result<Option<WalletPayload>, WalletError>;

    fn save(&self, payload: &WalletPayload) -> Result<(), WalletError>;

    fn guids(&self) -> Result<Vec<String>, WalletError>;
}

fn storage_err<E: std::fmt::Display>(e: E) -> WalletError {
    WalletError::Storage(e.to_string())
}

/// sled-backed store for payloads and metadata blobs
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let db = sled::open(path).map_err(storage_err)?;
        Ok(Self { db })
    }

    /// Throwaway database, removed on drop
    pub fn temporary() -> Result<Self, WalletError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Ok(Self { db })
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), WalletError> {
        let serialized = bincode::serialize(value).map_err(storage_err)?;
        self.db.insert(key.as_bytes(), serialized).map_err(storage_err)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, WalletError> {
        match self.db.get(key.as_bytes()).map_err(storage_err)? {
            Some(data) => Ok(Some(bincode::deserialize(&data).map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<(), WalletError> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}

impl PayloadStore for Storage {
    fn load(&self, guid: &str) -> Result<Option<WalletPayload>, WalletError> {
        self.get(&format!("wallet:{}", guid))
    }

    fn save(&self, payload: &WalletPayload) -> Result<(), WalletError> {
        self.put(&format!("wallet:{}", payload.identity.guid), payload)?;
        self.flush()?;
        debug!(guid = %payload.identity.guid, version = payload.version, "Wallet payload saved");
        Ok(())
    }

    fn guids(&self) -> Result<Vec<String>, WalletError> {
        self.db
            .scan_prefix(b"wallet:")
            .keys()
            .map(|key| -> Result<String, WalletError> {
                let key = key.map_err(storage_err)?;
                Ok(String::from_utf8_lossy(&key["wallet:".len()..]).into_owned())
            })
            .collect()
    }
}

#[async_trait]
impl MetadataStore for Storage {
    async fn fetch(&self, identifier: &str) -> Result<Vec<u8>, MetadataError> {
        match self.db.get(format!("metadata:{}", identifier).as_bytes()) {
            Ok(Some(blob)) => Ok(blob.to_vec()),
            Ok(None) => Err(MetadataError::NotFound),
            Err(e) => Err(MetadataError::Transport(e.to_string())),
        }
    }

    async fn save(&self, identifier: &str, blob: &[u8]) -> Result<(), MetadataError> {
        self.db
            .insert(format!("metadata:{}", identifier).as_bytes(), blob)
            .map_err(|e| MetadataError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPayloadStore {
    payloads: Mutex<HashMap<String, WalletPayload>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn load(&self, guid: &str) -> Result<Option<WalletPayload>, WalletError> {
        Ok(self
            .payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(guid)
            .cloned())
    }

    fn save(&self, payload: &WalletPayload) -> Result<(), WalletError> {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(payload.identity.guid.clone(), payload.clone());
        Ok(())
    }

    fn guids(&self) -> Result<Vec<String>, WalletError> {
        Ok(self
            .payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::crypto::tests::fast_params;
    use crate::secret::SecretStore;

    fn payload() -> WalletPayload {
        let secrets = SecretStore::new(fast_params(), 0.0)
            .initialize("Tr0ub4dor&3", None)
            .unwrap();
        WalletPayload {
            version: PAYLOAD_VERSION_LEGACY,
            identity: Identity::generate(None),
            secrets,
            accounts: RegistryTable::default(),
        }
    }

    #[test]
    fn test_sled_payload_roundtrip() {
        let storage = Storage::temporary().unwrap();
        let payload = payload();

        assert_eq!(storage.load(&payload.identity.guid).unwrap(), None);
        PayloadStore::save(&storage, &payload).unwrap();

        assert_eq!(storage.load(&payload.identity.guid).unwrap(), Some(payload.clone()));
        assert_eq!(storage.guids().unwrap(), vec![payload.identity.guid.clone()]);
        assert!(!payload.is_hd());
    }

    #[tokio::test]
    async fn test_sled_metadata_store() {
        let storage = Storage::temporary().unwrap();
        assert_eq!(storage.fetch("abc").await, Err(MetadataError::NotFound));

        MetadataStore::save(&storage, "abc", b"blob").await.unwrap();
        assert_eq!(storage.fetch("abc").await.unwrap(), b"blob".to_vec());
        // Metadata keys stay out of the wallet listing
        assert!(storage.guids().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryPayloadStore::new();
        let mut payload = payload();
        store.save(&payload).unwrap();

        payload.version = PAYLOAD_VERSION_HD;
        store.save(&payload).unwrap();
        let loaded = store.load(&payload.identity.guid).unwrap().unwrap();
        assert!(loaded.is_hd());
        assert_eq!(store.guids().unwrap().len(), 1);
    }
}
