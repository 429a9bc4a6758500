// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device identity persistence.
//!
//! The identity is created once (random device id, then uuid/token from the
//! gateway) and survives reboots so the engine can skip registration.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::protocol::{Token, Uuid, TOKEN_LEN, UUID_LEN};

/// Credentials of this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: u64,
    pub uuid: Uuid,
    pub token: Token,
}

impl DeviceIdentity {
    /// Size of the persisted record.
    pub const RECORD_LEN: usize = 8 + UUID_LEN + TOKEN_LEN;

    pub fn new(device_id: u64, uuid: Uuid, token: Token) -> Self {
        Self {
            device_id,
            uuid,
            token,
        }
    }

    /// Fixed-size record: device id (LE), uuid, token, NUL padded.
    pub fn to_record(&self) -> [u8; Self::RECORD_LEN] {
        let mut out = [0u8; Self::RECORD_LEN];
        out[..8].copy_from_slice(&self.device_id.to_le_bytes());
        let uuid = self.uuid.as_bytes();
        out[8..8 + uuid.len()].copy_from_slice(uuid);
        let token = self.token.as_bytes();
        out[8 + UUID_LEN..8 + UUID_LEN + token.len()].copy_from_slice(token);
        out
    }

    pub fn from_record(record: &[u8]) -> Result<Self, StorageError> {
        if record.len() != Self::RECORD_LEN {
            return Err(StorageError::Corrupt(record.len()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&record[..8]);
        Ok(Self {
            device_id: u64::from_le_bytes(id),
            uuid: field(&record[8..8 + UUID_LEN], record.len())?,
            token: field(&record[8 + UUID_LEN..], record.len())?,
        })
    }
}

fn field<const N: usize>(bytes: &[u8], record_len: usize) -> Result<heapless::String<N>, StorageError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let s = core::str::from_utf8(&bytes[..end]).map_err(|_| StorageError::Corrupt(record_len))?;
    let mut out = heapless::String::new();
    out.push_str(s)
        .map_err(|_| StorageError::Corrupt(record_len))?;
    Ok(out)
}

/// Where the engine keeps its identity.
pub trait IdentityStore: Send {
    /// `Ok(None)` when the device was never registered.
    fn load_identity(&mut self) -> Result<Option<DeviceIdentity>, StorageError>;

    fn save_identity(&mut self, identity: &DeviceIdentity) -> Result<(), StorageError>;

    /// Forget the identity (factory reset or gateway unregister).
    fn reset(&mut self) -> Result<(), StorageError>;
}

/// Volatile store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    identity: Option<DeviceIdentity>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with an identity, as after a reboot.
    pub fn with_identity(identity: DeviceIdentity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }
}

impl IdentityStore for MemoryStore {
    fn load_identity(&mut self) -> Result<Option<DeviceIdentity>, StorageError> {
        Ok(self.identity.clone())
    }

    fn save_identity(&mut self, identity: &DeviceIdentity) -> Result<(), StorageError> {
        self.identity = Some(identity.clone());
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StorageError> {
        self.identity = None;
        Ok(())
    }
}

/// Identity in a single file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

impl IdentityStore for FileStore {
    fn load_identity(&mut self) -> Result<Option<DeviceIdentity>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => DeviceIdentity::from_record(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_identity(&mut self, identity: &DeviceIdentity) -> Result<(), StorageError> {
        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&identity.to_record())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        log::debug!("[STORAGE] identity saved to {}", self.path.display());
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(
            0x1122_3344_5566_7788,
            Uuid::try_from("7599eaee-e006-455e-87c1-f9650be8c7cf").unwrap(),
            Token::try_from("d2422c409fb5bfcf011292449d6638b480f643d8").unwrap(),
        )
    }

    #[test]
    fn test_record_layout() {
        let record = identity().to_record();
        assert_eq!(record.len(), 84);
        assert_eq!(&record[..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&record[8..12], b"7599");
        assert_eq!(DeviceIdentity::from_record(&record).unwrap(), identity());
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        assert_eq!(store.load_identity().unwrap(), None);
        store.save_identity(&identity()).unwrap();
        assert_eq!(store.load_identity().unwrap(), Some(identity()));
        store.reset().unwrap();
        assert_eq!(store.identity(), None);
    }

    #[test]
    fn test_file_store_roundtrip_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("identity.bin"));

        assert_eq!(store.load_identity().unwrap(), None);
        store.save_identity(&identity()).unwrap();

        // A fresh handle sees the saved identity, as after a reboot.
        let mut reopened = FileStore::new(store.path());
        assert_eq!(reopened.load_identity().unwrap(), Some(identity()));

        reopened.reset().unwrap();
        assert_eq!(store.load_identity().unwrap(), None);
        // Resetting twice is fine.
        store.reset().unwrap();
    }

    #[test]
    fn test_file_store_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.bin");
        fs::write(&path, [0u8; 10]).unwrap();
        let mut store = FileStore::new(&path);
        assert!(matches!(
            store.load_identity(),
            Err(StorageError::Corrupt(10))
        ));
    }
}
