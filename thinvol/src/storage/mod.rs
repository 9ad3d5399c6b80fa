//! Local storage driver abstraction.
//!
//! A storage driver owns the mapping from volume and snapshot UUIDs onto
//! local block devices, and produces block-granular deltas between two
//! snapshots of the same volume for the backup engine.

pub mod dm;
pub mod thinpool;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thin_delta::Mappings;
use uuid::Uuid;

use crate::error::{ConfigError, StorageError};

/// One snapshot of a volume as the driver sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: Uuid,
    pub dev_id: u32,
    pub activated: bool,
}

/// One volume as the driver sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: Uuid,
    pub dev_id: u32,
    pub size: u64,
    pub base: Option<Uuid>,
    pub snapshots: Vec<SnapshotInfo>,
}

/// Thin-provisioned volume and snapshot lifecycle.
///
/// Snapshot reads are bracketed: `open_snapshot` activates the snapshot
/// device, `read_snapshot` may then be called, and `close_snapshot` tears
/// the device down again. At most one reader holds a snapshot open.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a volume of `size` bytes, optionally seeded by an activated
    /// base image whose size must equal `size`.
    async fn create_volume(
        &mut self,
        id: Uuid,
        base: Option<Uuid>,
        size: u64,
    ) -> Result<(), StorageError>;

    /// Delete a volume. Fails while any snapshot of it remains.
    async fn delete_volume(&mut self, id: Uuid) -> Result<(), StorageError>;

    fn list_volumes(&self, id: Option<Uuid>) -> Result<Vec<VolumeInfo>, StorageError>;

    /// Info about a single volume.
    fn volume_info(&self, id: Uuid) -> Result<VolumeInfo, StorageError>;

    /// Path of the kernel block device a volume may be written through.
    fn get_volume_device(&self, id: Uuid) -> Result<PathBuf, StorageError>;

    async fn create_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError>;

    async fn delete_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError>;

    fn has_snapshot(&self, id: Uuid, volume_id: Uuid) -> bool;

    /// Block-granular delta between two snapshots of the same volume.
    ///
    /// `other` of `None` (or equal to `id`) yields the full list of live
    /// blocks of `id`.
    async fn compare_snapshot(
        &self,
        id: Uuid,
        other: Option<Uuid>,
        volume_id: Uuid,
    ) -> Result<Mappings, StorageError>;

    async fn open_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError>;

    async fn read_snapshot(
        &self,
        id: Uuid,
        volume_id: Uuid,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StorageError>;

    async fn close_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError>;

    /// Loopback-attach an image file and persist its record.
    async fn activate_image(&mut self, id: Uuid, file: &Path) -> Result<(), StorageError>;

    /// Detach an image. Fails while any volume still refers to it.
    async fn deactivate_image(&mut self, id: Uuid) -> Result<(), StorageError>;

    fn info(&self) -> Result<serde_json::Value, StorageError>;

    /// Deactivate all devices on daemon shutdown.
    async fn shutdown(&mut self) -> Result<(), StorageError>;
}

/// Constructor for one driver kind.
///
/// The driver restores itself from `<kind>.cfg` under `root` when present,
/// otherwise it initializes fresh state from `opts`.
#[async_trait]
pub trait StorageInit: Send + Sync {
    async fn init(
        &self,
        root: &Path,
        cfg_name: &str,
        opts: &HashMap<String, String>,
    ) -> Result<Box<dyn StorageDriver>, StorageError>;
}

/// Registry of storage driver initializers, keyed by kind.
#[derive(Default)]
pub struct DriverTable {
    inits: HashMap<String, Box<dyn StorageInit>>,
}

impl DriverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initializer. Registering the same kind twice is a hard
    /// error.
    pub fn register(&mut self, kind: &str, init: Box<dyn StorageInit>) -> Result<(), ConfigError> {
        if self.inits.contains_key(kind) {
            return Err(ConfigError::DuplicateKind(kind.to_string()));
        }
        self.inits.insert(kind.to_string(), init);
        Ok(())
    }

    pub async fn get_driver(
        &self,
        kind: &str,
        root: &Path,
        opts: &HashMap<String, String>,
    ) -> Result<Box<dyn StorageDriver>, StorageError> {
        let init = self
            .inits
            .get(kind)
            .ok_or_else(|| ConfigError::UnsupportedKind(kind.to_string()))
            .map_err(StorageError::Config)?;
        init.init(root, &format!("{kind}.cfg"), opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::thinpool::ThinpoolInit;

    #[test]
    fn duplicate_kind_is_rejected() {
        let mut table = DriverTable::new();
        table.register("thinpool", Box::new(ThinpoolInit)).unwrap();
        assert!(matches!(
            table.register("thinpool", Box::new(ThinpoolInit)),
            Err(ConfigError::DuplicateKind(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let table = DriverTable::new();
        let err = match table.get_driver("nope", Path::new("/tmp"), &HashMap::new()).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            StorageError::Config(ConfigError::UnsupportedKind(_))
        ));
    }
}
