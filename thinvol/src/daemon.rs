//! Daemon façade wiring the storage driver and the backup engine together.
//!
//! One process-wide reader/writer lock guards all state: mutating requests
//! (create/delete, backup, restore, register) hold it exclusively, listings
//! hold it shared. A second daemon on the same root is fenced off by an
//! advisory file lock acquired at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::objectstore::{self, RemoteVolumeInfo};
use crate::storage::{self, thinpool::ThinpoolInit, StorageDriver, VolumeInfo};
use crate::util;

/// A running thinvol instance.
#[derive(Clone)]
pub struct Daemon {
    root: PathBuf,
    config: Arc<Config>,
    storage: Arc<RwLock<Box<dyn StorageDriver>>>,
    object_table: Arc<objectstore::DriverTable>,
    _lock: Arc<util::FileLock>,
}

/// The driver tables shipped with the daemon.
pub fn default_tables() -> Result<(storage::DriverTable, objectstore::DriverTable)> {
    let mut storage_table = storage::DriverTable::new();
    storage_table.register(storage::thinpool::DRIVER_NAME, Box::new(ThinpoolInit))?;

    let mut object_table = objectstore::DriverTable::new();
    object_table.register(objectstore::vfs::KIND, Box::new(objectstore::vfs::VfsInit))?;
    object_table.register(objectstore::s3::KIND, Box::new(objectstore::s3::S3Init))?;

    Ok((storage_table, object_table))
}

impl Daemon {
    /// Create a daemon with the default driver tables.
    pub async fn from_config(config: Config) -> Result<Self> {
        let (storage_table, object_table) = default_tables()?;
        Self::with_tables(config, storage_table, object_table).await
    }

    /// Create a daemon with explicit driver tables.
    ///
    /// Acquires the advisory lock under the root and initializes the
    /// configured storage driver, reactivating persisted state.
    pub async fn with_tables(
        config: Config,
        storage_table: storage::DriverTable,
        object_table: objectstore::DriverTable,
    ) -> Result<Self> {
        config.validate()?;
        util::mkdir_if_not_exists(&config.root)?;
        let lock = util::FileLock::acquire(&config.lock_path())?;
        info!(lock = %lock.path().display(), "acquired daemon lock");

        let storage = storage_table
            .get_driver(&config.driver.kind, &config.root, &config.driver.opts)
            .await?;
        info!(driver = storage.name(), root = %config.root.display(), "storage driver ready");

        Ok(Self {
            root: config.root.clone(),
            config: Arc::new(config),
            storage: Arc::new(RwLock::new(storage)),
            object_table: Arc::new(object_table),
            _lock: Arc::new(lock),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn info(&self) -> Result<serde_json::Value> {
        let storage = self.storage.read().await;
        let driver = storage.info()?;
        Ok(serde_json::json!({
            "Root": self.root,
            "Socket": self.config.socket,
            "Driver": driver,
        }))
    }

    pub async fn volume_create(
        &self,
        id: Option<Uuid>,
        base: Option<Uuid>,
        size: u64,
    ) -> Result<Uuid> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let mut storage = self.storage.write().await;
        storage.create_volume(id, base, size).await?;
        Ok(id)
    }

    pub async fn volume_delete(&self, id: Uuid) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.delete_volume(id).await.map_err(Error::from)
    }

    pub async fn volume_list(&self, id: Option<Uuid>) -> Result<Vec<VolumeInfo>> {
        let storage = self.storage.read().await;
        storage.list_volumes(id).map_err(Error::from)
    }

    pub async fn snapshot_create(&self, id: Option<Uuid>, volume: Uuid) -> Result<Uuid> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let mut storage = self.storage.write().await;
        storage.create_snapshot(id, volume).await?;
        Ok(id)
    }

    pub async fn snapshot_delete(&self, id: Uuid, volume: Uuid) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.delete_snapshot(id, volume).await.map_err(Error::from)
    }

    pub async fn image_activate(&self, id: Option<Uuid>, file: &Path) -> Result<Uuid> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let mut storage = self.storage.write().await;
        storage.activate_image(id, file).await?;
        Ok(id)
    }

    pub async fn image_deactivate(&self, id: Uuid) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.deactivate_image(id).await.map_err(Error::from)
    }

    pub async fn store_register(
        &self,
        kind: &str,
        opts: &HashMap<String, String>,
    ) -> Result<(Uuid, u64)> {
        let _storage = self.storage.write().await;
        objectstore::register(&self.root, kind, opts, &self.object_table).await
    }

    pub async fn store_deregister(&self, id: Uuid) -> Result<()> {
        let _storage = self.storage.write().await;
        objectstore::deregister(&self.root, id).await
    }

    /// Add a local volume to a store, carrying its size and base over.
    pub async fn store_add_volume(&self, store: Uuid, volume: Uuid) -> Result<()> {
        let storage = self.storage.write().await;
        let info = storage.volume_info(volume)?;
        objectstore::add_volume(
            &self.root,
            &self.object_table,
            store,
            volume,
            info.base,
            info.size,
        )
        .await
    }

    pub async fn store_remove_volume(&self, store: Uuid, volume: Uuid) -> Result<()> {
        let _storage = self.storage.write().await;
        objectstore::remove_volume(&self.root, &self.object_table, store, volume).await
    }

    pub async fn store_list_volume(
        &self,
        store: Uuid,
        volume: Uuid,
        snapshot: Option<Uuid>,
    ) -> Result<Option<RemoteVolumeInfo>> {
        let _storage = self.storage.read().await;
        objectstore::list_volume(&self.root, &self.object_table, store, volume, snapshot).await
    }

    pub async fn backup_create(&self, snapshot: Uuid, volume: Uuid, store: Uuid) -> Result<()> {
        let mut storage = self.storage.write().await;
        objectstore::backup_snapshot(
            &self.root,
            &self.object_table,
            snapshot,
            volume,
            store,
            &mut **storage,
        )
        .await
    }

    pub async fn backup_restore(
        &self,
        snapshot: Uuid,
        volume: Uuid,
        target: Uuid,
        store: Uuid,
    ) -> Result<()> {
        let storage = self.storage.write().await;
        objectstore::restore_snapshot(
            &self.root,
            &self.object_table,
            snapshot,
            volume,
            target,
            store,
            &**storage,
        )
        .await
    }

    pub async fn backup_remove(&self, snapshot: Uuid, volume: Uuid, store: Uuid) -> Result<()> {
        let _storage = self.storage.write().await;
        objectstore::remove_snapshot(&self.root, &self.object_table, snapshot, volume, store).await
    }

    /// Deactivate all driver state on clean shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.shutdown().await.map_err(Error::from)
    }
}
