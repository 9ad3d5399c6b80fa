//! Device-mapper thin-pool storage driver.
//!
//! Volumes and snapshots are thin devices in one pool built over a data and
//! a metadata block device. Device IDs come from a persisted monotonic
//! counter and are never reused. Per-volume records and the pool-wide
//! driver record are atomically-renamed JSON files under the driver root.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thin_delta::Mappings;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConfigError, StorageError};
use crate::util;

use super::dm::{self, SECTOR_SIZE};
use super::{SnapshotInfo, StorageDriver, StorageInit, VolumeInfo};

pub const DRIVER_NAME: &str = "thinpool";

pub const OPT_DATA_DEV: &str = "dm.datadev";
pub const OPT_METADATA_DEV: &str = "dm.metadatadev";
pub const OPT_THINPOOL_NAME: &str = "dm.thinpoolname";
pub const OPT_THINPOOL_BLOCK_SIZE: &str = "dm.thinpoolblocksize";

pub const DEFAULT_THINPOOL_NAME: &str = "thinvol-pool";

// Bounds from the device-mapper thin-provisioning target, in sectors.
const BLOCK_SIZE_MIN: u64 = 128;
const BLOCK_SIZE_MAX: u64 = 2_097_152;
const BLOCK_SIZE_MULTIPLIER: u64 = 128;
const DEFAULT_BLOCK_SIZE_SECTORS: u64 = 4096;

const VOLUME_CFG_PREFIX: &str = "volume_";
const CFG_SUFFIX: &str = ".json";

fn volume_cfg_name(id: Uuid) -> String {
    format!("{VOLUME_CFG_PREFIX}{id}{CFG_SUFFIX}")
}

fn image_cfg_name(id: Uuid) -> String {
    format!("image_{id}_{DRIVER_NAME}{CFG_SUFFIX}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    #[serde(rename = "DevID")]
    dev_id: u32,
    #[serde(rename = "Activated")]
    activated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Volume {
    #[serde(rename = "UUID")]
    id: Uuid,
    #[serde(rename = "DevID")]
    dev_id: u32,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "Base", with = "util::uuid_or_empty")]
    base: Option<Uuid>,
    #[serde(rename = "Snapshots")]
    snapshots: HashMap<Uuid, Snapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Image {
    #[serde(rename = "UUID")]
    id: Uuid,
    #[serde(rename = "FilePath")]
    file_path: PathBuf,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "Device")]
    device: PathBuf,
    #[serde(rename = "VolumeRef")]
    volume_ref: HashSet<Uuid>,
}

/// Pool-wide driver record, persisted as `thinpool.cfg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Device {
    #[serde(rename = "DataDevice")]
    data_device: PathBuf,
    #[serde(rename = "MetadataDevice")]
    metadata_device: PathBuf,
    #[serde(rename = "ThinpoolDevice")]
    thinpool_device: PathBuf,
    #[serde(rename = "ThinpoolSize")]
    thinpool_size: u64,
    #[serde(rename = "ThinpoolBlockSize")]
    thinpool_block_size: u64,
    #[serde(rename = "LastDevID")]
    last_dev_id: u32,
}

pub struct ThinpoolDriver {
    root: PathBuf,
    config_name: String,
    device: Device,
}

pub struct ThinpoolInit;

fn verify_config(opts: &HashMap<String, String>) -> Result<Device, ConfigError> {
    let required = |key: &'static str| {
        opts.get(key)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingOption(key))
    };
    let data_device = required(OPT_DATA_DEV)?;
    let metadata_device = required(OPT_METADATA_DEV)?;

    let pool_name = opts
        .get(OPT_THINPOOL_NAME)
        .filter(|v| !v.is_empty())
        .map(String::as_str)
        .unwrap_or(DEFAULT_THINPOOL_NAME);

    let block_size = match opts.get(OPT_THINPOOL_BLOCK_SIZE) {
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            field: OPT_THINPOOL_BLOCK_SIZE,
            reason: format!("illegal block size {raw:?}"),
        })?,
        None => DEFAULT_BLOCK_SIZE_SECTORS,
    };
    if !(BLOCK_SIZE_MIN..=BLOCK_SIZE_MAX).contains(&block_size)
        || block_size % BLOCK_SIZE_MULTIPLIER != 0
    {
        return Err(ConfigError::InvalidValue {
            field: OPT_THINPOOL_BLOCK_SIZE,
            reason: format!(
                "block size must be in [{BLOCK_SIZE_MIN}, {BLOCK_SIZE_MAX}] and a multiple of {BLOCK_SIZE_MULTIPLIER}, got {block_size}"
            ),
        });
    }

    Ok(Device {
        data_device,
        metadata_device,
        thinpool_device: dm::device_path(pool_name),
        thinpool_size: 0,
        thinpool_block_size: block_size,
        last_dev_id: 1,
    })
}

#[async_trait]
impl StorageInit for ThinpoolInit {
    async fn init(
        &self,
        root: &Path,
        cfg_name: &str,
        opts: &HashMap<String, String>,
    ) -> Result<Box<dyn StorageDriver>, StorageError> {
        if util::config_exists(root, cfg_name) {
            let device: Device = util::load_config(root, cfg_name)?;
            let mut driver = ThinpoolDriver {
                root: root.to_path_buf(),
                config_name: cfg_name.to_string(),
                device,
            };
            driver.activate_pool().await?;
            return Ok(Box::new(driver));
        }

        let mut device = verify_config(opts)?;
        device.thinpool_size = dm::block_device_size(&device.data_device).await?;

        let pool_name = pool_name(&device);
        dm::create_pool(
            &pool_name,
            &device.data_device,
            &device.metadata_device,
            device.thinpool_block_size,
            device.thinpool_size,
        )
        .await?;
        info!(pool = %device.thinpool_device.display(), "created thin pool");

        util::save_config(root, cfg_name, &device)?;
        Ok(Box::new(ThinpoolDriver {
            root: root.to_path_buf(),
            config_name: cfg_name.to_string(),
            device,
        }))
    }
}

fn pool_name(device: &Device) -> String {
    device
        .thinpool_device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_THINPOOL_NAME.to_string())
}

impl ThinpoolDriver {
    fn load_volume(&self, id: Uuid) -> Option<Volume> {
        let name = volume_cfg_name(id);
        if !util::config_exists(&self.root, &name) {
            return None;
        }
        match util::load_config(&self.root, &name) {
            Ok(volume) => Some(volume),
            Err(e) => {
                warn!(volume = %id, error = %e, "failed to load volume record");
                None
            }
        }
    }

    fn save_volume(&self, volume: &Volume) -> Result<(), StorageError> {
        util::save_config(&self.root, &volume_cfg_name(volume.id), volume)?;
        Ok(())
    }

    fn remove_volume_record(&self, id: Uuid) -> Result<(), StorageError> {
        util::remove_config(&self.root, &volume_cfg_name(id))?;
        Ok(())
    }

    fn list_volume_ids(&self) -> Vec<Uuid> {
        util::list_config_ids(&self.root, VOLUME_CFG_PREFIX, CFG_SUFFIX)
            .into_iter()
            .filter_map(|id| Uuid::parse_str(&id).ok())
            .collect()
    }

    fn load_image(&self, id: Uuid) -> Option<Image> {
        let name = image_cfg_name(id);
        if !util::config_exists(&self.root, &name) {
            return None;
        }
        util::load_config(&self.root, &name).ok()
    }

    fn save_image(&self, image: &Image) -> Result<(), StorageError> {
        util::save_config(&self.root, &image_cfg_name(image.id), image)?;
        Ok(())
    }

    fn save_device(&self) -> Result<(), StorageError> {
        util::save_config(&self.root, &self.config_name, &self.device)?;
        Ok(())
    }

    fn get_snapshot_and_volume(
        &self,
        snapshot_id: Uuid,
        volume_id: Uuid,
    ) -> Result<(Snapshot, Volume), StorageError> {
        let volume = self
            .load_volume(volume_id)
            .ok_or(StorageError::VolumeNotFound(volume_id))?;
        let snapshot = volume
            .snapshots
            .get(&snapshot_id)
            .cloned()
            .ok_or(StorageError::SnapshotNotFound {
                snapshot: snapshot_id,
                volume: volume_id,
            })?;
        Ok((snapshot, volume))
    }

    /// Take the next device ID and persist the advanced counter before the
    /// ID is used. IDs are write-only monotonic: a later activation failure
    /// does not roll the counter back.
    fn allocate_dev_id(&mut self) -> Result<u32, StorageError> {
        let dev_id = self.device.last_dev_id;
        self.device.last_dev_id += 1;
        self.save_device()?;
        Ok(dev_id)
    }

    async fn activate_pool(&mut self) -> Result<(), StorageError> {
        if self.device.thinpool_device.exists() {
            debug!(pool = %self.device.thinpool_device.display(), "pool already active");
            return Ok(());
        }

        dm::create_pool(
            &pool_name(&self.device),
            &self.device.data_device,
            &self.device.metadata_device,
            self.device.thinpool_block_size,
            self.device.thinpool_size,
        )
        .await?;
        info!(pool = %self.device.thinpool_device.display(), "reinitialized thin pool");

        for id in self.list_volume_ids() {
            let volume = self
                .load_volume(id)
                .ok_or(StorageError::VolumeNotFound(id))?;
            dm::activate_device(
                &self.device.thinpool_device,
                &id.to_string(),
                volume.dev_id,
                volume.size,
                None,
            )
            .await?;
            debug!(volume = %id, dev_id = volume.dev_id, "reactivated volume device");
        }
        Ok(())
    }

    fn volume_to_info(&self, volume: &Volume) -> VolumeInfo {
        let mut snapshots: Vec<SnapshotInfo> = volume
            .snapshots
            .iter()
            .map(|(id, s)| SnapshotInfo {
                id: *id,
                dev_id: s.dev_id,
                activated: s.activated,
            })
            .collect();
        snapshots.sort_by_key(|s| s.dev_id);
        VolumeInfo {
            id: volume.id,
            dev_id: volume.dev_id,
            size: volume.size,
            base: volume.base,
            snapshots,
        }
    }
}

#[async_trait]
impl StorageDriver for ThinpoolDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn create_volume(
        &mut self,
        id: Uuid,
        base: Option<Uuid>,
        size: u64,
    ) -> Result<(), StorageError> {
        let multiple = self.device.thinpool_block_size * SECTOR_SIZE;
        if size == 0 || size % multiple != 0 {
            return Err(StorageError::InvalidSize { size, multiple });
        }
        if self.load_volume(id).is_some() {
            return Err(StorageError::VolumeExists(id));
        }

        let mut image = None;
        if let Some(base_id) = base {
            let img = self
                .load_image(base_id)
                .ok_or(StorageError::ImageNotFound(base_id))?;
            if !img.device.exists() {
                return Err(StorageError::ImageNotFound(base_id));
            }
            if size != img.size {
                return Err(StorageError::SizeMismatch {
                    size,
                    image_size: img.size,
                });
            }
            image = Some(img);
        }

        let dev_id = self.allocate_dev_id()?;
        info!(volume = %id, dev_id, size, base = ?base, "creating volume");
        dm::create_device(&self.device.thinpool_device, dev_id).await?;

        let activated = dm::activate_device(
            &self.device.thinpool_device,
            &id.to_string(),
            dev_id,
            size,
            image.as_ref().map(|i| i.device.as_path()),
        )
        .await;
        if let Err(e) = activated {
            warn!(volume = %id, dev_id, error = %e, "activation failed, removing thin device");
            if let Err(cleanup) = dm::delete_device(&self.device.thinpool_device, dev_id).await {
                warn!(volume = %id, dev_id, error = %cleanup, "failed to remove thin device");
            }
            return Err(e);
        }

        let volume = Volume {
            id,
            dev_id,
            size,
            base,
            snapshots: HashMap::new(),
        };
        if let Some(mut image) = image {
            image.volume_ref.insert(id);
            self.save_image(&image)?;
        }
        self.save_volume(&volume)?;
        Ok(())
    }

    async fn delete_volume(&mut self, id: Uuid) -> Result<(), StorageError> {
        let volume = self
            .load_volume(id)
            .ok_or(StorageError::VolumeNotFound(id))?;
        if !volume.snapshots.is_empty() {
            return Err(StorageError::VolumeBusy {
                volume: id,
                snapshots: volume.snapshots.len(),
            });
        }

        info!(volume = %id, dev_id = volume.dev_id, "deleting volume");
        dm::remove_device(&id.to_string()).await?;
        dm::delete_device(&self.device.thinpool_device, volume.dev_id).await?;

        if let Some(base_id) = volume.base {
            let mut image = self
                .load_image(base_id)
                .ok_or(StorageError::ImageNotFound(base_id))?;
            if !image.volume_ref.remove(&id) {
                warn!(image = %base_id, volume = %id, "image did not list volume as referrer");
            }
            self.save_image(&image)?;
        }

        self.remove_volume_record(id)?;
        Ok(())
    }

    fn list_volumes(&self, id: Option<Uuid>) -> Result<Vec<VolumeInfo>, StorageError> {
        match id {
            Some(id) => Ok(vec![self.volume_info(id)?]),
            None => {
                let mut volumes = Vec::new();
                for id in self.list_volume_ids() {
                    volumes.push(self.volume_info(id)?);
                }
                volumes.sort_by_key(|v| v.dev_id);
                Ok(volumes)
            }
        }
    }

    fn volume_info(&self, id: Uuid) -> Result<VolumeInfo, StorageError> {
        let volume = self
            .load_volume(id)
            .ok_or(StorageError::VolumeNotFound(id))?;
        Ok(self.volume_to_info(&volume))
    }

    fn get_volume_device(&self, id: Uuid) -> Result<PathBuf, StorageError> {
        self.load_volume(id)
            .ok_or(StorageError::VolumeNotFound(id))?;
        Ok(dm::device_path(&id.to_string()))
    }

    async fn create_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError> {
        let mut volume = self
            .load_volume(volume_id)
            .ok_or(StorageError::VolumeNotFound(volume_id))?;
        if volume.snapshots.contains_key(&id) {
            return Err(StorageError::SnapshotExists {
                snapshot: id,
                volume: volume_id,
            });
        }

        let dev_id = self.allocate_dev_id()?;
        info!(snapshot = %id, volume = %volume_id, dev_id, "creating snapshot");
        dm::create_snap_device(
            &self.device.thinpool_device,
            dev_id,
            &volume_id.to_string(),
            volume.dev_id,
        )
        .await?;

        volume.snapshots.insert(
            id,
            Snapshot {
                dev_id,
                activated: false,
            },
        );
        self.save_volume(&volume)?;
        Ok(())
    }

    async fn delete_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError> {
        let (snapshot, mut volume) = self.get_snapshot_and_volume(id, volume_id)?;

        info!(snapshot = %id, volume = %volume_id, dev_id = snapshot.dev_id, "deleting snapshot");
        dm::delete_device(&self.device.thinpool_device, snapshot.dev_id).await?;
        volume.snapshots.remove(&id);
        self.save_volume(&volume)?;
        Ok(())
    }

    fn has_snapshot(&self, id: Uuid, volume_id: Uuid) -> bool {
        self.get_snapshot_and_volume(id, volume_id).is_ok()
    }

    async fn compare_snapshot(
        &self,
        id: Uuid,
        other: Option<Uuid>,
        volume_id: Uuid,
    ) -> Result<Mappings, StorageError> {
        let (old_id, include_same) = match other {
            Some(other) if other != id => (other, false),
            _ => (id, true),
        };

        let (new_snapshot, _) = self.get_snapshot_and_volume(id, volume_id)?;
        let (old_snapshot, _) = self.get_snapshot_and_volume(old_id, volume_id)?;

        let out = dm::thin_delta(
            &self.device.metadata_device,
            old_snapshot.dev_id,
            new_snapshot.dev_id,
        )
        .await?;
        let mappings = thin_delta::parse(
            &out,
            self.device.thinpool_block_size * SECTOR_SIZE,
            include_same,
        )?;
        Ok(mappings)
    }

    async fn open_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError> {
        let (snapshot, mut volume) = self.get_snapshot_and_volume(id, volume_id)?;

        debug!(snapshot = %id, volume = %volume_id, dev_id = snapshot.dev_id, "activating snapshot");
        dm::activate_device(
            &self.device.thinpool_device,
            &id.to_string(),
            snapshot.dev_id,
            volume.size,
            None,
        )
        .await?;

        volume
            .snapshots
            .get_mut(&id)
            .expect("snapshot checked above")
            .activated = true;
        self.save_volume(&volume)?;
        Ok(())
    }

    async fn read_snapshot(
        &self,
        id: Uuid,
        volume_id: Uuid,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        self.get_snapshot_and_volume(id, volume_id)?;

        let dev = std::fs::File::open(dm::device_path(&id.to_string()))?;
        dev.read_exact_at(buf, offset)?;
        Ok(())
    }

    async fn close_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError> {
        let (_, mut volume) = self.get_snapshot_and_volume(id, volume_id)?;

        debug!(snapshot = %id, volume = %volume_id, "deactivating snapshot");
        dm::remove_device(&id.to_string()).await?;

        volume
            .snapshots
            .get_mut(&id)
            .expect("snapshot checked above")
            .activated = false;
        self.save_volume(&volume)?;
        Ok(())
    }

    async fn activate_image(&mut self, id: Uuid, file: &Path) -> Result<(), StorageError> {
        if self.load_image(id).is_some() {
            return Err(StorageError::ImageExists(id));
        }
        let meta = std::fs::metadata(file)?;
        if !meta.is_file() {
            return Err(StorageError::Command {
                command: "losetup",
                message: format!("{} is not a regular file", file.display()),
            });
        }

        let device = util::attach_loopback_device(file, true).await?;
        info!(image = %id, file = %file.display(), device = %device.display(), "activated image");

        self.save_image(&Image {
            id,
            file_path: file.to_path_buf(),
            size: meta.len(),
            device,
            volume_ref: HashSet::new(),
        })?;
        Ok(())
    }

    async fn deactivate_image(&mut self, id: Uuid) -> Result<(), StorageError> {
        let image = self
            .load_image(id)
            .ok_or(StorageError::ImageNotFound(id))?;
        for volume_id in &image.volume_ref {
            if self.load_volume(*volume_id).is_some() {
                return Err(StorageError::ImageBusy {
                    image: id,
                    volume: *volume_id,
                });
            }
        }

        util::detach_loopback_device(&image.file_path, &image.device).await?;
        info!(image = %id, device = %image.device.display(), "deactivated image");
        util::remove_config(&self.root, &image_cfg_name(id))?;
        Ok(())
    }

    fn info(&self) -> Result<serde_json::Value, StorageError> {
        Ok(serde_json::json!({
            "Driver": DRIVER_NAME,
            "Root": self.root,
            "DataDevice": self.device.data_device,
            "MetadataDevice": self.device.metadata_device,
            "ThinpoolDevice": self.device.thinpool_device,
            "ThinpoolSize": self.device.thinpool_size,
            "ThinpoolBlockSize": self.device.thinpool_block_size * SECTOR_SIZE,
        }))
    }

    async fn shutdown(&mut self) -> Result<(), StorageError> {
        for id in self.list_volume_ids() {
            dm::remove_device(&id.to_string()).await?;
            debug!(volume = %id, "deactivated volume device");
        }
        dm::remove_device(&pool_name(&self.device)).await?;
        info!(pool = %self.device.thinpool_device.display(), "deactivated thin pool");
        Ok(())
    }
}
