//! Content-addressed incremental backup engine.
//!
//! Snapshots are backed up into an object store as fixed-size,
//! checksum-named blocks plus a per-snapshot manifest ordered by offset.
//! Blocks are deduplicated by existence within a volume's subtree and
//! garbage-collected by manifest reachability when a snapshot is removed.

pub mod driver;
pub mod layout;
pub mod s3;
pub mod vfs;

use std::collections::HashSet;
use std::path::Path;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, StoreError};
use crate::storage::StorageDriver;
use crate::util;

pub use driver::{DriverTable, ObjectStoreDriver, ObjectStoreInit};

/// Block size recorded on first register; never changes afterwards.
pub const DEFAULT_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// The object-store record, authoritative copy under
/// `rancher-objectstore/objectstore.cfg` in the store itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStore {
    #[serde(rename = "UUID")]
    pub id: Uuid,
    #[serde(rename = "Kind")]
    pub kind: String,
    #[serde(rename = "BlockSize")]
    pub block_size: u64,
}

/// Per-volume record in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Base", with = "util::uuid_or_empty")]
    pub base: Option<Uuid>,
    #[serde(rename = "LastSnapshotID", with = "util::uuid_or_empty")]
    pub last_snapshot_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapping {
    #[serde(rename = "Offset")]
    pub offset: u64,
    #[serde(rename = "BlockChecksum")]
    pub checksum: String,
}

/// Manifest of one backed-up snapshot: `(offset, checksum)` pairs strictly
/// increasing by offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMap {
    #[serde(rename = "ID")]
    pub id: Uuid,
    #[serde(rename = "Blocks")]
    pub blocks: Vec<BlockMapping>,
}

/// Remote view of a volume, for listings over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteVolumeInfo {
    pub id: Uuid,
    pub size: u64,
    pub base: Option<Uuid>,
    pub last_snapshot_id: Option<Uuid>,
    pub snapshots: Vec<Uuid>,
}

async fn load_config_in_store<T: DeserializeOwned>(
    driver: &dyn ObjectStoreDriver,
    path: &str,
) -> Result<T, StoreError> {
    if driver.file_size(path).await.is_none() {
        return Err(StoreError::NotFound {
            path: path.to_string(),
        });
    }
    let data = driver.read(path).await?;
    serde_json::from_slice(&data).map_err(StoreError::backend)
}

async fn save_config_in_store<T: Serialize>(
    driver: &dyn ObjectStoreDriver,
    path: &str,
    value: &T,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec(value).map_err(StoreError::backend)?;
    driver.write(path, Bytes::from(data)).await
}

async fn load_remote_store_config(
    driver: &dyn ObjectStoreDriver,
) -> Result<ObjectStore, StoreError> {
    load_config_in_store(driver, &layout::objectstore_config_path()).await
}

async fn save_remote_store_config(
    driver: &dyn ObjectStoreDriver,
    store: &ObjectStore,
) -> Result<(), StoreError> {
    save_config_in_store(driver, &layout::objectstore_config_path(), store).await
}

async fn load_volume_config(
    volume_id: Uuid,
    store_id: Uuid,
    driver: &dyn ObjectStoreDriver,
) -> Result<Volume, StoreError> {
    load_config_in_store(driver, &layout::volume_config_path(volume_id))
        .await
        .map_err(|e| match e {
            StoreError::NotFound { .. } => StoreError::VolumeNotFound {
                volume: volume_id,
                store: store_id,
            },
            other => other,
        })
}

async fn save_volume_config(
    volume_id: Uuid,
    driver: &dyn ObjectStoreDriver,
    volume: &Volume,
) -> Result<(), StoreError> {
    save_config_in_store(driver, &layout::volume_config_path(volume_id), volume).await
}

async fn snapshot_exists(
    snapshot_id: Uuid,
    volume_id: Uuid,
    driver: &dyn ObjectStoreDriver,
) -> bool {
    driver
        .file_exists(&layout::snapshot_config_path(snapshot_id, volume_id))
        .await
}

async fn load_snapshot_map(
    snapshot_id: Uuid,
    volume_id: Uuid,
    driver: &dyn ObjectStoreDriver,
) -> Result<SnapshotMap, StoreError> {
    load_config_in_store(driver, &layout::snapshot_config_path(snapshot_id, volume_id)).await
}

async fn save_snapshot_map(
    snapshot_id: Uuid,
    volume_id: Uuid,
    driver: &dyn ObjectStoreDriver,
    map: &SnapshotMap,
) -> Result<(), StoreError> {
    let path = layout::snapshot_config_path(snapshot_id, volume_id);
    if driver.file_exists(&path).await {
        // Only reachable after a partial earlier run; the fresh manifest
        // supersedes it.
        warn!(path, "snapshot manifest already exists, overwriting");
        driver.remove(&path).await?;
    }
    save_config_in_store(driver, &path, map).await
}

/// Snapshot IDs with a manifest under the volume's subtree.
async fn list_snapshots(
    volume_id: Uuid,
    driver: &dyn ObjectStoreDriver,
) -> Result<Vec<Uuid>, StoreError> {
    let names = match driver.list(&layout::snapshots_path(volume_id)).await {
        Ok(names) => names,
        Err(StoreError::NotFound { .. }) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(names
        .iter()
        .filter_map(|name| layout::parse_snapshot_config_name(name))
        .collect())
}

async fn get_store_cfg_and_driver(
    root: &Path,
    table: &DriverTable,
    store_id: Uuid,
) -> Result<(ObjectStore, Box<dyn ObjectStoreDriver>), StoreError> {
    let cfg_name = layout::local_config_name(store_id);
    if !util::config_exists(root, &cfg_name) {
        return Err(StoreError::NotFound { path: cfg_name });
    }
    let store: ObjectStore = util::load_config(root, &cfg_name)?;
    let driver = table
        .get_driver(
            &store.kind,
            root,
            Some(&layout::local_driver_config_name(store_id, &store.kind)),
            &Default::default(),
        )
        .await?;
    Ok((store, driver))
}

/// Register an object store, creating its on-store record on first use.
///
/// A store that already carries a config is authoritative: its UUID and
/// block size are reused and the local copy is overwritten. Returns the
/// store UUID and block size.
pub async fn register(
    root: &Path,
    kind: &str,
    opts: &std::collections::HashMap<String, String>,
    table: &DriverTable,
) -> Result<(Uuid, u64), Error> {
    let mut driver = table.get_driver(kind, root, None, opts).await?;

    let store = match load_remote_store_config(&*driver).await {
        Ok(existing) => {
            if existing.kind != kind {
                return Err(StoreError::KindMismatch {
                    stored: existing.kind,
                    requested: kind.to_string(),
                }
                .into());
            }
            debug!(store = %existing.id, "found existing object store config");
            driver.finalize_init(
                root,
                &layout::local_driver_config_name(existing.id, kind),
                existing.id,
            )?;
            existing
        }
        Err(StoreError::NotFound { .. }) => {
            let id = Uuid::new_v4();
            driver.finalize_init(root, &layout::local_driver_config_name(id, kind), id)?;

            if let Err(e) = driver.mkdir_all(&layout::volume_base_path()).await {
                let _ = util::remove_config(root, &layout::local_driver_config_name(id, kind));
                return Err(e.into());
            }
            let store = ObjectStore {
                id,
                kind: kind.to_string(),
                block_size: DEFAULT_BLOCK_SIZE,
            };
            save_remote_store_config(&*driver, &store).await?;
            debug!(store = %id, "created object store config");
            store
        }
        Err(e) => return Err(e.into()),
    };

    util::save_config(root, &layout::local_config_name(store.id), &store)
        .map_err(StoreError::from)?;
    info!(store = %store.id, kind, block_size = store.block_size, "registered object store");
    Ok((store.id, store.block_size))
}

/// Drop the local copies of a store's config. The remote store is
/// untouched.
pub async fn deregister(root: &Path, store_id: Uuid) -> Result<(), Error> {
    let cfg_name = layout::local_config_name(store_id);
    if !util::config_exists(root, &cfg_name) {
        return Err(StoreError::NotFound { path: cfg_name }.into());
    }
    let store: ObjectStore = util::load_config(root, &cfg_name).map_err(StoreError::from)?;

    util::remove_config(root, &layout::local_driver_config_name(store_id, &store.kind))
        .map_err(StoreError::from)?;
    util::remove_config(root, &cfg_name).map_err(StoreError::from)?;
    info!(store = %store_id, "deregistered object store");
    Ok(())
}

/// Add a volume to the store, laying down its directory skeleton.
pub async fn add_volume(
    root: &Path,
    table: &DriverTable,
    store_id: Uuid,
    volume_id: Uuid,
    base: Option<Uuid>,
    size: u64,
) -> Result<(), Error> {
    let (_, driver) = get_store_cfg_and_driver(root, table, store_id).await?;

    let volume_cfg = layout::volume_config_path(volume_id);
    if driver.file_exists(&volume_cfg).await {
        return Err(StoreError::VolumeExists {
            volume: volume_id,
            store: store_id,
        }
        .into());
    }

    driver.mkdir_all(&layout::volume_path(volume_id)).await?;
    driver.mkdir_all(&layout::snapshots_path(volume_id)).await?;
    driver.mkdir_all(&layout::blocks_path(volume_id)).await?;

    let volume = Volume {
        size,
        base,
        last_snapshot_id: None,
    };
    save_volume_config(volume_id, &*driver, &volume).await?;
    info!(volume = %volume_id, store = %store_id, size, "added volume to object store");
    Ok(())
}

/// Delete a volume's whole subtree from the store.
pub async fn remove_volume(
    root: &Path,
    table: &DriverTable,
    store_id: Uuid,
    volume_id: Uuid,
) -> Result<(), Error> {
    let (_, driver) = get_store_cfg_and_driver(root, table, store_id).await?;

    if !driver
        .file_exists(&layout::volume_config_path(volume_id))
        .await
    {
        return Err(StoreError::VolumeNotFound {
            volume: volume_id,
            store: store_id,
        }
        .into());
    }

    let volume_path = layout::volume_path(volume_id);
    driver.remove_all(&volume_path).await?;
    prune_empty_parents(&*driver, &volume_path, &layout::volume_base_path()).await;
    info!(volume = %volume_id, store = %store_id, "removed volume from object store");
    Ok(())
}

/// Back up one snapshot of a volume into the store.
///
/// Only blocks changed against the last backed-up snapshot are read and
/// uploaded; the resulting manifest is the sorted merge of the delta with
/// the parent manifest. Falls back to a full backup when no usable parent
/// exists.
pub async fn backup_snapshot(
    root: &Path,
    table: &DriverTable,
    snapshot_id: Uuid,
    volume_id: Uuid,
    store_id: Uuid,
    storage: &mut dyn StorageDriver,
) -> Result<(), Error> {
    let (store, driver) = get_store_cfg_and_driver(root, table, store_id).await?;
    let mut volume = load_volume_config(volume_id, store_id, &*driver).await?;

    if snapshot_exists(snapshot_id, volume_id, &*driver).await {
        return Err(StoreError::SnapshotExists {
            snapshot: snapshot_id,
            store: store_id,
        }
        .into());
    }

    let mut parent_id = volume.last_snapshot_id;
    if let Some(pid) = parent_id {
        if pid == snapshot_id {
            // The same snapshot was the last one backed up; regenerate a
            // full manifest.
            parent_id = None;
        } else if !storage.has_snapshot(pid, volume_id) {
            debug!(parent = %pid, volume = %volume_id, "parent snapshot gone locally, doing full backup");
            parent_id = None;
        }
    }

    let parent_map = match parent_id {
        Some(pid) => {
            debug!(parent = %pid, "loading parent snapshot manifest");
            Some(load_snapshot_map(pid, volume_id, &*driver).await?)
        }
        None => None,
    };

    let delta = storage
        .compare_snapshot(snapshot_id, parent_id, volume_id)
        .await?;
    if delta.block_size != store.block_size {
        return Err(StoreError::BlockSizeMismatch {
            driver: delta.block_size,
            store: store.block_size,
        }
        .into());
    }

    storage.open_snapshot(snapshot_id, volume_id).await?;
    let walk = upload_changed_blocks(&*driver, storage, snapshot_id, volume_id, &delta).await;
    if let Err(e) = storage.close_snapshot(snapshot_id, volume_id).await {
        warn!(snapshot = %snapshot_id, volume = %volume_id, error = %e, "failed to close snapshot");
    }
    let delta_blocks = walk?;

    let snapshot_map = merge_snapshot_map(snapshot_id, delta_blocks, parent_map);
    save_snapshot_map(snapshot_id, volume_id, &*driver, &snapshot_map).await?;

    volume.last_snapshot_id = Some(snapshot_id);
    save_volume_config(volume_id, &*driver, &volume).await?;
    info!(
        snapshot = %snapshot_id,
        volume = %volume_id,
        store = %store_id,
        blocks = snapshot_map.blocks.len(),
        "backed up snapshot"
    );
    Ok(())
}

async fn upload_changed_blocks(
    driver: &dyn ObjectStoreDriver,
    storage: &dyn StorageDriver,
    snapshot_id: Uuid,
    volume_id: Uuid,
    delta: &thin_delta::Mappings,
) -> Result<Vec<BlockMapping>, Error> {
    let block_size = delta.block_size;
    let mut blocks = Vec::new();

    for mapping in &delta.mappings {
        for i in 0..mapping.size / block_size {
            let offset = mapping.offset + i * block_size;
            let mut block = vec![0u8; block_size as usize];
            storage
                .read_snapshot(snapshot_id, volume_id, offset, &mut block)
                .await?;

            let checksum = util::checksum(&block);
            let block_file = layout::block_path(volume_id, &checksum);
            if driver.file_exists(&block_file).await {
                debug!(block = %block_file, "found existing block");
            } else {
                if let Some(parent) = parent_path(&block_file) {
                    driver.mkdir_all(parent).await?;
                }
                driver.write(&block_file, Bytes::from(block)).await?;
                debug!(block = %block_file, "created block");
            }

            blocks.push(BlockMapping { offset, checksum });
        }
    }
    Ok(blocks)
}

/// Merge a sorted delta with the parent manifest into a new sorted
/// manifest. On an equal offset the delta entry wins.
fn merge_snapshot_map(
    snapshot_id: Uuid,
    delta: Vec<BlockMapping>,
    last: Option<SnapshotMap>,
) -> SnapshotMap {
    let Some(last) = last else {
        return SnapshotMap {
            id: snapshot_id,
            blocks: delta,
        };
    };

    let mut blocks = Vec::with_capacity(delta.len().max(last.blocks.len()));
    let mut d = delta.into_iter().peekable();
    let mut l = last.blocks.into_iter().peekable();

    loop {
        match (d.peek(), l.peek()) {
            (Some(db), Some(lb)) => {
                if db.offset == lb.offset {
                    blocks.push(d.next().expect("peeked"));
                    l.next();
                } else if db.offset < lb.offset {
                    blocks.push(d.next().expect("peeked"));
                } else {
                    blocks.push(l.next().expect("peeked"));
                }
            }
            (Some(_), None) => blocks.push(d.next().expect("peeked")),
            (None, Some(_)) => blocks.push(l.next().expect("peeked")),
            (None, None) => break,
        }
    }

    SnapshotMap {
        id: snapshot_id,
        blocks,
    }
}

/// Restore a backed-up snapshot onto the target volume's block device.
pub async fn restore_snapshot(
    root: &Path,
    table: &DriverTable,
    snapshot_id: Uuid,
    volume_id: Uuid,
    target_volume_id: Uuid,
    store_id: Uuid,
    storage: &dyn StorageDriver,
) -> Result<(), Error> {
    let (_, driver) = get_store_cfg_and_driver(root, table, store_id).await?;
    load_volume_config(volume_id, store_id, &*driver).await?;

    let device_path = storage.get_volume_device(target_volume_id)?;
    let mut device = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&device_path)
        .await?;

    let snapshot_map = load_snapshot_map(snapshot_id, volume_id, &*driver).await?;
    for block in &snapshot_map.blocks {
        let data = driver
            .read(&layout::block_path(volume_id, &block.checksum))
            .await?;
        device
            .seek(std::io::SeekFrom::Start(block.offset))
            .await?;
        device.write_all(&data).await?;
    }
    device.flush().await?;

    info!(
        snapshot = %snapshot_id,
        volume = %volume_id,
        target = %target_volume_id,
        blocks = snapshot_map.blocks.len(),
        "restored snapshot"
    );
    Ok(())
}

/// Remove a backed-up snapshot and garbage-collect blocks no surviving
/// manifest of the volume references.
pub async fn remove_snapshot(
    root: &Path,
    table: &DriverTable,
    snapshot_id: Uuid,
    volume_id: Uuid,
    store_id: Uuid,
) -> Result<(), Error> {
    let (_, driver) = get_store_cfg_and_driver(root, table, store_id).await?;
    let mut volume = load_volume_config(volume_id, store_id, &*driver).await?;

    let snapshot_map = load_snapshot_map(snapshot_id, volume_id, &*driver).await?;
    let mut candidates: HashSet<String> = snapshot_map
        .blocks
        .iter()
        .map(|b| b.checksum.clone())
        .collect();

    driver
        .remove(&layout::snapshot_config_path(snapshot_id, volume_id))
        .await?;
    debug!(snapshot = %snapshot_id, "removed snapshot manifest");

    if volume.last_snapshot_id == Some(snapshot_id) {
        volume.last_snapshot_id = None;
        save_volume_config(volume_id, &*driver, &volume).await?;
    }

    debug!(volume = %volume_id, candidates = candidates.len(), "block GC started");
    for other_id in list_snapshots(volume_id, &*driver).await? {
        if candidates.is_empty() {
            break;
        }
        let other = load_snapshot_map(other_id, volume_id, &*driver).await?;
        for block in &other.blocks {
            candidates.remove(&block.checksum);
            if candidates.is_empty() {
                break;
            }
        }
    }

    let reclaimed = candidates.len();
    for checksum in &candidates {
        let block_file = layout::block_path(volume_id, checksum);
        driver.remove(&block_file).await?;
        prune_empty_parents(&*driver, &block_file, &layout::blocks_path(volume_id)).await;
        debug!(block = %checksum, volume = %volume_id, "removed unused block");
    }

    info!(
        snapshot = %snapshot_id,
        volume = %volume_id,
        store = %store_id,
        reclaimed,
        "removed backed-up snapshot"
    );
    Ok(())
}

/// Remote listing of a volume and its backed-up snapshots.
pub async fn list_volume(
    root: &Path,
    table: &DriverTable,
    store_id: Uuid,
    volume_id: Uuid,
    snapshot_id: Option<Uuid>,
) -> Result<Option<RemoteVolumeInfo>, Error> {
    let (_, driver) = get_store_cfg_and_driver(root, table, store_id).await?;

    let volume = match load_volume_config(volume_id, store_id, &*driver).await {
        Ok(volume) => volume,
        Err(StoreError::VolumeNotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut snapshots = list_snapshots(volume_id, &*driver).await?;
    snapshots.sort();
    if let Some(filter) = snapshot_id {
        snapshots.retain(|s| *s == filter);
    }

    Ok(Some(RemoteVolumeInfo {
        id: volume_id,
        size: volume.size,
        base: volume.base,
        last_snapshot_id: volume.last_snapshot_id,
        snapshots,
    }))
}

fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Best-effort removal of now-empty fan-out directories above a deleted
/// leaf, stopping at `stop`.
async fn prune_empty_parents(driver: &dyn ObjectStoreDriver, path: &str, stop: &str) {
    let mut current = parent_path(path);
    while let Some(dir) = current {
        if dir == stop || dir.is_empty() {
            break;
        }
        if driver.remove(dir).await.is_err() {
            break;
        }
        current = parent_path(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(offset: u64, checksum: &str) -> BlockMapping {
        BlockMapping {
            offset,
            checksum: checksum.to_string(),
        }
    }

    fn map_of(id: Uuid, blocks: &[(u64, &str)]) -> SnapshotMap {
        SnapshotMap {
            id,
            blocks: blocks.iter().map(|(o, c)| mapping(*o, c)).collect(),
        }
    }

    #[test]
    fn merge_without_parent_is_the_delta() {
        let id = Uuid::new_v4();
        let delta = vec![mapping(0, "a"), mapping(2, "b")];
        let merged = merge_snapshot_map(id, delta.clone(), None);
        assert_eq!(merged.id, id);
        assert_eq!(merged.blocks, delta);
    }

    #[test]
    fn merge_prefers_delta_on_equal_offset() {
        let id = Uuid::new_v4();
        let parent = map_of(Uuid::new_v4(), &[(0, "old0"), (2, "old2"), (4, "old4")]);
        let delta = vec![mapping(2, "new2")];

        let merged = merge_snapshot_map(id, delta, Some(parent));
        assert_eq!(
            merged.blocks,
            vec![mapping(0, "old0"), mapping(2, "new2"), mapping(4, "old4")]
        );
    }

    #[test]
    fn merge_interleaves_and_appends_tails() {
        let id = Uuid::new_v4();
        let parent = map_of(Uuid::new_v4(), &[(2, "old2"), (6, "old6")]);
        let delta = vec![mapping(0, "new0"), mapping(4, "new4"), mapping(8, "new8")];

        let merged = merge_snapshot_map(id, delta, Some(parent));
        assert_eq!(
            merged.blocks,
            vec![
                mapping(0, "new0"),
                mapping(2, "old2"),
                mapping(4, "new4"),
                mapping(6, "old6"),
                mapping(8, "new8"),
            ]
        );
    }

    #[test]
    fn merge_output_is_strictly_increasing_and_bounded() {
        let id = Uuid::new_v4();
        let parent = map_of(Uuid::new_v4(), &[(0, "p0"), (1, "p1"), (2, "p2")]);
        let delta = vec![mapping(1, "d1"), mapping(3, "d3")];

        let merged = merge_snapshot_map(id, delta.clone(), Some(parent.clone()));
        for window in merged.blocks.windows(2) {
            assert!(window[0].offset < window[1].offset);
        }
        assert!(merged.blocks.len() <= delta.len() + parent.blocks.len());

        // Every offset comes from the delta or the parent, from the delta
        // when both carry it.
        assert_eq!(
            merged.blocks,
            vec![mapping(0, "p0"), mapping(1, "d1"), mapping(2, "p2"), mapping(3, "d3")]
        );
    }

    #[test]
    fn merge_empty_delta_keeps_parent() {
        let id = Uuid::new_v4();
        let parent = map_of(Uuid::new_v4(), &[(0, "p0"), (2, "p2")]);
        let merged = merge_snapshot_map(id, Vec::new(), Some(parent.clone()));
        assert_eq!(merged.blocks, parent.blocks);
        assert_eq!(merged.id, id);
    }

    #[test]
    fn parent_path_walks_up() {
        assert_eq!(parent_path("a/b/c"), Some("a/b"));
        assert_eq!(parent_path("a"), None);
    }
}
