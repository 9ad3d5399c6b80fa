//! End-to-end backup engine tests over a vfs object store and a
//! file-backed storage driver.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::TempDir;
use thin_delta::{Mapping, Mappings};
use uuid::Uuid;

use thinvol::error::{Error, StorageError, StoreError};
use thinvol::objectstore::{self, layout, DriverTable, SnapshotMap, Volume};
use thinvol::storage::{StorageDriver, VolumeInfo};
use thinvol::util;
use thinvol::DEFAULT_BLOCK_SIZE;

const MIB: u64 = 1024 * 1024;

/// Storage driver test double: volumes are sparse files, snapshots are
/// copies taken at snapshot time, and deltas come from block-wise
/// comparison of the copies.
struct FileStorage {
    dir: PathBuf,
    block_size: u64,
    volumes: HashMap<Uuid, FileVolume>,
    open: HashSet<Uuid>,
}

struct FileVolume {
    size: u64,
    snapshots: HashMap<Uuid, PathBuf>,
}

impl FileStorage {
    fn new(dir: &Path, block_size: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            block_size,
            volumes: HashMap::new(),
            open: HashSet::new(),
        }
    }

    fn volume_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("volume_{id}.img"))
    }

    fn snapshot_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("snapshot_{id}.img"))
    }

    fn volume(&self, id: Uuid) -> Result<&FileVolume, StorageError> {
        self.volumes.get(&id).ok_or(StorageError::VolumeNotFound(id))
    }

    fn snapshot_file(&self, id: Uuid, volume_id: Uuid) -> Result<PathBuf, StorageError> {
        self.volume(volume_id)?
            .snapshots
            .get(&id)
            .cloned()
            .ok_or(StorageError::SnapshotNotFound {
                snapshot: id,
                volume: volume_id,
            })
    }

    fn write_volume(&self, id: Uuid, offset: u64, data: &[u8]) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.volume_path(id))
            .unwrap();
        file.write_all_at(data, offset).unwrap();
    }

    fn read_volume(&self, id: Uuid, offset: u64, len: usize) -> Vec<u8> {
        let file = std::fs::File::open(self.volume_path(id)).unwrap();
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset).unwrap();
        buf
    }
}

#[async_trait]
impl StorageDriver for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn create_volume(
        &mut self,
        id: Uuid,
        base: Option<Uuid>,
        size: u64,
    ) -> Result<(), StorageError> {
        assert!(base.is_none(), "test driver has no image support");
        let file = std::fs::File::create(self.volume_path(id))?;
        file.set_len(size)?;
        self.volumes.insert(
            id,
            FileVolume {
                size,
                snapshots: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_volume(&mut self, id: Uuid) -> Result<(), StorageError> {
        let volume = self.volume(id)?;
        if !volume.snapshots.is_empty() {
            return Err(StorageError::VolumeBusy {
                volume: id,
                snapshots: volume.snapshots.len(),
            });
        }
        std::fs::remove_file(self.volume_path(id))?;
        self.volumes.remove(&id);
        Ok(())
    }

    fn list_volumes(&self, id: Option<Uuid>) -> Result<Vec<VolumeInfo>, StorageError> {
        match id {
            Some(id) => Ok(vec![self.volume_info(id)?]),
            None => self.volumes.keys().map(|id| self.volume_info(*id)).collect(),
        }
    }

    fn volume_info(&self, id: Uuid) -> Result<VolumeInfo, StorageError> {
        let volume = self.volume(id)?;
        Ok(VolumeInfo {
            id,
            dev_id: 0,
            size: volume.size,
            base: None,
            snapshots: Vec::new(),
        })
    }

    fn get_volume_device(&self, id: Uuid) -> Result<PathBuf, StorageError> {
        self.volume(id)?;
        Ok(self.volume_path(id))
    }

    async fn create_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError> {
        self.volume(volume_id)?;
        let path = self.snapshot_path(id);
        std::fs::copy(self.volume_path(volume_id), &path)?;
        self.volumes
            .get_mut(&volume_id)
            .unwrap()
            .snapshots
            .insert(id, path);
        Ok(())
    }

    async fn delete_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError> {
        let path = self.snapshot_file(id, volume_id)?;
        std::fs::remove_file(path)?;
        self.volumes.get_mut(&volume_id).unwrap().snapshots.remove(&id);
        Ok(())
    }

    fn has_snapshot(&self, id: Uuid, volume_id: Uuid) -> bool {
        self.snapshot_file(id, volume_id).is_ok()
    }

    async fn compare_snapshot(
        &self,
        id: Uuid,
        other: Option<Uuid>,
        volume_id: Uuid,
    ) -> Result<Mappings, StorageError> {
        let full = other.is_none() || other == Some(id);
        let new_data = std::fs::read(self.snapshot_file(id, volume_id)?)?;
        let old_data = if full {
            Vec::new()
        } else {
            std::fs::read(self.snapshot_file(other.unwrap(), volume_id)?)?
        };

        let block_size = self.block_size as usize;
        let mut mappings = Vec::new();
        for (i, chunk) in new_data.chunks(block_size).enumerate() {
            let offset = (i * block_size) as u64;
            let changed = full
                || old_data
                    .get(i * block_size..i * block_size + chunk.len())
                    .map(|old| old != chunk)
                    .unwrap_or(true);
            if changed {
                mappings.push(Mapping {
                    offset,
                    size: chunk.len() as u64,
                });
            }
        }
        Ok(Mappings {
            mappings,
            block_size: self.block_size,
        })
    }

    async fn open_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError> {
        self.snapshot_file(id, volume_id)?;
        assert!(self.open.insert(id), "snapshot {id} opened twice");
        Ok(())
    }

    async fn read_snapshot(
        &self,
        id: Uuid,
        volume_id: Uuid,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        assert!(self.open.contains(&id), "read of snapshot {id} while closed");
        let file = std::fs::File::open(self.snapshot_file(id, volume_id)?)?;
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    async fn close_snapshot(&mut self, id: Uuid, volume_id: Uuid) -> Result<(), StorageError> {
        self.snapshot_file(id, volume_id)?;
        assert!(self.open.remove(&id), "snapshot {id} closed while not open");
        Ok(())
    }

    async fn activate_image(&mut self, id: Uuid, _file: &Path) -> Result<(), StorageError> {
        Err(StorageError::ImageNotFound(id))
    }

    async fn deactivate_image(&mut self, id: Uuid) -> Result<(), StorageError> {
        Err(StorageError::ImageNotFound(id))
    }

    fn info(&self) -> Result<serde_json::Value, StorageError> {
        Ok(serde_json::json!({ "Driver": "file" }))
    }

    async fn shutdown(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

struct Harness {
    root: TempDir,
    store_dir: TempDir,
    _volumes_dir: TempDir,
    table: DriverTable,
    storage: FileStorage,
    store_id: Uuid,
}

impl Harness {
    async fn new() -> Self {
        Self::with_driver_block_size(DEFAULT_BLOCK_SIZE).await
    }

    async fn with_driver_block_size(block_size: u64) -> Self {
        let root = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let volumes_dir = TempDir::new().unwrap();

        let mut table = DriverTable::new();
        table
            .register("vfs", Box::new(objectstore::vfs::VfsInit))
            .unwrap();

        let opts = HashMap::from([(
            "vfs.path".to_string(),
            store_dir.path().display().to_string(),
        )]);
        let (store_id, store_block_size) =
            objectstore::register(root.path(), "vfs", &opts, &table)
                .await
                .unwrap();
        assert_eq!(store_block_size, DEFAULT_BLOCK_SIZE);

        let storage = FileStorage::new(volumes_dir.path(), block_size);
        Self {
            root,
            store_dir,
            _volumes_dir: volumes_dir,
            table,
            storage,
            store_id,
        }
    }

    fn store_path(&self, path: &str) -> PathBuf {
        self.store_dir.path().join(path)
    }

    async fn make_volume(&mut self, id: Uuid, size: u64) {
        self.storage.create_volume(id, None, size).await.unwrap();
        objectstore::add_volume(self.root.path(), &self.table, self.store_id, id, None, size)
            .await
            .unwrap();
    }

    async fn snapshot(&mut self, volume: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.storage.create_snapshot(id, volume).await.unwrap();
        id
    }

    async fn backup(&mut self, snapshot: Uuid, volume: Uuid) -> Result<(), Error> {
        objectstore::backup_snapshot(
            self.root.path(),
            &self.table,
            snapshot,
            volume,
            self.store_id,
            &mut self.storage,
        )
        .await
    }

    async fn restore(&mut self, snapshot: Uuid, volume: Uuid, target: Uuid) -> Result<(), Error> {
        objectstore::restore_snapshot(
            self.root.path(),
            &self.table,
            snapshot,
            volume,
            target,
            self.store_id,
            &self.storage,
        )
        .await
    }

    fn snapshot_map(&self, snapshot: Uuid, volume: Uuid) -> SnapshotMap {
        let path = self.store_path(&layout::snapshot_config_path(snapshot, volume));
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    fn remote_volume(&self, volume: Uuid) -> Volume {
        let path = self.store_path(&layout::volume_config_path(volume));
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    /// All block checksums currently stored for a volume.
    fn stored_blocks(&self, volume: Uuid) -> HashSet<String> {
        let mut blocks = HashSet::new();
        let dir = self.store_path(&layout::blocks_path(volume));
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if let Some(checksum) = name.strip_suffix(".blk") {
                        blocks.insert(checksum.to_string());
                    }
                }
            }
        }
        blocks
    }
}

fn block_of(byte: u8) -> Vec<u8> {
    vec![byte; DEFAULT_BLOCK_SIZE as usize]
}

#[tokio::test]
async fn register_creates_store_config_and_is_idempotent() {
    let harness = Harness::new().await;

    // S1: the store config exists and records the defaults.
    let cfg_path = harness.store_path(&layout::objectstore_config_path());
    let raw = std::fs::read(&cfg_path).unwrap();
    let cfg: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(cfg["Kind"], "vfs");
    assert_eq!(cfg["BlockSize"], 2097152);
    assert_eq!(cfg["UUID"], harness.store_id.to_string());

    // Registering again against the same store returns the same UUID and
    // leaves the remote config unchanged.
    let opts = HashMap::from([(
        "vfs.path".to_string(),
        harness.store_dir.path().display().to_string(),
    )]);
    let (second_id, block_size) =
        objectstore::register(harness.root.path(), "vfs", &opts, &harness.table)
            .await
            .unwrap();
    assert_eq!(second_id, harness.store_id);
    assert_eq!(block_size, DEFAULT_BLOCK_SIZE);
    assert_eq!(std::fs::read(&cfg_path).unwrap(), raw);
}

#[tokio::test]
async fn add_volume_lays_out_the_subtree() {
    let mut harness = Harness::new().await;
    let volume = Uuid::parse_str("00112233-4455-6677-8899-aabbccddaaaa").unwrap();
    harness.make_volume(volume, 4 * MIB).await;

    // S2: fanned-out path, size recorded, no last snapshot.
    let cfg_path = harness.store_path(
        "rancher-objectstore/volumes/00/11/00112233-4455-6677-8899-aabbccddaaaa/volume.cfg",
    );
    let cfg: serde_json::Value =
        serde_json::from_slice(&std::fs::read(cfg_path).unwrap()).unwrap();
    assert_eq!(cfg["Size"], 4194304);
    assert_eq!(cfg["LastSnapshotID"], "");

    // Adding the same volume twice is rejected.
    let err = objectstore::add_volume(
        harness.root.path(),
        &harness.table,
        harness.store_id,
        volume,
        None,
        4 * MIB,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        Error::Store(StoreError::VolumeExists { .. })
    ));
}

#[tokio::test]
async fn full_backup_uploads_every_live_block() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 4 * MIB).await;

    // S3: two distinct blocks, checksum-named blobs, ordered manifest.
    let a = block_of(0x41);
    let b = block_of(0x42);
    harness.storage.write_volume(volume, 0, &a);
    harness.storage.write_volume(volume, 2 * MIB, &b);
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();

    let expected: HashSet<String> = [util::checksum(&a), util::checksum(&b)].into();
    assert_eq!(harness.stored_blocks(volume), expected);

    let map = harness.snapshot_map(s1, volume);
    assert_eq!(map.id, s1);
    assert_eq!(map.blocks.len(), 2);
    assert_eq!(map.blocks[0].offset, 0);
    assert_eq!(map.blocks[0].checksum, util::checksum(&a));
    assert_eq!(map.blocks[1].offset, 2 * MIB);
    assert_eq!(map.blocks[1].checksum, util::checksum(&b));

    assert_eq!(harness.remote_volume(volume).last_snapshot_id, Some(s1));
    assert!(harness.storage.open.is_empty(), "snapshot left open");
}

#[tokio::test]
async fn incremental_backup_uploads_only_changed_blocks() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 4 * MIB).await;

    let a = block_of(0x41);
    let b = block_of(0x42);
    harness.storage.write_volume(volume, 0, &a);
    harness.storage.write_volume(volume, 2 * MIB, &b);
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();

    // S4: overwrite the first block, back up again.
    let c = block_of(0x43);
    harness.storage.write_volume(volume, 0, &c);
    let s2 = harness.snapshot(volume).await;
    harness.backup(s2, volume).await.unwrap();

    let expected: HashSet<String> = [
        util::checksum(&a),
        util::checksum(&b),
        util::checksum(&c),
    ]
    .into();
    assert_eq!(harness.stored_blocks(volume), expected);

    let map = harness.snapshot_map(s2, volume);
    assert_eq!(map.blocks.len(), 2);
    assert_eq!(map.blocks[0].offset, 0);
    assert_eq!(map.blocks[0].checksum, util::checksum(&c));
    assert_eq!(map.blocks[1].offset, 2 * MIB);
    assert_eq!(map.blocks[1].checksum, util::checksum(&b));

    assert_eq!(harness.remote_volume(volume).last_snapshot_id, Some(s2));

    // Manifest invariants: strictly increasing block-aligned offsets, and
    // every referenced blob present in the store.
    for map in [harness.snapshot_map(s1, volume), harness.snapshot_map(s2, volume)] {
        for window in map.blocks.windows(2) {
            assert!(window[0].offset < window[1].offset);
        }
        for block in &map.blocks {
            assert_eq!(block.offset % DEFAULT_BLOCK_SIZE, 0);
            assert!(harness
                .store_path(&layout::block_path(volume, &block.checksum))
                .exists());
        }
    }
}

#[tokio::test]
async fn restore_reproduces_snapshot_content() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 4 * MIB).await;

    let b = block_of(0x42);
    let c = block_of(0x43);
    harness.storage.write_volume(volume, 0, &block_of(0x41));
    harness.storage.write_volume(volume, 2 * MIB, &b);
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();

    harness.storage.write_volume(volume, 0, &c);
    let s2 = harness.snapshot(volume).await;
    harness.backup(s2, volume).await.unwrap();

    // S5: restore the incremental snapshot onto a fresh volume.
    let target = Uuid::new_v4();
    harness
        .storage
        .create_volume(target, None, 4 * MIB)
        .await
        .unwrap();
    harness.restore(s2, volume, target).await.unwrap();

    assert_eq!(
        harness.storage.read_volume(target, 0, 2 * MIB as usize),
        c
    );
    assert_eq!(
        harness
            .storage
            .read_volume(target, 2 * MIB, 2 * MIB as usize),
        b
    );
}

#[tokio::test]
async fn remove_snapshot_collects_only_unreferenced_blocks() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 4 * MIB).await;

    let a = block_of(0x41);
    let b = block_of(0x42);
    let c = block_of(0x43);
    harness.storage.write_volume(volume, 0, &a);
    harness.storage.write_volume(volume, 2 * MIB, &b);
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();

    harness.storage.write_volume(volume, 0, &c);
    let s2 = harness.snapshot(volume).await;
    harness.backup(s2, volume).await.unwrap();

    // S6: dropping S1 reclaims only the block S2 no longer references.
    objectstore::remove_snapshot(
        harness.root.path(),
        &harness.table,
        s1,
        volume,
        harness.store_id,
    )
    .await
    .unwrap();

    let expected: HashSet<String> = [util::checksum(&b), util::checksum(&c)].into();
    assert_eq!(harness.stored_blocks(volume), expected);
    assert!(!harness
        .store_path(&layout::snapshot_config_path(s1, volume))
        .exists());
    assert_eq!(harness.remote_volume(volume).last_snapshot_id, Some(s2));

    // Every surviving manifest still resolves to stored blobs.
    for block in harness.snapshot_map(s2, volume).blocks {
        assert!(harness
            .store_path(&layout::block_path(volume, &block.checksum))
            .exists());
    }

    // Dropping the last snapshot clears the volume pointer and empties the
    // blocks subtree.
    objectstore::remove_snapshot(
        harness.root.path(),
        &harness.table,
        s2,
        volume,
        harness.store_id,
    )
    .await
    .unwrap();
    assert_eq!(harness.remote_volume(volume).last_snapshot_id, None);
    assert!(harness.stored_blocks(volume).is_empty());
}

#[tokio::test]
async fn identical_rewrite_uploads_nothing_new() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 4 * MIB).await;

    let a = block_of(0x41);
    harness.storage.write_volume(volume, 0, &a);
    harness.storage.write_volume(volume, 2 * MIB, &block_of(0x42));
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();
    let before = harness.stored_blocks(volume);

    // Rewrite offset 0 with identical bytes. The file driver sees no delta
    // at all; even a full walk would dedup against the existing blobs.
    harness.storage.write_volume(volume, 0, &a);
    let s2 = harness.snapshot(volume).await;
    harness.backup(s2, volume).await.unwrap();

    assert_eq!(harness.stored_blocks(volume), before);
    // The merged manifest still covers the whole volume.
    assert_eq!(harness.snapshot_map(s2, volume).blocks.len(), 2);
}

#[tokio::test]
async fn rebackup_of_same_snapshot_is_rejected() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 2 * MIB).await;

    harness.storage.write_volume(volume, 0, &block_of(0x41));
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();

    let err = harness.backup(s1, volume).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Store(StoreError::SnapshotExists { .. })
    ));
    assert!(harness.storage.open.is_empty());
}

#[tokio::test]
async fn block_size_mismatch_rejects_backup_without_uploads() {
    let mut harness = Harness::with_driver_block_size(MIB).await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 4 * MIB).await;

    harness.storage.write_volume(volume, 0, &block_of(0x41));
    let s1 = harness.snapshot(volume).await;

    let err = harness.backup(s1, volume).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Store(StoreError::BlockSizeMismatch {
            driver: 1048576,
            store: 2097152,
        })
    ));
    assert!(harness.stored_blocks(volume).is_empty());
    assert!(harness.storage.open.is_empty());
}

#[tokio::test]
async fn missing_local_parent_falls_back_to_full_backup() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 4 * MIB).await;

    harness.storage.write_volume(volume, 0, &block_of(0x41));
    harness.storage.write_volume(volume, 2 * MIB, &block_of(0x42));
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();

    // The parent disappears locally; the engine must fall back to a full
    // backup instead of failing.
    harness.storage.delete_snapshot(s1, volume).await.unwrap();

    harness.storage.write_volume(volume, 0, &block_of(0x43));
    let s2 = harness.snapshot(volume).await;
    harness.backup(s2, volume).await.unwrap();

    let map = harness.snapshot_map(s2, volume);
    assert_eq!(map.blocks.len(), 2, "full manifest expected");
}

#[tokio::test]
async fn incremental_restore_equals_full_restore() {
    // Incremental chain.
    let mut incremental = Harness::new().await;
    let volume = Uuid::new_v4();
    incremental.make_volume(volume, 4 * MIB).await;
    incremental.storage.write_volume(volume, 0, &block_of(0x51));
    incremental
        .storage
        .write_volume(volume, 2 * MIB, &block_of(0x52));
    let s1 = incremental.snapshot(volume).await;
    incremental.backup(s1, volume).await.unwrap();
    incremental.storage.write_volume(volume, 0, &block_of(0x53));
    let s2 = incremental.snapshot(volume).await;
    incremental.backup(s2, volume).await.unwrap();

    let target = Uuid::new_v4();
    incremental
        .storage
        .create_volume(target, None, 4 * MIB)
        .await
        .unwrap();
    incremental.restore(s2, volume, target).await.unwrap();
    let via_incremental = incremental.storage.read_volume(target, 0, 4 * MIB as usize);

    // Same end state backed up with no parent.
    let mut full = Harness::new().await;
    let volume2 = Uuid::new_v4();
    full.make_volume(volume2, 4 * MIB).await;
    full.storage.write_volume(volume2, 0, &block_of(0x53));
    full.storage.write_volume(volume2, 2 * MIB, &block_of(0x52));
    let s3 = full.snapshot(volume2).await;
    full.backup(s3, volume2).await.unwrap();

    let target2 = Uuid::new_v4();
    full.storage
        .create_volume(target2, None, 4 * MIB)
        .await
        .unwrap();
    full.restore(s3, volume2, target2).await.unwrap();
    let via_full = full.storage.read_volume(target2, 0, 4 * MIB as usize);

    assert_eq!(via_incremental, via_full);
}

#[tokio::test]
async fn remove_volume_deletes_the_subtree() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 2 * MIB).await;

    harness.storage.write_volume(volume, 0, &block_of(0x41));
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();

    objectstore::remove_volume(harness.root.path(), &harness.table, harness.store_id, volume)
        .await
        .unwrap();
    assert!(!harness.store_path(&layout::volume_path(volume)).exists());

    let err =
        objectstore::remove_volume(harness.root.path(), &harness.table, harness.store_id, volume)
            .await
            .unwrap_err();
    assert!(matches!(
        err,
        Error::Store(StoreError::VolumeNotFound { .. })
    ));
}

#[tokio::test]
async fn list_volume_reports_backed_up_snapshots() {
    let mut harness = Harness::new().await;
    let volume = Uuid::new_v4();
    harness.make_volume(volume, 2 * MIB).await;

    harness.storage.write_volume(volume, 0, &block_of(0x41));
    let s1 = harness.snapshot(volume).await;
    harness.backup(s1, volume).await.unwrap();

    let listed = objectstore::list_volume(
        harness.root.path(),
        &harness.table,
        harness.store_id,
        volume,
        None,
    )
    .await
    .unwrap()
    .expect("volume is in the store");
    assert_eq!(listed.id, volume);
    assert_eq!(listed.size, 2 * MIB);
    assert_eq!(listed.last_snapshot_id, Some(s1));
    assert_eq!(listed.snapshots, vec![s1]);

    let missing = objectstore::list_volume(
        harness.root.path(),
        &harness.table,
        harness.store_id,
        Uuid::new_v4(),
        None,
    )
    .await
    .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn deregister_drops_local_handles_only() {
    let harness = Harness::new().await;

    objectstore::deregister(harness.root.path(), harness.store_id)
        .await
        .unwrap();

    // Local copies are gone, the remote store is untouched.
    assert!(!util::config_exists(
        harness.root.path(),
        &layout::local_config_name(harness.store_id)
    ));
    assert!(harness
        .store_path(&layout::objectstore_config_path())
        .exists());
}
