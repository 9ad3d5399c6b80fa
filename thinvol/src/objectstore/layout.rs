//! On-store path layout.
//!
//! Everything lives under a single well-known root prefix. Volume IDs and
//! block checksums are fanned out on their first two and next two hex
//! characters to bound directory width; the slicing is part of the wire
//! format and must not change.

use uuid::Uuid;

pub const OBJECTSTORE_BASE: &str = "rancher-objectstore";
pub const OBJECTSTORE_CONFIG_FILE: &str = "objectstore.cfg";
pub const VOLUME_DIRECTORY: &str = "volumes";
pub const VOLUME_CONFIG_FILE: &str = "volume.cfg";
pub const SNAPSHOTS_DIRECTORY: &str = "snapshots";
pub const SNAPSHOT_CONFIG_PREFIX: &str = "snapshot_";
pub const BLOCKS_DIRECTORY: &str = "blocks";
pub const BLOCK_FILE_SUFFIX: &str = ".blk";
pub const CFG_SUFFIX: &str = ".cfg";

const FANOUT_LAYER1: usize = 2;
const FANOUT_LAYER2: usize = 4;

pub fn objectstore_config_path() -> String {
    format!("{OBJECTSTORE_BASE}/{OBJECTSTORE_CONFIG_FILE}")
}

pub fn volume_base_path() -> String {
    format!("{OBJECTSTORE_BASE}/{VOLUME_DIRECTORY}")
}

fn fanout(id: &str) -> (&str, &str) {
    (&id[..FANOUT_LAYER1], &id[FANOUT_LAYER1..FANOUT_LAYER2])
}

pub fn volume_path(volume_id: Uuid) -> String {
    let id = volume_id.to_string();
    let (layer1, layer2) = fanout(&id);
    format!("{}/{layer1}/{layer2}/{id}", volume_base_path())
}

pub fn volume_config_path(volume_id: Uuid) -> String {
    format!("{}/{VOLUME_CONFIG_FILE}", volume_path(volume_id))
}

pub fn snapshots_path(volume_id: Uuid) -> String {
    format!("{}/{SNAPSHOTS_DIRECTORY}", volume_path(volume_id))
}

pub fn snapshot_config_name(snapshot_id: Uuid) -> String {
    format!("{SNAPSHOT_CONFIG_PREFIX}{snapshot_id}{CFG_SUFFIX}")
}

pub fn snapshot_config_path(snapshot_id: Uuid, volume_id: Uuid) -> String {
    format!(
        "{}/{}",
        snapshots_path(volume_id),
        snapshot_config_name(snapshot_id)
    )
}

/// Snapshot ID embedded in a `snapshot_<id>.cfg` file name, if any.
pub fn parse_snapshot_config_name(name: &str) -> Option<Uuid> {
    let id = name
        .strip_prefix(SNAPSHOT_CONFIG_PREFIX)?
        .strip_suffix(CFG_SUFFIX)?;
    Uuid::parse_str(id).ok()
}

pub fn blocks_path(volume_id: Uuid) -> String {
    format!("{}/{BLOCKS_DIRECTORY}", volume_path(volume_id))
}

pub fn block_path(volume_id: Uuid, checksum: &str) -> String {
    let (layer1, layer2) = fanout(checksum);
    format!(
        "{}/{layer1}/{layer2}/{checksum}{BLOCK_FILE_SUFFIX}",
        blocks_path(volume_id)
    )
}

/// Name of the local copy of an object-store record.
pub fn local_config_name(store_id: Uuid) -> String {
    format!("objectstore_{store_id}{CFG_SUFFIX}")
}

/// Name of the local driver-specific config for an object store.
pub fn local_driver_config_name(store_id: Uuid, kind: &str) -> String {
    format!("objectstore_{store_id}_{kind}{CFG_SUFFIX}")
}
