//! Control protocol for thinvold <-> thinvolctl communication over a Unix
//! domain socket, one JSON request/response per line.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::objectstore::RemoteVolumeInfo;
use crate::storage::VolumeInfo;

/// Request from thinvolctl to thinvold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Driver and daemon information.
    Info,
    /// Create a volume; a fresh UUID is minted when `id` is absent.
    VolumeCreate {
        id: Option<Uuid>,
        size: u64,
        base: Option<Uuid>,
    },
    VolumeDelete {
        id: Uuid,
    },
    /// List one volume, or all of them.
    VolumeList {
        id: Option<Uuid>,
    },
    SnapshotCreate {
        id: Option<Uuid>,
        volume: Uuid,
    },
    SnapshotDelete {
        id: Uuid,
        volume: Uuid,
    },
    ImageActivate {
        id: Option<Uuid>,
        file: PathBuf,
    },
    ImageDeactivate {
        id: Uuid,
    },
    StoreRegister {
        kind: String,
        opts: HashMap<String, String>,
    },
    StoreDeregister {
        id: Uuid,
    },
    StoreAddVolume {
        store: Uuid,
        volume: Uuid,
    },
    StoreRemoveVolume {
        store: Uuid,
        volume: Uuid,
    },
    StoreListVolume {
        store: Uuid,
        volume: Uuid,
        snapshot: Option<Uuid>,
    },
    BackupCreate {
        snapshot: Uuid,
        volume: Uuid,
        store: Uuid,
    },
    BackupRestore {
        snapshot: Uuid,
        volume: Uuid,
        target: Uuid,
        store: Uuid,
    },
    BackupRemove {
        snapshot: Uuid,
        volume: Uuid,
        store: Uuid,
    },
}

/// Response from thinvold to thinvolctl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    /// UUID of a freshly created volume, snapshot or image.
    Created(Uuid),
    Info(serde_json::Value),
    Volumes(Vec<VolumeInfo>),
    Registered { store: Uuid, block_size: u64 },
    RemoteVolume(Option<RemoteVolumeInfo>),
}
