//! Error types for thinvol.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

// Re-export the parser error from the thin-delta crate
pub use thin_delta::DeltaError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage driver error: {0}")]
    Storage(#[from] StorageError),

    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Local storage driver errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("volume not found: {0}")]
    VolumeNotFound(Uuid),

    #[error("volume already exists: {0}")]
    VolumeExists(Uuid),

    #[error("volume {volume} still has {snapshots} snapshot(s)")]
    VolumeBusy { volume: Uuid, snapshots: usize },

    #[error("snapshot {snapshot} not found on volume {volume}")]
    SnapshotNotFound { snapshot: Uuid, volume: Uuid },

    #[error("snapshot {snapshot} already exists on volume {volume}")]
    SnapshotExists { snapshot: Uuid, volume: Uuid },

    #[error("image not found: {0}")]
    ImageNotFound(Uuid),

    #[error("image already activated: {0}")]
    ImageExists(Uuid),

    #[error("image {image} is still referenced by volume {volume}")]
    ImageBusy { image: Uuid, volume: Uuid },

    #[error("volume size {size} differs from base image size {image_size}")]
    SizeMismatch { size: u64, image_size: u64 },

    #[error("invalid volume size {size}: must be a positive multiple of {multiple}")]
    InvalidSize { size: u64, multiple: u64 },

    #[error("{command} failed: {message}")]
    Command { command: &'static str, message: String },

    #[error("thin delta parse error: {0}")]
    Delta(#[from] DeltaError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Backup engine and object-store driver errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot find {path} in object store")]
    NotFound { path: String },

    #[error("volume {volume} already exists in object store {store}")]
    VolumeExists { volume: Uuid, store: Uuid },

    #[error("volume {volume} doesn't exist in object store {store}")]
    VolumeNotFound { volume: Uuid, store: Uuid },

    #[error("snapshot {snapshot} already exists in object store {store}")]
    SnapshotExists { snapshot: Uuid, store: Uuid },

    #[error("driver block size {driver} differs from object store block size {store}")]
    BlockSizeMismatch { driver: u64, store: u64 },

    #[error("object store holds a {stored} config, asked to register as {requested}")]
    KindMismatch { stored: String, requested: String },

    #[error("access denied: {path}")]
    AccessDenied { path: String },

    #[error("storage backend error: {message}")]
    Backend { message: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to write config file {path}: {source}")]
    WriteError { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    #[error("unsupported driver kind: {0}")]
    UnsupportedKind(String),

    #[error("driver {0} has already been registered")]
    DuplicateKind(String),

    #[error("another daemon holds the lock on {0}")]
    Locked(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_ids() {
        let volume = Uuid::new_v4();
        let err = StorageError::VolumeBusy {
            volume,
            snapshots: 2,
        };
        assert!(err.to_string().contains(&volume.to_string()));
        assert!(err.to_string().contains('2'));
    }

    #[test]
    fn store_error_wraps_backend_messages() {
        let err = StoreError::backend("connection reset");
        assert!(err.to_string().contains("connection reset"));
    }
}
