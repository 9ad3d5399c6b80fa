//! Object-store driver abstraction.
//!
//! A driver exposes path-keyed blob primitives over some remote byte store.
//! It knows nothing about snapshots or blocks; the backup engine composes
//! those on top. Drivers are constructed through a [`DriverTable`] built at
//! program start, keyed by the driver's `kind` string.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::{ConfigError, StoreError};

/// Path-keyed blob primitives over a remote store.
///
/// All paths are forward-slash-separated logical paths within the store.
/// Implementations are expected to be idempotent under retries at the
/// network edge; `write` must have atomic replace semantics for the final
/// path.
#[async_trait]
pub trait ObjectStoreDriver: Send + Sync {
    /// Stable string identifying the driver variant.
    fn kind(&self) -> &'static str;

    /// Persist the local driver config under `root` once the store UUID is
    /// known.
    fn finalize_init(&mut self, root: &Path, cfg_name: &str, id: Uuid) -> Result<(), StoreError>;

    async fn file_exists(&self, path: &str) -> bool;

    /// Byte length of the blob at `path`, or `None` if absent.
    async fn file_size(&self, path: &str) -> Option<u64>;

    /// Idempotent creation of all intermediate directories. A no-op for
    /// stores without a directory concept.
    async fn mkdir_all(&self, path: &str) -> Result<(), StoreError>;

    async fn read(&self, path: &str) -> Result<Bytes, StoreError>;

    async fn write(&self, path: &str, data: Bytes) -> Result<(), StoreError>;

    /// Delete a single leaf. Removing a non-empty directory is an error.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Delete a subtree.
    async fn remove_all(&self, path: &str) -> Result<(), StoreError>;

    /// Names of the direct children of `path`, excluding `.` and `..`.
    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError>;
}

/// Constructor for one driver kind.
///
/// With `cfg_name` set, the driver is restored from its local config under
/// `root`; otherwise it is built fresh from `opts` and probed.
#[async_trait]
pub trait ObjectStoreInit: Send + Sync {
    async fn init(
        &self,
        root: &Path,
        cfg_name: Option<&str>,
        opts: &HashMap<String, String>,
    ) -> Result<Box<dyn ObjectStoreDriver>, StoreError>;
}

/// Registry of object-store driver initializers, keyed by kind.
#[derive(Default)]
pub struct DriverTable {
    inits: HashMap<String, Box<dyn ObjectStoreInit>>,
}

impl DriverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initializer. Registering the same kind twice is a hard
    /// error.
    pub fn register(
        &mut self,
        kind: &str,
        init: Box<dyn ObjectStoreInit>,
    ) -> Result<(), ConfigError> {
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
        cfg_name: Option<&str>,
        opts: &HashMap<String, String>,
    ) -> Result<Box<dyn ObjectStoreDriver>, StoreError> {
        let init = self
            .inits
            .get(kind)
            .ok_or_else(|| StoreError::Config(ConfigError::UnsupportedKind(kind.to_string())))?;
        init.init(root, cfg_name, opts).await
    }
}
