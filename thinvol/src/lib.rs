//! thinvol: thin-provisioned block volume manager with incremental,
//! content-addressed backup to a pluggable object store.
//!
//! Volumes and snapshots live in a device-mapper thin pool; each snapshot
//! can be backed up as deduplicated fixed-size blocks plus an ordered
//! manifest, and restored onto a fresh volume.
//!
//! # Library Usage
//!
//! The primary API for running thinvol is the [`Daemon`] struct:
//!
//! ```ignore
//! use thinvol::{Config, Daemon};
//!
//! let config = Config::default();
//! let daemon = Daemon::from_config(config).await?;
//! ```

pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod objectstore;
pub mod storage;
pub mod util;

pub use config::{Config, DriverConfig};
pub use daemon::Daemon;
pub use error::{ConfigError, Error, Result, StorageError, StoreError};
pub use objectstore::{ObjectStoreDriver, DEFAULT_BLOCK_SIZE};
pub use storage::{StorageDriver, VolumeInfo};

pub use thin_delta;
