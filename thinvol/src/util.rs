//! Shared primitives: block checksums, atomic JSON config files, the
//! daemon's advisory lock and loopback device helpers.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha512};
use tokio::process::Command;

use crate::error::{ConfigError, StorageError};

/// Hex characters kept from the full SHA-512 digest.
const PRESERVED_CHECKSUM_LENGTH: usize = 64;

const CONFIG_DIR_MODE: u32 = 0o700;

/// Checksum of a block: SHA-512, hex encoded, truncated to 64 characters.
pub fn checksum(data: &[u8]) -> String {
    let digest = Sha512::digest(data);
    let mut hex = hex::encode(digest);
    hex.truncate(PRESERVED_CHECKSUM_LENGTH);
    hex
}

fn config_path(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

/// Load a JSON config file from under `root`.
pub fn load_config<T: DeserializeOwned>(root: &Path, name: &str) -> Result<T, ConfigError> {
    let data = fs::read(config_path(root, name)).map_err(ConfigError::ReadError)?;
    serde_json::from_slice(&data).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Save a JSON config file under `root` with atomic replace semantics.
///
/// The record is staged to `<name>.tmp` and renamed over the final path so a
/// crash mid-write never leaves a truncated config behind.
pub fn save_config<T: Serialize>(root: &Path, name: &str, value: &T) -> Result<(), ConfigError> {
    mkdir_if_not_exists(root).map_err(|source| ConfigError::WriteError {
        path: root.to_path_buf(),
        source,
    })?;

    let path = config_path(root, name);
    let tmp_path = config_path(root, &format!("{name}.tmp"));
    let data =
        serde_json::to_vec(value).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    fs::write(&tmp_path, data).map_err(|source| ConfigError::WriteError {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, &path).map_err(|source| ConfigError::WriteError { path, source })
}

pub fn config_exists(root: &Path, name: &str) -> bool {
    config_path(root, name).exists()
}

pub fn remove_config(root: &Path, name: &str) -> Result<(), ConfigError> {
    match fs::remove_file(config_path(root, name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConfigError::ReadError(e)),
    }
}

/// List the IDs embedded in config file names of the form
/// `<prefix><id><suffix>` directly under `root`.
pub fn list_config_ids(root: &Path, prefix: &str, suffix: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| {
            let name = entry.ok()?.file_name().into_string().ok()?;
            let id = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
            if id.is_empty() {
                None
            } else {
                Some(id.to_string())
            }
        })
        .collect()
}

pub fn mkdir_if_not_exists(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(CONFIG_DIR_MODE))?;
    }
    Ok(())
}

/// Exclusive advisory lock on a file, held for the lifetime of the value.
///
/// A second daemon on the same root fails fast instead of corrupting shared
/// state. The kernel drops the lock when the file handle closes.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: &Path) -> Result<Self, ConfigError> {
        let file = File::create(path).map_err(ConfigError::ReadError)?;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(ConfigError::Locked(path.to_path_buf()));
        }
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Attach a loopback device to `file`, returning the allocated device path.
pub async fn attach_loopback_device(
    file: &Path,
    read_only: bool,
) -> Result<PathBuf, StorageError> {
    let mut cmd = Command::new("losetup");
    cmd.arg("--find").arg("--show");
    if read_only {
        cmd.arg("--read-only");
    }
    cmd.arg(file);

    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(StorageError::Command {
            command: "losetup",
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if device.is_empty() {
        return Err(StorageError::Command {
            command: "losetup",
            message: "no device reported".to_string(),
        });
    }
    Ok(PathBuf::from(device))
}

/// Detach a loopback device, verifying it is still backed by `file`.
pub async fn detach_loopback_device(file: &Path, device: &Path) -> Result<(), StorageError> {
    let output = Command::new("losetup").arg(device).output().await?;
    if !output.status.success() {
        return Err(StorageError::Command {
            command: "losetup",
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    let described = String::from_utf8_lossy(&output.stdout);
    let backing = format!("({})", file.display());
    if !described.trim().ends_with(&backing) {
        return Err(StorageError::Command {
            command: "losetup",
            message: format!(
                "device {} is not backed by {}",
                device.display(),
                file.display()
            ),
        });
    }

    let output = Command::new("losetup").arg("-d").arg(device).output().await?;
    if !output.status.success() {
        return Err(StorageError::Command {
            command: "losetup",
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Serde adapter persisting `Option<Uuid>` as the on-disk empty-string
/// convention used by every config record.
pub mod uuid_or_empty {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(value: &Option<Uuid>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(id) => serializer.serialize_str(&id.to_string()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Uuid>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        Uuid::parse_str(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
