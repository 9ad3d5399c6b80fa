//! Thin wrappers around `dmsetup` and `pdata_tools`.
//!
//! The thin-provisioning kernel primitives are driven through the standard
//! userspace tools rather than raw ioctls. Every wrapper surfaces the tool's
//! stderr on a non-zero exit status.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::StorageError;

pub const DM_DIR: &str = "/dev/mapper";

pub const SECTOR_SIZE: u64 = 512;

/// Low-water-mark for the thin-pool target, in pool blocks.
const LOW_WATER_MARK: u64 = 32768;

/// Kernel device path for a device-mapper name.
pub fn device_path(name: &str) -> PathBuf {
    Path::new(DM_DIR).join(name)
}

async fn run(command: &'static str, args: &[String]) -> Result<String, StorageError> {
    debug!(command, ?args, "running");
    let output = Command::new(command).args(args).output().await?;
    if !output.status.success() {
        return Err(StorageError::Command {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn dmsetup(args: &[String]) -> Result<String, StorageError> {
    run("dmsetup", args).await
}

/// Size of a block device in bytes.
pub async fn block_device_size(dev: &Path) -> Result<u64, StorageError> {
    let out = run(
        "blockdev",
        &["--getsize64".to_string(), dev.display().to_string()],
    )
    .await?;
    out.trim()
        .parse::<u64>()
        .map_err(|e| StorageError::Command {
            command: "blockdev",
            message: format!("unparseable size {:?}: {e}", out.trim()),
        })
}

/// Create the thin-pool device over a data and a metadata device.
pub async fn create_pool(
    pool_name: &str,
    data_dev: &Path,
    metadata_dev: &Path,
    block_size_sectors: u64,
    size_bytes: u64,
) -> Result<(), StorageError> {
    let table = format!(
        "0 {} thin-pool {} {} {} {}",
        size_bytes / SECTOR_SIZE,
        metadata_dev.display(),
        data_dev.display(),
        block_size_sectors,
        LOW_WATER_MARK,
    );
    dmsetup(&[
        "create".to_string(),
        pool_name.to_string(),
        "--table".to_string(),
        table,
    ])
    .await?;
    Ok(())
}

async fn pool_message(pool_dev: &Path, message: String) -> Result<(), StorageError> {
    dmsetup(&[
        "message".to_string(),
        pool_dev.display().to_string(),
        "0".to_string(),
        message,
    ])
    .await?;
    Ok(())
}

/// Allocate a thin device in the pool.
pub async fn create_device(pool_dev: &Path, dev_id: u32) -> Result<(), StorageError> {
    pool_message(pool_dev, format!("create_thin {dev_id}")).await
}

/// Allocate a snapshot device of `origin_dev_id` in the pool.
///
/// The origin's kernel device is suspended around the message so the
/// snapshot captures a quiesced view.
pub async fn create_snap_device(
    pool_dev: &Path,
    dev_id: u32,
    origin_name: &str,
    origin_dev_id: u32,
) -> Result<(), StorageError> {
    dmsetup(&["suspend".to_string(), origin_name.to_string()]).await?;
    let result = pool_message(pool_dev, format!("create_snap {dev_id} {origin_dev_id}")).await;
    let resume = dmsetup(&["resume".to_string(), origin_name.to_string()]).await;
    result?;
    resume?;
    Ok(())
}

/// Delete a thin device from the pool's metadata.
pub async fn delete_device(pool_dev: &Path, dev_id: u32) -> Result<(), StorageError> {
    pool_message(pool_dev, format!("delete {dev_id}")).await
}

/// Map a thin device into the kernel under `/dev/mapper/<name>`.
///
/// With `external_origin` set, unprovisioned reads fall through to the
/// origin device instead of returning zeros.
pub async fn activate_device(
    pool_dev: &Path,
    name: &str,
    dev_id: u32,
    size_bytes: u64,
    external_origin: Option<&Path>,
) -> Result<(), StorageError> {
    let mut table = format!(
        "0 {} thin {} {dev_id}",
        size_bytes / SECTOR_SIZE,
        pool_dev.display(),
    );
    if let Some(origin) = external_origin {
        table.push_str(&format!(" {}", origin.display()));
    }
    dmsetup(&[
        "create".to_string(),
        name.to_string(),
        "--table".to_string(),
        table,
    ])
    .await?;
    Ok(())
}

/// Tear down a kernel device previously mapped with [`activate_device`] or
/// [`create_pool`].
pub async fn remove_device(name: &str) -> Result<(), StorageError> {
    dmsetup(&["remove".to_string(), name.to_string()]).await?;
    Ok(())
}

/// Dump the delta between two thin devices from the pool metadata.
///
/// `old_dev_id` maps to thin_delta's `--snap1` and `new_dev_id` to
/// `--snap2`, matching the orientation the parser expects.
pub async fn thin_delta(
    metadata_dev: &Path,
    old_dev_id: u32,
    new_dev_id: u32,
) -> Result<String, StorageError> {
    run(
        "pdata_tools",
        &[
            "thin_delta".to_string(),
            "--snap1".to_string(),
            old_dev_id.to_string(),
            "--snap2".to_string(),
            new_dev_id.to_string(),
            metadata_dev.display().to_string(),
        ],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_paths_live_under_dev_mapper() {
        assert_eq!(
            device_path("thinvol-pool"),
            PathBuf::from("/dev/mapper/thinvol-pool")
        );
    }

    #[tokio::test]
    async fn failed_command_surfaces_stderr() {
        let err = run("dmsetup", &["definitely-not-a-subcommand".to_string()])
            .await
            .unwrap_err();
        match err {
            // dmsetup missing entirely in the test environment
            StorageError::Io(_) => {}
            StorageError::Command { command, .. } => assert_eq!(command, "dmsetup"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
