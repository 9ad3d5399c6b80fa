//! POSIX-filesystem-backed object store.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, StoreError};
use crate::util;

use super::driver::{ObjectStoreDriver, ObjectStoreInit};

pub const KIND: &str = "vfs";

pub const OPT_PATH: &str = "vfs.path";

#[derive(Debug, Serialize, Deserialize)]
pub struct VfsDriver {
    #[serde(rename = "UUID", with = "util::uuid_or_empty")]
    id: Option<Uuid>,
    #[serde(rename = "Path")]
    path: PathBuf,
}

pub struct VfsInit;

#[async_trait]
impl ObjectStoreInit for VfsInit {
    async fn init(
        &self,
        root: &Path,
        cfg_name: Option<&str>,
        opts: &HashMap<String, String>,
    ) -> Result<Box<dyn ObjectStoreDriver>, StoreError> {
        if let Some(cfg_name) = cfg_name {
            if !util::config_exists(root, cfg_name) {
                return Err(StoreError::Config(ConfigError::InvalidValue {
                    field: "objectstore",
                    reason: format!("missing local config {cfg_name}"),
                }));
            }
            let driver: VfsDriver = util::load_config(root, cfg_name)?;
            return Ok(Box::new(driver));
        }

        let path = opts
            .get(OPT_PATH)
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingOption(OPT_PATH))
            .map_err(StoreError::Config)?;
        let path = PathBuf::from(path);
        std::fs::create_dir_all(&path).map_err(|e| map_io(&path.display().to_string(), e))?;
        Ok(Box::new(VfsDriver { id: None, path }))
    }
}

fn map_io(path: &str, err: io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound {
            path: path.to_string(),
        },
        io::ErrorKind::PermissionDenied => StoreError::AccessDenied {
            path: path.to_string(),
        },
        _ => StoreError::Io(err),
    }
}

impl VfsDriver {
    fn local_path(&self, path: &str) -> PathBuf {
        self.path.join(path)
    }
}

#[async_trait]
impl ObjectStoreDriver for VfsDriver {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn finalize_init(&mut self, root: &Path, cfg_name: &str, id: Uuid) -> Result<(), StoreError> {
        self.id = Some(id);
        util::save_config(root, cfg_name, self)?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> bool {
        self.local_path(path).exists()
    }

    async fn file_size(&self, path: &str) -> Option<u64> {
        let meta = tokio::fs::metadata(self.local_path(path)).await.ok()?;
        meta.is_file().then(|| meta.len())
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(self.local_path(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn read(&self, path: &str) -> Result<Bytes, StoreError> {
        let data = tokio::fs::read(self.local_path(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), StoreError> {
        // Stage to a sibling temp file and rename so readers never observe a
        // partially written blob.
        let final_path = self.local_path(path);
        let tmp_path = final_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| map_io(path, e))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let local = self.local_path(path);
        let result = match tokio::fs::metadata(&local).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(&local).await,
            Ok(_) => tokio::fs::remove_file(&local).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| map_io(path, e))
    }

    async fn remove_all(&self, path: &str) -> Result<(), StoreError> {
        let local = self.local_path(path);
        let result = match tokio::fs::metadata(&local).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&local).await,
            Ok(_) => tokio::fs::remove_file(&local).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| map_io(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = tokio::fs::read_dir(self.local_path(path))
            .await
            .map_err(|e| map_io(path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(path, e))? {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn make_driver(store_dir: &Path) -> Box<dyn ObjectStoreDriver> {
        let opts = HashMap::from([(OPT_PATH.to_string(), store_dir.display().to_string())]);
        VfsInit
            .init(Path::new("/nonexistent-root"), None, &opts)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let driver = make_driver(dir.path()).await;

        driver.mkdir_all("a/b").await.unwrap();
        driver
            .write("a/b/blob", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert!(driver.file_exists("a/b/blob").await);
        assert_eq!(driver.file_size("a/b/blob").await, Some(5));
        assert_eq!(driver.read("a/b/blob").await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn missing_blob_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let driver = make_driver(dir.path()).await;

        assert!(!driver.file_exists("nope").await);
        assert_eq!(driver.file_size("nope").await, None);
        assert!(matches!(
            driver.read("nope").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn write_replaces_existing_content() {
        let dir = TempDir::new().unwrap();
        let driver = make_driver(dir.path()).await;

        driver.write("blob", Bytes::from_static(b"one")).await.unwrap();
        driver.write("blob", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(driver.read("blob").await.unwrap().as_ref(), b"two");
    }

    #[tokio::test]
    async fn remove_refuses_non_empty_directory() {
        let dir = TempDir::new().unwrap();
        let driver = make_driver(dir.path()).await;

        driver.mkdir_all("d").await.unwrap();
        driver.write("d/blob", Bytes::from_static(b"x")).await.unwrap();

        assert!(driver.remove("d").await.is_err());
        driver.remove("d/blob").await.unwrap();
        driver.remove("d").await.unwrap();
        assert!(!driver.file_exists("d").await);
    }

    #[tokio::test]
    async fn remove_all_deletes_subtree() {
        let dir = TempDir::new().unwrap();
        let driver = make_driver(dir.path()).await;

        driver.mkdir_all("tree/inner").await.unwrap();
        driver
            .write("tree/inner/blob", Bytes::from_static(b"x"))
            .await
            .unwrap();
        driver.remove_all("tree").await.unwrap();
        assert!(!driver.file_exists("tree").await);

        // Idempotent on a missing path.
        driver.remove_all("tree").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_direct_children() {
        let dir = TempDir::new().unwrap();
        let driver = make_driver(dir.path()).await;

        driver.mkdir_all("d/sub").await.unwrap();
        driver.write("d/one", Bytes::from_static(b"1")).await.unwrap();
        driver.write("d/two", Bytes::from_static(b"2")).await.unwrap();

        let mut names = driver.list("d").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["one", "sub", "two"]);

        assert!(matches!(
            driver.list("missing").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn finalize_init_persists_local_config() {
        let store_dir = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let mut driver = make_driver(store_dir.path()).await;

        let id = Uuid::new_v4();
        driver
            .finalize_init(root.path(), "objectstore_test_vfs.cfg", id)
            .unwrap();

        let reloaded = VfsInit
            .init(root.path(), Some("objectstore_test_vfs.cfg"), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(reloaded.kind(), KIND);
        assert!(reloaded.file_exists("").await);
    }
}
