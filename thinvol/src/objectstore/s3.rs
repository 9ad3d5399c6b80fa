//! S3-compatible object store, backed by the `object_store` crate.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, StoreError};
use crate::util;

use super::driver::{ObjectStoreDriver, ObjectStoreInit};

pub const KIND: &str = "s3";

pub const OPT_ACCESS_KEY: &str = "s3.access_key";
pub const OPT_SECRET_KEY: &str = "s3.secret_key";
pub const OPT_REGION: &str = "s3.region";
pub const OPT_BUCKET: &str = "s3.bucket";
pub const OPT_PATH: &str = "s3.path";

const ENV_AWS_ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
const ENV_AWS_SECRET_KEY: &str = "AWS_SECRET_ACCESS_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(rename = "UUID", with = "util::uuid_or_empty")]
    id: Option<Uuid>,
    #[serde(rename = "Region")]
    region: String,
    #[serde(rename = "Bucket")]
    bucket: String,
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "AccessKey")]
    access_key: String,
    #[serde(rename = "SecretKey")]
    secret_key: String,
}

pub struct S3Driver {
    config: S3Config,
    client: Arc<AmazonS3>,
}

pub struct S3Init;

#[async_trait]
impl ObjectStoreInit for S3Init {
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
            let config: S3Config = util::load_config(root, cfg_name)?;
            let client = build_client(&config)?;
            return Ok(Box::new(S3Driver { config, client }));
        }

        let opt = |key: &'static str| -> Result<String, StoreError> {
            opts.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or(StoreError::Config(ConfigError::MissingOption(key)))
        };
        let opt_or_env = |key: &'static str, env_key: &str| {
            opts.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .or_else(|| env::var(env_key).ok())
                .unwrap_or_default()
        };

        let config = S3Config {
            id: None,
            region: opt(OPT_REGION)?,
            bucket: opt(OPT_BUCKET)?,
            path: opt(OPT_PATH)?,
            access_key: opt_or_env(OPT_ACCESS_KEY, ENV_AWS_ACCESS_KEY),
            secret_key: opt_or_env(OPT_SECRET_KEY, ENV_AWS_SECRET_KEY),
        };

        let client = build_client(&config)?;
        let driver = S3Driver { config, client };

        // Probe the bucket so bad credentials fail at registration instead
        // of halfway through a backup.
        driver.list("").await?;
        Ok(Box::new(driver))
    }
}

fn build_client(config: &S3Config) -> Result<Arc<AmazonS3>, StoreError> {
    let mut builder = AmazonS3Builder::from_env()
        .with_region(&config.region)
        .with_bucket_name(&config.bucket);
    if !config.access_key.is_empty() {
        builder = builder.with_access_key_id(&config.access_key);
    }
    if !config.secret_key.is_empty() {
        builder = builder.with_secret_access_key(&config.secret_key);
    }
    let client = builder.build().map_err(StoreError::backend)?;
    Ok(Arc::new(client))
}

fn map_store_error(path: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound {
            path: path.to_string(),
        },
        other => StoreError::backend(other),
    }
}

impl S3Driver {
    fn store_path(&self, path: &str) -> StorePath {
        if path.is_empty() {
            StorePath::from(self.config.path.as_str())
        } else {
            StorePath::from(format!("{}/{}", self.config.path, path))
        }
    }
}

#[async_trait]
impl ObjectStoreDriver for S3Driver {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn finalize_init(&mut self, root: &Path, cfg_name: &str, id: Uuid) -> Result<(), StoreError> {
        self.config.id = Some(id);
        util::save_config(root, cfg_name, &self.config)?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> bool {
        self.file_size(path).await.is_some()
    }

    async fn file_size(&self, path: &str) -> Option<u64> {
        let meta = self.client.head(&self.store_path(path)).await.ok()?;
        Some(meta.size as u64)
    }

    async fn mkdir_all(&self, _path: &str) -> Result<(), StoreError> {
        // Object keys carry their own hierarchy.
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Bytes, StoreError> {
        let result = self
            .client
            .get(&self.store_path(path))
            .await
            .map_err(|e| map_store_error(path, e))?;
        result.bytes().await.map_err(|e| map_store_error(path, e))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), StoreError> {
        self.client
            .put(&self.store_path(path), PutPayload::from(data))
            .await
            .map_err(|e| map_store_error(path, e))?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        match self.client.delete(&self.store_path(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_error(path, e)),
        }
    }

    async fn remove_all(&self, path: &str) -> Result<(), StoreError> {
        let prefix = self.store_path(path);
        let mut listing = self.client.list(Some(&prefix));
        let mut keys = Vec::new();
        while let Some(meta) = listing.next().await {
            keys.push(meta.map_err(|e| map_store_error(path, e))?.location);
        }
        for key in keys {
            match self.client.delete(&key).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_store_error(path, e)),
            }
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let prefix = self.store_path(path);
        let result = self
            .client
            .list_with_delimiter(Some(&prefix))
            .await
            .map_err(|e| map_store_error(path, e))?;

        let mut names = Vec::new();
        for dir in result.common_prefixes {
            if let Some(name) = dir.parts().last() {
                names.push(name.as_ref().to_string());
            }
        }
        for object in result.objects {
            if let Some(name) = object.location.parts().last() {
                names.push(name.as_ref().to_string());
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn init_requires_bucket_region_and_path() {
        let err = match S3Init
            .init(
                Path::new("/nonexistent-root"),
                None,
                &opts(&[(OPT_BUCKET, "b"), (OPT_PATH, "p")]),
            )
            .await
        {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            StoreError::Config(ConfigError::MissingOption(OPT_REGION))
        ));
    }

    #[test]
    fn store_paths_are_rooted_at_the_prefix() {
        let config = S3Config {
            id: None,
            region: "us-east-1".to_string(),
            bucket: "bucket".to_string(),
            path: "backups/site-a".to_string(),
            access_key: "key".to_string(),
            secret_key: "secret".to_string(),
        };
        let client = build_client(&config).unwrap();
        let driver = S3Driver { config, client };

        assert_eq!(
            driver.store_path("rancher-objectstore/objectstore.cfg").as_ref(),
            "backups/site-a/rancher-objectstore/objectstore.cfg"
        );
        assert_eq!(driver.store_path("").as_ref(), "backups/site-a");
    }
}
