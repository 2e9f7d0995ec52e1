use crate::error::{Result, SyncError};
use crate::storage::{BucketHandle, StorageConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 规范化指纹：去掉引号与空白，统一小写
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_ascii_lowercase()
}

/// 远程对象清单：存储桶解析与对象列表
pub struct RemoteInventory {
    connection: Arc<dyn StorageConnection>,
}

impl RemoteInventory {
    pub fn new(connection: Arc<dyn StorageConnection>) -> Self {
        Self { connection }
    }

    /// 按名称查找存储桶，不存在时在指定区域创建
    pub async fn resolve(&self, bucket: &str, region: &str) -> Result<BucketHandle> {
        let resolution_error = |message: String| SyncError::BucketResolution {
            bucket: bucket.to_string(),
            message,
        };

        let existing = self
            .connection
            .get_bucket(bucket)
            .await
            .map_err(|e| resolution_error(format!("{:#}", e)))?;

        if let Some(handle) = existing {
            debug!("使用已有存储桶: {}", bucket);
            return Ok(handle);
        }

        info!("存储桶 {} 不存在，在 {} 创建", bucket, region);
        self.connection
            .create_bucket(bucket, region)
            .await
            .map_err(|e| resolution_error(format!("{:#}", e)))
    }

    /// 列出存储桶内全部对象：key -> 规范化后的指纹
    ///
    /// 没有 ETag 的对象不出现在结果中，之后会被当作需要上传。
    pub async fn list_objects(&self, handle: &BucketHandle) -> Result<HashMap<String, String>> {
        let objects = self
            .connection
            .list_objects(handle)
            .await
            .map_err(|e| SyncError::BucketResolution {
                bucket: handle.name.clone(),
                message: format!("list objects: {:#}", e),
            })?;

        let inventory: HashMap<_, _> = objects
            .into_iter()
            .filter_map(|object| {
                let etag = object.etag.as_deref().map(normalize_fingerprint)?;
                Some((object.key, etag))
            })
            .collect();

        info!("远程清单: {} 中 {} 个对象", handle.name, inventory.len());
        Ok(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ConnectionSettings, Connector, MemoryConnector, StorageCall};

    async fn inventory(connector: &MemoryConnector) -> RemoteInventory {
        RemoteInventory::new(
            connector
                .connect(&ConnectionSettings::default())
                .await
                .unwrap(),
        )
    }

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("\"ABCdef123\""), "abcdef123");
        assert_eq!(normalize_fingerprint(" 123abcdef "), "123abcdef");
    }

    #[tokio::test]
    async fn test_resolve_existing_bucket_does_not_create() {
        let connector = MemoryConnector::new().with_bucket("leaky");
        let handle = inventory(&connector)
            .await
            .resolve("leaky", "elsewhere")
            .await
            .unwrap();

        assert_eq!(handle.name, "leaky");
        assert_eq!(connector.calls(), vec![StorageCall::GetBucket("leaky".into())]);
    }

    #[tokio::test]
    async fn test_resolve_creates_missing_bucket() {
        let connector = MemoryConnector::new();
        inventory(&connector)
            .await
            .resolve("leaky", "elsewhere")
            .await
            .unwrap();

        assert_eq!(
            connector.created_buckets(),
            vec![("leaky".to_string(), "elsewhere".to_string())]
        );
    }

    #[tokio::test]
    async fn test_resolve_failure_is_fatal() {
        let connector = MemoryConnector::new();
        connector.fail_bucket_lookup();
        let err = inventory(&connector)
            .await
            .resolve("leaky", "elsewhere")
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(connector.created_buckets().is_empty());
    }

    #[tokio::test]
    async fn test_list_objects_normalizes_etags() {
        let connector = MemoryConnector::new().with_bucket("b");
        connector.insert_object("b", "storage/tmp/foo", "ABCDEF123");
        let inventory = inventory(&connector).await;
        let handle = inventory.resolve("b", "").await.unwrap();

        let objects = inventory.list_objects(&handle).await.unwrap();
        assert_eq!(objects["storage/tmp/foo"], "abcdef123");
    }
}
