use super::{BucketHandle, ConnectionSettings, Connector, RemoteObject, StorageConnection};
use crate::core::hasher::fingerprint_file;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use walkdir::WalkDir;

/// 上传中的临时文件所在目录，位于所有存储桶之外
const STAGING_DIR: &str = ".bucket-sync-tmp";

/// 本地文件系统模拟的对象存储：每个存储桶是 base_path 下的一个目录
pub struct LocalConnection {
    base_path: PathBuf,
    region: String,
    name: String,
}

impl LocalConnection {
    pub fn new(path: &str, region: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self {
            base_path,
            region: region.to_string(),
            name,
        })
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        Self::ensure_relative(bucket)?;
        if bucket == STAGING_DIR {
            return Err(anyhow!("bucket name is reserved: {}", bucket));
        }
        Ok(self.base_path.join(bucket))
    }

    fn object_path(&self, bucket: &BucketHandle, key: &str) -> Result<PathBuf> {
        let key = key.trim_start_matches('/');
        Self::ensure_relative(key)?;
        Ok(self.bucket_path(&bucket.name)?.join(key))
    }

    /// 拒绝能逃出 base_path 的名称
    fn ensure_relative(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(anyhow!("empty path"));
        }
        let escapes = Path::new(path)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(anyhow!("path escapes storage root: {}", path));
        }
        Ok(())
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }
}

#[async_trait]
impl StorageConnection for LocalConnection {
    async fn get_bucket(&self, name: &str) -> Result<Option<BucketHandle>> {
        let path = self.bucket_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(BucketHandle {
                name: name.to_string(),
                region: self.region.clone(),
            })),
            Ok(_) => Err(anyhow!("{} exists but is not a directory", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_bucket(&self, name: &str, location: &str) -> Result<BucketHandle> {
        fs::create_dir_all(self.bucket_path(name)?).await?;
        Ok(BucketHandle {
            name: name.to_string(),
            region: location.to_string(),
        })
    }

    async fn list_objects(&self, bucket: &BucketHandle) -> Result<Vec<RemoteObject>> {
        let base = self.bucket_path(&bucket.name)?;

        // 使用 spawn_blocking 避免阻塞 async runtime
        let objects = tokio::task::spawn_blocking(move || {
            WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    let relative = entry.path().strip_prefix(&base).ok()?.to_str()?;
                    Some(RemoteObject {
                        key: Self::normalize_path(relative),
                        etag: fingerprint_file(entry.path()).ok(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .await?;

        Ok(objects)
    }

    async fn put_object(
        &self,
        bucket: &BucketHandle,
        key: &str,
        source: &Path,
        _size: u64,
    ) -> Result<()> {
        let full_path = self.object_path(bucket, key)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 先复制到存储桶外的临时文件，再原子重命名
        let staging = self.base_path.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        let temp_path = staging.join(uuid::Uuid::new_v4().to_string());

        if let Err(e) = fs::copy(source, &temp_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        fs::rename(&temp_path, &full_path).await?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 本地存储连接器，endpoint 为根目录
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn StorageConnection>> {
        let path = settings
            .endpoint
            .as_ref()
            .ok_or_else(|| anyhow!("Local storage requires endpoint (base directory)"))?;
        tracing::info!("初始化本地存储: {}", path);
        Ok(
            Arc::new(LocalConnection::new(path, &settings.credentials.region)?)
                as Arc<dyn StorageConnection>,
        )
    }
}
