pub mod local;
pub mod memory;
pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use local::{LocalConnection, LocalConnector};
pub use memory::{MemoryConnection, MemoryConnector, StorageCall};
pub use s3::{S3Connection, S3Connector};

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, list 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- 上传
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 存储提供方
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Aws,
    Local,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Aws => write!(f, "AWS"),
            Provider::Local => write!(f, "Local"),
        }
    }
}

/// 连接凭证
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub region: String,
}

// 不在日志中泄露密钥
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("region", &self.region)
            .finish()
    }
}

/// 建立连接所需的全部参数
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    pub credentials: Credentials,
    /// S3 兼容服务的地址；本地存储时为根目录
    pub endpoint: Option<String>,
}

/// 已解析的远程存储桶，一次同步运行内有效
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHandle {
    pub name: String,
    pub region: String,
}

/// 远程对象信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteObject {
    pub key: String,
    /// 后端返回的原始 ETag，可能带引号
    pub etag: Option<String>,
}

/// 存储连接抽象接口
#[async_trait]
pub trait StorageConnection: Send + Sync {
    /// 按名称查找存储桶，不存在时返回 None
    async fn get_bucket(&self, name: &str) -> Result<Option<BucketHandle>>;

    /// 在指定区域创建存储桶
    async fn create_bucket(&self, name: &str, location: &str) -> Result<BucketHandle>;

    /// 列出存储桶内全部对象（分页由实现处理）
    async fn list_objects(&self, bucket: &BucketHandle) -> Result<Vec<RemoteObject>>;

    /// 以单次写入上传本地文件，内容从磁盘流式读取
    ///
    /// `size` 为扫描后重新 stat 得到的长度。
    async fn put_object(
        &self,
        bucket: &BucketHandle,
        key: &str,
        source: &Path,
        size: u64,
    ) -> Result<()>;

    /// 获取连接名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据凭证建立存储连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn StorageConnection>>;
}

/// 按 provider 分发的默认连接器
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn StorageConnection>> {
        create_connection(settings).await
    }
}

/// 根据配置创建存储连接
pub async fn create_connection(
    settings: &ConnectionSettings,
) -> Result<Arc<dyn StorageConnection>> {
    match settings.credentials.provider {
        Provider::Aws => S3Connector.connect(settings).await,
        Provider::Local => LocalConnector.connect(settings).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_secret() {
        let credentials = Credentials {
            provider: Provider::Aws,
            access_key_id: "my-access".into(),
            secret_access_key: "my-secret".into(),
            region: "somewhere".into(),
        };

        let printed = format!("{:?}", credentials);
        assert!(printed.contains("my-access"));
        assert!(!printed.contains("my-secret"));
    }

    #[test]
    fn test_provider_serde() {
        let provider: Provider = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(provider, Provider::Local);
        assert_eq!(Provider::Aws.to_string(), "AWS");
    }
}
