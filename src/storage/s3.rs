use super::{
    BucketHandle, ConnectionSettings, Connector, RemoteObject, StorageConnection,
    IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials as AwsCredentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// us-east-1 不接受 LocationConstraint
const DEFAULT_REGION: &str = "us-east-1";

/// S3 连接
///
/// 存储桶的查找、创建与对象写入走 aws-sdk-s3，对象列表走 opendal。
pub struct S3Connection {
    client: Client,
    access_key_id: String,
    secret_access_key: String,
    endpoint: Option<String>,
    operators: Mutex<HashMap<String, Operator>>,
    name: String,
}

impl S3Connection {
    pub fn new(settings: &ConnectionSettings) -> Result<Self> {
        let credentials = &settings.credentials;
        if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
            return Err(anyhow!("S3 connection requires accessKeyId and secretAccessKey"));
        }

        let region = if credentials.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            credentials.region.clone()
        };

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(AwsCredentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                None,
                None,
                "bucket-sync",
            ));

        if let Some(ref ep) = settings.endpoint {
            builder = builder.endpoint_url(ep).force_path_style(true);
        }

        let name = format!(
            "s3://{}{}",
            region,
            settings
                .endpoint
                .as_deref()
                .map(|e| format!("@{}", e))
                .unwrap_or_default()
        );

        Ok(Self {
            client: Client::from_conf(builder.build()),
            access_key_id: credentials.access_key_id.clone(),
            secret_access_key: credentials.secret_access_key.clone(),
            endpoint: settings.endpoint.clone(),
            operators: Mutex::new(HashMap::new()),
            name,
        })
    }

    /// 获取（或创建）指定存储桶的 opendal Operator
    fn operator(&self, bucket: &BucketHandle) -> Result<Operator> {
        let mut operators = self
            .operators
            .lock()
            .map_err(|_| anyhow!("operator cache lock poisoned"))?;

        if let Some(op) = operators.get(&bucket.name) {
            return Ok(op.clone());
        }

        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(&bucket.name)
            .region(&bucket.region)
            .access_key_id(&self.access_key_id)
            .secret_access_key(&self.secret_access_key);

        if let Some(ref ep) = self.endpoint {
            builder = builder.endpoint(ep);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        operators.insert(bucket.name.clone(), operator.clone());
        Ok(operator)
    }

    fn default_region(&self) -> String {
        self.client
            .config()
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }
}

#[async_trait]
impl StorageConnection for S3Connection {
    async fn get_bucket(&self, name: &str) -> Result<Option<BucketHandle>> {
        match self.client.head_bucket().bucket(name).send().await {
            Ok(_) => Ok(Some(BucketHandle {
                name: name.to_string(),
                region: self.default_region(),
            })),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(anyhow!(
                        "head bucket {}: {}",
                        name,
                        DisplayErrorContext(&service_error)
                    ))
                }
            }
        }
    }

    async fn create_bucket(&self, name: &str, location: &str) -> Result<BucketHandle> {
        let mut request = self.client.create_bucket().bucket(name);

        if !location.is_empty() && location != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(location))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| anyhow!("create bucket {}: {}", name, DisplayErrorContext(&e)))?;

        Ok(BucketHandle {
            name: name.to_string(),
            region: if location.is_empty() {
                self.default_region()
            } else {
                location.to_string()
            },
        })
    }

    async fn list_objects(&self, bucket: &BucketHandle) -> Result<Vec<RemoteObject>> {
        let operator = self.operator(bucket)?;
        let mut objects = Vec::new();

        // lister 内部处理 ListObjectsV2 的续页
        let mut lister = operator
            .lister_with("")
            .recursive(true)
            .metakey(Metakey::Mode | Metakey::Etag)
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let meta = entry.metadata();
            if meta.is_dir() {
                continue;
            }

            let key = entry.path().trim_start_matches('/').to_string();
            if key.is_empty() {
                continue;
            }

            objects.push(RemoteObject {
                key,
                etag: meta.etag().map(|s| s.to_string()),
            });
        }

        debug!("{} 中列出 {} 个对象", bucket.name, objects.len());
        Ok(objects)
    }

    async fn put_object(
        &self,
        bucket: &BucketHandle,
        key: &str,
        source: &Path,
        size: u64,
    ) -> Result<()> {
        // 单次 PutObject，ETag 与内容 MD5 一致
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| anyhow!("open {}: {}", source.display(), e))?;

        let request = self
            .client
            .put_object()
            .bucket(&bucket.name)
            .key(key)
            .content_length(size as i64)
            .body(body)
            .send();

        tokio::time::timeout(Duration::from_secs(IO_TIMEOUT_SECS), request)
            .await
            .map_err(|_| anyhow!("put object {}: timed out", key))?
            .map_err(|e| anyhow!("put object {}: {}", key, DisplayErrorContext(&e)))?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// S3 连接器
#[derive(Debug, Clone, Copy, Default)]
pub struct S3Connector;

#[async_trait]
impl Connector for S3Connector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn StorageConnection>> {
        tracing::info!(
            "初始化S3连接: region={}, endpoint={:?}",
            settings.credentials.region,
            settings.endpoint
        );
        Ok(Arc::new(S3Connection::new(settings)?) as Arc<dyn StorageConnection>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Credentials, Provider};

    #[test]
    fn test_new_requires_keys() {
        let settings = ConnectionSettings {
            credentials: Credentials {
                provider: Provider::Aws,
                region: "somewhere".into(),
                ..Default::default()
            },
            endpoint: None,
        };

        assert!(S3Connection::new(&settings).is_err());
    }

    #[test]
    fn test_name_includes_region_and_endpoint() {
        let settings = ConnectionSettings {
            credentials: Credentials {
                provider: Provider::Aws,
                access_key_id: "my-access".into(),
                secret_access_key: "my-secret".into(),
                region: "somewhere".into(),
            },
            endpoint: Some("http://localhost:9000".into()),
        };

        let connection = S3Connection::new(&settings).unwrap();
        assert_eq!(connection.name(), "s3://somewhere@http://localhost:9000");
    }
}
