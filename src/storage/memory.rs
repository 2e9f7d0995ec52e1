//! 内存存储 - 记录所有调用，供测试与演练使用

use crate::core::hasher::fingerprint_bytes;
use super::{
    BucketHandle, ConnectionSettings, Connector, Credentials, RemoteObject, StorageConnection,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// 对存储连接的一次调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    GetBucket(String),
    CreateBucket { key: String, location: String },
    ListObjects(String),
    PutObject { key: String, body: Bytes },
}

#[derive(Debug, Clone)]
struct MemoryObject {
    etag: String,
    body: Bytes,
}

#[derive(Debug, Default)]
struct MemoryState {
    buckets: HashMap<String, BTreeMap<String, MemoryObject>>,
    calls: Vec<StorageCall>,
    connections: Vec<Credentials>,
    failing_keys: HashSet<String>,
    refuse_connections: bool,
    fail_bucket_lookup: bool,
    /// 成功写入达到次数后置位的标志
    cancel_after_puts: Option<(usize, Arc<AtomicBool>)>,
    puts: usize,
}

/// 内存连接器，所有由它创建的连接共享同一份状态
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// 预先创建一个存储桶
    pub fn with_bucket(self, name: &str) -> Self {
        self.lock().buckets.entry(name.to_string()).or_default();
        self
    }

    /// 放入一个带指定 ETag 的远程对象（存储桶不存在时自动创建）
    pub fn insert_object(&self, bucket: &str, key: &str, etag: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            MemoryObject {
                etag: etag.to_string(),
                body: Bytes::new(),
            },
        );
    }

    /// 让指定 key 的写入失败
    pub fn fail_puts_for(&self, key: &str) {
        self.lock().failing_keys.insert(key.to_string());
    }

    /// 恢复指定 key 的写入
    pub fn allow_puts_for(&self, key: &str) {
        self.lock().failing_keys.remove(key);
    }

    /// 拒绝建立连接
    pub fn refuse_connections(&self) {
        self.lock().refuse_connections = true;
    }

    /// 让存储桶查找报错（模拟鉴权失败）
    pub fn fail_bucket_lookup(&self) {
        self.lock().fail_bucket_lookup = true;
    }

    /// 成功写入 `count` 次后置位 `flag`（用于在运行中途取消）
    pub fn cancel_after_puts(&self, count: usize, flag: Arc<AtomicBool>) {
        self.lock().cancel_after_puts = Some((count, flag));
    }

    /// 所有调用，按发生顺序
    pub fn calls(&self) -> Vec<StorageCall> {
        self.lock().calls.clone()
    }

    /// 每次建立连接时使用的凭证
    pub fn connections(&self) -> Vec<Credentials> {
        self.lock().connections.clone()
    }

    /// 所有成功写入的 (key, body)
    pub fn uploads(&self) -> Vec<(String, Bytes)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StorageCall::PutObject { key, body } => Some((key.clone(), body.clone())),
                _ => None,
            })
            .collect()
    }

    /// 所有创建存储桶的调用
    pub fn created_buckets(&self) -> Vec<(String, String)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StorageCall::CreateBucket { key, location } => {
                    Some((key.clone(), location.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// 清空调用记录，保留存储内容
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// 读取对象内容
    pub fn object_body(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.body.clone())
    }

    /// 存储桶内所有 key
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn StorageConnection>> {
        let mut state = self.lock();
        state.connections.push(settings.credentials.clone());
        if state.refuse_connections {
            return Err(anyhow!("connection refused"));
        }
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
        }) as Arc<dyn StorageConnection>)
    }
}

/// 内存连接
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    async fn get_bucket(&self, name: &str) -> Result<Option<BucketHandle>> {
        let mut state = lock_state(&self.state);
        state.calls.push(StorageCall::GetBucket(name.to_string()));
        if state.fail_bucket_lookup {
            return Err(anyhow!("access denied"));
        }
        Ok(state.buckets.contains_key(name).then(|| BucketHandle {
            name: name.to_string(),
            region: String::new(),
        }))
    }

    async fn create_bucket(&self, name: &str, location: &str) -> Result<BucketHandle> {
        let mut state = lock_state(&self.state);
        state.calls.push(StorageCall::CreateBucket {
            key: name.to_string(),
            location: location.to_string(),
        });
        state.buckets.entry(name.to_string()).or_default();
        Ok(BucketHandle {
            name: name.to_string(),
            region: location.to_string(),
        })
    }

    async fn list_objects(&self, bucket: &BucketHandle) -> Result<Vec<RemoteObject>> {
        let mut state = lock_state(&self.state);
        state.calls.push(StorageCall::ListObjects(bucket.name.clone()));
        let objects = state
            .buckets
            .get(&bucket.name)
            .ok_or_else(|| anyhow!("no such bucket: {}", bucket.name))?;
        Ok(objects
            .iter()
            .map(|(key, object)| RemoteObject {
                key: key.clone(),
                // 与 S3 一致，ETag 带引号返回
                etag: Some(format!("\"{}\"", object.etag)),
            })
            .collect())
    }

    async fn put_object(
        &self,
        bucket: &BucketHandle,
        key: &str,
        source: &Path,
        _size: u64,
    ) -> Result<()> {
        let body = Bytes::from(tokio::fs::read(source).await?);

        let mut state = lock_state(&self.state);
        if state.failing_keys.contains(key) {
            return Err(anyhow!("simulated write failure"));
        }
        let etag = fingerprint_bytes(&body);
        state
            .buckets
            .get_mut(&bucket.name)
            .ok_or_else(|| anyhow!("no such bucket: {}", bucket.name))?
            .insert(
                key.to_string(),
                MemoryObject {
                    etag,
                    body: body.clone(),
                },
            );
        state.calls.push(StorageCall::PutObject {
            key: key.to_string(),
            body,
        });

        state.puts += 1;
        if let Some((count, flag)) = &state.cancel_after_puts {
            if state.puts >= *count {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
