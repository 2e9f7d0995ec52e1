//! 同步配置

use crate::core::scanner::{root_name, ScanConfig};
use crate::error::SyncError;
use crate::logging::LogConfig;
use crate::storage::{ConnectionSettings, Credentials};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 一次同步运行的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfiguration {
    /// 本地根目录，按顺序处理
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    /// 远程路径前缀
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// S3 兼容服务地址；local provider 时为根目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// 每个目录的最大并发哈希数
    #[serde(default = "default_max_concurrent_hashes")]
    pub max_concurrent_hashes: usize,
    /// 最大并发上传数
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 单个文件上传的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_max_concurrent_hashes() -> usize {
    8
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

impl Default for SyncConfiguration {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            prefix: String::new(),
            bucket: String::new(),
            credentials: Credentials::default(),
            endpoint: None,
            max_concurrent_hashes: default_max_concurrent_hashes(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            scan: ScanConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SyncConfiguration {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            ..Default::default()
        }
    }

    /// 添加一个根目录
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directories.push(dir.into());
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// 从 JSON 文件加载配置
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// 用 AWS_* 环境变量补全缺失的凭证
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fill = |field: &mut String, names: &[&str]| {
            if field.is_empty() {
                if let Some(value) = names.iter().find_map(|&name| lookup(name)) {
                    *field = value;
                }
            }
        };

        fill(&mut self.credentials.access_key_id, &["AWS_ACCESS_KEY_ID"]);
        fill(
            &mut self.credentials.secret_access_key,
            &["AWS_SECRET_ACCESS_KEY"],
        );
        fill(
            &mut self.credentials.region,
            &["AWS_REGION", "AWS_DEFAULT_REGION"],
        );
    }

    /// 运行前校验
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.directories.is_empty() {
            return Err(SyncError::Config(
                "at least one directory must be configured".to_string(),
            ));
        }

        if self.bucket.trim().is_empty() {
            return Err(SyncError::Config("bucket name is empty".to_string()));
        }

        // 根目录名进入存储 key，同名会互相覆盖
        let mut seen: HashMap<String, &Path> = HashMap::new();
        for dir in &self.directories {
            let Some(name) = root_name(dir) else {
                return Err(SyncError::Config(format!(
                    "cannot derive a name for directory '{}'",
                    dir.display()
                )));
            };
            if let Some(previous) = seen.insert(name.clone(), dir) {
                return Err(SyncError::Config(format!(
                    "directories '{}' and '{}' both map to '{}'",
                    previous.display(),
                    dir.display(),
                    name
                )));
            }
        }

        Ok(())
    }

    /// 建立存储连接所需参数
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            credentials: self.credentials.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Provider;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: SyncConfiguration =
            serde_json::from_str(r#"{"directories": ["tmp"], "bucket": "leaky"}"#).unwrap();

        assert_eq!(config.prefix, "");
        assert_eq!(config.credentials.provider, Provider::Aws);
        assert_eq!(config.max_concurrent_uploads, 4);
        assert!(config.scan.exclude_patterns.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_json() {
        let config: SyncConfiguration = serde_json::from_str(
            r#"{
                "directories": ["tmp", "/srv/files"],
                "prefix": "storage",
                "bucket": "leaky",
                "credentials": {
                    "provider": "aws",
                    "accessKeyId": "my-access",
                    "secretAccessKey": "my-secret",
                    "region": "somewhere"
                },
                "maxRetries": 0,
                "scan": {"excludePatterns": ["*.tmp"]},
                "log": {"level": "debug"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.directories.len(), 2);
        assert_eq!(config.credentials.access_key_id, "my-access");
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.scan.exclude_patterns, vec!["*.tmp"]);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_validate_requires_directory() {
        let err = SyncConfiguration::new("leaky").validate().unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_validate_requires_bucket() {
        let config = SyncConfiguration::new(" ").with_directory("tmp");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_root_names() {
        let config = SyncConfiguration::new("leaky")
            .with_directory("a/tmp")
            .with_directory("b/tmp");
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_env_fills_only_missing_credentials() {
        let mut config = SyncConfiguration::new("leaky");
        config.credentials.region = "somewhere".into();

        config.apply_env_from(|name| match name {
            "AWS_ACCESS_KEY_ID" => Some("env-access".into()),
            "AWS_SECRET_ACCESS_KEY" => Some("env-secret".into()),
            "AWS_REGION" => Some("env-region".into()),
            _ => None,
        });

        assert_eq!(config.credentials.access_key_id, "env-access");
        assert_eq!(config.credentials.secret_access_key, "env-secret");
        assert_eq!(config.credentials.region, "somewhere");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(&path, r#"{"directories": ["tmp"], "bucket": "leaky", "prefix": "box"}"#)
            .unwrap();

        let config = SyncConfiguration::load(&path).unwrap();
        assert_eq!(config.prefix, "box");
        assert!(SyncConfiguration::load(&dir.path().join("missing.json")).is_err());
    }
}
