use crate::core::comparator::{SkipReason, SyncAction, UploadAction};
use crate::error::{Result, SyncError};
use crate::storage::{BucketHandle, StorageConnection};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// 单次重试等待的上限（毫秒）
const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// 上传配置
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    /// 只分类不上传
    pub dry_run: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay_ms: 500,
            dry_run: false,
        }
    }
}

/// 单个文件的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum FileOutcome {
    Uploaded { path: String, key: String, bytes: u64 },
    Skipped { path: String, reason: SkipReason },
    /// dry-run 下本应上传
    Planned { path: String, key: String },
    Failed { path: String, key: String, error: String },
    /// 运行取消时尚未上传
    Cancelled { path: String, key: String },
}

impl FileOutcome {
    pub fn path(&self) -> &str {
        match self {
            FileOutcome::Uploaded { path, .. }
            | FileOutcome::Skipped { path, .. }
            | FileOutcome::Planned { path, .. }
            | FileOutcome::Failed { path, .. }
            | FileOutcome::Cancelled { path, .. } => path,
        }
    }
}

/// 一次上传的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResult {
    Uploaded { bytes: u64 },
    Vanished,
}

/// 上传器
pub struct Uploader {
    connection: Arc<dyn StorageConnection>,
    bucket: BucketHandle,
    config: UploaderConfig,
    cancelled: Arc<AtomicBool>,
}

impl Uploader {
    pub fn new(
        connection: Arc<dyn StorageConnection>,
        bucket: BucketHandle,
        config: UploaderConfig,
    ) -> Self {
        Self {
            connection,
            bucket,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 共享外部的取消标志
    pub fn with_cancel(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// 上传单个文件，不重试
    ///
    /// 文件已不存在时不发起任何网络调用。内容相同的重复上传没有副作用，
    /// 失败后可以直接再次调用。
    pub async fn upload(&self, action: &UploadAction) -> Result<UploadResult> {
        if !action.record.exists() {
            debug!("文件已消失，跳过上传: {}", action.record.relative_path);
            return Ok(UploadResult::Vanished);
        }

        let size = match tokio::fs::metadata(&action.record.absolute_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(UploadResult::Vanished),
            Err(e) => return Err(self.upload_error(action, &e)),
        };

        debug!("上传: {} -> {} ({}字节)", action.record.relative_path, action.key, size);

        self.connection
            .put_object(&self.bucket, &action.key, &action.record.absolute_path, size)
            .await
            .map_err(|e| self.upload_error(action, &format!("{:#}", e)))?;

        Ok(UploadResult::Uploaded { bytes: size })
    }

    /// 第 attempt 次失败后的等待时间，指数增长并封顶
    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self
            .config
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY_MS);
        Duration::from_millis(delay)
    }

    fn upload_error(&self, action: &UploadAction, message: &dyn std::fmt::Display) -> SyncError {
        SyncError::TransientUpload {
            key: action.key.clone(),
            message: message.to_string(),
        }
    }

    /// 执行一个动作（带重试），返回文件级结果
    pub async fn execute(&self, action: SyncAction) -> FileOutcome {
        let upload = match action {
            SyncAction::Skip { path, reason } => return FileOutcome::Skipped { path, reason },
            SyncAction::Upload(upload) => upload,
        };

        let path = upload.record.relative_path.clone();
        let key = upload.key.clone();

        if self.config.dry_run {
            return if upload.record.exists() {
                FileOutcome::Planned { path, key }
            } else {
                FileOutcome::Skipped {
                    path,
                    reason: SkipReason::VanishedLocally,
                }
            };
        }

        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if self.cancelled.load(Ordering::SeqCst) {
                return FileOutcome::Cancelled { path, key };
            }

            match self.upload(&upload).await {
                Ok(UploadResult::Uploaded { bytes }) => {
                    return FileOutcome::Uploaded { path, key, bytes };
                }
                Ok(UploadResult::Vanished) => {
                    return FileOutcome::Skipped {
                        path,
                        reason: SkipReason::VanishedLocally,
                    };
                }
                Err(e) => {
                    last_error = e.to_string();

                    if attempt < self.config.max_retries {
                        let delay = self.retry_delay(attempt);
                        warn!(
                            "上传失败，{}ms 后重试 ({}/{}): {}",
                            delay.as_millis(),
                            attempt + 1,
                            self.config.max_retries,
                            last_error
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        error!("上传最终失败 (已重试{}次): {}", self.config.max_retries, last_error);
                    }
                }
            }
        }

        FileOutcome::Failed {
            path,
            key,
            error: last_error,
        }
    }
}
