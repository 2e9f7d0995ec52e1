use crate::config::SyncConfiguration;
use crate::core::comparator::{DiffEngine, RootTarget, SkipReason, SyncAction};
use crate::core::hasher::ContentHasher;
use crate::core::inventory::RemoteInventory;
use crate::core::scanner::{root_name, LocalTreeScanner};
use crate::core::uploader::{FileOutcome, Uploader, UploaderConfig};
use crate::error::{Result, SyncError};
use crate::storage::{BucketHandle, Connector, StorageConnection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// 同步运行所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Idle,
    ConnectionEstablished,
    BucketResolved,
    Scanning,
    Hashing,
    Diffing,
    Uploading,
    Done,
    Failed,
}

/// 同步进度
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub run_id: String,
    pub phase: SyncPhase,
    /// 当前处理的根目录
    pub directory: Option<String>,
    pub files_scanned: usize,
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
}

/// 运行结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Completed,
    /// 有目录或文件失败，其余部分已完成
    CompletedWithErrors,
    Cancelled,
}

/// 单个根目录的报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryReport {
    pub root: String,
    pub root_name: String,
    pub files_scanned: usize,
    pub files: Vec<FileOutcome>,
    /// 扫描失败时的错误，此时 files 为空
    pub error: Option<String>,
}

impl DirectoryReport {
    fn new(root: &Path, root_name: &str) -> Self {
        Self {
            root: root.display().to_string(),
            root_name: root_name.to_string(),
            files_scanned: 0,
            files: Vec::new(),
            error: None,
        }
    }

    /// 按相对路径查找文件结果
    pub fn outcome(&self, path: &str) -> Option<&FileOutcome> {
        self.files.iter().find(|f| f.path() == path)
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub bucket: String,
    pub start_time: i64,
    pub end_time: i64,
    pub status: RunStatus,
    pub files_scanned: usize,
    pub files_uploaded: usize,
    pub files_planned: usize,
    pub files_skipped: HashMap<SkipReason, usize>,
    pub files_failed: usize,
    /// 因取消而未上传
    pub files_cancelled: usize,
    pub bytes_uploaded: u64,
    pub directories: Vec<DirectoryReport>,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(run_id: &str, bucket: &str, start_time: i64) -> Self {
        Self {
            run_id: run_id.to_string(),
            bucket: bucket.to_string(),
            start_time,
            end_time: start_time,
            status: RunStatus::Completed,
            files_scanned: 0,
            files_uploaded: 0,
            files_planned: 0,
            files_skipped: HashMap::new(),
            files_failed: 0,
            files_cancelled: 0,
            bytes_uploaded: 0,
            directories: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// 跳过的文件总数
    pub fn total_skipped(&self) -> usize {
        self.files_skipped.values().sum()
    }

    /// 指定原因跳过的文件数
    pub fn skipped(&self, reason: SkipReason) -> usize {
        self.files_skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// 按根目录名称查找目录报告
    pub fn directory(&self, root_name: &str) -> Option<&DirectoryReport> {
        self.directories.iter().find(|d| d.root_name == root_name)
    }

    fn absorb(&mut self, directory: DirectoryReport) {
        self.files_scanned += directory.files_scanned;

        if let Some(ref e) = directory.error {
            self.errors.push(e.clone());
        }

        for outcome in &directory.files {
            match outcome {
                FileOutcome::Uploaded { bytes, .. } => {
                    self.files_uploaded += 1;
                    self.bytes_uploaded += bytes;
                }
                FileOutcome::Planned { .. } => self.files_planned += 1,
                FileOutcome::Skipped { reason, .. } => {
                    *self.files_skipped.entry(*reason).or_default() += 1;
                }
                FileOutcome::Failed { key, error, .. } => {
                    self.files_failed += 1;
                    self.errors.push(format!("{}: {}", key, error));
                }
                FileOutcome::Cancelled { .. } => self.files_cancelled += 1,
            }
        }

        self.directories.push(directory);
    }
}

/// 一次运行内共享的只读状态
struct RunContext {
    run_id: String,
    connection: Arc<dyn StorageConnection>,
    bucket: BucketHandle,
    remote: Arc<HashMap<String, String>>,
}

/// 同步协调器
pub struct SyncCoordinator {
    config: SyncConfiguration,
    connector: Arc<dyn Connector>,
    dry_run: bool,
    cancelled: Arc<AtomicBool>,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfiguration, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            dry_run: false,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 只分类不上传
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// 取消同步，在下一个文件边界生效
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 取消标志，可交给其他任务（如 Ctrl-C 处理）
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// 检查是否已取消
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 运行一次同步
    ///
    /// 连接、存储桶解析或远程列表失败时返回错误；目录与文件级别的失败
    /// 记录在报告中。
    pub async fn run(&self, progress_tx: Option<mpsc::Sender<SyncProgress>>) -> Result<SyncReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let start_time = chrono::Utc::now().timestamp();
        let mut report = SyncReport::new(&run_id, &self.config.bucket, start_time);

        self.send_progress(&progress_tx, &run_id, SyncPhase::Idle, None, &report)
            .await;

        let context = match self.prepare(&run_id, &progress_tx, &report).await {
            Ok(context) => context,
            Err(e) => {
                error!("同步运行失败: {}", e);
                self.send_progress(&progress_tx, &run_id, SyncPhase::Failed, None, &report)
                    .await;
                return Err(e);
            }
        };

        info!(
            "开始同步 {} 个目录到 {} ({})",
            self.config.directories.len(),
            context.bucket.name,
            context.connection.name()
        );

        for root in &self.config.directories {
            if self.is_cancelled() {
                break;
            }
            let directory = self
                .sync_directory(&context, root, &progress_tx, &report)
                .await;
            report.absorb(directory);
        }

        report.end_time = chrono::Utc::now().timestamp();
        report.status = if self.is_cancelled() {
            RunStatus::Cancelled
        } else if report.errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };

        self.send_progress(&progress_tx, &run_id, SyncPhase::Done, None, &report)
            .await;

        info!(
            "同步完成: 扫描 {}, 上传 {}, 跳过 {}, 失败 {}",
            report.files_scanned,
            report.files_uploaded,
            report.total_skipped(),
            report.files_failed
        );

        Ok(report)
    }

    /// 校验配置、建立连接、解析存储桶并取得远程清单
    async fn prepare(
        &self,
        run_id: &str,
        progress_tx: &Option<mpsc::Sender<SyncProgress>>,
        report: &SyncReport,
    ) -> Result<RunContext> {
        self.config.validate()?;

        let connection = self
            .connector
            .connect(&self.config.connection_settings())
            .await
            .map_err(|e| SyncError::Connection(format!("{:#}", e)))?;
        self.send_progress(progress_tx, run_id, SyncPhase::ConnectionEstablished, None, report)
            .await;

        let inventory = RemoteInventory::new(connection.clone());
        let bucket = inventory
            .resolve(&self.config.bucket, &self.config.credentials.region)
            .await?;
        self.send_progress(progress_tx, run_id, SyncPhase::BucketResolved, None, report)
            .await;

        // 远程清单在任何上传前取一次，整次运行内不再刷新
        let remote = inventory.list_objects(&bucket).await?;

        Ok(RunContext {
            run_id: run_id.to_string(),
            connection,
            bucket,
            remote: Arc::new(remote),
        })
    }

    /// 处理单个根目录：扫描 -> 哈希 -> 比较 -> 上传
    async fn sync_directory(
        &self,
        context: &RunContext,
        root: &Path,
        progress_tx: &Option<mpsc::Sender<SyncProgress>>,
        totals: &SyncReport,
    ) -> DirectoryReport {
        // validate() 已保证每个根目录都有名称
        let name = root_name(root).unwrap_or_default();
        let mut report = DirectoryReport::new(root, &name);
        let label = Some(report.root.clone());

        self.send_progress(progress_tx, &context.run_id, SyncPhase::Scanning, label.clone(), totals)
            .await;
        let scanner = LocalTreeScanner::new(self.config.scan.clone());
        let files = match scanner.scan(root).await {
            Ok(files) => files,
            Err(e) => {
                warn!("扫描目录失败，跳过: {}", e);
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.files_scanned = files.len();

        self.send_progress(progress_tx, &context.run_id, SyncPhase::Hashing, label.clone(), totals)
            .await;
        let fingerprints = ContentHasher::new(self.config.max_concurrent_hashes)
            .hash_tree(&files)
            .await;

        self.send_progress(progress_tx, &context.run_id, SyncPhase::Diffing, label.clone(), totals)
            .await;
        let target = RootTarget::new(root, &name, &self.config.prefix);
        let actions = DiffEngine::new().classify(&target, &fingerprints, &context.remote);
        let summary = DiffEngine::summarize_actions(&actions);
        debug!(
            "{}: {} 个待上传, {} 个与远程相同",
            name, summary.upload_count, summary.skip_count
        );

        self.send_progress(progress_tx, &context.run_id, SyncPhase::Uploading, label, totals)
            .await;
        report.files = self.upload_all(context, actions).await;
        report
    }

    /// 并行执行一个目录的所有动作
    async fn upload_all(&self, context: &RunContext, actions: Vec<SyncAction>) -> Vec<FileOutcome> {
        let uploader = Arc::new(
            Uploader::new(
                context.connection.clone(),
                context.bucket.clone(),
                UploaderConfig {
                    max_retries: self.config.max_retries,
                    retry_base_delay_ms: self.config.retry_base_delay_ms,
                    dry_run: self.dry_run,
                },
            )
            .with_cancel(self.cancelled.clone()),
        );
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_uploads.max(1)));
        let mut outcomes = Vec::with_capacity(actions.len());
        let mut handles = Vec::new();

        for action in actions {
            let upload = match action {
                // 跳过动作不需要网络调用
                SyncAction::Skip { path, reason } => {
                    outcomes.push(FileOutcome::Skipped { path, reason });
                    continue;
                }
                SyncAction::Upload(upload) => upload,
            };
            let path = upload.record.relative_path.clone();
            let key = upload.key.clone();

            if self.is_cancelled() {
                outcomes.push(FileOutcome::Cancelled { path, key });
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    outcomes.push(FileOutcome::Failed {
                        path,
                        key,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            // 等待许可期间可能已取消
            if self.is_cancelled() {
                outcomes.push(FileOutcome::Cancelled { path, key });
                continue;
            }

            let uploader = uploader.clone();
            let handle = tokio::spawn(async move {
                let outcome = uploader.execute(SyncAction::Upload(upload)).await;
                drop(permit);
                outcome
            });
            handles.push((path, key, handle));
        }

        for (path, key, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!("上传任务失败: {}: {}", key, e);
                    outcomes.push(FileOutcome::Failed {
                        path,
                        key,
                        error: format!("upload task failed: {}", e),
                    });
                }
            }
        }

        outcomes.sort_by(|a, b| a.path().cmp(b.path()));
        outcomes
    }

    /// 发送进度更新
    async fn send_progress(
        &self,
        tx: &Option<mpsc::Sender<SyncProgress>>,
        run_id: &str,
        phase: SyncPhase,
        directory: Option<String>,
        report: &SyncReport,
    ) {
        if let Some(tx) = tx {
            let _ = tx
                .send(SyncProgress {
                    run_id: run_id.to_string(),
                    phase,
                    directory,
                    files_scanned: report.files_scanned,
                    files_uploaded: report.files_uploaded,
                    files_skipped: report.total_skipped(),
                    files_failed: report.files_failed,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hasher::fingerprint_bytes;
    use crate::storage::{MemoryConnector, StorageCall};
    use std::fs;

    fn config(root: &Path) -> SyncConfiguration {
        let mut config = SyncConfiguration::new("leaky")
            .with_directory(root)
            .with_prefix("storage");
        config.max_retries = 0;
        config
    }

    #[tokio::test]
    async fn test_phases_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tmp");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("foo"), b"foo").unwrap();

        let connector = Arc::new(MemoryConnector::new().with_bucket("leaky"));
        let coordinator = SyncCoordinator::new(config(&root), connector);
        let (tx, mut rx) = mpsc::channel(64);

        coordinator.run(Some(tx)).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            phases.push(progress.phase);
        }
        assert_eq!(
            phases,
            vec![
                SyncPhase::Idle,
                SyncPhase::ConnectionEstablished,
                SyncPhase::BucketResolved,
                SyncPhase::Scanning,
                SyncPhase::Hashing,
                SyncPhase::Diffing,
                SyncPhase::Uploading,
                SyncPhase::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MemoryConnector::new();
        connector.refuse_connections();
        let coordinator = SyncCoordinator::new(config(dir.path()), Arc::new(connector.clone()));
        let (tx, mut rx) = mpsc::channel(64);

        let err = coordinator.run(Some(tx)).await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(_)));
        assert!(connector.calls().is_empty());

        let mut last = None;
        while let Ok(progress) = rx.try_recv() {
            last = Some(progress.phase);
        }
        assert_eq!(last, Some(SyncPhase::Failed));
    }

    #[tokio::test]
    async fn test_invalid_config_never_connects() {
        let connector = MemoryConnector::new();
        let coordinator =
            SyncCoordinator::new(SyncConfiguration::new("leaky"), Arc::new(connector.clone()));

        let err = coordinator.run(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(connector.connections().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_uploads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tmp");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("foo"), b"foo").unwrap();

        let connector = MemoryConnector::new().with_bucket("leaky");
        let coordinator = SyncCoordinator::new(config(&root), Arc::new(connector.clone()));
        coordinator.cancel();

        let report = coordinator.run(None).await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(connector.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_directory_keeps_every_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tmp");
        fs::create_dir(&root).unwrap();
        for name in ["a", "c", "d", "e"] {
            fs::write(root.join(name), name.as_bytes()).unwrap();
        }

        let connector = MemoryConnector::new().with_bucket("leaky");
        connector.insert_object("leaky", "storage/tmp/e", &fingerprint_bytes(b"e"));

        let mut config = config(&root);
        config.max_concurrent_uploads = 1;
        let coordinator = SyncCoordinator::new(config, Arc::new(connector.clone()));
        connector.cancel_after_puts(1, coordinator.cancel_handle());

        let report = coordinator.run(None).await.unwrap();
        let directory = report.directory("tmp").unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(directory.files.len(), directory.files_scanned);
        assert_eq!(connector.uploads().len(), 1);
        assert!(matches!(directory.outcome("a"), Some(FileOutcome::Uploaded { .. })));
        assert!(matches!(directory.outcome("d"), Some(FileOutcome::Cancelled { .. })));
        assert_eq!(
            directory.outcome("e"),
            Some(&FileOutcome::Skipped {
                path: "e".into(),
                reason: SkipReason::MatchesRemote
            })
        );
        assert_eq!(report.files_uploaded + report.files_cancelled, 3);
        assert_eq!(report.files_failed, 0);
    }

    #[tokio::test]
    async fn test_listing_happens_once_before_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        let files = dir.path().join("files");
        fs::create_dir(&tmp).unwrap();
        fs::create_dir(&files).unwrap();
        fs::write(tmp.join("foo"), b"foo").unwrap();
        fs::write(files.join("bar"), b"bar").unwrap();

        let connector = MemoryConnector::new().with_bucket("leaky");
        let coordinator = SyncCoordinator::new(
            config(&tmp).with_directory(&files),
            Arc::new(connector.clone()),
        );

        coordinator.run(None).await.unwrap();

        let calls = connector.calls();
        let lists: Vec<_> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, StorageCall::ListObjects(_)))
            .map(|(i, _)| i)
            .collect();
        let first_put = calls
            .iter()
            .position(|c| matches!(c, StorageCall::PutObject { .. }))
            .unwrap();
        assert_eq!(lists.len(), 1);
        assert!(lists[0] < first_put);
    }
}
