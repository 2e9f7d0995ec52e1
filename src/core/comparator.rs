use crate::core::inventory::normalize_fingerprint;
use crate::core::scanner::LocalFileRecord;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// 远程已有相同内容
    MatchesRemote,
    /// 扫描后本地文件消失
    VanishedLocally,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MatchesRemote => write!(f, "matches-remote"),
            SkipReason::VanishedLocally => write!(f, "vanished-locally"),
        }
    }
}

/// 待上传的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAction {
    pub record: LocalFileRecord,
    /// 完整存储 key
    pub key: String,
    pub fingerprint: String,
}

/// 同步动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Upload(UploadAction),
    Skip { path: String, reason: SkipReason },
}

impl SyncAction {
    /// 相对根目录的路径
    pub fn path(&self) -> &str {
        match self {
            SyncAction::Upload(upload) => &upload.record.relative_path,
            SyncAction::Skip { path, .. } => path,
        }
    }
}

/// 计算存储 key：prefix/rootName/relativePath，空段会被省略
pub fn storage_key(prefix: &str, root_name: &str, relative_path: &str) -> String {
    [prefix, root_name, relative_path]
        .iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// 一个根目录的比较上下文
#[derive(Debug, Clone)]
pub struct RootTarget {
    pub root: PathBuf,
    pub root_name: String,
    pub prefix: String,
}

impl RootTarget {
    pub fn new(root: &Path, root_name: &str, prefix: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            root_name: root_name.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub fn key_for(&self, relative_path: &str) -> String {
        storage_key(&self.prefix, &self.root_name, relative_path)
    }

    fn absolute_path(&self, relative_path: &str) -> PathBuf {
        relative_path
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

/// 差异引擎：本地指纹 vs 远程指纹
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffEngine;

impl DiffEngine {
    pub fn new() -> Self {
        Self
    }

    /// 对一个根目录下的每个本地文件给出动作
    ///
    /// 只遍历本地文件，远程独有的对象永远不会产生动作。
    pub fn classify(
        &self,
        target: &RootTarget,
        local: &HashMap<String, String>,
        remote: &HashMap<String, String>,
    ) -> Vec<SyncAction> {
        let mut actions: Vec<SyncAction> = local
            .iter()
            .map(|(relative_path, fingerprint)| {
                let key = target.key_for(relative_path);
                let local_fingerprint = normalize_fingerprint(fingerprint);

                match remote.get(&key) {
                    Some(remote_fingerprint)
                        if normalize_fingerprint(remote_fingerprint) == local_fingerprint =>
                    {
                        tracing::debug!("远程内容相同，跳过: {}", key);
                        SyncAction::Skip {
                            path: relative_path.clone(),
                            reason: SkipReason::MatchesRemote,
                        }
                    }
                    _ => SyncAction::Upload(UploadAction {
                        record: LocalFileRecord {
                            relative_path: relative_path.clone(),
                            absolute_path: target.absolute_path(relative_path),
                        },
                        key,
                        fingerprint: local_fingerprint,
                    }),
                }
            })
            .collect();

        // 按路径排序，确保一致性
        actions.sort_by(|a, b| a.path().cmp(b.path()));
        actions
    }

    /// 统计同步动作
    pub fn summarize_actions(actions: &[SyncAction]) -> ActionSummary {
        let mut summary = ActionSummary::default();

        for action in actions {
            match action {
                SyncAction::Upload(_) => summary.upload_count += 1,
                SyncAction::Skip { .. } => summary.skip_count += 1,
            }
        }

        summary
    }
}

/// 动作统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub upload_count: usize,
    /// 比较阶段只会产生 matches-remote 跳过
    pub skip_count: usize,
}
