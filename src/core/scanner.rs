use crate::error::{Result, SyncError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 文件扫描器配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// 排除规则（glob patterns，支持 * 与 **）
    ///
    /// 不含 `/` 的规则只匹配文件名，含 `/` 的规则匹配整个相对路径。
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// 最大文件大小（0 表示不限制）
    #[serde(default)]
    pub max_file_size: u64,
}

/// 扫描得到的本地文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileRecord {
    /// 相对根目录的路径，分隔符统一为 /
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

impl LocalFileRecord {
    /// 文件此刻是否仍然存在
    pub fn exists(&self) -> bool {
        self.absolute_path.is_file()
    }
}

/// 根目录在存储 key 中使用的名称（路径最后一段）
pub fn root_name(root: &Path) -> Option<String> {
    let lexical = root
        .components()
        .next_back()
        .and_then(|c| match c {
            Component::Normal(name) => name.to_str().map(str::to_string),
            _ => None,
        });

    lexical.or_else(|| {
        root.canonicalize()
            .ok()?
            .file_name()?
            .to_str()
            .map(str::to_string)
    })
}

struct CompiledPattern {
    regex: Regex,
    full_path: bool,
}

/// 本地目录树扫描器
///
/// 只返回普通文件；符号链接不跟随，也不作为文件返回。
pub struct LocalTreeScanner {
    config: ScanConfig,
    patterns: Vec<CompiledPattern>,
}

impl LocalTreeScanner {
    pub fn new(config: ScanConfig) -> Self {
        let patterns = config
            .exclude_patterns
            .iter()
            .filter_map(|pattern| match Self::compile_pattern(pattern) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!("忽略无效的排除规则 {}: {}", pattern, e);
                    None
                }
            })
            .collect();

        Self { config, patterns }
    }

    /// glob -> 正则
    fn compile_pattern(pattern: &str) -> std::result::Result<CompiledPattern, regex::Error> {
        let escaped = regex::escape(pattern.trim_start_matches('/'))
            .replace(r"\*\*", "\u{0}")
            .replace(r"\*", "[^/]*")
            .replace(r"\?", "[^/]")
            .replace('\u{0}', ".*");

        Ok(CompiledPattern {
            regex: Regex::new(&format!("^{}$", escaped))?,
            full_path: pattern.contains('/'),
        })
    }

    /// 检查路径是否应该被排除
    fn should_exclude(&self, relative_path: &str) -> bool {
        let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        self.patterns.iter().any(|p| {
            if p.full_path {
                p.regex.is_match(relative_path)
            } else {
                p.regex.is_match(file_name)
            }
        })
    }

    /// 递归扫描根目录下的所有普通文件
    pub async fn scan(&self, root: &Path) -> Result<Vec<LocalFileRecord>> {
        let scan_error = |message: String| SyncError::Scan {
            root: root.display().to_string(),
            message,
        };

        let metadata = tokio::fs::metadata(root)
            .await
            .map_err(|e| scan_error(e.to_string()))?;
        if !metadata.is_dir() {
            return Err(scan_error("not a directory".to_string()));
        }

        info!("开始扫描: {}", root.display());

        let base = root.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || Self::walk(&base))
            .await
            .map_err(|e| scan_error(e.to_string()))?
            .map_err(scan_error)?;

        let mut files = Vec::with_capacity(entries.len());
        let mut excluded_count = 0;

        for (record, size) in entries {
            if self.should_exclude(&record.relative_path) {
                debug!("排除文件: {}", record.relative_path);
                excluded_count += 1;
                continue;
            }

            if self.config.max_file_size > 0 && size > self.config.max_file_size {
                debug!("跳过大文件: {} ({})", record.relative_path, size);
                excluded_count += 1;
                continue;
            }

            files.push(record);
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "扫描完成: {} 个文件, {} 个被排除",
            files.len(),
            excluded_count
        );

        Ok(files)
    }

    fn walk(base: &Path) -> std::result::Result<Vec<(LocalFileRecord, u64)>, String> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(base).follow_links(false).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                // 根目录本身不可读
                Err(e) if e.depth() == 0 => return Err(e.to_string()),
                Err(e) => {
                    warn!("跳过无法读取的条目: {}", e);
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                debug!("跳过符号链接: {}", entry.path().display());
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let Some(relative_path) = Self::relative_path(base, entry.path()) else {
                warn!("跳过无法表示为 UTF-8 的路径: {}", entry.path().display());
                continue;
            };

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);

            entries.push((
                LocalFileRecord {
                    relative_path,
                    absolute_path: entry.path().to_path_buf(),
                },
                size,
            ));
        }

        Ok(entries)
    }

    fn relative_path(base: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(base).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

impl Default for LocalTreeScanner {
    fn default() -> Self {
        Self::new(ScanConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn relative_paths(files: &[LocalFileRecord]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[tokio::test]
    async fn test_scan_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("foo"), b"1").unwrap();
        fs::write(dir.path().join("a/bar"), b"2").unwrap();
        fs::write(dir.path().join("a/b/baz"), b"3").unwrap();

        let files = LocalTreeScanner::default().scan(dir.path()).await.unwrap();
        assert_eq!(relative_paths(&files), vec!["a/b/baz", "a/bar", "foo"]);
        assert!(files.iter().all(|f| f.exists()));
    }

    #[tokio::test]
    async fn test_scan_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let files = LocalTreeScanner::default().scan(dir.path()).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_scan_missing_root_is_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = LocalTreeScanner::default()
            .scan(&dir.path().join("missing"))
            .await;
        assert!(matches!(result, Err(SyncError::Scan { .. })));
    }

    #[tokio::test]
    async fn test_scan_file_root_is_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        let result = LocalTreeScanner::default().scan(&file).await;
        assert!(matches!(result, Err(SyncError::Scan { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let files = LocalTreeScanner::default().scan(dir.path()).await.unwrap();
        assert_eq!(relative_paths(&files), vec!["real"]);
    }

    #[tokio::test]
    async fn test_exclude_patterns_and_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/objects/x"), b"1").unwrap();
        fs::write(dir.path().join("keep.txt"), b"1").unwrap();
        fs::write(dir.path().join("scratch.tmp"), b"1").unwrap();
        fs::write(dir.path().join("huge.bin"), vec![0u8; 64]).unwrap();

        let scanner = LocalTreeScanner::new(ScanConfig {
            exclude_patterns: vec![".git/**".into(), "*.tmp".into()],
            max_file_size: 32,
        });

        let files = scanner.scan(dir.path()).await.unwrap();
        assert_eq!(relative_paths(&files), vec!["keep.txt"]);
    }

    #[test]
    fn test_root_name() {
        assert_eq!(root_name(Path::new("tmp")).as_deref(), Some("tmp"));
        assert_eq!(root_name(Path::new("/var/data/files/")).as_deref(), Some("files"));
        assert!(root_name(Path::new(".")).is_some());
    }
}
