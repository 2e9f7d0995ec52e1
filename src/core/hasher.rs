//! 内容指纹 - 本地文件的 MD5，与 S3 单次上传的 ETag 可直接比较

use crate::core::scanner::LocalFileRecord;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 计算文件内容的 MD5（小写十六进制）
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// 计算内存数据的 MD5
pub fn fingerprint_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// 批量内容哈希器，一个根目录一批
pub struct ContentHasher {
    max_concurrent: usize,
}

impl ContentHasher {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 并发计算一批文件的指纹，返回 相对路径 -> 指纹
    ///
    /// 扫描后消失或无法读取的文件不会出现在结果里。
    pub async fn hash_tree(&self, files: &[LocalFileRecord]) -> HashMap<String, String> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(files.len());

        for record in files {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let record = record.clone();

            let handle = tokio::task::spawn_blocking(move || {
                let result = fingerprint_file(&record.absolute_path);
                drop(permit);
                (record.relative_path, result)
            });

            handles.push(handle);
        }

        let mut fingerprints = HashMap::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((path, Ok(fingerprint))) => {
                    fingerprints.insert(path, fingerprint);
                }
                Ok((path, Err(e))) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("文件已消失，跳过哈希: {}", path);
                }
                Ok((path, Err(e))) => warn!("无法计算哈希，跳过: {} ({})", path, e),
                Err(e) => warn!("哈希任务失败: {}", e),
            }
        }

        fingerprints
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(root: &Path, relative: &str) -> LocalFileRecord {
        LocalFileRecord {
            relative_path: relative.to_string(),
            absolute_path: root.join(relative),
        }
    }

    #[test]
    fn test_fingerprint_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo");
        std::fs::write(&path, b"hello").unwrap();

        let fingerprint = fingerprint_file(&path).unwrap();
        assert_eq!(fingerprint, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(fingerprint, fingerprint_bytes(b"hello"));
    }

    #[test]
    fn test_fingerprint_larger_than_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        let data = vec![7u8; READ_BUFFER_SIZE * 3 + 17];
        std::fs::write(&path, &data).unwrap();

        assert_eq!(fingerprint_file(&path).unwrap(), fingerprint_bytes(&data));
    }

    #[tokio::test]
    async fn test_hash_tree_skips_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo"), b"foo").unwrap();
        std::fs::write(dir.path().join("bar"), b"bar").unwrap();

        let files = vec![
            record(dir.path(), "foo"),
            record(dir.path(), "bar"),
            record(dir.path(), "gone"),
        ];

        let fingerprints = ContentHasher::new(2).hash_tree(&files).await;
        assert_eq!(fingerprints.len(), 2);
        assert_eq!(fingerprints["foo"], fingerprint_bytes(b"foo"));
        assert!(!fingerprints.contains_key("gone"));
    }

    #[tokio::test]
    async fn test_hash_tree_empty() {
        let fingerprints = ContentHasher::default().hash_tree(&[]).await;
        assert!(fingerprints.is_empty());
    }
}
