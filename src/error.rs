//! 同步错误分类

use thiserror::Error;

/// 同步过程中的错误
///
/// `Config`、`Connection`、`BucketResolution` 会终止整次运行；
/// `Scan` 只影响单个目录，`TransientUpload` 只影响单个文件。
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to connect to storage: {0}")]
    Connection(String),

    #[error("failed to resolve bucket '{bucket}': {message}")]
    BucketResolution { bucket: String, message: String },

    #[error("failed to scan '{root}': {message}")]
    Scan { root: String, message: String },

    #[error("failed to upload '{key}': {message}")]
    TransientUpload { key: String, message: String },
}

impl SyncError {
    /// 是否为终止整次运行的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_) | SyncError::Connection(_) | SyncError::BucketResolution { .. }
        )
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::Connection("denied".into()).is_fatal());
        assert!(SyncError::BucketResolution {
            bucket: "leaky".into(),
            message: "boom".into()
        }
        .is_fatal());
        assert!(!SyncError::Scan {
            root: "tmp".into(),
            message: "gone".into()
        }
        .is_fatal());
        assert!(!SyncError::TransientUpload {
            key: "storage/tmp/foo".into(),
            message: "timeout".into()
        }
        .is_fatal());
    }
}
