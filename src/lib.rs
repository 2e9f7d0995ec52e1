//! 本地目录到对象存储的单向同步
//!
//! 上传新增或内容变化的文件，跳过远程已相同的文件，从不删除远程对象。

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::SyncConfiguration;
pub use crate::core::{FileOutcome, RunStatus, SkipReason, SyncCoordinator, SyncReport};
pub use error::SyncError;
pub use storage::{Connector, Credentials, DefaultConnector, Provider};
