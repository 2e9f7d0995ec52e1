pub mod comparator;
pub mod engine;
pub mod hasher;
pub mod inventory;
pub mod scanner;
pub mod uploader;

pub use comparator::{
    storage_key, ActionSummary, DiffEngine, RootTarget, SkipReason, SyncAction, UploadAction,
};
pub use engine::{
    DirectoryReport, RunStatus, SyncCoordinator, SyncPhase, SyncProgress, SyncReport,
};
pub use hasher::{fingerprint_bytes, fingerprint_file, ContentHasher};
pub use inventory::{normalize_fingerprint, RemoteInventory};
pub use scanner::{root_name, LocalFileRecord, LocalTreeScanner, ScanConfig};
pub use uploader::{FileOutcome, UploadResult, Uploader, UploaderConfig};
