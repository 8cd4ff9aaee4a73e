pub mod core;
pub mod validation;
pub mod transform;
pub mod scheduler;
pub mod session;
pub mod uploaders;
pub mod utils;
pub mod config;

// 重新导出核心类型
pub use crate::core::{
    AuthorizationProvider,
    FileCategory,
    FileHandle,
    NewUpload,
    PendingUpload,
    Result,
    Transfer,
    TransferFailure,
    UploadBatchState,
    UploadErrorCode,
    UploadId,
    UploadState,
    UploadTask,
    UploaderError,
};

pub use scheduler::{SchedulerConfig, SchedulerHandle, UploadEvent, UploadScheduler};
pub use session::{SessionStore, UploaderSession};
pub use transform::{CompressionPreset, TransformOptions, TransformPipeline};
pub use uploaders::{HttpAuthorizationProvider, HttpTransfer};
pub use validation::{validate, ValidationError};
