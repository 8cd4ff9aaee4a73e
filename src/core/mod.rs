mod batch;
mod error_code;
mod errors;
mod traits;
mod types;

pub use batch::UploadBatchState;
pub use error_code::{TransferFailure, UploadErrorCode};
pub use errors::{Result, UploaderError};
pub use traits::{
    AuthorizationProvider,
    ProgressCallback,
    SessionExpiredCallback,
    Transfer,
    TransferRequest,
};
pub use types::{
    AuthorizationWindow,
    DestinationUpdate,
    FileCategory,
    FileHandle,
    NewUpload,
    PendingUpload,
    UploadDestination,
    UploadId,
    UploadState,
    UploadTask,
};
pub(crate) use types::extension_of;
