use std::time::Duration;
use tokio::sync::oneshot;
use crate::core::{
    AuthorizationWindow,
    DestinationUpdate,
    NewUpload,
    Result,
    TransferFailure,
    UploadBatchState,
    UploadId,
    UploadState,
    UploadTask,
};

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 最大并发数
    pub concurrency: usize,
    /// Authorizations expiring within this margin count as already elapsed.
    pub expiry_buffer: Duration,
    /// Upper bound for a single transfer. `None` leaves timeouts to the
    /// transfer primitive.
    pub transfer_timeout: Option<Duration>,
    /// Forwarded with every transfer request.
    pub credentials: Option<String>,
    /// 最大缓存事件数
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            transfer_timeout: None,
            credentials: None,
            event_capacity: 256,
        }
    }
}

/// What a call to `start` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartReport {
    pub started: usize,
    pub expired: usize,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 任务状态变更
    StateChanged {
        upload_id: UploadId,
        old_state: UploadState,
        new_state: UploadState,
    },

    /// 单个任务进度
    Progress {
        upload_id: UploadId,
        progress: u8,
    },

    /// 上传授权过期
    SessionExpired {
        count: usize,
    },

    /// 所有任务都已结束
    AllCompleted {
        total: usize,
        success_count: usize,
        failed_count: usize,
    },
}

/// 调度器命令
pub(crate) enum SchedulerCommand {
    Enqueue {
        uploads: Vec<NewUpload>,
        reply: oneshot::Sender<Vec<UploadId>>,
    },

    Start {
        reply: oneshot::Sender<StartReport>,
    },

    Cancel {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    CancelAll {
        reply: oneshot::Sender<usize>,
    },

    Retry {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    RetryAll {
        reply: oneshot::Sender<usize>,
    },

    SetSession {
        window: Option<AuthorizationWindow>,
        reply: oneshot::Sender<()>,
    },

    IsSessionExpired {
        reply: oneshot::Sender<bool>,
    },

    UpdateDestinations {
        updates: Vec<DestinationUpdate>,
        reply: oneshot::Sender<usize>,
    },

    /// 将排队和上传中的任务标记为过期
    MarkExpired {
        reply: oneshot::Sender<usize>,
    },

    Remove {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 清除所有已结束的任务
    Clear {
        reply: oneshot::Sender<usize>,
    },

    GetTask {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },

    GetAllTasks {
        reply: oneshot::Sender<Vec<UploadTask>>,
    },

    BatchState {
        reply: oneshot::Sender<UploadBatchState>,
    },

    Shutdown,
}

/// How a transfer run ended.
#[derive(Debug, Clone)]
pub(crate) enum TransferOutcome {
    Success,
    Canceled,
    Failed(TransferFailure),
}

/// Sent by running transfers back to the scheduler. `run` tells stale runs
/// apart from the current one.
#[derive(Debug)]
pub(crate) enum TaskMessage {
    Progress {
        upload_id: UploadId,
        run: u64,
        percent: u8,
    },
    Settled {
        upload_id: UploadId,
        run: u64,
        outcome: TransferOutcome,
    },
}
