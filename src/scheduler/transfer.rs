use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use super::types::{TaskMessage, TransferOutcome};
use crate::core::{ProgressCallback, Transfer, TransferFailure, TransferRequest, UploadId};

/// One attempt at moving one file, spawned by the scheduler.
pub(crate) struct TransferRun {
    pub(crate) upload_id: UploadId,
    pub(crate) run: u64,
    pub(crate) transfer: Arc<dyn Transfer>,
    pub(crate) request: TransferRequest,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) timeout: Option<Duration>,
    pub(crate) message_tx: mpsc::UnboundedSender<TaskMessage>,
}

impl TransferRun {
    pub(crate) async fn run(self) {
        let TransferRun {
            upload_id,
            run,
            transfer,
            request,
            cancellation_token,
            timeout,
            message_tx,
        } = self;

        // 进度和结束消息走同一个通道，保证顺序
        let progress_tx = message_tx.clone();
        let on_progress: ProgressCallback = Arc::new(move |percent: u8| {
            let _ = progress_tx.send(TaskMessage::Progress {
                upload_id,
                run,
                percent: percent.min(100),
            });
        });

        let attempt = transfer.transfer(request, on_progress, cancellation_token.clone());
        let guarded = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(%upload_id, ?limit, "Transfer exceeded watchdog timeout");
                        Err(TransferFailure::timeout())
                    }
                },
                None => attempt.await,
            }
        };
        let guarded = AssertUnwindSafe(guarded).catch_unwind();

        // 执行
        let result = tokio::select! {
            biased;
            result = guarded => match result {
                Ok(result) => result,
                Err(_) => {
                    error!(%upload_id, "Transfer panicked");
                    Err(TransferFailure::http(0)
                        .with_code("UNKNOWN")
                        .with_message("Transfer panicked"))
                }
            },
            _ = cancellation_token.cancelled() => Err(TransferFailure::canceled()),
        };

        let outcome = match result {
            Ok(()) => TransferOutcome::Success,
            Err(_) if cancellation_token.is_cancelled() => TransferOutcome::Canceled,
            Err(failure) => TransferOutcome::Failed(failure),
        };

        let _ = message_tx.send(TaskMessage::Settled {
            upload_id,
            run,
            outcome,
        });
    }
}
