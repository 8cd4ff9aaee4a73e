use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use super::transfer::TransferRun;
use super::types::{SchedulerCommand, SchedulerConfig, StartReport, TaskMessage, TransferOutcome, UploadEvent};
use crate::core::{
    AuthorizationWindow,
    DestinationUpdate,
    NewUpload,
    Result,
    SessionExpiredCallback,
    Transfer,
    TransferFailure,
    TransferRequest,
    UploadBatchState,
    UploadErrorCode,
    UploadId,
    UploadState,
    UploadTask,
    UploaderError,
};
use crate::utils::SharedClock;

struct TaskHandle {
    task: UploadTask,
    cancellation_token: Option<CancellationToken>,
    /// Id of the transfer run currently owning this task.
    run: u64,
}

pub(crate) struct SchedulerWorker {
    transfer: Arc<dyn Transfer>,
    clock: SharedClock,
    on_session_expired: Option<SessionExpiredCallback>,
    config: SchedulerConfig,
    expiry_buffer: chrono::Duration,

    tasks: HashMap<UploadId, TaskHandle>,
    /// 插入顺序
    order: Vec<UploadId>,
    window: Option<AuthorizationWindow>,
    /// Transfers spawned and not yet settled, including stale runs.
    running: usize,
    next_run: u64,
    completion_pending: bool,

    event_tx: broadcast::Sender<UploadEvent>,
    message_tx: mpsc::UnboundedSender<TaskMessage>,
}

impl SchedulerWorker {
    pub(crate) async fn run(
        transfer: Arc<dyn Transfer>,
        clock: SharedClock,
        on_session_expired: Option<SessionExpiredCallback>,
        mut config: SchedulerConfig,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        config.concurrency = config.concurrency.max(1);
        let expiry_buffer = chrono::Duration::from_std(config.expiry_buffer).unwrap_or_else(|_| chrono::Duration::zero());
        let (message_tx, mut message_rx) = mpsc::unbounded_channel();

        let mut worker = Self {
            transfer,
            clock,
            on_session_expired,
            config,
            expiry_buffer,
            tasks: HashMap::new(),
            order: Vec::new(),
            window: None,
            running: 0,
            next_run: 0,
            completion_pending: false,
            event_tx,
            message_tx,
        };

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(SchedulerCommand::Shutdown) | None => break,
                    Some(command) => worker.handle_command(command),
                },
                Some(message) = message_rx.recv() => {
                    worker.handle_message(message);
                }
            }
        }

        worker.cancel_running();
        debug!("Scheduler worker stopped");
    }

    fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Enqueue { uploads, reply } => {
                let _ = reply.send(self.enqueue(uploads));
            }
            SchedulerCommand::Start { reply } => {
                let report = self.process_queue();
                info!(started = report.started, expired = report.expired, "Upload batch started");
                let _ = reply.send(report);
            }
            SchedulerCommand::Cancel { upload_id, reply } => {
                let _ = reply.send(self.cancel(upload_id));
            }
            SchedulerCommand::CancelAll { reply } => {
                let _ = reply.send(self.cancel_all());
            }
            SchedulerCommand::Retry { upload_id, reply } => {
                let result = self.retry(upload_id);
                if result.is_ok() {
                    self.process_queue();
                }
                let _ = reply.send(result);
            }
            SchedulerCommand::RetryAll { reply } => {
                let count = self.retry_all();
                if count > 0 {
                    self.process_queue();
                }
                let _ = reply.send(count);
            }
            SchedulerCommand::SetSession { window, reply } => {
                if let Some(window) = &window {
                    debug!(session_id = %window.session_id, expires_at = %window.expires_at, "Authorization window set");
                }
                self.window = window;
                let _ = reply.send(());
            }
            SchedulerCommand::IsSessionExpired { reply } => {
                let now = self.clock.now();
                let expired = self.window.as_ref().map(|w| self.is_elapsed(w.expires_at, now)).unwrap_or(false);
                let _ = reply.send(expired);
            }
            SchedulerCommand::UpdateDestinations { updates, reply } => {
                let count = self.update_destinations(updates);
                if count > 0 {
                    self.process_queue();
                }
                let _ = reply.send(count);
            }
            SchedulerCommand::MarkExpired { reply } => {
                let _ = reply.send(self.mark_expired());
            }
            SchedulerCommand::Remove { upload_id, reply } => {
                let _ = reply.send(self.remove(upload_id));
            }
            SchedulerCommand::Clear { reply } => {
                let _ = reply.send(self.clear());
            }
            SchedulerCommand::GetTask { upload_id, reply } => {
                let task = self.tasks.get(&upload_id).map(|handle| handle.task.clone());
                let _ = reply.send(task);
            }
            SchedulerCommand::GetAllTasks { reply } => {
                let _ = reply.send(self.ordered_tasks().cloned().collect());
            }
            SchedulerCommand::BatchState { reply } => {
                let _ = reply.send(UploadBatchState::from_tasks(self.ordered_tasks(), self.window.as_ref()));
            }
            SchedulerCommand::Shutdown => {}
        }
    }

    fn handle_message(&mut self, message: TaskMessage) {
        match message {
            TaskMessage::Progress { upload_id, run, percent } => {
                let Some(handle) = self.tasks.get_mut(&upload_id) else {
                    return;
                };
                // 只接受当前运行的进度，且只增不减
                if handle.run != run || handle.task.state != UploadState::Uploading || percent <= handle.task.progress {
                    return;
                }
                handle.task.progress = percent;
                let _ = self.event_tx.send(UploadEvent::Progress {
                    upload_id,
                    progress: percent,
                });
            }
            TaskMessage::Settled { upload_id, run, outcome } => {
                self.running = self.running.saturating_sub(1);
                self.settle(upload_id, run, outcome);
                self.process_queue();
                self.check_all_completed();
            }
        }
    }

    fn ordered_tasks(&self) -> impl Iterator<Item = &UploadTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|handle| &handle.task)
    }

    fn enqueue(&mut self, uploads: Vec<NewUpload>) -> Vec<UploadId> {
        let now = self.clock.now();
        let mut ids = Vec::with_capacity(uploads.len());

        for upload in uploads {
            let upload_id = upload.id;
            if self.tasks.contains_key(&upload_id) {
                warn!(%upload_id, "Task already enqueued, ignoring duplicate");
                continue;
            }

            let task = UploadTask::from_new(upload, now);
            debug!(%upload_id, file = %task.file_name(), size = task.file_size, category = %task.category, "Task enqueued");
            self.tasks.insert(upload_id, TaskHandle {
                task,
                cancellation_token: None,
                run: 0,
            });
            self.order.push(upload_id);
            self.emit_state_change(upload_id, UploadState::Queued, UploadState::Queued);
            ids.push(upload_id);
        }

        ids
    }

    fn is_elapsed(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= expires_at - self.expiry_buffer
    }

    fn task_deadline(&self, task: &UploadTask) -> Option<DateTime<Utc>> {
        task.expires_at.or_else(|| self.window.as_ref().map(|w| w.expires_at))
    }

    /// Expire elapsed queued tasks and fill free slots, in insertion order.
    fn process_queue(&mut self) -> StartReport {
        let now = self.clock.now();
        let mut report = StartReport::default();

        let queued: Vec<UploadId> = self
            .ordered_tasks()
            .filter(|task| task.state == UploadState::Queued)
            .map(|task| task.id)
            .collect();

        for upload_id in queued {
            let elapsed = self
                .tasks
                .get(&upload_id)
                .and_then(|handle| self.task_deadline(&handle.task))
                .map(|deadline| self.is_elapsed(deadline, now))
                .unwrap_or(false);

            if elapsed {
                self.expire(upload_id, UploadErrorCode::ExpiredSession);
                report.expired += 1;
                continue;
            }

            if self.running < self.config.concurrency {
                self.start_transfer(upload_id, now);
                report.started += 1;
            }
        }

        if report.expired > 0 {
            self.notify_session_expired(report.expired);
        }

        report
    }

    fn start_transfer(&mut self, upload_id: UploadId, now: DateTime<Utc>) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else {
            return;
        };

        self.next_run += 1;
        let run = self.next_run;
        let cancellation_token = CancellationToken::new();

        handle.run = run;
        handle.cancellation_token = Some(cancellation_token.clone());
        handle.task.state = UploadState::Uploading;
        handle.task.attempts += 1;
        handle.task.started_at = Some(now);
        handle.task.completed_at = None;

        let request = TransferRequest {
            url: handle.task.upload_url.clone(),
            file: handle.task.file.clone(),
            content_type: handle.task.file.mime_type().to_string(),
            credentials: self.config.credentials.clone(),
        };

        info!(
            %upload_id,
            file = %handle.task.file_name(),
            attempt = handle.task.attempts,
            "Starting transfer"
        );

        let transfer_run = TransferRun {
            upload_id,
            run,
            transfer: self.transfer.clone(),
            request,
            cancellation_token,
            timeout: self.config.transfer_timeout,
            message_tx: self.message_tx.clone(),
        };
        tokio::spawn(transfer_run.run());

        self.running += 1;
        self.completion_pending = true;
        self.emit_state_change(upload_id, UploadState::Queued, UploadState::Uploading);
    }

    fn settle(&mut self, upload_id: UploadId, run: u64, outcome: TransferOutcome) {
        let now = self.clock.now();
        let Some(handle) = self.tasks.get_mut(&upload_id) else {
            return;
        };

        // 过期或已经重新开始的任务，忽略旧的结果
        if handle.run != run || handle.task.state != UploadState::Uploading {
            debug!(%upload_id, run, "Ignoring stale transfer result");
            return;
        }

        handle.cancellation_token = None;
        handle.task.completed_at = Some(now);

        let new_state = match outcome {
            TransferOutcome::Success => {
                handle.task.progress = 100;
                handle.task.clear_error();
                info!(%upload_id, file = %handle.task.file_name(), "Upload completed");
                UploadState::Success
            }
            TransferOutcome::Canceled => {
                handle.task.set_error(UploadErrorCode::Canceled, UploadErrorCode::Canceled.message());
                info!(%upload_id, "Upload canceled");
                UploadState::Canceled
            }
            TransferOutcome::Failed(failure) => Self::apply_failure(&mut handle.task, &failure),
        };

        handle.task.state = new_state;
        self.emit_state_change(upload_id, UploadState::Uploading, new_state);

        if new_state == UploadState::Expired {
            self.notify_session_expired(1);
        }
    }

    fn apply_failure(task: &mut UploadTask, failure: &TransferFailure) -> UploadState {
        let code = failure.classify();
        let upload_id = task.id;

        if code == UploadErrorCode::Canceled {
            task.set_error(code, code.message());
            return UploadState::Canceled;
        }

        task.set_error(code, code.message());
        task.retry_after = failure.retry_after;

        if code.requires_reauthorization() {
            warn!(%upload_id, status = failure.status, %code, "Upload authorization rejected");
            UploadState::Expired
        } else {
            warn!(%upload_id, status = failure.status, %code, error = %failure, "Upload failed");
            UploadState::Failed
        }
    }

    fn expire(&mut self, upload_id: UploadId, code: UploadErrorCode) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else {
            return;
        };

        let old_state = handle.task.state;
        if let Some(token) = handle.cancellation_token.take() {
            token.cancel();
        }
        handle.task.state = UploadState::Expired;
        handle.task.set_error(code, code.message());
        self.emit_state_change(upload_id, old_state, UploadState::Expired);
    }

    fn notify_session_expired(&self, count: usize) {
        warn!(count, "Upload authorization expired");
        if let Some(callback) = &self.on_session_expired {
            callback(count);
        }
        let _ = self.event_tx.send(UploadEvent::SessionExpired { count });
    }

    fn cancel(&mut self, upload_id: UploadId) -> Result<()> {
        let handle = self.tasks.get_mut(&upload_id).ok_or(UploaderError::TaskNotFound(upload_id))?;

        match handle.task.state {
            UploadState::Queued => {
                handle.task.state = UploadState::Canceled;
                handle.task.completed_at = Some(self.clock.now());
                self.emit_state_change(upload_id, UploadState::Queued, UploadState::Canceled);
                self.check_all_completed();
            }
            UploadState::Uploading => {
                // 只发一次取消信号，任务在传输返回后结束
                if let Some(token) = &handle.cancellation_token {
                    if !token.is_cancelled() {
                        debug!(%upload_id, "Signalling cancellation");
                        token.cancel();
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn cancel_all(&mut self) -> usize {
        let active: Vec<UploadId> = self
            .ordered_tasks()
            .filter(|task| task.state.is_active())
            .map(|task| task.id)
            .collect();

        for upload_id in &active {
            let _ = self.cancel(*upload_id);
        }

        active.len()
    }

    fn requeue(&mut self, upload_id: UploadId) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else {
            return;
        };

        let old_state = handle.task.state;
        handle.task.state = UploadState::Queued;
        handle.task.progress = 0;
        handle.task.clear_error();
        handle.task.started_at = None;
        handle.task.completed_at = None;
        self.emit_state_change(upload_id, old_state, UploadState::Queued);
    }

    fn retry(&mut self, upload_id: UploadId) -> Result<()> {
        let handle = self.tasks.get(&upload_id).ok_or(UploaderError::TaskNotFound(upload_id))?;
        let state = handle.task.state;
        if !state.can_retry() {
            return Err(UploaderError::invalid_state("retry", state));
        }

        debug!(%upload_id, from = %state, "Retrying task");
        self.requeue(upload_id);
        Ok(())
    }

    fn retry_all(&mut self) -> usize {
        let retryable: Vec<UploadId> = self
            .ordered_tasks()
            .filter(|task| task.state.can_retry())
            .map(|task| task.id)
            .collect();

        for upload_id in &retryable {
            self.requeue(*upload_id);
        }

        retryable.len()
    }

    fn update_destinations(&mut self, updates: Vec<DestinationUpdate>) -> usize {
        let mut updated = 0;

        for update in updates {
            let Some(handle) = self.tasks.get_mut(&update.id) else {
                debug!(upload_id = %update.id, "Destination update for unknown task");
                continue;
            };

            let state = handle.task.state;
            if state != UploadState::Queued && !state.can_retry() {
                continue;
            }

            handle.task.upload_url = update.upload_url;
            handle.task.upload_key = update.upload_key;
            handle.task.expires_at = update.expires_at;
            updated += 1;

            if state.can_retry() {
                self.requeue(update.id);
            }
        }

        updated
    }

    fn mark_expired(&mut self) -> usize {
        let active: Vec<UploadId> = self
            .ordered_tasks()
            .filter(|task| task.state.is_active())
            .map(|task| task.id)
            .collect();

        for upload_id in &active {
            self.expire(*upload_id, UploadErrorCode::ExpiredSession);
        }

        if !active.is_empty() {
            self.notify_session_expired(active.len());
        }

        active.len()
    }

    fn remove(&mut self, upload_id: UploadId) -> Result<()> {
        let handle = self.tasks.get(&upload_id).ok_or(UploaderError::TaskNotFound(upload_id))?;
        if !handle.task.state.is_terminal() {
            return Err(UploaderError::invalid_state("remove", handle.task.state));
        }

        self.tasks.remove(&upload_id);
        self.order.retain(|id| *id != upload_id);
        debug!(%upload_id, "Task removed");
        Ok(())
    }

    fn clear(&mut self) -> usize {
        let terminal: Vec<UploadId> = self
            .ordered_tasks()
            .filter(|task| task.state.is_terminal())
            .map(|task| task.id)
            .collect();

        for upload_id in &terminal {
            self.tasks.remove(upload_id);
        }
        self.order.retain(|id| self.tasks.contains_key(id));

        terminal.len()
    }

    fn check_all_completed(&mut self) {
        if !self.completion_pending || self.tasks.values().any(|handle| handle.task.state.is_active()) {
            return;
        }

        self.completion_pending = false;
        let batch = UploadBatchState::from_tasks(self.ordered_tasks(), self.window.as_ref());
        info!(
            total = batch.total,
            success = batch.success_count,
            failed = batch.failed_count,
            expired = batch.expired_count,
            "All uploads settled"
        );
        let _ = self.event_tx.send(UploadEvent::AllCompleted {
            total: batch.total,
            success_count: batch.success_count,
            failed_count: batch.failed_count + batch.expired_count,
        });
    }

    fn cancel_running(&mut self) {
        for handle in self.tasks.values_mut() {
            if let Some(token) = handle.cancellation_token.take() {
                token.cancel();
            }
        }
    }

    fn emit_state_change(&self, upload_id: UploadId, old_state: UploadState, new_state: UploadState) {
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            upload_id,
            old_state,
            new_state,
        });
    }
}
