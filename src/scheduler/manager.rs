use std::sync::Arc;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;
use super::types::{SchedulerCommand, SchedulerConfig, StartReport, UploadEvent};
use super::worker::SchedulerWorker;
use crate::core::{
    AuthorizationProvider,
    AuthorizationWindow,
    DestinationUpdate,
    NewUpload,
    PendingUpload,
    Result,
    SessionExpiredCallback,
    Transfer,
    UploadBatchState,
    UploadId,
    UploadState,
    UploadTask,
    UploaderError,
};
use crate::utils::{SharedClock, system_clock};

/// Cloneable command handle for the scheduler actor.
#[derive(Clone)]
pub struct UploadScheduler {
    command_tx: mpsc::Sender<SchedulerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
    provider: Option<Arc<dyn AuthorizationProvider>>,
    clock: SharedClock,
}

/// 调度器句柄 - 包含调度器和工作任务
pub struct SchedulerHandle {
    pub scheduler: UploadScheduler,
    pub worker_handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the actor, signalling every running transfer.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.scheduler.command_tx.send(SchedulerCommand::Shutdown).await;
        drop(self.scheduler);
        self.worker_handle
            .await
            .map_err(|err| UploaderError::internal(format!("Worker panic: {}", err)))
    }
}

pub struct SchedulerBuilder {
    transfer: Arc<dyn Transfer>,
    provider: Option<Arc<dyn AuthorizationProvider>>,
    clock: SharedClock,
    on_session_expired: Option<SessionExpiredCallback>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn provider(mut self, provider: Arc<dyn AuthorizationProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_session_expired(mut self, callback: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_session_expired = Some(Arc::new(callback));
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the actor. Must be called inside a tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (event_tx, _) = broadcast::channel(self.config.event_capacity.max(1));

        let worker_handle = tokio::spawn(SchedulerWorker::run(
            self.transfer,
            self.clock.clone(),
            self.on_session_expired,
            self.config,
            command_rx,
            event_tx.clone(),
        ));

        let scheduler = UploadScheduler {
            command_tx,
            event_tx,
            provider: self.provider,
            clock: self.clock,
        };

        SchedulerHandle {
            scheduler,
            worker_handle,
        }
    }
}

impl UploadScheduler {
    pub fn builder(transfer: Arc<dyn Transfer>) -> SchedulerBuilder {
        SchedulerBuilder {
            transfer,
            provider: None,
            clock: system_clock(),
            on_session_expired: None,
            config: SchedulerConfig::default(),
        }
    }

    pub fn new(transfer: Arc<dyn Transfer>, config: SchedulerConfig) -> SchedulerHandle {
        Self::builder(transfer).config(config).spawn()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| UploaderError::SchedulerShutdown)?;

        // 等待响应
        reply_rx.await.map_err(|_| UploaderError::SchedulerShutdown)
    }

    /// Append tasks as `queued`. Nothing is transferred until `start`.
    pub async fn enqueue(&self, uploads: Vec<NewUpload>) -> Result<Vec<UploadId>> {
        self.request(|reply| SchedulerCommand::Enqueue { uploads, reply }).await
    }

    /// Ask the authorization provider for a destination per file, then
    /// enqueue the ones that got one. Results keep the input order.
    pub async fn enqueue_authorized(&self, files: Vec<PendingUpload>) -> Result<Vec<Result<UploadId>>> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| UploaderError::Config("no authorization provider configured".to_string()))?;

        let destinations = join_all(
            files
                .iter()
                .map(|pending| provider.get_upload_destination(&pending.file, pending.category)),
        )
        .await;

        let now = self.clock.now();
        let mut results = Vec::with_capacity(files.len());
        let mut ready = Vec::new();

        for (pending, destination) in files.into_iter().zip(destinations) {
            match destination {
                Ok(destination) => {
                    let upload = NewUpload::new(pending.file, pending.category, destination.url)
                        .with_id(pending.id)
                        .with_key(destination.key)
                        .with_expiry(expiry_from(now, destination.expires_in_seconds));
                    results.push(Ok(pending.id));
                    ready.push(upload);
                }
                Err(err) => {
                    warn!(upload_id = %pending.id, file = %pending.file.name(), error = %err, "Authorization failed");
                    results.push(Err(err));
                }
            }
        }

        if !ready.is_empty() {
            self.enqueue(ready).await?;
        }

        Ok(results)
    }

    pub async fn start(&self) -> Result<StartReport> {
        self.request(|reply| SchedulerCommand::Start { reply }).await
    }

    pub async fn cancel(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Cancel { upload_id, reply }).await?
    }

    pub async fn cancel_all(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::CancelAll { reply }).await
    }

    pub async fn retry(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Retry { upload_id, reply }).await?
    }

    pub async fn retry_all(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::RetryAll { reply }).await
    }

    pub async fn set_session(&self, session_id: impl Into<String>, expires_at: DateTime<Utc>) -> Result<()> {
        let window = AuthorizationWindow {
            session_id: session_id.into(),
            expires_at,
        };
        self.request(|reply| SchedulerCommand::SetSession {
            window: Some(window),
            reply,
        })
        .await
    }

    pub async fn clear_session(&self) -> Result<()> {
        self.request(|reply| SchedulerCommand::SetSession { window: None, reply }).await
    }

    /// Whether the authorization window is elapsed, buffer included.
    pub async fn is_session_expired(&self) -> Result<bool> {
        self.request(|reply| SchedulerCommand::IsSessionExpired { reply }).await
    }

    /// Point failed/expired tasks at fresh destinations and queue them again.
    pub async fn update_destinations(&self, updates: Vec<DestinationUpdate>) -> Result<usize> {
        self.request(|reply| SchedulerCommand::UpdateDestinations { updates, reply }).await
    }

    /// Re-authorize every expired task through the provider and requeue it.
    pub async fn refresh_expired(&self) -> Result<usize> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| UploaderError::Config("no authorization provider configured".to_string()))?;

        let expired: Vec<UploadTask> = self
            .tasks()
            .await?
            .into_iter()
            .filter(|task| task.state == UploadState::Expired)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let destinations = join_all(
            expired
                .iter()
                .map(|task| provider.get_upload_destination(&task.file, task.category)),
        )
        .await;

        let now = self.clock.now();
        let updates: Vec<DestinationUpdate> = expired
            .iter()
            .zip(destinations)
            .filter_map(|(task, destination)| match destination {
                Ok(destination) => Some(DestinationUpdate {
                    id: task.id,
                    upload_url: destination.url,
                    upload_key: Some(destination.key),
                    expires_at: Some(expiry_from(now, destination.expires_in_seconds)),
                }),
                Err(err) => {
                    warn!(upload_id = %task.id, error = %err, "Re-authorization failed");
                    None
                }
            })
            .collect();

        self.update_destinations(updates).await
    }

    /// Force every queued or uploading task into `expired`.
    pub async fn mark_expired(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::MarkExpired { reply }).await
    }

    /// Drop a succeeded or canceled task. Any other state is rejected.
    pub async fn remove(&self, upload_id: UploadId) -> Result<()> {
        self.request(|reply| SchedulerCommand::Remove { upload_id, reply }).await?
    }

    pub async fn clear(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::Clear { reply }).await
    }

    pub async fn get_task(&self, upload_id: UploadId) -> Result<Option<UploadTask>> {
        self.request(|reply| SchedulerCommand::GetTask { upload_id, reply }).await
    }

    /// Every task in insertion order.
    pub async fn tasks(&self) -> Result<Vec<UploadTask>> {
        self.request(|reply| SchedulerCommand::GetAllTasks { reply }).await
    }

    pub async fn batch_state(&self) -> Result<UploadBatchState> {
        self.request(|reply| SchedulerCommand::BatchState { reply }).await
    }

    /// 订阅事件
    ///
    /// 注意：接收速度跟不上时会丢失事件（lagged error）
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F> {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }
}

fn expiry_from(now: DateTime<Utc>, expires_in_seconds: u64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(expires_in_seconds.min(i32::MAX as u64) as i64)
}

/// 过滤的事件接收器
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}
