use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;
use uploader::core::{
    AuthorizationProvider,
    DestinationUpdate,
    FileCategory,
    FileHandle,
    NewUpload,
    PendingUpload,
    ProgressCallback,
    Transfer,
    TransferFailure,
    TransferRequest,
    UploadDestination,
    UploadErrorCode,
    UploadId,
    UploadState,
    UploaderError,
};
use uploader::scheduler::{SchedulerConfig, SchedulerHandle, UploadEvent, UploadScheduler};
use uploader::utils::ManualClock;

/// 脚本化的传输 - 按文件名预设每次调用的结果
#[derive(Clone)]
enum Step {
    Succeed,
    Fail(TransferFailure),
    /// Never finishes on its own.
    Hang,
    Report(Vec<u8>),
    /// Reports progress, then fails.
    ReportThenFail(Vec<u8>, TransferFailure),
}

struct ScriptedTransfer {
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    urls: Mutex<Vec<(String, Url)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedTransfer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            scripts: Mutex::new(HashMap::new()),
            urls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn script(self, file_name: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().insert(file_name.to_string(), steps.into());
        self
    }

    fn next_step(&self, file_name: &str) -> Step {
        self.scripts
            .lock()
            .get_mut(file_name)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transfer for ScriptedTransfer {
    async fn transfer(
        &self,
        request: TransferRequest,
        on_progress: ProgressCallback,
        cancellation_token: CancellationToken,
    ) -> Result<(), TransferFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let file_name = request.file.name().to_string();
        self.urls.lock().push((file_name.clone(), request.url.clone()));

        match self.next_step(&file_name) {
            Step::Hang => {
                cancellation_token.cancelled().await;
                Err(TransferFailure::canceled())
            }
            Step::Report(percents) => {
                for percent in percents {
                    on_progress(percent);
                    tokio::time::sleep(self.delay).await;
                }
                Ok(())
            }
            Step::ReportThenFail(percents, failure) => {
                for percent in percents {
                    on_progress(percent);
                    tokio::time::sleep(self.delay).await;
                }
                Err(failure)
            }
            Step::Succeed => {
                on_progress(50);
                tokio::time::sleep(self.delay).await;
                Ok(())
            }
            Step::Fail(failure) => {
                tokio::time::sleep(self.delay).await;
                Err(failure)
            }
        }
    }
}

fn destination(name: &str) -> Url {
    Url::parse(&format!("https://uploads.example.com/bucket/{}", name)).unwrap()
}

fn document(name: &str) -> NewUpload {
    let file = FileHandle::new(name, "application/pdf", vec![7u8; 2048]);
    NewUpload::new(file, FileCategory::Instruction, destination(name))
}

fn spawn(transfer: Arc<ScriptedTransfer>, concurrency: usize) -> SchedulerHandle {
    UploadScheduler::new(
        transfer,
        SchedulerConfig {
            concurrency,
            ..Default::default()
        },
    )
}

async fn wait_for_completion(events: &mut broadcast::Receiver<UploadEvent>) -> (usize, usize, usize) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(UploadEvent::AllCompleted { total, success_count, failed_count }) => {
                    return (total, success_count, failed_count);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("batch did not settle")
}

async fn wait_for_state(events: &mut broadcast::Receiver<UploadEvent>, upload_id: UploadId, state: UploadState) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(UploadEvent::StateChanged { upload_id: id, new_state, .. }) if id == upload_id && new_state == state => {
                    return;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("task did not reach the expected state")
}

/// Drain every state transition already broadcast.
fn transitions(events: &mut broadcast::Receiver<UploadEvent>) -> Vec<(UploadId, UploadState, UploadState)> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(UploadEvent::StateChanged { upload_id, old_state, new_state }) => {
                seen.push((upload_id, old_state, new_state));
            }
            Ok(_) => continue,
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}

async fn task_state(scheduler: &UploadScheduler, upload_id: UploadId) -> UploadState {
    scheduler.get_task(upload_id).await.unwrap().unwrap().state
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_budget_is_respected() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(100)));
    let handle = spawn(transfer.clone(), 3);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let uploads = (0..5).map(|i| document(&format!("manual-{}.pdf", i))).collect();
    let ids = scheduler.enqueue(uploads).await.unwrap();
    assert_eq!(ids.len(), 5);

    // enqueue alone never transfers
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 0);
    let state = scheduler.batch_state().await.unwrap();
    assert_eq!(state.queued_count, 5);
    assert!(!state.is_complete);

    let report = scheduler.start().await.unwrap();
    assert_eq!(report.started, 3);
    assert_eq!(report.expired, 0);

    let state = scheduler.batch_state().await.unwrap();
    assert_eq!(state.uploading_count, 3);
    assert_eq!(state.queued_count, 2);

    let (total, success, failed) = wait_for_completion(&mut events).await;
    assert_eq!((total, success, failed), (5, 5, 0));
    assert_eq!(transfer.max_active.load(Ordering::SeqCst), 3);
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 5);

    let state = scheduler.batch_state().await.unwrap();
    assert!(state.is_complete);
    assert_eq!(state.overall_progress, 100);

    // 按插入顺序返回
    let tasks = scheduler.tasks().await.unwrap();
    let order: Vec<UploadId> = tasks.iter().map(|task| task.id).collect();
    assert_eq!(order, ids);
    assert!(tasks.iter().all(|task| task.progress == 100 && task.attempts == 1));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_runs_sequentially() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(10)));
    let handle = spawn(transfer.clone(), 1);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let uploads = (0..4).map(|i| document(&format!("part-{}.pdf", i))).collect();
    scheduler.enqueue(uploads).await.unwrap();
    assert_eq!(scheduler.start().await.unwrap().started, 1);

    wait_for_completion(&mut events).await;
    assert_eq!(transfer.max_active.load(Ordering::SeqCst), 1);

    let urls: Vec<String> = transfer.urls.lock().iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(urls, vec!["part-0.pdf", "part-1.pdf", "part-2.pdf", "part-3.pdf"]);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_elapsed_authorization_expires_queued_tasks() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(10)));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let expired_counts = Arc::new(Mutex::new(Vec::new()));

    let counts = expired_counts.clone();
    let handle = UploadScheduler::builder(transfer.clone())
        .clock(clock.clone())
        .on_session_expired(move |count| counts.lock().push(count))
        .spawn();
    let scheduler = handle.scheduler.clone();

    // 在 30 秒缓冲期内也算过期
    let near_expiry = clock_now(&clock) + chrono::Duration::seconds(10);
    let uploads = vec![
        document("a.pdf").with_expiry(near_expiry),
        document("b.pdf").with_expiry(near_expiry),
        document("c.pdf").with_expiry(clock_now(&clock) + chrono::Duration::minutes(15)),
    ];
    let ids = scheduler.enqueue(uploads).await.unwrap();

    let report = scheduler.start().await.unwrap();
    assert_eq!(report.expired, 2);
    assert_eq!(report.started, 1);
    assert_eq!(*expired_counts.lock(), vec![2]);

    let task = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.state, UploadState::Expired);
    assert_eq!(task.error_code, Some(UploadErrorCode::ExpiredSession));
    assert_eq!(task.attempts, 0);

    handle.shutdown().await.unwrap();
}

fn clock_now(clock: &ManualClock) -> chrono::DateTime<Utc> {
    use uploader::utils::Clock;
    clock.now()
}

#[tokio::test(start_paused = true)]
async fn test_session_window_controls_expiry() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(10)));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let handle = UploadScheduler::builder(transfer.clone()).clock(clock.clone()).spawn();
    let scheduler = handle.scheduler.clone();

    assert!(!scheduler.is_session_expired().await.unwrap());

    scheduler
        .set_session("batch-1", clock_now(&clock) + chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert!(!scheduler.is_session_expired().await.unwrap());
    let state = scheduler.batch_state().await.unwrap();
    assert_eq!(state.session_id.as_deref(), Some("batch-1"));

    clock.advance(chrono::Duration::minutes(10) - chrono::Duration::seconds(20));
    assert!(scheduler.is_session_expired().await.unwrap());

    let ids = scheduler.enqueue(vec![document("late.pdf")]).await.unwrap();
    let report = scheduler.start().await.unwrap();
    assert_eq!(report, uploader::scheduler::StartReport { started: 0, expired: 1 });
    assert_eq!(task_state(&scheduler, ids[0]).await, UploadState::Expired);
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 0);

    scheduler.clear_session().await.unwrap();
    assert!(!scheduler.is_session_expired().await.unwrap());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_can_be_retried() {
    let transfer = Arc::new(
        ScriptedTransfer::new(Duration::from_millis(10))
            .script("flaky.pdf", vec![Step::Fail(TransferFailure::http(503))]),
    );
    let handle = spawn(transfer.clone(), 3);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler.enqueue(vec![document("flaky.pdf"), document("fine.pdf")]).await.unwrap();
    scheduler.start().await.unwrap();

    let (total, success, failed) = wait_for_completion(&mut events).await;
    assert_eq!((total, success, failed), (2, 1, 1));

    let task = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.state, UploadState::Failed);
    assert_eq!(task.error_code, Some(UploadErrorCode::ServerError));
    assert!(scheduler.batch_state().await.unwrap().has_errors);

    // 成功的任务不能重试
    let err = scheduler.retry(ids[1]).await.unwrap_err();
    assert!(matches!(err, UploaderError::InvalidState { state: UploadState::Success, .. }));

    scheduler.retry(ids[0]).await.unwrap();
    wait_for_completion(&mut events).await;

    let task = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.state, UploadState::Success);
    assert_eq!(task.attempts, 2);
    assert!(task.error_code.is_none());
    assert!(scheduler.batch_state().await.unwrap().is_complete);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_resets_progress_of_partial_transfer() {
    let transfer = Arc::new(
        ScriptedTransfer::new(Duration::from_millis(10))
            .script("partial.pdf", vec![Step::ReportThenFail(vec![20, 40], TransferFailure::http(503))])
            .script("blocker.pdf", vec![Step::Hang]),
    );
    let handle = spawn(transfer.clone(), 1);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler
        .enqueue(vec![document("partial.pdf"), document("blocker.pdf")])
        .await
        .unwrap();
    scheduler.start().await.unwrap();
    wait_for_state(&mut events, ids[0], UploadState::Failed).await;

    let failed = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(failed.progress, 40);
    assert_eq!(task_state(&scheduler, ids[1]).await, UploadState::Uploading);

    // 唯一的槽位被占着，重试后的任务停在队列里
    scheduler.retry(ids[0]).await.unwrap();
    let requeued = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(requeued.state, UploadState::Queued);
    assert_eq!(requeued.progress, 0);
    assert!(requeued.error_code.is_none());

    scheduler.cancel(ids[1]).await.unwrap();
    wait_for_state(&mut events, ids[0], UploadState::Success).await;

    let done = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(done.state, UploadState::Success);
    assert_eq!(done.progress, 100);
    assert_eq!(done.attempts, 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_all_requeues_failed_and_expired() {
    let transfer = Arc::new(
        ScriptedTransfer::new(Duration::from_millis(10))
            .script("a.pdf", vec![Step::Fail(TransferFailure::http(500))])
            .script("b.pdf", vec![Step::Fail(TransferFailure::http(403))]),
    );
    let handle = spawn(transfer.clone(), 3);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler
        .enqueue(vec![document("a.pdf"), document("b.pdf"), document("c.pdf")])
        .await
        .unwrap();
    scheduler.start().await.unwrap();
    wait_for_completion(&mut events).await;

    assert_eq!(task_state(&scheduler, ids[0]).await, UploadState::Failed);
    assert_eq!(task_state(&scheduler, ids[1]).await, UploadState::Expired);

    assert_eq!(scheduler.retry_all().await.unwrap(), 2);
    let (total, success, failed) = wait_for_completion(&mut events).await;
    assert_eq!((total, success, failed), (3, 3, 0));
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 5);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_and_uploading() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(10)).script("big.pdf", vec![Step::Hang]));
    let handle = spawn(transfer.clone(), 1);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();
    let mut history = scheduler.subscribe_events();

    let ids = scheduler.enqueue(vec![document("big.pdf"), document("next.pdf")]).await.unwrap();
    scheduler.start().await.unwrap();
    assert_eq!(task_state(&scheduler, ids[0]).await, UploadState::Uploading);

    scheduler.cancel(ids[1]).await.unwrap();
    assert_eq!(task_state(&scheduler, ids[1]).await, UploadState::Canceled);

    scheduler.cancel(ids[0]).await.unwrap();
    // 第二次取消不会出错
    scheduler.cancel(ids[0]).await.unwrap();

    let (total, success, failed) = wait_for_completion(&mut events).await;
    assert_eq!((total, success, failed), (2, 0, 0));

    // settled tasks ignore cancel
    scheduler.cancel(ids[0]).await.unwrap();
    scheduler.cancel(ids[1]).await.unwrap();

    let canceled: Vec<_> = transitions(&mut history)
        .into_iter()
        .filter(|(_, _, new_state)| *new_state == UploadState::Canceled)
        .collect();
    assert_eq!(
        canceled,
        vec![
            (ids[1], UploadState::Queued, UploadState::Canceled),
            (ids[0], UploadState::Uploading, UploadState::Canceled),
        ]
    );

    let big = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(big.state, UploadState::Canceled);
    assert_eq!(big.error_code, Some(UploadErrorCode::Canceled));
    let next = scheduler.get_task(ids[1]).await.unwrap().unwrap();
    assert_eq!(next.attempts, 0);
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 1);

    // canceled tasks are not retryable
    assert!(scheduler.retry(ids[0]).await.is_err());

    let state = scheduler.batch_state().await.unwrap();
    assert_eq!(state.canceled_count, 2);
    assert!(!state.is_complete);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_all_stops_every_active_task() {
    let transfer = Arc::new(
        ScriptedTransfer::new(Duration::from_millis(10))
            .script("a.pdf", vec![Step::Hang])
            .script("b.pdf", vec![Step::Hang]),
    );
    let handle = spawn(transfer.clone(), 2);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    scheduler
        .enqueue(vec![document("a.pdf"), document("b.pdf"), document("c.pdf")])
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    assert_eq!(scheduler.cancel_all().await.unwrap(), 3);
    wait_for_completion(&mut events).await;

    let tasks = scheduler.tasks().await.unwrap();
    assert!(tasks.iter().all(|task| task.state == UploadState::Canceled));
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remove_and_clear_rules() {
    let transfer = Arc::new(
        ScriptedTransfer::new(Duration::from_millis(10))
            .script("bad.pdf", vec![Step::Fail(TransferFailure::http(500))])
            .script("stale.pdf", vec![Step::Fail(TransferFailure::http(401))]),
    );
    let handle = spawn(transfer.clone(), 4);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler
        .enqueue(vec![
            document("good.pdf"),
            document("bad.pdf"),
            document("third.pdf"),
            document("stale.pdf"),
        ])
        .await
        .unwrap();

    // queued tasks cannot be removed
    let err = scheduler.remove(ids[0]).await.unwrap_err();
    assert!(matches!(err, UploaderError::InvalidState { state: UploadState::Queued, .. }));

    let missing = UploadId::new();
    assert!(matches!(scheduler.remove(missing).await, Err(UploaderError::TaskNotFound(id)) if id == missing));

    scheduler.start().await.unwrap();
    wait_for_completion(&mut events).await;
    assert_eq!(task_state(&scheduler, ids[1]).await, UploadState::Failed);
    assert_eq!(task_state(&scheduler, ids[3]).await, UploadState::Expired);

    // failed and expired tasks are kept for retry
    let err = scheduler.remove(ids[1]).await.unwrap_err();
    assert!(matches!(err, UploaderError::InvalidState { state: UploadState::Failed, .. }));
    let err = scheduler.remove(ids[3]).await.unwrap_err();
    assert!(matches!(err, UploaderError::InvalidState { state: UploadState::Expired, .. }));

    scheduler.remove(ids[0]).await.unwrap();
    assert!(scheduler.get_task(ids[0]).await.unwrap().is_none());
    assert_eq!(scheduler.tasks().await.unwrap().len(), 3);

    assert_eq!(scheduler.clear().await.unwrap(), 1);
    let remaining: Vec<UploadId> = scheduler.tasks().await.unwrap().iter().map(|task| task.id).collect();
    assert_eq!(remaining, vec![ids[1], ids[3]]);
    assert_eq!(scheduler.batch_state().await.unwrap().total, 2);

    // 清理之后仍然可以重试
    assert_eq!(scheduler.retry_all().await.unwrap(), 2);
    let (total, success, failed) = wait_for_completion(&mut events).await;
    assert_eq!((total, success, failed), (2, 2, 0));
    assert_eq!(scheduler.clear().await.unwrap(), 2);
    assert!(scheduler.tasks().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remote_rejection_escalates_to_expired() {
    let transfer = Arc::new(
        ScriptedTransfer::new(Duration::from_millis(10))
            .script(
                "session.pdf",
                vec![Step::Fail(TransferFailure::http(400).with_code("EXPIRED_SESSION"))],
            )
            .script("auth.pdf", vec![Step::Fail(TransferFailure::http(401))]),
    );
    let expired_counts = Arc::new(Mutex::new(Vec::new()));
    let counts = expired_counts.clone();
    let handle = UploadScheduler::builder(transfer.clone())
        .on_session_expired(move |count| counts.lock().push(count))
        .spawn();
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler.enqueue(vec![document("session.pdf"), document("auth.pdf")]).await.unwrap();
    scheduler.start().await.unwrap();
    let (_, success, failed) = wait_for_completion(&mut events).await;
    assert_eq!((success, failed), (0, 2));

    let session = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(session.state, UploadState::Expired);
    assert_eq!(session.error_code, Some(UploadErrorCode::ExpiredSession));

    let auth = scheduler.get_task(ids[1]).await.unwrap().unwrap();
    assert_eq!(auth.state, UploadState::Expired);
    assert_eq!(auth.error_code, Some(UploadErrorCode::Unauthorized));

    assert_eq!(*expired_counts.lock(), vec![1, 1]);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_keeps_retry_after() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(10)).script(
        "busy.pdf",
        vec![Step::Fail(TransferFailure::http(429).with_retry_after(Duration::from_secs(5)))],
    ));
    let handle = spawn(transfer.clone(), 3);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler.enqueue(vec![document("busy.pdf")]).await.unwrap();
    scheduler.start().await.unwrap();
    wait_for_completion(&mut events).await;

    let task = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.state, UploadState::Failed);
    assert_eq!(task.error_code, Some(UploadErrorCode::RateLimited));
    assert_eq!(task.retry_after, Some(Duration::from_secs(5)));
    assert_eq!(task.error.as_deref(), Some(UploadErrorCode::RateLimited.message()));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_update_destinations_requeues_expired_tasks() {
    let transfer = Arc::new(
        ScriptedTransfer::new(Duration::from_millis(10)).script("stale.pdf", vec![Step::Fail(TransferFailure::http(403))]),
    );
    let handle = spawn(transfer.clone(), 3);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler.enqueue(vec![document("stale.pdf")]).await.unwrap();
    scheduler.start().await.unwrap();
    wait_for_completion(&mut events).await;
    assert_eq!(task_state(&scheduler, ids[0]).await, UploadState::Expired);

    let fresh = Url::parse("https://uploads.example.com/bucket/stale.pdf?signature=fresh").unwrap();
    let updated = scheduler
        .update_destinations(vec![
            DestinationUpdate {
                id: ids[0],
                upload_url: fresh.clone(),
                upload_key: Some("uploads/stale.pdf".to_string()),
                expires_at: Some(Utc::now() + chrono::Duration::minutes(15)),
            },
            DestinationUpdate {
                id: UploadId::new(),
                upload_url: fresh.clone(),
                upload_key: None,
                expires_at: None,
            },
        ])
        .await
        .unwrap();
    assert_eq!(updated, 1);

    wait_for_completion(&mut events).await;
    let task = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.state, UploadState::Success);
    assert_eq!(task.upload_url, fresh);
    assert_eq!(task.upload_key.as_deref(), Some("uploads/stale.pdf"));
    assert_eq!(transfer.urls.lock().last().map(|(_, url)| url.clone()), Some(fresh));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_mark_expired_stops_active_tasks() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(10)).script("a.pdf", vec![Step::Hang]));
    let handle = spawn(transfer.clone(), 1);
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler.enqueue(vec![document("a.pdf"), document("b.pdf")]).await.unwrap();
    scheduler.start().await.unwrap();

    assert_eq!(scheduler.mark_expired().await.unwrap(), 2);
    assert_eq!(task_state(&scheduler, ids[0]).await, UploadState::Expired);
    assert_eq!(task_state(&scheduler, ids[1]).await, UploadState::Expired);

    let (_, success, failed) = wait_for_completion(&mut events).await;
    assert_eq!((success, failed), (0, 2));
    // 过期后到达的取消结果不会改变状态
    assert_eq!(task_state(&scheduler, ids[0]).await, UploadState::Expired);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_times_out_stuck_transfer() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(10)).script("stuck.pdf", vec![Step::Hang]));
    let handle = UploadScheduler::new(
        transfer.clone(),
        SchedulerConfig {
            transfer_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        },
    );
    let scheduler = handle.scheduler.clone();
    let mut events = scheduler.subscribe_events();

    let ids = scheduler.enqueue(vec![document("stuck.pdf")]).await.unwrap();
    scheduler.start().await.unwrap();
    wait_for_completion(&mut events).await;

    let task = scheduler.get_task(ids[0]).await.unwrap().unwrap();
    assert_eq!(task.state, UploadState::Failed);
    assert_eq!(task.error_code, Some(UploadErrorCode::Timeout));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_progress_never_decreases() {
    let transfer = Arc::new(
        ScriptedTransfer::new(Duration::from_millis(10))
            .script("photo.pdf", vec![Step::Report(vec![10, 5, 60, 60, 90])]),
    );
    let handle = spawn(transfer.clone(), 3);
    let scheduler = handle.scheduler.clone();

    let ids = scheduler.enqueue(vec![document("photo.pdf")]).await.unwrap();
    let mut events = scheduler.subscribe_events();
    scheduler.start().await.unwrap();

    let mut progress = Vec::new();
    let mut transitions = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            UploadEvent::Progress { upload_id, progress: percent } if upload_id == ids[0] => progress.push(percent),
            UploadEvent::StateChanged { old_state, new_state, .. } => transitions.push((old_state, new_state)),
            UploadEvent::AllCompleted { .. } => break,
            _ => {}
        }
    }

    assert_eq!(progress, vec![10, 60, 90]);
    assert_eq!(
        transitions,
        vec![
            (UploadState::Queued, UploadState::Uploading),
            (UploadState::Uploading, UploadState::Success),
        ]
    );
    assert_eq!(scheduler.get_task(ids[0]).await.unwrap().unwrap().progress, 100);

    handle.shutdown().await.unwrap();
}

struct FakeProvider {
    expires_in_seconds: u64,
}

#[async_trait]
impl AuthorizationProvider for FakeProvider {
    async fn get_upload_destination(
        &self,
        file: &FileHandle,
        _category: FileCategory,
    ) -> uploader::core::Result<UploadDestination> {
        if file.name().starts_with("denied") {
            return Err(UploaderError::authorization(403, "not allowed"));
        }
        Ok(UploadDestination {
            url: destination(file.name()),
            key: format!("uploads/{}", file.name()),
            expires_in_seconds: self.expires_in_seconds,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_authorized_keeps_input_order() {
    let transfer = Arc::new(ScriptedTransfer::new(Duration::from_millis(10)));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let handle = UploadScheduler::builder(transfer.clone())
        .provider(Arc::new(FakeProvider { expires_in_seconds: 900 }))
        .clock(clock.clone())
        .spawn();
    let scheduler = handle.scheduler.clone();

    let ok = PendingUpload::new(FileHandle::new("castle.jpg", "image/jpeg", vec![1u8; 64]), FileCategory::GalleryImage);
    let denied = PendingUpload::new(FileHandle::new("denied.jpg", "image/jpeg", vec![1u8; 64]), FileCategory::GalleryImage);
    let ok_id = ok.id;

    let results = scheduler.enqueue_authorized(vec![ok, denied]).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(*results[0].as_ref().unwrap(), ok_id);
    assert!(matches!(results[1], Err(UploaderError::Authorization { status_code: 403, .. })));

    let tasks = scheduler.tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].upload_key.as_deref(), Some("uploads/castle.jpg"));
    assert_eq!(tasks[0].expires_at, Some(clock_now(&clock) + chrono::Duration::seconds(900)));
    assert_eq!(tasks[0].state, UploadState::Queued);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_authorized_requires_provider() {
    let handle = spawn(Arc::new(ScriptedTransfer::new(Duration::from_millis(10))), 3);
    let pending = PendingUpload::new(FileHandle::new("a.pdf", "application/pdf", vec![0u8; 200]), FileCategory::Instruction);

    let result = handle.scheduler.enqueue_authorized(vec![pending]).await;
    assert!(matches!(result, Err(UploaderError::Config(_))));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_further_commands() {
    let handle = spawn(Arc::new(ScriptedTransfer::new(Duration::from_millis(10))), 3);
    let scheduler = handle.scheduler.clone();

    handle.shutdown().await.unwrap();
    assert!(matches!(scheduler.start().await, Err(UploaderError::SchedulerShutdown)));
}
