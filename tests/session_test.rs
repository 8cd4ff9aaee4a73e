use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use uploader::core::{FileCategory, FileHandle, Result, UploadId, UploaderError};
use uploader::session::{
    FileMetadata,
    FileMetadataPatch,
    FileStatus,
    FileStore,
    KeyValueStore,
    MemoryStore,
    SessionConfig,
    SessionPatch,
    SessionStore,
    UploaderSession,
    UploaderStep,
    ANON_ID_KEY,
    SESSION_VERSION,
};
use uploader::utils::{Clock, ManualClock};

const ROUTE: &str = "/instructions/new";

/// 记录写入次数的存储
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    writes: AtomicUsize,
    fail_reads: bool,
}

impl CountingStore {
    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn stored(&self, key: &str) -> Option<UploaderSession> {
        self.inner
            .get(key)
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }
}

impl KeyValueStore for CountingStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads {
            return Err(UploaderError::storage("backend unavailable"));
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if key != ANON_ID_KEY {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }
}

fn user_key(user: &str) -> String {
    format!("uploader:{}:user:{}", ROUTE, user)
}

fn anon_key(anon_id: &str) -> String {
    format!("uploader:{}:anon:{}", ROUTE, anon_id)
}

fn draft(title: &str, updated_at: i64) -> UploaderSession {
    let mut session = UploaderSession::empty(None, updated_at);
    session.title = title.to_string();
    session.step = UploaderStep::Files;
    session
}

fn put(store: &CountingStore, key: &str, session: &UploaderSession) {
    store.inner.set(key, &serde_json::to_string(session).unwrap()).unwrap();
}

fn metadata(name: &str) -> FileMetadata {
    let file = FileHandle::new(name, "image/jpeg", vec![1u8; 512]);
    FileMetadata::from_file(UploadId::new(), &file, FileCategory::GalleryImage)
}

#[tokio::test(start_paused = true)]
async fn test_writes_are_debounced() {
    let backend = Arc::new(CountingStore::default());
    let store = SessionStore::builder(backend.clone(), ROUTE).user("u-1").open();

    store.update(SessionPatch::title("A"));
    store.update(SessionPatch::title("AB"));
    store.update(SessionPatch::title("ABC"));
    assert!(store.is_dirty());
    assert_eq!(store.session().title, "ABC");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.writes(), 0);

    // 持续修改会推迟写入
    store.set_step(UploaderStep::Files);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(backend.writes(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.writes(), 1);
    assert!(!store.is_dirty());

    let stored = backend.stored(&user_key("u-1")).unwrap();
    assert_eq!(stored.title, "ABC");
    assert_eq!(stored.step, UploaderStep::Files);
    assert_eq!(stored.version, SESSION_VERSION);
    assert!(stored.anon_session_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_flush_writes_immediately() {
    let backend = Arc::new(CountingStore::default());
    let store = SessionStore::builder(backend.clone(), ROUTE).user("u-1").open();

    store.add_files(vec![metadata("castle.jpg"), metadata("tower.jpg")]);
    store.flush().await;
    assert_eq!(backend.writes(), 1);
    assert_eq!(backend.stored(&user_key("u-1")).unwrap().files.len(), 2);

    // nothing pending, nothing written
    store.flush().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_persists_pending_changes() {
    let backend = Arc::new(CountingStore::default());
    let store = SessionStore::builder(backend.clone(), ROUTE).user("u-1").open();

    store.update(SessionPatch::title("Last words"));
    store.close().await;

    assert_eq!(backend.stored(&user_key("u-1")).unwrap().title, "Last words");
}

#[tokio::test(start_paused = true)]
async fn test_file_list_operations() {
    let backend = Arc::new(CountingStore::default());
    let store = SessionStore::builder(backend.clone(), ROUTE).user("u-1").open();

    let files = vec![metadata("a.jpg"), metadata("b.jpg"), metadata("c.jpg")];
    let b_id = files[1].id;
    store.add_files(files);

    assert_eq!(store.file_index(b_id), Some(1));
    assert!(store.update_file(1, FileMetadataPatch::status(FileStatus::Uploaded)));
    assert!(!store.update_file(7, FileMetadataPatch::status(FileStatus::Failed)));

    let removed = store.remove_file(0).unwrap();
    assert_eq!(removed.name, "a.jpg");
    assert!(store.remove_file(5).is_none());
    assert_eq!(store.file_index(b_id), Some(0));

    let session = store.session();
    assert_eq!(session.files.len(), 2);
    assert_eq!(session.files[0].status, FileStatus::Uploaded);
    assert_eq!(session.files[1].status, FileStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_expired_record_is_discarded() {
    let backend = Arc::new(CountingStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let stale = clock.now_millis() - Duration::from_secs(25 * 60 * 60).as_millis() as i64;
    put(&backend, &user_key("u-1"), &draft("Old castle", stale));

    let restores = Arc::new(AtomicUsize::new(0));
    let counter = restores.clone();
    let store = SessionStore::builder(backend.clone(), ROUTE)
        .user("u-1")
        .clock(clock.clone())
        .on_restore(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .open();

    assert!(!store.was_restored());
    assert!(store.session().is_empty());
    assert!(backend.stored(&user_key("u-1")).is_none());
    assert_eq!(restores.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_record_is_restored_once() {
    let backend = Arc::new(CountingStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let recent = clock.now_millis() - 60_000;
    put(&backend, &user_key("u-1"), &draft("Castle", recent));

    let restores = Arc::new(AtomicUsize::new(0));
    let counter = restores.clone();
    let store = SessionStore::builder(backend.clone(), ROUTE)
        .user("u-1")
        .clock(clock.clone())
        .on_restore(move |session| {
            assert_eq!(session.title, "Castle");
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .open();

    assert!(store.was_restored());
    assert!(!store.is_dirty());
    assert_eq!(store.session().title, "Castle");
    assert_eq!(store.session().step, UploaderStep::Files);

    // reloading does not notify again
    store.load();
    assert_eq!(restores.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_record_is_not_a_restore() {
    let backend = Arc::new(CountingStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    put(&backend, &user_key("u-1"), &UploaderSession::empty(None, clock.now_millis()));

    let restores = Arc::new(AtomicUsize::new(0));
    let counter = restores.clone();
    let store = SessionStore::builder(backend.clone(), ROUTE)
        .user("u-1")
        .clock(clock.clone())
        .on_restore(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .open();

    assert!(!store.was_restored());
    assert_eq!(restores.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_version_mismatch_and_garbage_are_discarded() {
    let backend = Arc::new(CountingStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let mut future = draft("From the future", clock.now_millis());
    future.version = SESSION_VERSION + 1;
    put(&backend, &user_key("u-1"), &future);
    backend.inner.set(&user_key("u-2"), "{not json").unwrap();

    let first = SessionStore::builder(backend.clone(), ROUTE).user("u-1").clock(clock.clone()).open();
    assert!(!first.was_restored());
    assert!(!backend.inner.contains(&user_key("u-1")));

    let second = SessionStore::builder(backend.clone(), ROUTE).user("u-2").clock(clock.clone()).open();
    assert!(!second.was_restored());
    assert!(!backend.inner.contains(&user_key("u-2")));
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_draft_migrates_on_login() {
    let backend = Arc::new(CountingStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));

    // 匿名用户先填写
    let anonymous = SessionStore::builder(backend.clone(), ROUTE).clock(clock.clone()).open();
    let anon_id = backend.inner.get(ANON_ID_KEY).unwrap().unwrap();
    assert_eq!(anonymous.key(), anon_key(&anon_id));
    assert_eq!(anonymous.session().anon_session_id.as_deref(), Some(anon_id.as_str()));

    anonymous.update(SessionPatch::title("Anonymous castle"));
    anonymous.add_files(vec![metadata("castle.jpg")]);
    anonymous.close().await;
    assert!(backend.inner.contains(&anon_key(&anon_id)));

    let restores = Arc::new(AtomicUsize::new(0));
    let counter = restores.clone();
    let user = SessionStore::builder(backend.clone(), ROUTE)
        .user("u-9")
        .clock(clock.clone())
        .on_restore(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .open();

    assert!(user.was_restored());
    assert_eq!(restores.load(Ordering::SeqCst), 1);
    let session = user.session();
    assert_eq!(session.title, "Anonymous castle");
    assert_eq!(session.files.len(), 1);
    assert!(session.anon_session_id.is_none());

    assert!(!backend.inner.contains(&anon_key(&anon_id)));
    let migrated = backend.stored(&user_key("u-9")).unwrap();
    assert_eq!(migrated.title, "Anonymous castle");
    assert!(migrated.anon_session_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_user_record_wins_over_anonymous() {
    let backend = Arc::new(CountingStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    backend.inner.set(ANON_ID_KEY, "anon-1").unwrap();
    put(&backend, &anon_key("anon-1"), &draft("Anonymous", clock.now_millis()));
    put(&backend, &user_key("u-1"), &draft("Mine", clock.now_millis()));

    let store = SessionStore::builder(backend.clone(), ROUTE).user("u-1").clock(clock.clone()).open();
    assert_eq!(store.session().title, "Mine");
    // anonymous draft left alone
    assert!(backend.inner.contains(&anon_key("anon-1")));
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_id_is_reused() {
    let backend = Arc::new(CountingStore::default());

    let first = SessionStore::builder(backend.clone(), ROUTE).open();
    let second = SessionStore::builder(backend.clone(), ROUTE).open();
    assert_eq!(first.key(), second.key());

    let other_route = SessionStore::builder(backend.clone(), "/sets/new").open();
    assert_ne!(first.key(), other_route.key());
    assert_eq!(backend.inner.keys(), vec![ANON_ID_KEY.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_and_finalize_delete_the_record() {
    let backend = Arc::new(CountingStore::default());
    let store = SessionStore::builder(backend.clone(), ROUTE).user("u-1").open();

    store.update(SessionPatch::title("Abandon me"));
    store.flush().await;
    assert!(backend.inner.contains(&user_key("u-1")));

    store.reset();
    assert!(!backend.inner.contains(&user_key("u-1")));
    assert!(store.session().is_empty());
    assert!(!store.is_dirty());

    // a pending write must not bring the record back
    store.update(SessionPatch::title("Finish me"));
    store.mark_finalized();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!backend.inner.contains(&user_key("u-1")));
    assert_eq!(backend.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backend_failure_means_no_session() {
    let backend = Arc::new(CountingStore {
        fail_reads: true,
        ..Default::default()
    });

    let store = SessionStore::builder(backend.clone(), ROUTE).user("u-1").open();
    assert!(!store.was_restored());
    assert!(store.session().is_empty());

    store.update(SessionPatch::title("Still works"));
    store.flush().await;
    assert_eq!(backend.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_custom_ttl() {
    let backend = Arc::new(CountingStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    put(&backend, &user_key("u-1"), &draft("Ten minutes old", clock.now_millis() - 10 * 60 * 1000));

    let config = SessionConfig {
        ttl: Duration::from_secs(5 * 60),
        ..Default::default()
    };
    let store = SessionStore::open(config, backend.clone(), ROUTE, Some("u-1".to_string()), clock.clone());
    assert!(!store.was_restored());
}

#[tokio::test]
async fn test_file_store_backend() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileStore::new(dir.path()).unwrap());

    let store = SessionStore::builder(backend.clone(), ROUTE).user("u-1").open();
    store.update(SessionPatch {
        title: Some("On disk".to_string()),
        tags: Some(vec!["castle".to_string(), "moc".to_string()]),
        ..Default::default()
    });
    store.close().await;

    let reopened = SessionStore::builder(backend, ROUTE).user("u-1").open();
    assert!(reopened.was_restored());
    assert_eq!(reopened.session().tags, vec!["castle", "moc"]);
}
