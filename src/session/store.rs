use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::core::UploadId;
use crate::utils::{SharedClock, system_clock};
use super::keys::{anonymous_id, existing_anonymous_id, session_key};
use super::storage::KeyValueStore;
use super::types::{
    FileMetadata,
    FileMetadataPatch,
    SessionPatch,
    UploaderSession,
    UploaderStep,
    SESSION_TTL,
    SESSION_VERSION,
    WRITE_DEBOUNCE,
};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl: Duration,
    pub debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: SESSION_TTL,
            debounce: WRITE_DEBOUNCE,
        }
    }
}

pub type RestoreCallback = Arc<dyn Fn(&UploaderSession) + Send + Sync>;

enum WriteSignal {
    Dirty,
    Flush(oneshot::Sender<()>),
}

struct SessionState {
    session: UploaderSession,
    key: String,
    dirty: bool,
    restored: bool,
}

/// 写入和删除都在持有锁的情况下完成，reset 之后不会被旧快照覆盖
#[derive(Clone)]
struct Persistence {
    state: Arc<Mutex<SessionState>>,
    backend: Arc<dyn KeyValueStore>,
}

impl Persistence {
    fn write_if_dirty(&self) {
        let mut state = self.state.lock();
        if !state.dirty {
            return;
        }

        match serde_json::to_string(&state.session) {
            Ok(json) => {
                if let Err(err) = self.backend.set(&state.key, &json) {
                    warn!(key = %state.key, error = %err, "Failed to persist uploader session");
                } else {
                    debug!(key = %state.key, files = state.session.files.len(), "Uploader session persisted");
                }
            }
            Err(err) => warn!(key = %state.key, error = %err, "Failed to serialize uploader session"),
        }
        state.dirty = false;
    }
}

/// Durable per-route draft of an upload flow.
///
/// Mutations land in memory immediately; a background writer persists the
/// latest snapshot once no mutation happened for `SessionConfig::debounce`.
/// Must be opened inside a Tokio runtime.
pub struct SessionStore {
    persistence: Persistence,
    route: String,
    user_id: Option<String>,
    anon_id: Option<String>,
    clock: SharedClock,
    config: SessionConfig,
    write_tx: mpsc::UnboundedSender<WriteSignal>,
    writer: JoinHandle<()>,
}

pub struct SessionStoreBuilder {
    backend: Arc<dyn KeyValueStore>,
    route: String,
    user_id: Option<String>,
    clock: Option<SharedClock>,
    config: SessionConfig,
    on_restore: Option<RestoreCallback>,
}

impl SessionStoreBuilder {
    /// Authenticated identity; anonymous when never called.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn identity(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_restore<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UploaderSession) + Send + Sync + 'static,
    {
        self.on_restore = Some(Arc::new(callback));
        self
    }

    pub fn open(self) -> SessionStore {
        let clock = self.clock.unwrap_or_else(system_clock);

        // 登录用户不生成匿名 id，只读取已有的用于迁移
        let anon_id = match self.user_id {
            Some(_) => existing_anonymous_id(self.backend.as_ref()),
            None => Some(anonymous_id(self.backend.as_ref())),
        };
        let key = current_key(&self.route, self.user_id.as_deref(), anon_id.as_deref());

        let session_anon_id = if self.user_id.is_none() { anon_id.clone() } else { None };
        let state = SessionState {
            session: UploaderSession::empty(session_anon_id, clock.now_millis()),
            key,
            dirty: false,
            restored: false,
        };

        let persistence = Persistence {
            state: Arc::new(Mutex::new(state)),
            backend: self.backend,
        };

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(persistence.clone(), write_rx, self.config.debounce));

        let store = SessionStore {
            persistence,
            route: self.route,
            user_id: self.user_id,
            anon_id,
            clock,
            config: self.config,
            write_tx,
            writer,
        };

        let restored = store.load();
        if store.was_restored() {
            info!(route = %store.route, files = restored.files.len(), step = ?restored.step, "Uploader session restored");
            if let Some(callback) = &self.on_restore {
                callback(&restored);
            }
        }

        store
    }
}

fn current_key(route: &str, user_id: Option<&str>, anon_id: Option<&str>) -> String {
    session_key(route, user_id, anon_id.unwrap_or_default())
}

async fn run_writer(
    persistence: Persistence,
    mut rx: mpsc::UnboundedReceiver<WriteSignal>,
    debounce: Duration,
) {
    while let Some(signal) = rx.recv().await {
        match signal {
            WriteSignal::Dirty => {
                // trailing debounce: every new mutation restarts the wait
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => {
                            persistence.write_if_dirty();
                            break;
                        }
                        next = rx.recv() => match next {
                            Some(WriteSignal::Dirty) => continue,
                            Some(WriteSignal::Flush(reply)) => {
                                persistence.write_if_dirty();
                                let _ = reply.send(());
                                break;
                            }
                            None => {
                                persistence.write_if_dirty();
                                return;
                            }
                        }
                    }
                }
            }
            WriteSignal::Flush(reply) => {
                persistence.write_if_dirty();
                let _ = reply.send(());
            }
        }
    }

    persistence.write_if_dirty();
}

impl SessionStore {
    pub fn builder(backend: Arc<dyn KeyValueStore>, route: impl Into<String>) -> SessionStoreBuilder {
        SessionStoreBuilder {
            backend,
            route: route.into(),
            user_id: None,
            clock: None,
            config: SessionConfig::default(),
            on_restore: None,
        }
    }

    pub fn open(
        config: SessionConfig,
        backend: Arc<dyn KeyValueStore>,
        route: impl Into<String>,
        user_id: Option<String>,
        clock: SharedClock,
    ) -> Self {
        Self::builder(backend, route)
            .config(config)
            .identity(user_id)
            .clock(clock)
            .open()
    }

    /// Re-read the durable record, replacing the in-memory draft.
    ///
    /// Falls back to an empty session when nothing usable is stored.
    pub fn load(&self) -> UploaderSession {
        let backend = self.persistence.backend.as_ref();
        let now = self.clock.now_millis();
        let mut state = self.persistence.state.lock();

        let mut adopted = self.read_record(backend, &state.key, now);
        if adopted.is_none() && self.user_id.is_some() {
            adopted = self.migrate_anonymous(backend, &state.key, now);
        }

        match adopted {
            Some(session) => {
                state.restored = !session.is_empty();
                state.session = session;
            }
            None => {
                state.restored = false;
                state.session = UploaderSession::empty(self.session_anon_id(), now);
            }
        }
        state.dirty = false;
        state.session.clone()
    }

    fn read_record(&self, backend: &dyn KeyValueStore, key: &str, now: i64) -> Option<UploaderSession> {
        let raw = match backend.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "Failed to read uploader session");
                return None;
            }
        };

        let discard = |reason: &str| {
            debug!(key, reason, "Discarding stored uploader session");
            if let Err(err) = backend.remove(key) {
                warn!(key, error = %err, "Failed to delete uploader session");
            }
        };

        let session: UploaderSession = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(err) => {
                warn!(key, error = %err, "Stored uploader session is not readable");
                discard("unparsable");
                return None;
            }
        };

        if session.version != SESSION_VERSION {
            discard("version mismatch");
            return None;
        }
        if session.is_expired(now, self.config.ttl) {
            discard("expired");
            return None;
        }

        Some(session)
    }

    /// 匿名草稿在登录后转到用户 key 下
    fn migrate_anonymous(&self, backend: &dyn KeyValueStore, user_key: &str, now: i64) -> Option<UploaderSession> {
        let anon_id = self.anon_id.as_deref()?;
        let anon_key = session_key(&self.route, None, anon_id);
        let mut session = self.read_record(backend, &anon_key, now)?;
        session.anon_session_id = None;

        match serde_json::to_string(&session) {
            Ok(json) => {
                if let Err(err) = backend.set(user_key, &json) {
                    warn!(key = user_key, error = %err, "Failed to write migrated uploader session");
                }
            }
            Err(err) => warn!(error = %err, "Failed to serialize migrated uploader session"),
        }
        if let Err(err) = backend.remove(&anon_key) {
            warn!(key = %anon_key, error = %err, "Failed to delete anonymous uploader session");
        }

        info!(route = %self.route, from = %anon_key, to = user_key, "Anonymous uploader session migrated");
        Some(session)
    }

    fn session_anon_id(&self) -> Option<String> {
        match self.user_id {
            Some(_) => None,
            None => self.anon_id.clone(),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut UploaderSession) -> R) -> R {
        let result = {
            let mut state = self.persistence.state.lock();
            let result = f(&mut state.session);
            state.session.updated_at = self.clock.now_millis();
            state.dirty = true;
            result
        };
        let _ = self.write_tx.send(WriteSignal::Dirty);
        result
    }

    pub fn update(&self, patch: SessionPatch) {
        self.mutate(|session| patch.apply(session));
    }

    pub fn add_files(&self, files: Vec<FileMetadata>) {
        if files.is_empty() {
            return;
        }
        self.mutate(|session| session.files.extend(files));
    }

    /// Out of range is a no-op.
    pub fn remove_file(&self, index: usize) -> Option<FileMetadata> {
        if index >= self.persistence.state.lock().session.files.len() {
            return None;
        }
        self.mutate(|session| {
            if index < session.files.len() {
                Some(session.files.remove(index))
            } else {
                None
            }
        })
    }

    pub fn update_file(&self, index: usize, patch: FileMetadataPatch) -> bool {
        if index >= self.persistence.state.lock().session.files.len() {
            return false;
        }
        self.mutate(|session| match session.files.get_mut(index) {
            Some(file) => {
                patch.apply(file);
                true
            }
            None => false,
        })
    }

    pub fn set_step(&self, step: UploaderStep) {
        self.mutate(|session| session.step = step);
    }

    /// User abandoned the draft.
    pub fn reset(&self) {
        self.discard("abandoned");
    }

    /// The upload flow finished successfully.
    pub fn mark_finalized(&self) {
        self.discard("completed");
    }

    fn discard(&self, outcome: &'static str) {
        let mut state = self.persistence.state.lock();
        state.session = UploaderSession::empty(self.session_anon_id(), self.clock.now_millis());
        state.dirty = false;
        state.restored = false;

        if let Err(err) = self.persistence.backend.remove(&state.key) {
            warn!(key = %state.key, error = %err, "Failed to delete uploader session");
        }
        info!(route = %self.route, key = %state.key, outcome, "Uploader session cleared");
    }

    pub fn session(&self) -> UploaderSession {
        self.persistence.state.lock().session.clone()
    }

    /// There are mutations not yet written.
    pub fn is_dirty(&self) -> bool {
        self.persistence.state.lock().dirty
    }

    pub fn was_restored(&self) -> bool {
        self.persistence.state.lock().restored
    }

    pub fn key(&self) -> String {
        self.persistence.state.lock().key.clone()
    }

    pub fn file_index(&self, id: UploadId) -> Option<usize> {
        self.persistence
            .state
            .lock()
            .session
            .files
            .iter()
            .position(|file| file.id == id)
    }

    /// Write pending mutations now instead of waiting for the debounce.
    pub async fn flush(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.write_tx.send(WriteSignal::Flush(reply_tx)).is_err() || reply_rx.await.is_err() {
            self.persistence.write_if_dirty();
        }
    }

    /// Flush and stop the writer task.
    pub async fn close(self) {
        let SessionStore { persistence, write_tx, writer, .. } = self;
        drop(write_tx);
        if let Err(err) = writer.await {
            warn!(error = %err, "Session writer task failed");
            persistence.write_if_dirty();
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("route", &self.route)
            .field("user_id", &self.user_id)
            .field("key", &self.key())
            .finish()
    }
}
