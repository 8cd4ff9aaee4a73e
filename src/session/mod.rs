//! Durable draft of an upload flow, keyed per route and identity.

mod keys;
mod storage;
mod store;
mod types;

pub use keys::{anonymous_id, session_key, ANON_ID_KEY};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use store::{RestoreCallback, SessionConfig, SessionStore, SessionStoreBuilder};
pub use types::{
    FileMetadata,
    FileMetadataPatch,
    FileStatus,
    SessionPatch,
    UploaderSession,
    UploaderStep,
    SESSION_TTL,
    SESSION_VERSION,
    WRITE_DEBOUNCE,
};
