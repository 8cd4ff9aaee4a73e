use tracing::warn;
use uuid::Uuid;
use super::storage::KeyValueStore;

pub const KEY_PREFIX: &str = "uploader";
/// Lives outside any single session record.
pub const ANON_ID_KEY: &str = "uploader:anon-id";

/// `uploader:{route}:user:{id}` when authenticated, otherwise
/// `uploader:{route}:anon:{anon_id}`.
pub fn session_key(route: &str, user_id: Option<&str>, anon_id: &str) -> String {
    match user_id {
        Some(user_id) => format!("{}:{}:user:{}", KEY_PREFIX, route, user_id),
        None => format!("{}:{}:anon:{}", KEY_PREFIX, route, anon_id),
    }
}

/// The persisted anonymous id, if one was ever generated.
pub fn existing_anonymous_id(store: &dyn KeyValueStore) -> Option<String> {
    match store.get(ANON_ID_KEY) {
        Ok(id) => id.filter(|id| !id.trim().is_empty()),
        Err(err) => {
            warn!(error = %err, "Failed to read anonymous id");
            None
        }
    }
}

/// Read the anonymous id, generating and persisting one on first use.
pub fn anonymous_id(store: &dyn KeyValueStore) -> String {
    if let Some(id) = existing_anonymous_id(store) {
        return id;
    }

    let id = Uuid::new_v4().to_string();
    if let Err(err) = store.set(ANON_ID_KEY, &id) {
        warn!(error = %err, "Failed to persist anonymous id");
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::storage::MemoryStore;

    #[test]
    fn test_session_key() {
        assert_eq!(session_key("/moc/new", Some("u-1"), "a-1"), "uploader:/moc/new:user:u-1");
        assert_eq!(session_key("/moc/new", None, "a-1"), "uploader:/moc/new:anon:a-1");
    }

    #[test]
    fn test_anonymous_id_is_stable() {
        let store = MemoryStore::new();
        assert_eq!(existing_anonymous_id(&store), None);

        let first = anonymous_id(&store);
        let second = anonymous_id(&store);
        assert_eq!(first, second);
        assert_eq!(store.get(ANON_ID_KEY).unwrap(), Some(first));
    }
}
