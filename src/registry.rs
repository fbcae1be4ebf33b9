//! Process-wide lookup of video id → live download event stream.
//!
//! Registered once the video's identity is known, read by progress
//! subscriptions that attach after the download started. A single locked map
//! is enough: operations touch one key at a time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::SessionStream;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionStream>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `stream` under `id`. Re-registering an id replaces the old
    /// entry (last write wins).
    pub fn register(&self, id: &str, stream: SessionStream) {
        self.inner.write().insert(id.to_owned(), stream);
    }

    pub fn lookup(&self, id: &str) -> Option<SessionStream> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Removes `id` only while it still maps to `stream`, so an eviction
    /// timer from a finished session never tears down the entry of a newer
    /// download that reused the id.
    pub fn remove_expired(&self, id: &str, stream: &SessionStream) {
        let mut map = self.inner.write();
        if map
            .get(id)
            .is_some_and(|current| current.same_session(stream))
        {
            map.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DownloadSession, SessionEvent};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    fn spawn_stub_session(dir: &TempDir, name: &str) -> SessionStream {
        let path = dir.path().join(name);
        std::fs::write(&path, "#!/bin/sh\ntrue\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let url = Url::parse("https://example.test/v").unwrap();
        let (session, _receiver) =
            DownloadSession::spawn(&path, &url, dir.path(), CancellationToken::new()).unwrap();
        session.stream()
    }

    #[tokio::test]
    async fn lookup_of_unknown_id_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.lookup("missing").is_none());
        assert!(!registry.contains("missing"));
    }

    #[tokio::test]
    async fn register_then_lookup_returns_live_stream() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        let stream = spawn_stub_session(&dir, "a");

        registry.register("abc123", stream.clone());
        let found = registry.lookup("abc123").expect("registered stream");
        assert!(found.same_session(&stream));

        // The looked-up handle is live: it can still subscribe and drain
        // the stream to its terminal event.
        let mut receiver = found.subscribe();
        if !found.is_closed() {
            loop {
                match receiver.recv().await {
                    Ok(SessionEvent::Closed) | Ok(SessionEvent::Failed(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    #[tokio::test]
    async fn reregistering_replaces_the_entry() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        let first = spawn_stub_session(&dir, "a");
        let second = spawn_stub_session(&dir, "b");

        registry.register("abc123", first.clone());
        registry.register("abc123", second.clone());

        let found = registry.lookup("abc123").expect("registered stream");
        assert!(found.same_session(&second));
        assert!(!found.same_session(&first));
    }

    #[tokio::test]
    async fn remove_expired_spares_a_newer_session() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        let stale = spawn_stub_session(&dir, "a");
        let fresh = spawn_stub_session(&dir, "b");

        registry.register("abc123", fresh.clone());
        registry.remove_expired("abc123", &stale);
        assert!(registry.contains("abc123"));

        registry.remove_expired("abc123", &fresh);
        assert!(!registry.contains("abc123"));
    }
}
