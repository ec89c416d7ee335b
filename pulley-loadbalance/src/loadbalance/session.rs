use parking_lot::RwLock;
use pulley_core::Clock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct SessionEntry {
    server_id: String,
    expires_at: Instant,
}

/// 会话粘性存储：client key -> server id
///
/// 过期条目在查询时惰性清除，只有移除服务器时才主动清扫
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    timeout: RwLock<Duration>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout: RwLock::new(timeout),
            clock,
        }
    }

    /// 修改超时时间，只影响之后的绑定
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    /// 创建或刷新绑定
    pub fn bind(&self, client_key: &str, server_id: &str) {
        let now = self.clock.now();
        let expires_at = now + *self.timeout.read();

        let mut sessions = self.sessions.write();
        match sessions.get_mut(client_key) {
            Some(entry) if entry.server_id == server_id => {
                entry.expires_at = expires_at;
            }
            _ => {
                sessions.insert(
                    client_key.to_string(),
                    SessionEntry {
                        server_id: server_id.to_string(),
                        expires_at,
                    },
                );
                debug!("Bound client {} to server {}", client_key, server_id);
            }
        }
    }

    /// 查询绑定的服务器，过期则删除并返回 None
    pub fn resolve(&self, client_key: &str) -> Option<String> {
        let now = self.clock.now();

        {
            let sessions = self.sessions.read();
            match sessions.get(client_key) {
                None => return None,
                Some(entry) if now < entry.expires_at => return Some(entry.server_id.clone()),
                Some(_) => {}
            }
        }

        let mut sessions = self.sessions.write();
        // 拿到写锁前可能已被重新绑定
        if let Some(entry) = sessions.get(client_key) {
            if now < entry.expires_at {
                return Some(entry.server_id.clone());
            }
            sessions.remove(client_key);
            debug!("Session for client {} expired", client_key);
        }
        None
    }

    pub fn clear(&self, client_key: &str) -> bool {
        self.sessions.write().remove(client_key).is_some()
    }

    pub fn clear_all(&self) -> usize {
        let mut sessions = self.sessions.write();
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// 删除所有指向该服务器的绑定
    pub fn purge_server(&self, server_id: &str) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.server_id != server_id);
        before - sessions.len()
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| now < entry.expires_at);
        before - sessions.len()
    }

    /// 当前条目数，包含尚未清除的过期条目
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulley_core::ManualClock;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn create_test_store() -> (SessionStore, ManualClock) {
        let clock = ManualClock::new();
        let store = SessionStore::new(TIMEOUT, Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_bind_and_resolve() {
        let (store, _clock) = create_test_store();

        assert_eq!(store.resolve("client-1"), None);
        store.bind("client-1", "a");
        assert_eq!(store.resolve("client-1").as_deref(), Some("a"));

        store.bind("client-1", "b");
        assert_eq!(store.resolve("client-1").as_deref(), Some("b"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_session_is_evicted_on_resolve() {
        let (store, clock) = create_test_store();
        store.bind("client-1", "a");

        clock.advance(TIMEOUT - Duration::from_millis(1));
        assert_eq!(store.resolve("client-1").as_deref(), Some("a"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.resolve("client-1"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_rebind_refreshes_expiry() {
        let (store, clock) = create_test_store();
        store.bind("client-1", "a");

        clock.advance(Duration::from_secs(50));
        store.bind("client-1", "a");
        clock.advance(Duration::from_secs(50));

        assert_eq!(store.resolve("client-1").as_deref(), Some("a"));
    }

    #[test]
    fn test_purge_server_only_removes_its_bindings() {
        let (store, _clock) = create_test_store();
        store.bind("client-1", "a");
        store.bind("client-2", "b");
        store.bind("client-3", "a");

        assert_eq!(store.purge_server("a"), 2);
        assert_eq!(store.resolve("client-1"), None);
        assert_eq!(store.resolve("client-2").as_deref(), Some("b"));
    }

    #[test]
    fn test_clear_and_clear_all() {
        let (store, _clock) = create_test_store();
        store.bind("client-1", "a");
        store.bind("client-2", "b");

        assert!(store.clear("client-1"));
        assert!(!store.clear("client-1"));
        assert_eq!(store.clear_all(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let (store, clock) = create_test_store();
        store.bind("client-1", "a");
        clock.advance(Duration::from_secs(30));
        store.bind("client-2", "b");
        clock.advance(Duration::from_secs(30));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.resolve("client-2").as_deref(), Some("b"));
    }
}
