//! Cookie-bound session records with timed expiry.
//!
//! Sessions are created on first authenticated request, touched on
//! every later one, and expired either by the periodic sweeper or
//! lazily when a request arrives past the deadline. Expire hooks fire
//! exactly once: the entry is removed under the store lock before its
//! hooks run.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How often the sweeper scans for idle sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Recently-expired session ids remembered to tell a locally timed-out
/// session apart from one created on another replica.
const EXPIRED_MEMORY: usize = 1024;

type ExpireHook = Box<dyn FnOnce() + Send>;

struct Session {
    client_ip: String,
    created_at: Instant,
    last_touch: Instant,
    timeout: Duration,
    hooks: Vec<ExpireHook>,
}

impl Session {
    fn deadline(&self) -> Instant {
        self.last_touch + self.timeout
    }
}

#[derive(Default)]
struct ExpiredMemory {
    order: std::collections::VecDeque<String>,
    ids: std::collections::HashSet<String>,
}

impl ExpiredMemory {
    fn remember(&mut self, session_id: &str) {
        if self.ids.insert(session_id.to_string()) {
            self.order.push_back(session_id.to_string());
            while self.order.len() > EXPIRED_MEMORY {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
    }
}

/// Shared store of live sessions keyed by id.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, Session>>>,
    expired: Arc<Mutex<ExpiredMemory>>,
    timeout: Duration,
}

impl SessionStore {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            expired: Arc::new(Mutex::new(ExpiredMemory::default())),
            timeout,
        }
    }

    /// Whether this store expired (or revoked) the session itself, as
    /// opposed to never having seen it.
    #[must_use]
    pub fn was_expired_here(&self, session_id: &str) -> bool {
        self.expired.lock().ids.contains(session_id)
    }

    /// Create a session if absent. Returns true when a new session was
    /// created, false when one already existed (it is touched instead).
    pub fn create(&self, session_id: &str, client_ip: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(session) = inner.get_mut(session_id) {
            session.last_touch = now;
            return false;
        }
        inner.insert(
            session_id.to_string(),
            Session {
                client_ip: client_ip.to_string(),
                created_at: now,
                last_touch: now,
                timeout: self.timeout,
                hooks: Vec::new(),
            },
        );
        debug!(session_id, client_ip, "session created");
        true
    }

    /// Touch a session, resetting its idle timer. Returns false when
    /// the session is unknown or already past its deadline; a session
    /// found past the deadline is expired on the spot.
    pub fn touch(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let expired = {
            let mut inner = self.inner.lock();
            match inner.get_mut(session_id) {
                None => return false,
                Some(session) => {
                    if session.deadline() > now {
                        session.last_touch = now;
                        return true;
                    }
                }
            }
            inner.remove(session_id)
        };
        if let Some(session) = expired {
            debug!(session_id, "session expired on access");
            self.expired.lock().remember(session_id);
            for hook in session.hooks {
                hook();
            }
        }
        false
    }

    /// Register a hook fired when the session expires or is revoked.
    pub fn notify_on_expire(&self, session_id: &str, hook: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.get_mut(session_id) {
            session.hooks.push(Box::new(hook));
        }
    }

    /// Explicitly revoke a session, firing its hooks.
    pub fn revoke(&self, session_id: &str) {
        let removed = self.inner.lock().remove(session_id);
        if let Some(session) = removed {
            debug!(session_id, "session revoked");
            self.expired.lock().remember(session_id);
            for hook in session.hooks {
                hook();
            }
        }
    }

    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .get(session_id)
            .is_some_and(|s| s.deadline() > now)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[must_use]
    pub fn client_ip(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .get(session_id)
            .map(|s| s.client_ip.clone())
    }

    #[must_use]
    pub fn age(&self, session_id: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .lock()
            .get(session_id)
            .map(|s| now.duration_since(s.created_at))
    }

    /// Remove every session past its deadline, firing hooks. Returns
    /// the number of sessions expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Session)> = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .iter()
                .filter(|(_, s)| s.deadline() <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.remove(&id).map(|s| (id, s)))
                .collect()
        };
        let count = expired.len();
        for (session_id, session) in expired {
            debug!(session_id, "session expired");
            self.expired.lock().remember(&session_id);
            for hook in session.hooks {
                hook();
            }
        }
        count
    }

    /// Spawn the periodic sweeper task.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let expired = store.sweep();
                if expired > 0 {
                    debug!(expired, "session sweep");
                }
            }
        })
    }
}
