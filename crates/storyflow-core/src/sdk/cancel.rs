use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Poll interval of [`CancellationManager::confirm_safe_to_proceed`].
const CONFIRM_POLL: Duration = Duration::from_millis(10);

pub type CallId = Uuid;

// ---------------------------------------------------------------------------
// CallRecord
// ---------------------------------------------------------------------------

/// Bookkeeping for one in-flight SDK call. Flags only ever go from false to
/// true.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub id: CallId,
    pub agent_name: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
    pub cleanup_completed: bool,
    pub target_found: bool,
    pub errors: Vec<String>,
    /// The caller stopped waiting; whoever finishes cleanup drops the record.
    orphaned: bool,
}

impl CallRecord {
    /// Both halves of the completion invariant hold.
    pub fn safe_to_proceed(&self) -> bool {
        self.cancel_requested && self.cleanup_completed
    }
}

// ---------------------------------------------------------------------------
// CancellationManager
// ---------------------------------------------------------------------------

/// Thread-safe registry of in-flight SDK calls.
#[derive(Debug, Default)]
pub struct CancellationManager {
    calls: Mutex<HashMap<CallId, CallRecord>>,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<CallId, CallRecord>> {
        // A panic while holding the lock cannot leave a record half-written:
        // every mutation is a single field store.
        self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn update(&self, id: CallId, f: impl FnOnce(&mut CallRecord)) -> bool {
        match self.calls().get_mut(&id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn register(&self, agent_name: &str) -> CallId {
        let id = Uuid::new_v4();
        self.calls().insert(
            id,
            CallRecord {
                id,
                agent_name: agent_name.to_string(),
                started_at: Utc::now(),
                cancel_requested: false,
                cleanup_completed: false,
                target_found: false,
                errors: Vec::new(),
                orphaned: false,
            },
        );
        tracing::trace!(call = %id, agent = agent_name, "sdk call registered");
        id
    }

    pub fn request_cancel(&self, id: CallId) -> bool {
        self.update(id, |r| r.cancel_requested = true)
    }

    pub fn mark_target_found(&self, id: CallId) -> bool {
        self.update(id, |r| r.target_found = true)
    }

    pub fn record_error(&self, id: CallId, error: impl Into<String>) -> bool {
        let error = error.into();
        self.update(id, |r| r.errors.push(error))
    }

    /// Set the cleanup flag. An orphaned record is removed at this point,
    /// since nobody is left to unregister it.
    pub fn mark_cleanup_completed(&self, id: CallId) -> bool {
        let mut calls = self.calls();
        let Some(record) = calls.get_mut(&id) else {
            return false;
        };
        record.cleanup_completed = true;
        if record.orphaned {
            calls.remove(&id);
            tracing::debug!(call = %id, "orphaned sdk call cleaned up");
        }
        true
    }

    /// Note that the caller stopped waiting. If cleanup already finished the
    /// record is dropped immediately.
    pub(crate) fn orphan(&self, id: CallId) {
        let mut calls = self.calls();
        if let Some(record) = calls.get_mut(&id) {
            record.cancel_requested = true;
            record.orphaned = true;
            if record.cleanup_completed {
                calls.remove(&id);
            }
        }
    }

    pub fn unregister(&self, id: CallId) -> Option<CallRecord> {
        self.calls().remove(&id)
    }

    pub fn snapshot(&self, id: CallId) -> Option<CallRecord> {
        self.calls().get(&id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.calls().len()
    }

    pub fn active(&self) -> Vec<CallRecord> {
        let mut records: Vec<_> = self.calls().values().cloned().collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Wait until the call has both `cancel_requested` and
    /// `cleanup_completed` set, polling every few milliseconds up to
    /// `timeout`.
    ///
    /// A call id with no record counts as safe: records are only removed
    /// after their cleanup flag has been set.
    pub async fn confirm_safe_to_proceed(&self, id: CallId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.snapshot(id) {
                None => return true,
                Some(r) if r.safe_to_proceed() => return true,
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(call = %id, ?timeout, "sdk call not safe to proceed past");
                return false;
            }
            tokio::time::sleep(CONFIRM_POLL).await;
        }
    }

    /// Register a call and return a guard that marks cleanup when dropped,
    /// on every exit path including panics and task aborts.
    pub fn guard(self: &Arc<Self>, agent_name: &str) -> CallGuard {
        let id = self.register(agent_name);
        CallGuard {
            manager: Arc::clone(self),
            id,
        }
    }
}

// ---------------------------------------------------------------------------
// CallGuard
// ---------------------------------------------------------------------------

pub struct CallGuard {
    manager: Arc<CancellationManager>,
    id: CallId,
}

impl CallGuard {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn manager(&self) -> &CancellationManager {
        &self.manager
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.manager.mark_cleanup_completed(self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_false() {
        let m = CancellationManager::new();
        let id = m.register("dev");
        let r = m.snapshot(id).unwrap();
        assert!(!r.cancel_requested && !r.cleanup_completed && !r.target_found);
        assert_eq!(r.agent_name, "dev");
    }

    #[test]
    fn safe_requires_both_flags() {
        let m = CancellationManager::new();
        let id = m.register("qa");
        m.request_cancel(id);
        assert!(!m.snapshot(id).unwrap().safe_to_proceed());
        m.mark_cleanup_completed(id);
        assert!(m.snapshot(id).unwrap().safe_to_proceed());
    }

    #[test]
    fn guard_marks_cleanup_on_drop() {
        let m = Arc::new(CancellationManager::new());
        let id = {
            let guard = m.guard("sm");
            assert!(!m.snapshot(guard.id()).unwrap().cleanup_completed);
            guard.id()
        };
        assert!(m.snapshot(id).unwrap().cleanup_completed);
    }

    #[test]
    fn guard_marks_cleanup_on_panic() {
        let m = Arc::new(CancellationManager::new());
        let m2 = Arc::clone(&m);
        let joined = std::thread::spawn(move || {
            let guard = m2.guard("panicky");
            m2.record_error(guard.id(), "about to panic");
            panic!("boom");
        })
        .join();
        assert!(joined.is_err());
        let records = m.active();
        assert_eq!(records.len(), 1);
        assert!(records[0].cleanup_completed);
        assert_eq!(records[0].errors, vec!["about to panic".to_string()]);
    }

    #[test]
    fn orphaned_call_is_removed_once_cleanup_finishes() {
        let m = Arc::new(CancellationManager::new());
        let guard = m.guard("dev");
        let id = guard.id();
        m.orphan(id);
        assert!(m.snapshot(id).is_some());
        drop(guard);
        assert!(m.snapshot(id).is_none());
    }

    #[test]
    fn unknown_ids_are_reported() {
        let m = CancellationManager::new();
        assert!(!m.request_cancel(Uuid::new_v4()));
        assert!(!m.mark_cleanup_completed(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn confirm_waits_for_cleanup() {
        let m = Arc::new(CancellationManager::new());
        let id = m.register("dev");
        m.request_cancel(id);
        let m2 = Arc::clone(&m);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            m2.mark_cleanup_completed(id);
        });
        assert!(m.confirm_safe_to_proceed(id, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn confirm_times_out_without_cancel_request() {
        let m = CancellationManager::new();
        let id = m.register("dev");
        m.mark_cleanup_completed(id);
        assert!(!m.confirm_safe_to_proceed(id, Duration::from_millis(40)).await);
    }

    #[tokio::test]
    async fn confirm_treats_unregistered_call_as_safe() {
        let m = CancellationManager::new();
        let id = m.register("dev");
        m.unregister(id);
        assert!(m.confirm_safe_to_proceed(id, Duration::from_millis(10)).await);
    }
}
