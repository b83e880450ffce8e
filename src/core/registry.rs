use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::core::model::{TrackedJob, Uid};

/// Shared job table, keyed by the originating request's uid. Membership
/// here is the sole source of truth for "is this job still tracked":
/// every handler re-checks it before acting, because engine callbacks
/// race with each other and with listener-side cleanup.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<Uid, TrackedJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access for read-modify-write sequences (insert,
    /// membership-check-then-replace). Keep the guard scope tight.
    pub async fn lock(&self) -> MutexGuard<'_, HashMap<Uid, TrackedJob>> {
        self.inner.lock().await
    }

    pub async fn find_by_gid(&self, gid: &str) -> Option<TrackedJob> {
        let jobs = self.inner.lock().await;
        jobs.values().find(|job| job.gid == gid).cloned()
    }

    pub async fn insert(&self, job: TrackedJob) {
        let mut jobs = self.inner.lock().await;
        jobs.insert(job.uid(), job);
    }

    pub async fn remove(&self, uid: Uid) -> Option<TrackedJob> {
        let mut jobs = self.inner.lock().await;
        jobs.remove(&uid)
    }

    pub async fn contains(&self, uid: Uid) -> bool {
        let jobs = self.inner.lock().await;
        jobs.contains_key(&uid)
    }

    /// Snapshot for status displays.
    pub async fn jobs(&self) -> Vec<TrackedJob> {
        let jobs = self.inner.lock().await;
        jobs.values().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        let jobs = self.inner.lock().await;
        jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::listener::Listener;
    use crate::core::testkit::RecordingListener;

    #[tokio::test]
    async fn find_by_gid_sees_inserted_jobs() {
        let registry = JobRegistry::new();
        let listener = RecordingListener::plain();
        let uid = listener.uid();
        registry.insert(TrackedJob::new("g1".into(), listener)).await;

        assert!(registry.contains(uid).await);
        let found = registry.find_by_gid("g1").await.expect("job");
        assert_eq!(found.uid(), uid);
        assert!(!found.seeding);
        assert!(registry.find_by_gid("g2").await.is_none());
    }

    #[tokio::test]
    async fn remove_is_terminal() {
        let registry = JobRegistry::new();
        let listener = RecordingListener::plain();
        let uid = listener.uid();
        registry.insert(TrackedJob::new("g1".into(), listener)).await;

        assert!(registry.remove(uid).await.is_some());
        assert!(registry.remove(uid).await.is_none());
        assert!(registry.find_by_gid("g1").await.is_none());
        assert!(registry.is_empty().await);
    }
}
