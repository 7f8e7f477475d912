//! Per-repository build number allocation.

use keel_core::{Build, Error, NewBuild, Result};
use keel_db::BuildStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default number of insert attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Allocates the next build number of a repository and persists the build.
///
/// Each attempt bumps the repository's high-water mark and inserts the
/// build under it in a single store transaction. A taken number or a busy
/// backend is retried with linear backoff. Numbers are never reused, even
/// after a delete; gaps are allowed.
pub struct NumberAllocator {
    store: Arc<dyn BuildStore>,
    max_attempts: u32,
    backoff: Duration,
}

impl NumberAllocator {
    pub fn new(store: Arc<dyn BuildStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            backoff: Duration::from_millis(10),
        }
    }

    /// Set the base delay between attempts. Attempt `n` waits `n * backoff`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Create `build` with the next free number of its repository.
    pub async fn allocate(&self, build: &NewBuild) -> Result<Build> {
        for attempt in 1..=self.max_attempts {
            match self.store.create_next(build).await {
                Ok(created) => return Ok(created),
                Err(e) if e.is_retryable() => {
                    debug!(
                        repo_id = %build.repo_id,
                        attempt,
                        conflict = %e,
                        "Build number not allocated, retrying"
                    );
                    crate::metrics::allocator_retry();
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::ResourceExhausted(format!(
            "no build number for repo {} after {} attempts",
            build.repo_id, self.max_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use keel_core::{BuildId, BuildStatus, Event, RepoId};
    use keel_db::{Database, DbError, DbResult, SqlBuildStore, StatusChange};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that loses the number race a fixed number of times.
    struct ContendedStore {
        inner: SqlBuildStore,
        conflicts: AtomicU32,
        attempts: AtomicU32,
    }

    impl ContendedStore {
        async fn new(conflicts: u32) -> Self {
            Self {
                inner: SqlBuildStore::new(Database::in_memory().await.unwrap()),
                conflicts: AtomicU32::new(conflicts),
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BuildStore for ContendedStore {
        async fn create(&self, build: &NewBuild, number: i64) -> DbResult<Build> {
            self.inner.create(build, number).await
        }

        async fn create_next(&self, build: &NewBuild) -> DbResult<Build> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                if left % 2 == 0 {
                    return Err(DbError::Busy("database is locked".to_string()));
                }
                return Err(DbError::Duplicate("build 1".to_string()));
            }
            self.inner.create_next(build).await
        }

        async fn get(&self, repo_id: RepoId, number: i64) -> DbResult<Build> {
            self.inner.get(repo_id, number).await
        }

        async fn get_by_id(&self, id: BuildId) -> DbResult<Build> {
            self.inner.get_by_id(id).await
        }

        async fn get_last(&self, repo_id: RepoId) -> DbResult<Build> {
            self.inner.get_last(repo_id).await
        }

        async fn get_last_by_branch(&self, repo_id: RepoId, branch: &str) -> DbResult<Build> {
            self.inner.get_last_by_branch(repo_id, branch).await
        }

        async fn list(&self, repo_id: RepoId, page: i64, per_page: i64) -> DbResult<Vec<Build>> {
            self.inner.list(repo_id, page, per_page).await
        }

        async fn list_by_event(
            &self,
            repo_id: RepoId,
            event: Event,
            page: i64,
            per_page: i64,
        ) -> DbResult<Vec<Build>> {
            self.inner
                .list_by_event(repo_id, event, page, per_page)
                .await
        }

        async fn list_all(&self) -> DbResult<Vec<Build>> {
            self.inner.list_all().await
        }

        async fn count(&self) -> DbResult<i64> {
            self.inner.count().await
        }

        async fn count_by_status(&self, status: BuildStatus) -> DbResult<i64> {
            self.inner.count_by_status(status).await
        }

        async fn count_by_repo(&self, repo_id: RepoId) -> DbResult<i64> {
            self.inner.count_by_repo(repo_id).await
        }

        async fn count_by_repo_and_event(&self, repo_id: RepoId, event: Event) -> DbResult<i64> {
            self.inner.count_by_repo_and_event(repo_id, event).await
        }

        async fn update(&self, build: &Build) -> DbResult<Build> {
            self.inner.update(build).await
        }

        async fn update_status(
            &self,
            id: BuildId,
            expected: BuildStatus,
            change: &StatusChange,
        ) -> DbResult<Option<Build>> {
            self.inner.update_status(id, expected, change).await
        }

        async fn set_route(&self, id: BuildId, route: &str) -> DbResult<Build> {
            self.inner.set_route(id, route).await
        }

        async fn mark_enqueued(&self, id: BuildId, at: DateTime<Utc>) -> DbResult<Build> {
            self.inner.mark_enqueued(id, at).await
        }

        async fn delete(&self, id: BuildId) -> DbResult<()> {
            self.inner.delete(id).await
        }
    }

    fn push() -> NewBuild {
        NewBuild::new(RepoId::new(1), Event::Push, "main")
    }

    #[tokio::test]
    async fn test_allocates_sequential_numbers() {
        let store = Arc::new(SqlBuildStore::new(Database::in_memory().await.unwrap()));
        let allocator = NumberAllocator::new(store, DEFAULT_MAX_ATTEMPTS);

        assert_eq!(allocator.allocate(&push()).await.unwrap().number, 1);
        assert_eq!(allocator.allocate(&push()).await.unwrap().number, 2);
    }

    #[tokio::test]
    async fn test_retries_after_conflict() {
        let store = Arc::new(ContendedStore::new(2).await);
        let allocator =
            NumberAllocator::new(store.clone(), 5).with_backoff(Duration::from_millis(1));

        let build = allocator.allocate(&push()).await.unwrap();
        assert_eq!(build.number, 1);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_attempts() {
        let store = Arc::new(ContendedStore::new(10).await);
        let allocator =
            NumberAllocator::new(store.clone(), 3).with_backoff(Duration::from_millis(1));

        let err = allocator.allocate(&push()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_on_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("keel.db").display());
        let db = keel_db::create_pool(&url, &keel_db::PoolSettings::default())
            .await
            .unwrap();
        keel_db::run_migrations(&db).await.unwrap();
        let allocator = Arc::new(NumberAllocator::new(
            Arc::new(SqlBuildStore::new(db)),
            DEFAULT_MAX_ATTEMPTS,
        ));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.allocate(&push()).await })
            })
            .collect();

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap().unwrap().number);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let store = Arc::new(SqlBuildStore::new(Database::in_memory().await.unwrap()));
        let allocator = NumberAllocator::new(store, 0);

        assert_eq!(allocator.max_attempts(), 1);
        assert_eq!(allocator.allocate(&push()).await.unwrap().number, 1);
    }
}
