//! Build repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{Build, BuildId, BuildStatus, Event, NewBuild, Pagination, RepoId};
use sqlx::{Any, Transaction};

use crate::queries::BuildQueries;
use crate::{Database, DbError, DbResult};

/// A build row as stored in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: i64,
    pub repo_id: i64,
    pub number: i64,
    pub event: String,
    pub branch: String,
    pub status: String,
    pub route: String,
    pub error: String,
    pub created_at: i64,
    pub enqueued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl BuildRecord {
    pub fn into_build(self) -> DbResult<Build> {
        let event = self
            .event
            .parse::<Event>()
            .map_err(|_| DbError::Corrupt(format!("build {}: event {:?}", self.id, self.event)))?;
        let status = self.status.parse::<BuildStatus>().map_err(|_| {
            DbError::Corrupt(format!("build {}: status {:?}", self.id, self.status))
        })?;

        Ok(Build {
            id: BuildId::new(self.id),
            repo_id: RepoId::new(self.repo_id),
            number: self.number,
            event,
            branch: self.branch,
            status,
            route: self.route,
            error: self.error,
            created_at: from_unix(self.id, self.created_at)?,
            enqueued_at: self.enqueued_at.map(|t| from_unix(self.id, t)).transpose()?,
            started_at: self.started_at.map(|t| from_unix(self.id, t)).transpose()?,
            finished_at: self.finished_at.map(|t| from_unix(self.id, t)).transpose()?,
        })
    }
}

fn from_unix(id: i64, secs: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DbError::Corrupt(format!("build {}: timestamp {}", id, secs)))
}

/// A status change applied with compare-and-set semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: BuildStatus,
    /// Replaces the stored error message when set.
    pub error: Option<String>,
    /// Only applied if the build has no start time yet.
    pub started_at: Option<DateTime<Utc>>,
    /// Only applied if the build has no finish time yet.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    pub fn new(status: BuildStatus) -> Self {
        Self {
            status,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Insert a build with an explicit number; fails with `Duplicate` if
    /// `(repo_id, number)` is taken. Later `create_next` calls number past it.
    async fn create(&self, build: &NewBuild, number: i64) -> DbResult<Build>;
    /// Insert a build numbered one past the highest number its repository
    /// ever handed out, inside a single transaction. Numbers of deleted
    /// builds are not reused. Fails with `Busy` when the backend could not
    /// take the write lock in time.
    async fn create_next(&self, build: &NewBuild) -> DbResult<Build>;

    async fn get(&self, repo_id: RepoId, number: i64) -> DbResult<Build>;
    async fn get_by_id(&self, id: BuildId) -> DbResult<Build>;
    async fn get_last(&self, repo_id: RepoId) -> DbResult<Build>;
    async fn get_last_by_branch(&self, repo_id: RepoId, branch: &str) -> DbResult<Build>;

    /// Builds of a repository, highest number first.
    async fn list(&self, repo_id: RepoId, page: i64, per_page: i64) -> DbResult<Vec<Build>>;
    async fn list_by_event(
        &self,
        repo_id: RepoId,
        event: Event,
        page: i64,
        per_page: i64,
    ) -> DbResult<Vec<Build>>;
    /// Every build in the store, in id order.
    async fn list_all(&self) -> DbResult<Vec<Build>>;

    async fn count(&self) -> DbResult<i64>;
    async fn count_by_status(&self, status: BuildStatus) -> DbResult<i64>;
    async fn count_by_repo(&self, repo_id: RepoId) -> DbResult<i64>;
    async fn count_by_repo_and_event(&self, repo_id: RepoId, event: Event) -> DbResult<i64>;

    /// Overwrite the mutable fields of a build, keyed by id.
    async fn update(&self, build: &Build) -> DbResult<Build>;
    /// Apply `change` only if the stored status is still `expected`.
    /// Returns `None` when the build is missing or its status moved on.
    async fn update_status(
        &self,
        id: BuildId,
        expected: BuildStatus,
        change: &StatusChange,
    ) -> DbResult<Option<Build>>;
    /// Record the route a build is dispatched on, leaving its status alone.
    async fn set_route(&self, id: BuildId, route: &str) -> DbResult<Build>;
    /// Record when the dispatch message was published. The first time wins.
    async fn mark_enqueued(&self, id: BuildId, at: DateTime<Utc>) -> DbResult<Build>;

    async fn delete(&self, id: BuildId) -> DbResult<()>;
}

/// SQL implementation of BuildStore.
#[derive(Debug, Clone)]
pub struct SqlBuildStore {
    db: Database,
}

impl SqlBuildStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn queries(&self) -> &'static BuildQueries {
        self.db.dialect().builds()
    }

    async fn fetch_optional<'q>(
        &self,
        query: sqlx::query::QueryAs<'q, sqlx::Any, BuildRecord, sqlx::any::AnyArguments<'q>>,
    ) -> DbResult<Option<Build>> {
        query
            .fetch_optional(self.db.pool())
            .await?
            .map(BuildRecord::into_build)
            .transpose()
    }

    async fn fetch_all<'q>(
        &self,
        query: sqlx::query::QueryAs<'q, sqlx::Any, BuildRecord, sqlx::any::AnyArguments<'q>>,
    ) -> DbResult<Vec<Build>> {
        query
            .fetch_all(self.db.pool())
            .await?
            .into_iter()
            .map(BuildRecord::into_build)
            .collect()
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'static, Any>,
        build: &NewBuild,
        number: i64,
    ) -> DbResult<BuildRecord> {
        sqlx::query_as::<_, BuildRecord>(self.queries().insert)
            .bind(build.repo_id.get())
            .bind(number)
            .bind(build.event.as_str())
            .bind(build.branch.as_str())
            .bind(BuildStatus::Pending.as_str())
            .bind(Utc::now().timestamp())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                DbError::on_insert(e, || {
                    format!("build {} for repo {}", number, build.repo_id)
                })
            })
    }

    async fn count_with<'q>(
        &self,
        query: sqlx::query::QueryScalar<'q, sqlx::Any, i64, sqlx::any::AnyArguments<'q>>,
    ) -> DbResult<i64> {
        Ok(query.fetch_one(self.db.pool()).await?)
    }
}

#[async_trait]
impl BuildStore for SqlBuildStore {
    async fn create(&self, build: &NewBuild, number: i64) -> DbResult<Build> {
        if number < 1 {
            return Err(DbError::InvalidArgument(format!(
                "build number must be positive, got {}",
                number
            )));
        }

        let mut tx = self.db.begin_write().await?;
        sqlx::query(self.queries().raise_number)
            .bind(build.repo_id.get())
            .bind(number)
            .execute(&mut *tx)
            .await?;
        let record = self.insert(&mut tx, build, number).await?;
        tx.commit().await?;
        record.into_build()
    }

    async fn create_next(&self, build: &NewBuild) -> DbResult<Build> {
        let mut tx = self.db.begin_write().await?;
        let number: i64 = sqlx::query_scalar::<_, i64>(self.queries().next_number)
            .bind(build.repo_id.get())
            .fetch_one(&mut *tx)
            .await?;
        let record = self.insert(&mut tx, build, number).await?;
        tx.commit().await?;
        record.into_build()
    }

    async fn get(&self, repo_id: RepoId, number: i64) -> DbResult<Build> {
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().select_repo_build)
            .bind(repo_id.get())
            .bind(number);
        self.fetch_optional(query)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {} for repo {}", number, repo_id)))
    }

    async fn get_by_id(&self, id: BuildId) -> DbResult<Build> {
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().select_by_id).bind(id.get());
        self.fetch_optional(query)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn get_last(&self, repo_id: RepoId) -> DbResult<Build> {
        let query =
            sqlx::query_as::<_, BuildRecord>(self.queries().select_last).bind(repo_id.get());
        self.fetch_optional(query)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("last build for repo {}", repo_id)))
    }

    async fn get_last_by_branch(&self, repo_id: RepoId, branch: &str) -> DbResult<Build> {
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().select_last_by_branch)
            .bind(repo_id.get())
            .bind(branch);
        self.fetch_optional(query).await?.ok_or_else(|| {
            DbError::NotFound(format!(
                "last build for repo {} on branch {:?}",
                repo_id, branch
            ))
        })
    }

    async fn list(&self, repo_id: RepoId, page: i64, per_page: i64) -> DbResult<Vec<Build>> {
        let page = Pagination::new(page, per_page)?;
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().list_repo)
            .bind(repo_id.get())
            .bind(page.limit())
            .bind(page.offset());
        self.fetch_all(query).await
    }

    async fn list_by_event(
        &self,
        repo_id: RepoId,
        event: Event,
        page: i64,
        per_page: i64,
    ) -> DbResult<Vec<Build>> {
        let page = Pagination::new(page, per_page)?;
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().list_repo_by_event)
            .bind(repo_id.get())
            .bind(event.as_str())
            .bind(page.limit())
            .bind(page.offset());
        self.fetch_all(query).await
    }

    async fn list_all(&self) -> DbResult<Vec<Build>> {
        self.fetch_all(sqlx::query_as::<_, BuildRecord>(self.queries().list_all))
            .await
    }

    async fn count(&self) -> DbResult<i64> {
        self.count_with(sqlx::query_scalar::<_, i64>(self.queries().count))
            .await
    }

    async fn count_by_status(&self, status: BuildStatus) -> DbResult<i64> {
        self.count_with(
            sqlx::query_scalar::<_, i64>(self.queries().count_by_status).bind(status.as_str()),
        )
        .await
    }

    async fn count_by_repo(&self, repo_id: RepoId) -> DbResult<i64> {
        self.count_with(
            sqlx::query_scalar::<_, i64>(self.queries().count_by_repo).bind(repo_id.get()),
        )
        .await
    }

    async fn count_by_repo_and_event(&self, repo_id: RepoId, event: Event) -> DbResult<i64> {
        self.count_with(
            sqlx::query_scalar::<_, i64>(self.queries().count_by_repo_and_event)
                .bind(repo_id.get())
                .bind(event.as_str()),
        )
        .await
    }

    async fn update(&self, build: &Build) -> DbResult<Build> {
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().update)
            .bind(build.event.as_str())
            .bind(build.branch.as_str())
            .bind(build.status.as_str())
            .bind(build.route.as_str())
            .bind(build.error.as_str())
            .bind(build.enqueued_at.map(|t| t.timestamp()))
            .bind(build.started_at.map(|t| t.timestamp()))
            .bind(build.finished_at.map(|t| t.timestamp()))
            .bind(build.id.get());
        self.fetch_optional(query)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", build.id)))
    }

    async fn update_status(
        &self,
        id: BuildId,
        expected: BuildStatus,
        change: &StatusChange,
    ) -> DbResult<Option<Build>> {
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().update_status)
            .bind(change.status.as_str())
            .bind(change.error.clone())
            .bind(change.started_at.map(|t| t.timestamp()))
            .bind(change.finished_at.map(|t| t.timestamp()))
            .bind(id.get())
            .bind(expected.as_str());
        self.fetch_optional(query).await
    }

    async fn set_route(&self, id: BuildId, route: &str) -> DbResult<Build> {
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().set_route)
            .bind(route)
            .bind(id.get());
        self.fetch_optional(query)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn mark_enqueued(&self, id: BuildId, at: DateTime<Utc>) -> DbResult<Build> {
        let query = sqlx::query_as::<_, BuildRecord>(self.queries().mark_enqueued)
            .bind(at.timestamp())
            .bind(id.get());
        self.fetch_optional(query)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn delete(&self, id: BuildId) -> DbResult<()> {
        let result = sqlx::query(self.queries().delete)
            .bind(id.get())
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", id)));
        }
        Ok(())
    }
}
