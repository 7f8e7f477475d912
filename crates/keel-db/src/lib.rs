//! Build store for Keel.
//!
//! Provides the `BuildStore` trait and a SQL implementation running on the
//! sqlx `Any` driver, so the same code serves PostgreSQL (clustered
//! deployments) and SQLite (single node, tests). The backend is chosen from
//! the database URL scheme.

pub mod error;
pub mod queries;
pub mod repo;

pub use error::{DbError, DbResult};
pub use queries::{BuildQueries, QueueQueries};
pub use repo::*;

use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Transaction};
use sqlx::migrate::Migrator;
use std::time::Duration;

static POSTGRES_MIGRATIONS: Migrator = sqlx::migrate!("./migrations/postgres");
static SQLITE_MIGRATIONS: Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQL flavour of the connected backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> DbResult<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            // never echo the URL itself, it may carry credentials
            let scheme = url.split(':').next().unwrap_or_default();
            Err(DbError::UnsupportedUrl(format!("scheme {:?}", scheme)))
        }
    }

    pub fn builds(&self) -> &'static BuildQueries {
        match self {
            Dialect::Postgres => &queries::postgres::BUILDS,
            Dialect::Sqlite => &queries::sqlite::BUILDS,
        }
    }

    pub fn queue(&self) -> &'static QueueQueries {
        match self {
            Dialect::Postgres => &queries::postgres::QUEUE,
            Dialect::Sqlite => &queries::sqlite::QUEUE,
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            max_lifetime: Some(Duration::from_secs(30 * 60)),
        }
    }
}

/// A connection pool together with the dialect it speaks.
#[derive(Debug, Clone)]
pub struct Database {
    pool: AnyPool,
    dialect: Dialect,
}

impl Database {
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Check that the backend answers.
    pub async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Begin a transaction that writes.
    ///
    /// SQLite transactions take the write lock at `BEGIN` so that concurrent
    /// writers wait on the busy timeout instead of failing a lock upgrade.
    pub async fn begin_write(&self) -> DbResult<Transaction<'static, Any>> {
        let tx = match self.dialect {
            Dialect::Sqlite => self.pool.begin_with("BEGIN IMMEDIATE").await?,
            Dialect::Postgres => self.pool.begin().await?,
        };
        Ok(tx)
    }

    /// A private, migrated in-memory SQLite database.
    pub async fn in_memory() -> DbResult<Self> {
        let db = create_pool("sqlite::memory:", &PoolSettings::default()).await?;
        run_migrations(&db).await?;
        Ok(db)
    }
}

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, settings: &PoolSettings) -> DbResult<Database> {
    sqlx::any::install_default_drivers();
    let dialect = Dialect::from_url(database_url)?;

    let mut options = AnyPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .max_lifetime(settings.max_lifetime);

    if dialect == Dialect::Sqlite && database_url.contains(":memory:") {
        // every connection to an in-memory database opens a fresh database
        options = options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = options.connect(database_url).await?;
    tracing::debug!(?dialect, "Database pool created");
    Ok(Database { pool, dialect })
}

/// Run database migrations.
pub async fn run_migrations(db: &Database) -> DbResult<()> {
    match db.dialect {
        Dialect::Postgres => POSTGRES_MIGRATIONS.run(&db.pool).await?,
        Dialect::Sqlite => SQLITE_MIGRATIONS.run(&db.pool).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(
            Dialect::from_url("postgres://u:p@localhost/keel").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("sqlite::memory:").unwrap(),
            Dialect::Sqlite
        );

        let err = Dialect::from_url("mysql://root:hunter2@db/keel").unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::in_memory().await.unwrap();
        db.ping().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM builds")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
