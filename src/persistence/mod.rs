mod error;
mod record;

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqlitePool};

pub use self::error::Error;
use self::error::Result;
pub use self::record::{BuildStatus, TagRecord};

use crate::registry::Digest;

/// Durable mapping from tag name to last-processed digest and build outcome
///
/// Every mutation is its own SQLite transaction, committed before the
/// orchestration loop moves to the next tag, so a crash between two tags
/// never loses progress already made. New connections should be made by cloning
/// [`Persistence`] rather than repeatedly calling [`Persistence::new`].
#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn new(db_path: &str) -> Result<Self> {
        if !Path::new(db_path).exists() {
            Sqlite::create_database(db_path).await?;
        }

        let pool = SqlitePool::connect(db_path).await?;
        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tags (
                name TEXT PRIMARY KEY,           -- Upstream tag name.
                last_digest TEXT,                -- Digest of the last successfully built content.
                last_seen_digest TEXT,           -- Digest most recently observed upstream.
                last_build_status TEXT NOT NULL, -- Enum indicating the last build outcome.
                last_build_time TEXT             -- Time of the last successful build.
            );",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn get(&self, name: &str) -> Result<Option<TagRecord>> {
        sqlx::query_as("SELECT * FROM tags WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)
    }

    pub async fn all(&self) -> Result<Vec<TagRecord>> {
        sqlx::query_as("SELECT * FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from)
    }

    /// Records the newest digest observed upstream without touching the build
    /// fields, so an interrupted build leaves the tag visibly behind
    pub async fn upsert_seen(&self, name: &str, digest: &Digest) -> Result<()> {
        sqlx::query(
            "INSERT INTO tags (name, last_seen_digest, last_build_status) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET last_seen_digest = excluded.last_seen_digest",
        )
        .bind(name)
        .bind(digest.to_string())
        .bind(BuildStatus::NeverBuilt)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    /// Commits a terminal build outcome. Success advances `last_digest` to
    /// the digest that was built; failure records only the status, leaving
    /// `last_digest` stale so the next cycle retries the tag.
    pub async fn commit_build(
        &self,
        name: &str,
        digest: &Digest,
        status: BuildStatus,
        time: DateTime<Utc>,
    ) -> Result<()> {
        match status {
            BuildStatus::Success => sqlx::query(
                "INSERT INTO tags (name, last_digest, last_seen_digest, last_build_status, last_build_time)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(name) DO UPDATE SET
                     last_digest = excluded.last_digest,
                     last_seen_digest = excluded.last_seen_digest,
                     last_build_status = excluded.last_build_status,
                     last_build_time = excluded.last_build_time",
            )
            .bind(name)
            .bind(digest.to_string())
            .bind(digest.to_string())
            .bind(status)
            .bind(time)
            .execute(&self.pool)
            .await,
            BuildStatus::Failed | BuildStatus::NeverBuilt => sqlx::query(
                "INSERT INTO tags (name, last_build_status) VALUES (?, ?)
                 ON CONFLICT(name) DO UPDATE SET last_build_status = excluded.last_build_status",
            )
            .bind(name)
            .bind(status)
            .execute(&self.pool)
            .await,
        }
        .map(|_| ())
        .map_err(Error::from)
    }
}
