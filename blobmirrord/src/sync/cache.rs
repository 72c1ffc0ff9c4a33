use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::SystemTime;

use blobmirror_core::{BlobProperties, ContainerProperties, PublicAccess};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const LOOKUP_CHUNK: usize = 500;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid public access level: {0}")]
    InvalidPublicAccess(String),
    #[error("container not found: {0}")]
    MissingContainer(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub id: i64,
    pub name: String,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
    pub metadata: BTreeMap<String, String>,
    pub public_access: PublicAccess,
    pub has_legal_hold: bool,
    pub has_immutability_policy: bool,
    pub blob_count: i64,
    pub total_size: i64,
    pub cache_copy_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobRecord {
    pub id: i64,
    pub container_name: String,
    pub name: String,
    pub etag: Option<String>,
    pub last_modified: Option<i64>,
    pub content_type: Option<String>,
    pub content_length: i64,
    pub content_encoding: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub has_legal_hold: bool,
    pub retention_until: Option<i64>,
    pub cache_copy_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSessionRecord {
    pub id: String,
    pub container_name: String,
    pub blob_name: String,
    pub created_at: i64,
    pub last_activity_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionCounts {
    pub containers: u64,
    pub blobs: u64,
}

#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, CacheError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_at(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), CacheError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_container(
        &self,
        container: &ContainerProperties,
        token: &str,
    ) -> Result<ContainerRecord, CacheError> {
        sqlx::query(
            "INSERT INTO containers (
                name,
                etag,
                last_modified,
                metadata,
                public_access,
                has_legal_hold,
                has_immutability_policy,
                cache_copy_id
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(name) DO UPDATE SET
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                metadata = excluded.metadata,
                public_access = excluded.public_access,
                has_legal_hold = excluded.has_legal_hold,
                has_immutability_policy = excluded.has_immutability_policy,
                cache_copy_id = excluded.cache_copy_id",
        )
        .bind(&container.name)
        .bind(&container.etag)
        .bind(container.last_modified.map(unix_seconds))
        .bind(serde_json::to_string(&container.metadata)?)
        .bind(container.public_access.as_str())
        .bind(container.has_legal_hold)
        .bind(container.has_immutability_policy)
        .bind(token)
        .execute(&self.pool)
        .await?;

        self.get_container(&container.name)
            .await?
            .ok_or_else(|| CacheError::MissingContainer(container.name.clone()))
    }

    pub async fn upsert_blobs(
        &self,
        container: &str,
        batch: &[BlobProperties],
        token: &str,
    ) -> Result<usize, CacheError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let mut existing: HashMap<String, i64> = HashMap::with_capacity(batch.len());
        for chunk in batch.chunks(LOOKUP_CHUNK) {
            let mut lookup =
                QueryBuilder::<Sqlite>::new("SELECT id, name FROM blobs WHERE container_name = ");
            lookup.push_bind(container).push(" AND name IN (");
            let mut names = lookup.separated(", ");
            for blob in chunk {
                names.push_bind(blob.name.as_str());
            }
            names.push_unseparated(")");
            for row in lookup.build().fetch_all(&mut *tx).await? {
                existing.insert(row.try_get("name")?, row.try_get("id")?);
            }
        }

        for blob in batch {
            let metadata = serde_json::to_string(&blob.metadata)?;
            let tags = serde_json::to_string(&blob.tags)?;
            let content_length = i64::try_from(blob.content_length).unwrap_or(i64::MAX);
            match existing.get(&blob.name) {
                Some(id) => {
                    sqlx::query(
                        "UPDATE blobs SET
                            etag = ?1,
                            last_modified = ?2,
                            content_type = ?3,
                            content_length = ?4,
                            content_encoding = ?5,
                            metadata = ?6,
                            tags = ?7,
                            has_legal_hold = ?8,
                            retention_until = ?9,
                            cache_copy_id = ?10
                         WHERE id = ?11",
                    )
                    .bind(&blob.etag)
                    .bind(blob.last_modified.map(unix_seconds))
                    .bind(&blob.content_type)
                    .bind(content_length)
                    .bind(&blob.content_encoding)
                    .bind(metadata)
                    .bind(tags)
                    .bind(blob.has_legal_hold)
                    .bind(blob.retention_until.map(unix_seconds))
                    .bind(token)
                    .bind(*id)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    // A listing can repeat a name within one batch, so inserts still upsert.
                    sqlx::query(
                        "INSERT INTO blobs (
                            container_name,
                            name,
                            etag,
                            last_modified,
                            content_type,
                            content_length,
                            content_encoding,
                            metadata,
                            tags,
                            has_legal_hold,
                            retention_until,
                            cache_copy_id
                        )
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                        ON CONFLICT(container_name, name) DO UPDATE SET
                            etag = excluded.etag,
                            last_modified = excluded.last_modified,
                            content_type = excluded.content_type,
                            content_length = excluded.content_length,
                            content_encoding = excluded.content_encoding,
                            metadata = excluded.metadata,
                            tags = excluded.tags,
                            has_legal_hold = excluded.has_legal_hold,
                            retention_until = excluded.retention_until,
                            cache_copy_id = excluded.cache_copy_id",
                    )
                    .bind(container)
                    .bind(&blob.name)
                    .bind(&blob.etag)
                    .bind(blob.last_modified.map(unix_seconds))
                    .bind(&blob.content_type)
                    .bind(content_length)
                    .bind(&blob.content_encoding)
                    .bind(metadata)
                    .bind(tags)
                    .bind(blob.has_legal_hold)
                    .bind(blob.retention_until.map(unix_seconds))
                    .bind(token)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(batch.len())
    }

    pub async fn set_container_totals(
        &self,
        container: &str,
        blob_count: u64,
        total_size: u64,
    ) -> Result<(), CacheError> {
        let result =
            sqlx::query("UPDATE containers SET blob_count = ?1, total_size = ?2 WHERE name = ?3")
                .bind(i64::try_from(blob_count).unwrap_or(i64::MAX))
                .bind(i64::try_from(total_size).unwrap_or(i64::MAX))
                .bind(container)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(CacheError::MissingContainer(container.to_string()));
        }
        Ok(())
    }

    pub async fn delete_where_token_not(&self, token: &str) -> Result<EvictionCounts, CacheError> {
        let mut tx = self.pool.begin().await?;
        let blobs = sqlx::query("DELETE FROM blobs WHERE cache_copy_id <> ?1")
            .bind(token)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let containers = sqlx::query("DELETE FROM containers WHERE cache_copy_id <> ?1")
            .bind(token)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(EvictionCounts { containers, blobs })
    }

    pub async fn delete_stale_uploads(&self, cutoff: i64) -> Result<u64, CacheError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM upload_blocks WHERE session_id IN (
                SELECT id FROM upload_sessions WHERE last_activity_at < ?1
            )",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let sessions = sqlx::query("DELETE FROM upload_sessions WHERE last_activity_at < ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(sessions)
    }

    pub async fn get_container(&self, name: &str) -> Result<Option<ContainerRecord>, CacheError> {
        let row = sqlx::query(
            "SELECT id, name, etag, last_modified, metadata, public_access, has_legal_hold, has_immutability_policy, blob_count, total_size, cache_copy_id
             FROM containers WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(container_from_row).transpose()
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerRecord>, CacheError> {
        let rows = sqlx::query(
            "SELECT id, name, etag, last_modified, metadata, public_access, has_legal_hold, has_immutability_policy, blob_count, total_size, cache_copy_id
             FROM containers
             ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(container_from_row).collect()
    }

    pub async fn get_blob(
        &self,
        container: &str,
        name: &str,
    ) -> Result<Option<BlobRecord>, CacheError> {
        let row = sqlx::query(
            "SELECT id, container_name, name, etag, last_modified, content_type, content_length, content_encoding, metadata, tags, has_legal_hold, retention_until, cache_copy_id
             FROM blobs WHERE container_name = ?1 AND name = ?2",
        )
        .bind(container)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(blob_from_row).transpose()
    }

    pub async fn list_blobs(&self, container: &str) -> Result<Vec<BlobRecord>, CacheError> {
        let rows = sqlx::query(
            "SELECT id, container_name, name, etag, last_modified, content_type, content_length, content_encoding, metadata, tags, has_legal_hold, retention_until, cache_copy_id
             FROM blobs
             WHERE container_name = ?1
             ORDER BY name ASC",
        )
        .bind(container)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(blob_from_row).collect()
    }

    pub async fn record_upload_activity(
        &self,
        session_id: &str,
        container: &str,
        blob: &str,
        at: i64,
    ) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO upload_sessions (id, container_name, blob_name, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET last_activity_at = excluded.last_activity_at",
        )
        .bind(session_id)
        .bind(container)
        .bind(blob)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_upload_block(
        &self,
        session_id: &str,
        block_id: &str,
        size: i64,
    ) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO upload_blocks (session_id, block_id, size) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id, block_id) DO UPDATE SET size = excluded.size",
        )
        .bind(session_id)
        .bind(block_id)
        .bind(size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_upload_session(
        &self,
        session_id: &str,
    ) -> Result<Option<UploadSessionRecord>, CacheError> {
        let row = sqlx::query(
            "SELECT id, container_name, blob_name, created_at, last_activity_at FROM upload_sessions WHERE id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(UploadSessionRecord {
            id: row.try_get("id")?,
            container_name: row.try_get("container_name")?,
            blob_name: row.try_get("blob_name")?,
            created_at: row.try_get("created_at")?,
            last_activity_at: row.try_get("last_activity_at")?,
        }))
    }

    pub async fn count_upload_blocks(&self, session_id: &str) -> Result<i64, CacheError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM upload_blocks WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

pub fn unix_seconds(at: SystemTime) -> i64 {
    OffsetDateTime::from(at).unix_timestamp()
}

fn container_from_row(row: &SqliteRow) -> Result<ContainerRecord, CacheError> {
    let metadata: String = row.try_get("metadata")?;
    let public_access: String = row.try_get("public_access")?;
    Ok(ContainerRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        metadata: serde_json::from_str(&metadata)?,
        public_access: PublicAccess::parse(&public_access)
            .ok_or(CacheError::InvalidPublicAccess(public_access))?,
        has_legal_hold: row.try_get("has_legal_hold")?,
        has_immutability_policy: row.try_get("has_immutability_policy")?,
        blob_count: row.try_get("blob_count")?,
        total_size: row.try_get("total_size")?,
        cache_copy_id: row.try_get("cache_copy_id")?,
    })
}

fn blob_from_row(row: &SqliteRow) -> Result<BlobRecord, CacheError> {
    let metadata: String = row.try_get("metadata")?;
    let tags: String = row.try_get("tags")?;
    Ok(BlobRecord {
        id: row.try_get("id")?,
        container_name: row.try_get("container_name")?,
        name: row.try_get("name")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        content_type: row.try_get("content_type")?,
        content_length: row.try_get("content_length")?,
        content_encoding: row.try_get("content_encoding")?,
        metadata: serde_json::from_str(&metadata)?,
        tags: serde_json::from_str(&tags)?,
        has_legal_hold: row.try_get("has_legal_hold")?,
        retention_until: row.try_get("retention_until")?,
        cache_copy_id: row.try_get("cache_copy_id")?,
    })
}
