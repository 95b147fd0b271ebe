use crate::error::TransferError;
use crate::persistence::TransferTable;
use crate::record::RecordPatch;
use crate::repository::models::DBTransferRecord;
use crate::repository::repository::TransferRepository;
use crate::schema::SchemaStore;
use async_trait::async_trait;
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::fs;
use std::path::Path;
use std::sync::Arc;

const COLUMNS: &str = "tag, url, folder, file_path, file_name, fraction, total_size, current_size, \
     status, priority, date, request, extra1, extra2, extra3, file_suffix, temp_file_name";

pub struct SqliteRepository {
    pool: Arc<SqlitePool>,
}

impl SqliteRepository {
    /// Opens (creating if needed) the database file and migrates it.
    pub async fn new(db_path: &Path) -> Result<Self, TransferError> {
        let cwd = std::env::current_dir()?;
        let db_abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            cwd.join(db_path)
        };

        if let Some(parent) = db_abs.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    TransferError::Storage(format!(
                        "Failed to create directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_abs)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        debug!("[Repository] Opened database {}", db_abs.display());

        Self::from_pool(pool).await
    }

    /// A private database that lives as long as the repository.
    pub async fn in_memory() -> Result<Self, TransferError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, TransferError> {
        SchemaStore::open(&pool).await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn row_to_record(row: &SqliteRow) -> Result<DBTransferRecord, TransferError> {
    Ok(DBTransferRecord {
        tag: row.try_get("tag")?,
        url: row.try_get::<Option<String>, _>("url")?.unwrap_or_default(),
        folder: row.try_get("folder")?,
        file_path: row.try_get("file_path")?,
        file_name: row.try_get("file_name")?,
        fraction: row.try_get("fraction")?,
        total_size: row.try_get::<Option<i64>, _>("total_size")?.unwrap_or(-1),
        current_size: row.try_get::<Option<i64>, _>("current_size")?.unwrap_or(0),
        status: row.try_get::<Option<i64>, _>("status")?.unwrap_or(0),
        priority: row.try_get::<Option<i64>, _>("priority")?.unwrap_or(0),
        date: row.try_get::<Option<i64>, _>("date")?.unwrap_or(0),
        request: row.try_get("request")?,
        extra1: row.try_get("extra1")?,
        extra2: row.try_get("extra2")?,
        extra3: row.try_get("extra3")?,
        file_suffix: row.try_get("file_suffix")?,
        temp_file_name: row.try_get("temp_file_name")?,
    })
}

#[async_trait]
impl TransferRepository for SqliteRepository {
    async fn load_all(&self, table: TransferTable) -> Result<Vec<DBTransferRecord>, TransferError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} ORDER BY date ASC",
            COLUMNS,
            table.name()
        ))
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn load(
        &self,
        table: TransferTable,
        tag: &str,
    ) -> Result<Option<DBTransferRecord>, TransferError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE tag = ?1",
            COLUMNS,
            table.name()
        ))
        .bind(tag)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn replace(
        &self,
        table: TransferTable,
        record: &DBTransferRecord,
    ) -> Result<(), TransferError> {
        sqlx::query(&format!(
            "REPLACE INTO {} ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            table.name(),
            COLUMNS
        ))
        .bind(&record.tag)
        .bind(&record.url)
        .bind(&record.folder)
        .bind(&record.file_path)
        .bind(&record.file_name)
        .bind(&record.fraction)
        .bind(record.total_size)
        .bind(record.current_size)
        .bind(record.status)
        .bind(record.priority)
        .bind(record.date)
        .bind(&record.request)
        .bind(&record.extra1)
        .bind(&record.extra2)
        .bind(&record.extra3)
        .bind(&record.file_suffix)
        .bind(&record.temp_file_name)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn update(
        &self,
        table: TransferTable,
        patch: &RecordPatch,
        tag: &str,
    ) -> Result<u64, TransferError> {
        if patch.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("UPDATE {} SET ", table.name()));
        {
            let mut set = builder.separated(", ");
            if let Some(url) = &patch.url {
                set.push("url = ").push_bind_unseparated(url.clone());
            }
            if let Some(folder) = &patch.folder {
                set.push("folder = ").push_bind_unseparated(folder.clone());
            }
            if let Some(file_path) = &patch.file_path {
                set.push("file_path = ").push_bind_unseparated(file_path.clone());
            }
            if let Some(file_name) = &patch.file_name {
                set.push("file_name = ").push_bind_unseparated(file_name.clone());
            }
            if let Some(fraction) = patch.fraction {
                set.push("fraction = ").push_bind_unseparated(fraction.to_string());
            }
            if let Some(total_size) = patch.total_size {
                set.push("total_size = ").push_bind_unseparated(total_size);
            }
            if let Some(current_size) = patch.current_size {
                set.push("current_size = ").push_bind_unseparated(current_size);
            }
            if let Some(status) = patch.status {
                set.push("status = ").push_bind_unseparated(status.code());
            }
            if let Some(priority) = patch.priority {
                set.push("priority = ").push_bind_unseparated(priority as i64);
            }
            if let Some(date) = patch.date {
                set.push("date = ").push_bind_unseparated(date);
            }
            if let Some(extra1) = &patch.extra1 {
                set.push("extra1 = ")
                    .push_bind_unseparated(extra1.as_ref().map(|s| s.as_bytes().to_vec()));
            }
        }
        builder.push(" WHERE tag = ").push_bind(tag.to_string());

        let result = builder.build().execute(&*self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, table: TransferTable, tag: &str) -> Result<(), TransferError> {
        sqlx::query(&format!("DELETE FROM {} WHERE tag = ?1", table.name()))
            .bind(tag)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}
