use crate::error::TransferError;
use crate::record::{RecordPatch, TransferRecord};
use crate::repository::models::DBTransferRecord;
use crate::repository::{MemoryRepository, SqliteRepository, TransferRepository};
use crate::request::TransferRequest;
use crate::schema::{TABLE_DOWNLOAD, TABLE_UPLOAD};
use crate::status::TransferStatus;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PersistenceType {
    Memory,
    Sqlite(PathBuf),
}

/// Which transfer table a store reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferTable {
    Download,
    Upload,
}

impl TransferTable {
    pub fn name(self) -> &'static str {
        match self {
            TransferTable::Download => TABLE_DOWNLOAD,
            TransferTable::Upload => TABLE_UPLOAD,
        }
    }
}

/// Keyed access to the transfer records of one table.
///
/// Every write goes through one lock shared by all stores created from the
/// same repository, so writes from concurrent transfers never interleave.
#[derive(Clone)]
pub struct TransferRecordStore {
    repository: Arc<dyn TransferRepository>,
    table: TransferTable,
    write_lock: Arc<Mutex<()>>,
}

impl TransferRecordStore {
    pub async fn open(
        persistence: &PersistenceType,
        table: TransferTable,
    ) -> Result<Self, TransferError> {
        let repository: Arc<dyn TransferRepository> = match persistence {
            PersistenceType::Memory => Arc::new(MemoryRepository::new()),
            PersistenceType::Sqlite(path) => Arc::new(SqliteRepository::new(path).await?),
        };
        Ok(Self::with_repository(repository, table))
    }

    pub fn with_repository(repository: Arc<dyn TransferRepository>, table: TransferTable) -> Self {
        Self {
            repository,
            table,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn memory(table: TransferTable) -> Self {
        Self::with_repository(Arc::new(MemoryRepository::new()), table)
    }

    /// A store over another table of the same database, sharing the write lock.
    pub fn sibling(&self, table: TransferTable) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            table,
            write_lock: Arc::clone(&self.write_lock),
        }
    }

    pub fn table(&self) -> TransferTable {
        self.table
    }

    pub async fn get(&self, tag: &str) -> Result<Option<TransferRecord>, TransferError> {
        let row = self.repository.load(self.table, tag).await?;
        Ok(row.map(db_to_record))
    }

    pub async fn load_all(&self) -> Result<Vec<TransferRecord>, TransferError> {
        let rows = self.repository.load_all(self.table).await?;
        Ok(rows.into_iter().map(db_to_record).collect())
    }

    /// Inserts or overwrites the full record.
    pub async fn replace(&self, record: &TransferRecord) -> Result<(), TransferError> {
        let row = record_to_db(record)?;
        let _guard = self.write_lock.lock().await;
        self.repository.replace(self.table, &row).await
    }

    /// Writes only the columns set in `patch`. Returns false when no row has `tag`.
    pub async fn update(&self, patch: &RecordPatch, tag: &str) -> Result<bool, TransferError> {
        let _guard = self.write_lock.lock().await;
        let touched = self.repository.update(self.table, patch, tag).await?;
        if touched == 0 {
            debug!("[Store] Update for unknown tag {} ignored", tag);
        }
        Ok(touched > 0)
    }

    pub async fn delete(&self, tag: &str) -> Result<(), TransferError> {
        let _guard = self.write_lock.lock().await;
        self.repository.delete(self.table, tag).await
    }
}

fn record_to_db(record: &TransferRecord) -> Result<DBTransferRecord, TransferError> {
    Ok(DBTransferRecord {
        tag: record.tag.clone(),
        url: record.url.clone(),
        folder: record.folder.clone(),
        file_path: record.file_path.clone(),
        file_name: record.file_name.clone(),
        fraction: Some(record.fraction.to_string()),
        total_size: record.total_size,
        current_size: record.current_size,
        status: record.status.code(),
        priority: record.priority as i64,
        date: record.date,
        request: Some(record.request.encode()?),
        extra1: record.extra1.as_ref().map(|s| s.as_bytes().to_vec()),
        extra2: record.extra2.clone(),
        extra3: record.extra3.clone(),
        file_suffix: record.file_suffix.clone(),
        temp_file_name: record.temp_file_name.clone(),
    })
}

fn db_to_record(row: DBTransferRecord) -> TransferRecord {
    let request = match row.request.as_deref().map(TransferRequest::decode) {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            warn!(
                "[Store] Stored request of {} is unreadable ({}), falling back to GET {}",
                row.tag, e, row.url
            );
            TransferRequest::get(row.url.clone())
        }
        None => TransferRequest::get(row.url.clone()),
    };

    TransferRecord {
        tag: row.tag,
        url: row.url,
        folder: row.folder,
        file_path: row.file_path,
        file_name: row.file_name,
        temp_file_name: row.temp_file_name,
        fraction: row
            .fraction
            .and_then(|f| f.parse::<f32>().ok())
            .unwrap_or(0.0),
        total_size: row.total_size,
        current_size: row.current_size,
        speed: 0,
        status: TransferStatus::from_code(row.status).unwrap_or_default(),
        priority: row.priority as i32,
        date: row.date,
        file_suffix: row.file_suffix,
        request,
        extra1: row
            .extra1
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        extra2: row.extra2,
        extra3: row.extra3,
        error: None,
    }
}
