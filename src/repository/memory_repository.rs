use super::repository::TransferRepository;
use crate::error::TransferError;
use crate::persistence::TransferTable;
use crate::record::RecordPatch;
use crate::repository::models::DBTransferRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryRepository {
    rows: Arc<RwLock<HashMap<(TransferTable, String), DBTransferRecord>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferRepository for MemoryRepository {
    async fn load_all(&self, table: TransferTable) -> Result<Vec<DBTransferRecord>, TransferError> {
        let mut rows: Vec<_> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, r)| r.clone())
            .collect();
        rows.sort_by_key(|r| r.date);
        Ok(rows)
    }

    async fn load(
        &self,
        table: TransferTable,
        tag: &str,
    ) -> Result<Option<DBTransferRecord>, TransferError> {
        Ok(self
            .rows
            .read()
            .await
            .get(&(table, tag.to_string()))
            .cloned())
    }

    async fn replace(
        &self,
        table: TransferTable,
        record: &DBTransferRecord,
    ) -> Result<(), TransferError> {
        self.rows
            .write()
            .await
            .insert((table, record.tag.clone()), record.clone());
        Ok(())
    }

    async fn update(
        &self,
        table: TransferTable,
        patch: &RecordPatch,
        tag: &str,
    ) -> Result<u64, TransferError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&(table, tag.to_string())) {
            Some(row) => {
                row.apply_patch(patch);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, table: TransferTable, tag: &str) -> Result<(), TransferError> {
        self.rows.write().await.remove(&(table, tag.to_string()));
        Ok(())
    }
}
