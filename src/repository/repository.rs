use crate::error::TransferError;
use crate::persistence::TransferTable;
use crate::record::RecordPatch;
use crate::repository::models::DBTransferRecord;
use async_trait::async_trait;

#[async_trait]
pub trait TransferRepository: Send + Sync {
    async fn load_all(&self, table: TransferTable) -> Result<Vec<DBTransferRecord>, TransferError>;
    async fn load(
        &self,
        table: TransferTable,
        tag: &str,
    ) -> Result<Option<DBTransferRecord>, TransferError>;
    /// Inserts or fully overwrites the row with the same tag.
    async fn replace(
        &self,
        table: TransferTable,
        record: &DBTransferRecord,
    ) -> Result<(), TransferError>;
    /// Returns the number of rows touched (0 when the tag is unknown).
    async fn update(
        &self,
        table: TransferTable,
        patch: &RecordPatch,
        tag: &str,
    ) -> Result<u64, TransferError>;
    async fn delete(&self, table: TransferTable, tag: &str) -> Result<(), TransferError>;
}
