//! Persistence for lifecycle records.
//!
//! The `LifecycleStore` trait is the only shared mutable state in the system. Each
//! `persist` call is a complete read-modify-write of one batch's record; implementations
//! must make it atomic so a crash leaves the previous consistent record behind.

use async_trait::async_trait;

use crate::batch::{BatchId, LifecycleRecord, RunId};
use crate::error::Result;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Storage for lifecycle records, keyed by batch id.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Insert or replace the record for `record.batch.batch_id`.
    async fn persist(&self, record: &LifecycleRecord) -> Result<()>;

    /// Get the record of one batch.
    async fn get(&self, batch_id: &BatchId) -> Result<LifecycleRecord>;

    /// All records, in no particular order.
    async fn list(&self) -> Result<Vec<LifecycleRecord>>;

    /// Records of one run, ordered by chunk index.
    async fn list_run(&self, run_id: RunId) -> Result<Vec<LifecycleRecord>> {
        let mut records: Vec<_> = self
            .list()
            .await?
            .into_iter()
            .filter(|record| record.batch.run_id == run_id)
            .collect();
        records.sort_by_key(|record| record.batch.chunk_index);
        Ok(records)
    }
}
