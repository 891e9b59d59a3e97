//! In-memory lifecycle store for tests and dry runs.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::LifecycleStore;
use crate::batch::{BatchId, BatchState, LifecycleRecord};
use crate::error::{BarrageError, Result};

/// Lifecycle store that keeps records in memory and remembers every write.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<BatchId, LifecycleRecord>>,
    history: Arc<Mutex<Vec<LifecycleRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted record, in write order.
    pub fn history(&self) -> Vec<LifecycleRecord> {
        self.history.lock().clone()
    }

    /// States persisted for one batch, in write order.
    pub fn states_of(&self, batch_id: &BatchId) -> Vec<BatchState> {
        self.history
            .lock()
            .iter()
            .filter(|record| &record.batch.batch_id == batch_id)
            .map(|record| record.batch.state)
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.history.lock().len()
    }
}

#[async_trait]
impl LifecycleStore for MemoryStore {
    async fn persist(&self, record: &LifecycleRecord) -> Result<()> {
        self.records
            .insert(record.batch.batch_id.clone(), record.clone());
        self.history.lock().push(record.clone());
        Ok(())
    }

    async fn get(&self, batch_id: &BatchId) -> Result<LifecycleRecord> {
        self.records
            .get(batch_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BarrageError::BatchNotFound(batch_id.clone()))
    }

    async fn list(&self) -> Result<Vec<LifecycleRecord>> {
        Ok(self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}
