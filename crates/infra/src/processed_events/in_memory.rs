use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use eventrelay_core::EventId;

use super::r#trait::{ProcessedEventRecord, ProcessedEventStore, ProcessingStatus, RepositoryError};

/// In-memory processed-event ledger.
///
/// Intended for tests/dev. Records do not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryProcessedEventStore {
    records: RwLock<HashMap<EventId, ProcessedEventRecord>>,
}

impl InMemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records_with_status(&self, status: ProcessingStatus) -> Vec<ProcessedEventRecord> {
        self.records
            .read()
            .map(|r| r.values().filter(|rec| rec.status == status).cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned() -> RepositoryError {
    RepositoryError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEventStore {
    async fn save(&self, record: &ProcessedEventRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        if records.contains_key(&record.event_id) {
            return Err(RepositoryError::Duplicate(record.event_id));
        }
        records.insert(record.event_id, record.clone());
        Ok(())
    }

    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEventRecord>, RepositoryError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(&event_id).cloned())
    }

    async fn update(&self, record: &ProcessedEventRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        match records.get_mut(&record.event_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(record.event_id)),
        }
    }

    async fn find_failed_for_retry(
        &self,
        limit: usize,
    ) -> Result<Vec<ProcessedEventRecord>, RepositoryError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut failed: Vec<ProcessedEventRecord> = records
            .values()
            .filter(|r| r.is_retry_candidate())
            .cloned()
            .collect();
        failed.sort_by_key(|r| (r.processed_at, r.event_id));
        failed.truncate(limit);
        Ok(failed)
    }
}
