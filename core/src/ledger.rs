//! In-memory mirror of escrow records.
//!
//! Each record sits behind its own async mutex so updates to one escrow are
//! serialized while different escrows proceed independently. The index lock is
//! never held across an await on a record.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use escrow_types::{EscrowId, EscrowRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("escrow {id} is not in the local ledger")]
pub struct NotFoundError {
    pub id: EscrowId,
}

#[derive(Default)]
struct Index {
    by_id: HashMap<EscrowId, Arc<Mutex<EscrowRecord>>>,
    order: Vec<EscrowId>,
}

#[derive(Default)]
pub struct EscrowLedger {
    index: RwLock<Index>,
}

impl EscrowLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record`, or merge it into the record already held under its id.
    ///
    /// Whichever side reflects the later chain position keeps its state; an existing
    /// record that already saw a newer remote change is left alone. Returns what is stored.
    pub async fn put(&self, record: EscrowRecord) -> EscrowRecord {
        let existing = {
            let mut index = self.index.write().await;
            match index.by_id.get(record.id()) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let id = record.id().clone();
                    index.order.push(id.clone());
                    index.by_id.insert(id, Arc::new(Mutex::new(record.clone())));
                    return record;
                }
            }
        };
        let mut current = existing.lock().await;
        if record.last_applied() > current.last_applied() {
            *current = record;
        }
        current.clone()
    }

    pub async fn get(&self, id: &EscrowId) -> Option<EscrowRecord> {
        let slot = self.slot(id).await?;
        let record = slot.lock().await.clone();
        Some(record)
    }

    /// Apply `mutator` to the record under the record's lock; returns the updated record.
    pub async fn update<F>(&self, id: &EscrowId, mutator: F) -> Result<EscrowRecord, NotFoundError>
    where
        F: FnOnce(&mut EscrowRecord),
    {
        let slot = self
            .slot(id)
            .await
            .ok_or_else(|| NotFoundError { id: id.clone() })?;
        let mut record = slot.lock().await;
        mutator(&mut record);
        Ok(record.clone())
    }

    /// Snapshot of all records in insertion order.
    pub async fn list(&self) -> Vec<(EscrowId, EscrowRecord)> {
        let slots: Vec<(EscrowId, Arc<Mutex<EscrowRecord>>)> = {
            let index = self.index.read().await;
            index
                .order
                .iter()
                .filter_map(|id| index.by_id.get(id).map(|slot| (id.clone(), Arc::clone(slot))))
                .collect()
        };
        let mut records = Vec::with_capacity(slots.len());
        for (id, slot) in slots {
            let record = slot.lock().await.clone();
            records.push((id, record));
        }
        records
    }

    async fn slot(&self, id: &EscrowId) -> Option<Arc<Mutex<EscrowRecord>>> {
        self.index.read().await.by_id.get(id).map(Arc::clone)
    }
}
