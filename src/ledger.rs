//! Item ledger: the in-memory table over the durable store.
//!
//! Every mutation validates against the [`StateMachine`], applies to the
//! table and writes through to disk while holding one mutex, so the runner
//! and the upload worker can share an `Arc<Ledger>` without ever writing the
//! file concurrently.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use gavel_common::{ItemRecord, ItemState, Metadata, ReservedKey, StateMachine, StatePatch};

use crate::errors::{PipelineError, Result};
use crate::store::{DurableStore, LoadSource, PipelineTable};

struct LedgerInner {
    store: DurableStore,
    table: PipelineTable,
}

pub struct Ledger {
    machine: StateMachine,
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    /// Load the store and wrap it. A corrupted store is an error here; the
    /// run must not continue on an assumed-empty table.
    pub fn open(store: DurableStore, machine: StateMachine) -> Result<Self> {
        let loaded = store.load()?;
        if let Some(version) = loaded.migrated_from {
            info!(
                path = %store.path().display(),
                from_version = version,
                items = loaded.table.items.len(),
                "Migrated legacy pipeline store"
            );
        }
        if loaded.source == LoadSource::Empty {
            info!(path = %store.path().display(), "Starting with an empty pipeline store");
        }
        Ok(Self::from_table(store, machine, loaded.table))
    }

    pub fn from_table(store: DurableStore, machine: StateMachine, table: PipelineTable) -> Self {
        Self {
            machine,
            inner: Mutex::new(LedgerInner { store, table }),
        }
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        // Mutations are applied to a clone and swapped in, so a panic while
        // holding the lock cannot leave a half-written record behind.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<ItemRecord> {
        self.lock().table.items.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().table.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record discovery results. Unknown ids become new `discovered` records;
    /// records already in the table are left exactly as they are, since only
    /// [`Ledger::set_state`] may change them. Returns the number of new
    /// records.
    pub fn register_discovered<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, Metadata)>,
    {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut created = Vec::new();

        for (id, metadata) in items {
            if inner.table.items.contains_key(&id) {
                continue;
            }
            let (record, dropped) = ItemRecord::discovered(&id, metadata, now);
            if !dropped.is_empty() {
                warn!(id = %id, keys = ?dropped, "Ignored discovery metadata for reserved keys");
            }
            inner.table.items.insert(id.clone(), record);
            created.push(id);
        }

        if !created.is_empty() {
            let LedgerInner { store, table } = &mut *inner;
            if let Err(e) = store.save(table) {
                for id in &created {
                    table.items.remove(id);
                }
                return Err(e);
            }
        }
        Ok(created.len())
    }

    /// The only way to change an item's state.
    ///
    /// Validates the transition, merges `patch` (reserved keys protected),
    /// appends history and persists. On a failed save the in-memory record is
    /// restored so the same call can be retried.
    pub fn set_state(&self, id: &str, next: ItemState, patch: StatePatch) -> Result<ItemRecord> {
        let mut inner = self.lock();
        let current = inner
            .table
            .items
            .get(id)
            .ok_or_else(|| PipelineError::UnknownItem { id: id.to_string() })?;

        self.machine.validate(current, next)?;
        if next == ItemState::Failed && patch.reserved(ReservedKey::FailureReason).is_none() {
            return Err(PipelineError::MissingFailureReason { id: id.to_string() });
        }

        let from = current.state;
        let mut updated = current.clone();
        let dropped = updated.apply_transition(next, patch, Utc::now());
        if !dropped.is_empty() {
            warn!(id, keys = ?dropped, "Ignored metadata for reserved keys");
        }

        let LedgerInner { store, table } = &mut *inner;
        let previous = table.items.insert(id.to_string(), updated.clone());
        if let Err(e) = store.save(table) {
            if let Some(previous) = previous {
                table.items.insert(id.to_string(), previous);
            }
            return Err(e);
        }

        debug!(id, %from, to = %next, retry_count = updated.retry_count, "State changed");
        Ok(updated)
    }

    /// Records in `state`, oldest discovery first.
    pub fn list_by_state(&self, state: ItemState) -> Vec<ItemRecord> {
        let mut records: Vec<ItemRecord> = self
            .lock()
            .table
            .items
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.discovered_at()
                .cmp(&b.discovered_at())
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    pub fn retry_target(&self, record: &ItemRecord) -> Option<ItemState> {
        if self.machine.can_retry(record) {
            self.machine.retry_target(record)
        } else {
            None
        }
    }

    pub fn counts(&self) -> BTreeMap<ItemState, usize> {
        let inner = self.lock();
        let mut counts = BTreeMap::new();
        for record in inner.table.items.values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        counts
    }
}
