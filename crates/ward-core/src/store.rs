//! In-memory record cache read by the UI and the CLI.
//!
//! The store holds the active (not deleted) records of every kind. Reads are
//! cheap and synchronous; writes are crate-private so that only the mutation
//! coordinator and the sync engine can change it. Every write publishes an
//! [`Event::StoreChanged`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus, StoreChange};
use crate::models::{Aggregate, Change, Record, RecordId, RecordKind};

#[derive(Debug, Default)]
struct Collections {
    by_kind: HashMap<RecordKind, Vec<Record>>,
}

impl Collections {
    fn records(&self, kind: RecordKind) -> &[Record] {
        self.by_kind.get(&kind).map_or(&[][..], Vec::as_slice)
    }

    fn records_mut(&mut self, kind: RecordKind) -> &mut Vec<Record> {
        self.by_kind.entry(kind).or_default()
    }

    fn position(&self, kind: RecordKind, id: &RecordId) -> Option<usize> {
        self.records(kind).iter().position(|record| record.id() == id)
    }

    /// Replace in place, or append when absent; returns true when replaced
    fn put(&mut self, record: Record) -> bool {
        let kind = record.kind();
        match self.position(kind, record.id()) {
            Some(index) => {
                self.records_mut(kind)[index] = record;
                true
            }
            None => {
                self.records_mut(kind).push(record);
                false
            }
        }
    }

    fn take(&mut self, kind: RecordKind, id: &RecordId) -> Option<Record> {
        let index = self.position(kind, id)?;
        Some(self.records_mut(kind).remove(index))
    }
}

/// Process-wide cache of active records.
#[derive(Debug)]
pub struct Store {
    state: RwLock<Collections>,
    events: EventBus,
}

impl Store {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: RwLock::new(Collections::default()),
            events,
        }
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Borrow a collection without copying it.
    ///
    /// The closure runs under the read lock; keep it short and never call
    /// back into the store from inside it.
    pub fn read<T>(&self, kind: RecordKind, f: impl FnOnce(&[Record]) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(state.records(kind))
    }

    /// Records of `kind` matching `predicate`, in insertion order.
    pub fn select(&self, kind: RecordKind, predicate: impl Fn(&Record) -> bool) -> Vec<Record> {
        self.read(kind, |records| {
            records
                .iter()
                .filter(|record| predicate(record))
                .cloned()
                .collect()
        })
    }

    pub fn all(&self, kind: RecordKind) -> Vec<Record> {
        self.select(kind, |_| true)
    }

    /// Deep copy of one record; the rollback anchor for a write.
    pub fn get_clone(&self, kind: RecordKind, id: &RecordId) -> Option<Record> {
        self.read(kind, |records| {
            records.iter().find(|record| record.id() == id).cloned()
        })
    }

    pub fn len(&self, kind: RecordKind) -> usize {
        self.read(kind, <[Record]>::len)
    }

    pub fn is_empty(&self) -> bool {
        RecordKind::ALL.iter().all(|kind| self.len(*kind) == 0)
    }

    /// Deep-cloned copy of every collection, safe to mutate or export.
    pub fn snapshot(&self) -> Aggregate {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut aggregate = Aggregate::default();
        for kind in RecordKind::ALL {
            aggregate.set_records(kind, state.records(kind).to_vec());
        }
        aggregate
    }

    /// Apply a write intent in place.
    ///
    /// `Add`/`Update` payloads must match `kind` and `doc_id`. Deleting an
    /// unknown record is a no-op that still reports the change.
    pub(crate) fn apply(&self, kind: RecordKind, doc_id: &RecordId, change: &Change) -> Result<()> {
        if let Some(record) = change.payload() {
            if record.kind() != kind || record.id() != doc_id {
                return Err(Error::InvalidInput(format!(
                    "payload {} {} does not match target {} {doc_id}",
                    record.kind().as_str(),
                    record.id(),
                    kind.as_str()
                )));
            }
        }

        let store_change = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match change {
                Change::Add(record) | Change::Update(record) => {
                    if state.put(record.clone()) {
                        StoreChange::Updated
                    } else {
                        StoreChange::Added
                    }
                }
                Change::Delete => {
                    state.take(kind, doc_id);
                    StoreChange::Removed
                }
            }
        };

        self.events.publish(Event::StoreChanged {
            kind,
            doc_id: Some(doc_id.clone()),
            change: store_change,
        });
        Ok(())
    }

    /// Revert a prior [`Store::apply`].
    ///
    /// With a previous value the record is put back exactly as it was;
    /// without one (the write was an add) the record is removed.
    pub(crate) fn restore(&self, kind: RecordKind, doc_id: &RecordId, previous: Option<Record>) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match previous {
                Some(record) if !record.is_deleted() => {
                    state.put(record);
                }
                _ => {
                    state.take(kind, doc_id);
                }
            }
        }

        self.events.publish(Event::StoreChanged {
            kind,
            doc_id: Some(doc_id.clone()),
            change: StoreChange::RolledBack,
        });
    }

    /// Replace a whole collection with a remote snapshot.
    ///
    /// Soft-deleted records in the snapshot are left out of the active set.
    pub(crate) fn replace_collection(&self, kind: RecordKind, records: Vec<Record>) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            *state.records_mut(kind) = records
                .into_iter()
                .filter(|record| record.kind() == kind && !record.is_deleted())
                .collect();
        }

        self.events.publish(Event::StoreChanged {
            kind,
            doc_id: None,
            change: StoreChange::Replaced,
        });
    }
}
