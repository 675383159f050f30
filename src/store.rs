//! Persistent store boundary.
//!
//! The relational backend is an external collaborator; the pipeline only
//! needs batched id lookups, one filtered query for the fee-snapshot
//! prefetch, and bulk upsert/insert at flush time. [`MemoryStore`] backs the
//! binary and the tests.

use eyre::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::model::{Entity, EntityKind};

#[allow(async_fn_in_trait)]
pub trait Store {
    /// Batched lookup; returns only the rows that exist, any order.
    async fn find_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<Entity>>;

    /// Positions with liquidity > 0, for the fee-snapshot prefetch.
    async fn find_open_positions(&self) -> Result<Vec<Entity>>;

    /// Bulk upsert. All rows of one flush become visible atomically from the
    /// caller's perspective.
    async fn save(&self, kind: EntityKind, rows: Vec<Entity>) -> Result<()>;

    /// Append-only insert for event records. Rows whose deterministic id
    /// already exists are ignored, so batch retries never duplicate.
    async fn insert(&self, kind: EntityKind, rows: Vec<Entity>) -> Result<()>;
}

/// In-memory store. Ordered maps keep flush results deterministic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<EntityKind, BTreeMap<String, Entity>>>,
    find_calls: AtomicUsize,
    #[cfg(test)]
    requested_ids: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `find_by_ids` round-trips issued so far.
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::Relaxed)
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.tables
            .lock()
            .expect("store lock poisoned")
            .get(&kind)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        self.tables
            .lock()
            .expect("store lock poisoned")
            .get(&kind)
            .and_then(|t| t.get(id))
            .cloned()
    }

    pub fn all(&self, kind: EntityKind) -> Vec<Entity> {
        self.tables
            .lock()
            .expect("store lock poisoned")
            .get(&kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Seed a row directly, bypassing the flush path.
    pub fn put(&self, entity: Entity) {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables
            .entry(entity.kind())
            .or_default()
            .insert(entity.id().to_string(), entity);
    }

    #[cfg(test)]
    pub fn requested_ids(&self) -> Vec<String> {
        self.requested_ids
            .lock()
            .expect("store lock poisoned")
            .clone()
    }
}

impl Store for MemoryStore {
    async fn find_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<Entity>> {
        self.find_calls.fetch_add(1, Ordering::Relaxed);
        #[cfg(test)]
        self.requested_ids
            .lock()
            .expect("store lock poisoned")
            .extend(ids.iter().cloned());

        let tables = self.tables.lock().expect("store lock poisoned");
        let table = match tables.get(&kind) {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };
        Ok(ids.iter().filter_map(|id| table.get(id).cloned()).collect())
    }

    async fn find_open_positions(&self) -> Result<Vec<Entity>> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables
            .get(&EntityKind::Position)
            .map(|t| {
                t.values()
                    .filter(|e| e.as_position().is_some_and(|p| p.liquidity > 0))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save(&self, kind: EntityKind, rows: Vec<Entity>) -> Result<()> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        let table = tables.entry(kind).or_default();
        for row in rows {
            table.insert(row.id().to_string(), row);
        }
        Ok(())
    }

    async fn insert(&self, kind: EntityKind, rows: Vec<Entity>) -> Result<()> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        let table = tables.entry(kind).or_default();
        for row in rows {
            table.entry(row.id().to_string()).or_insert(row);
        }
        Ok(())
    }
}
