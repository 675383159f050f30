//! Deferred-load entity cache.
//!
//! Decouples "I will need entity X" from "fetch it now": the prefetch phase
//! defers every id an entire batch of blocks will touch, `load` resolves each
//! kind in a single store round-trip, and all reads during folding are
//! synchronous overlay hits. Nothing is written back until the processor
//! flushes `values(kind)` per kind.
//!
//! Contract per (kind, id) within one batch:
//! - `defer` is idempotent and never performs I/O;
//! - `load` fetches each distinct unresolved id at most once;
//! - `get`/`get_or_fail` never perform I/O and fail fast on ids that were
//!   never deferred+loaded or added - that is a prefetch bug, not a miss to
//!   be papered over with an ad hoc fetch.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

use crate::errors::CacheError;
use crate::model::{Entity, EntityKind, LendingPair, Pool, Position, Tick, Token, User};
use crate::store::Store;

pub struct EntityCache<'a, S: Store> {
    store: &'a S,
    /// Ids requested via `defer` but not yet resolved by `load`.
    deferred: HashMap<EntityKind, HashSet<String>>,
    /// Ids whose store state is known, including loaded-but-absent ones.
    resolved: HashMap<EntityKind, HashSet<String>>,
    /// The in-memory overlay; authoritative for the duration of a batch.
    /// Ordered so flush output is deterministic.
    overlay: HashMap<EntityKind, BTreeMap<String, Entity>>,
}

impl<'a, S: Store> EntityCache<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            deferred: HashMap::new(),
            resolved: HashMap::new(),
            overlay: HashMap::new(),
        }
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    /// Record that `id` of `kind` will be needed. No I/O.
    pub fn defer(&mut self, kind: EntityKind, id: impl Into<String>) {
        self.deferred.entry(kind).or_default().insert(id.into());
    }

    pub fn defer_all<I>(&mut self, kind: EntityKind, ids: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let bucket = self.deferred.entry(kind).or_default();
        for id in ids {
            bucket.insert(id.into());
        }
    }

    /// Resolve all deferred-but-unresolved ids of `kind` in one store
    /// round-trip. Ids already resolved or already in the overlay are
    /// skipped entirely, so repeated `defer` calls cost nothing.
    pub async fn load(&mut self, kind: EntityKind) -> eyre::Result<()> {
        let pending = match self.deferred.remove(&kind) {
            Some(p) => p,
            None => return Ok(()),
        };

        let resolved = self.resolved.entry(kind).or_default();
        let overlay = self.overlay.entry(kind).or_default();
        let mut wanted: Vec<String> = pending
            .into_iter()
            .filter(|id| !resolved.contains(id) && !overlay.contains_key(id))
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }
        wanted.sort_unstable();

        trace!("loading {} {} ids", wanted.len(), kind);
        let rows = self.store.find_by_ids(kind, &wanted).await?;
        let found = rows.len();
        for row in rows {
            overlay.insert(row.id().to_string(), row);
        }
        // Absent ids are resolved too: the store has been consulted once and
        // must not be consulted again for them this batch.
        resolved.extend(wanted);
        debug!("loaded {found} {kind} rows");
        Ok(())
    }

    /// Overlay read. `Ok(None)` means the store was consulted and the entity
    /// does not exist; an id that was never deferred or added is a
    /// prefetch-completeness violation and fails the batch.
    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<&Entity>, CacheError> {
        if let Some(entity) = self.overlay.get(&kind).and_then(|o| o.get(id)) {
            return Ok(Some(entity));
        }
        if self.is_resolved(kind, id) {
            return Ok(None);
        }
        Err(CacheError::NotDeferred {
            kind,
            id: id.to_string(),
        })
    }

    pub fn get_mut(&mut self, kind: EntityKind, id: &str) -> Result<Option<&mut Entity>, CacheError> {
        if !self.is_resolved(kind, id)
            && !self
                .overlay
                .get(&kind)
                .is_some_and(|o| o.contains_key(id))
        {
            return Err(CacheError::NotDeferred {
                kind,
                id: id.to_string(),
            });
        }
        Ok(self.overlay.get_mut(&kind).and_then(|o| o.get_mut(id)))
    }

    /// As `get`, but absence is a programming error, not a domain outcome.
    pub fn get_or_fail(&self, kind: EntityKind, id: &str) -> Result<&Entity, CacheError> {
        self.get(kind, id)?.ok_or_else(|| CacheError::Missing {
            kind,
            id: id.to_string(),
        })
    }

    /// Insert a newly created entity into the overlay, overwriting any
    /// same-id entry, and mark it resolved for the rest of the batch.
    pub fn add(&mut self, entity: impl Into<Entity>) {
        let entity = entity.into();
        let kind = entity.kind();
        let id = entity.id().to_string();
        self.resolved.entry(kind).or_default().insert(id.clone());
        self.overlay.entry(kind).or_default().insert(id, entity);
    }

    /// All overlay entries of `kind`, in id order. Used at flush time.
    pub fn values(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.overlay.get(&kind).into_iter().flat_map(|o| o.values())
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.overlay.get(&kind).map(|o| o.len()).unwrap_or(0)
    }

    fn is_resolved(&self, kind: EntityKind, id: &str) -> bool {
        self.resolved
            .get(&kind)
            .is_some_and(|r| r.contains(id))
    }

    // ============================================
    // TYPED ACCESSORS (fold-handler conveniences)
    // ============================================

    pub fn token(&self, id: &str) -> Result<Option<&Token>, CacheError> {
        self.typed(EntityKind::Token, id, Entity::as_token)
    }

    pub fn pool(&self, id: &str) -> Result<Option<&Pool>, CacheError> {
        self.typed(EntityKind::Pool, id, Entity::as_pool)
    }

    pub fn pool_mut(&mut self, id: &str) -> Result<Option<&mut Pool>, CacheError> {
        self.typed_mut(EntityKind::Pool, id, Entity::as_pool_mut)
    }

    pub fn tick_mut(&mut self, id: &str) -> Result<Option<&mut Tick>, CacheError> {
        self.typed_mut(EntityKind::Tick, id, Entity::as_tick_mut)
    }

    pub fn position(&self, id: &str) -> Result<Option<&Position>, CacheError> {
        self.typed(EntityKind::Position, id, Entity::as_position)
    }

    pub fn position_mut(&mut self, id: &str) -> Result<Option<&mut Position>, CacheError> {
        self.typed_mut(EntityKind::Position, id, Entity::as_position_mut)
    }

    pub fn user_mut(&mut self, id: &str) -> Result<Option<&mut User>, CacheError> {
        self.typed_mut(EntityKind::User, id, Entity::as_user_mut)
    }

    pub fn lending_pair_mut(&mut self) -> Result<Option<&mut LendingPair>, CacheError> {
        self.typed_mut(
            EntityKind::LendingPair,
            LendingPair::SINGLETON_ID,
            Entity::as_lending_pair_mut,
        )
    }

    fn typed<'s, T: 's>(
        &'s self,
        kind: EntityKind,
        id: &str,
        project: impl Fn(&'s Entity) -> Option<&'s T>,
    ) -> Result<Option<&'s T>, CacheError> {
        match self.get(kind, id)? {
            None => Ok(None),
            Some(entity) => project(entity)
                .map(Some)
                .ok_or_else(|| CacheError::WrongVariant {
                    kind,
                    id: id.to_string(),
                }),
        }
    }

    fn typed_mut<'s, T: 's>(
        &'s mut self,
        kind: EntityKind,
        id: &str,
        project: impl Fn(&'s mut Entity) -> Option<&'s mut T>,
    ) -> Result<Option<&'s mut T>, CacheError> {
        match self.get_mut(kind, id)? {
            None => Ok(None),
            Some(entity) => project(entity)
                .map(Some)
                .ok_or_else(|| CacheError::WrongVariant {
                    kind,
                    id: id.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;
    use crate::store::MemoryStore;

    fn seeded_store(ids: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for id in ids {
            store.put(User::new(id.to_string()).into());
        }
        store
    }

    #[tokio::test]
    async fn load_fetches_each_distinct_id_once() {
        let store = seeded_store(&["a", "b", "c"]);
        let mut cache = EntityCache::new(&store);

        // Many defer calls, overlapping ids.
        cache.defer(EntityKind::User, "a");
        cache.defer_all(EntityKind::User, ["a", "b"]);
        cache.defer_all(EntityKind::User, ["b", "c", "c"]);
        cache.load(EntityKind::User).await.unwrap();

        assert_eq!(store.find_calls(), 1);
        let mut requested = store.requested_ids();
        requested.sort();
        assert_eq!(requested, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn reload_skips_resolved_and_added_ids() {
        let store = seeded_store(&["a"]);
        let mut cache = EntityCache::new(&store);

        cache.defer(EntityKind::User, "a");
        cache.load(EntityKind::User).await.unwrap();

        cache.add(User::new("new".to_string()));
        cache.defer_all(EntityKind::User, ["a", "new"]);
        cache.load(EntityKind::User).await.unwrap();

        // Second load had nothing unresolved, so no extra round-trip.
        assert_eq!(store.find_calls(), 1);
    }

    #[tokio::test]
    async fn absent_ids_resolve_to_none_without_refetch() {
        let store = seeded_store(&[]);
        let mut cache = EntityCache::new(&store);

        cache.defer(EntityKind::User, "ghost");
        cache.load(EntityKind::User).await.unwrap();
        assert!(cache.get(EntityKind::User, "ghost").unwrap().is_none());

        cache.defer(EntityKind::User, "ghost");
        cache.load(EntityKind::User).await.unwrap();
        assert_eq!(store.find_calls(), 1);
    }

    #[tokio::test]
    async fn get_on_never_deferred_id_is_fatal() {
        let store = seeded_store(&["a"]);
        let cache = EntityCache::new(&store);

        let err = cache.get(EntityKind::User, "a").unwrap_err();
        assert!(matches!(err, CacheError::NotDeferred { .. }));
        // Nothing was fetched behind the caller's back.
        assert_eq!(store.find_calls(), 0);
    }

    #[tokio::test]
    async fn get_or_fail_distinguishes_missing_from_not_deferred() {
        let store = seeded_store(&[]);
        let mut cache = EntityCache::new(&store);

        cache.defer(EntityKind::User, "ghost");
        cache.load(EntityKind::User).await.unwrap();

        let err = cache.get_or_fail(EntityKind::User, "ghost").unwrap_err();
        assert!(matches!(err, CacheError::Missing { .. }));
    }

    #[tokio::test]
    async fn add_overwrites_same_id_entry() {
        let store = seeded_store(&[]);
        let mut cache = EntityCache::new(&store);

        let mut user = User::new("u".to_string());
        user.deposit_count = 1;
        cache.add(user.clone());
        user.deposit_count = 2;
        cache.add(user);

        assert_eq!(cache.len(EntityKind::User), 1);
        let stored = cache.get_or_fail(EntityKind::User, "u").unwrap();
        assert_eq!(stored.as_user().unwrap().deposit_count, 2);
    }

    #[tokio::test]
    async fn values_returns_overlay_in_id_order() {
        let store = seeded_store(&[]);
        let mut cache = EntityCache::new(&store);
        cache.add(User::new("b".to_string()));
        cache.add(User::new("a".to_string()));

        let ids: Vec<&str> = cache.values(EntityKind::User).map(|e| e.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn typed_accessors_share_the_not_deferred_contract() {
        let store = seeded_store(&[]);
        let mut cache = EntityCache::new(&store);
        cache.add(User::new("u".to_string()));

        // Adding a user resolves nothing in the Position bucket.
        let err = cache.position("u");
        assert!(matches!(err, Err(CacheError::NotDeferred { .. })));
    }
}
