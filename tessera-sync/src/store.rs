//! In-memory state store: entity id → field name → register.
//!
//! Locking is three-level and always taken in this order:
//!
//! ```text
//! entities (RwLock) ──► fields of one entity (RwLock) ──► one field slot (Mutex)
//! ```
//!
//! Writers to existing fields hold only read locks on the two maps plus the
//! slot mutex, so writes to different fields run in parallel while the
//! read-merge-write of a single field is atomic. The map write locks are
//! taken only to create an entity/field or to evict.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::config::StoreConfig;
use crate::operation::Operation;
use crate::register::{merge, Merge, Register};

/// Snapshot of one entity, ordered by field name.
pub type EntityState = BTreeMap<String, Register>;

struct EntityCell {
    fields: RwLock<HashMap<String, Mutex<Option<Register>>>>,
    /// Milliseconds since the store epoch.
    last_touched: AtomicU64,
}

impl EntityCell {
    fn new(now: u64) -> Self {
        Self {
            fields: RwLock::new(HashMap::new()),
            last_touched: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_touched.fetch_max(now, Ordering::Relaxed);
    }

    fn last_touched(&self) -> u64 {
        self.last_touched.load(Ordering::Relaxed)
    }
}

/// Owned store of all entity state. One instance per server.
pub struct StateStore {
    entities: RwLock<HashMap<String, EntityCell>>,
    /// Room occupancy per entity; pinned entities are never evicted.
    pins: Mutex<HashMap<String, usize>>,
    config: StoreConfig,
    epoch: Instant,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl StateStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
            config,
            epoch: Instant::now(),
        }
    }

    /// Merge `op` into its register and return the result.
    pub fn apply_operation(&self, op: &Operation) -> Merge {
        loop {
            {
                let entities = read(&self.entities);
                if let Some(entity) = entities.get(op.entity_id()) {
                    entity.touch(self.now());
                    let fields = read(&entity.fields);
                    if let Some(slot) = fields.get(op.field()) {
                        let mut current = lock(slot);
                        let merged = merge(current.as_ref(), op);
                        if merged.outcome.is_accepted() {
                            *current = Some(merged.register.clone());
                        }
                        return merged;
                    }
                }
            }
            // Slow path: create the entity and/or field, then retry under
            // read locks. An eviction may race in between; the loop covers it.
            self.insert_slot(op.entity_id(), op.field());
        }
    }

    /// Full state of an entity; empty for unknown ids.
    pub fn get_entity_state(&self, entity_id: &str) -> EntityState {
        let entities = read(&self.entities);
        let Some(entity) = entities.get(entity_id) else {
            return EntityState::new();
        };
        entity.touch(self.now());
        let fields = read(&entity.fields);
        fields
            .iter()
            .filter_map(|(name, slot)| lock(slot).clone().map(|reg| (name.clone(), reg)))
            .collect()
    }

    pub fn get_register(&self, entity_id: &str, field: &str) -> Option<Register> {
        let entities = read(&self.entities);
        let entity = entities.get(entity_id)?;
        let fields = read(&entity.fields);
        let slot = fields.get(field)?;
        let register = lock(slot).clone();
        register
    }

    pub fn has_field(&self, entity_id: &str, field: &str) -> bool {
        self.get_register(entity_id, field).is_some()
    }

    pub fn has_entity(&self, entity_id: &str) -> bool {
        read(&self.entities).contains_key(entity_id)
    }

    pub fn entity_count(&self) -> usize {
        read(&self.entities).len()
    }

    pub fn entity_ids(&self) -> Vec<String> {
        read(&self.entities).keys().cloned().collect()
    }

    /// Drop all state. Used at shutdown.
    pub fn clear(&self) {
        write(&self.entities).clear();
        lock(&self.pins).clear();
    }

    /// Mark an entity as having one more room member.
    pub fn pin(&self, entity_id: &str) {
        *lock(&self.pins).entry(entity_id.to_owned()).or_insert(0) += 1;
    }

    /// Undo one [`pin`](Self::pin).
    pub fn unpin(&self, entity_id: &str) {
        let mut pins = lock(&self.pins);
        if let Some(count) = pins.get_mut(entity_id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(entity_id);
            }
        }
    }

    pub fn is_pinned(&self, entity_id: &str) -> bool {
        lock(&self.pins).contains_key(entity_id)
    }

    /// Evict entities idle for longer than `idle_ttl`. Returns the evicted ids.
    pub fn evict_idle(&self) -> Vec<String> {
        self.evict_idle_at(Instant::now())
    }

    /// [`evict_idle`](Self::evict_idle) with an explicit clock.
    pub fn evict_idle_at(&self, now: Instant) -> Vec<String> {
        let Some(ttl) = self.config.idle_ttl else {
            return Vec::new();
        };
        let now_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        let ttl_ms = ttl.as_millis() as u64;

        let mut entities = write(&self.entities);
        let pins = lock(&self.pins);
        let expired: Vec<String> = entities
            .iter()
            .filter(|(id, cell)| {
                !pins.contains_key(*id) && now_ms.saturating_sub(cell.last_touched()) > ttl_ms
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entities.remove(id);
        }
        if !expired.is_empty() {
            log::debug!("Evicted {} idle entities", expired.len());
        }
        expired
    }

    fn insert_slot(&self, entity_id: &str, field: &str) {
        let now = self.now();
        let mut entities = write(&self.entities);
        if !entities.contains_key(entity_id) {
            self.make_room(&mut entities);
            entities.insert(entity_id.to_owned(), EntityCell::new(now));
        }
        if let Some(entity) = entities.get(entity_id) {
            write(&entity.fields)
                .entry(field.to_owned())
                .or_insert_with(|| Mutex::new(None));
        }
    }

    /// Evict least recently touched unpinned entities until one more fits.
    fn make_room(&self, entities: &mut HashMap<String, EntityCell>) {
        let Some(max) = self.config.max_entities else {
            return;
        };
        let pins = lock(&self.pins);
        while entities.len() >= max.max(1) {
            let victim = entities
                .iter()
                .filter(|(id, _)| !pins.contains_key(*id))
                .min_by_key(|(_, cell)| cell.last_touched())
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    log::debug!("Store at capacity ({max}); evicting entity {id}");
                    entities.remove(&id);
                }
                // Everything resident is occupied; allow the overshoot.
                None => break,
            }
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::MergeOutcome;
    use crate::value::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn op(entity: &str, field: &str, value: &str, actor: &str, ts: u64) -> Operation {
        Operation::new(entity, field, value, actor, ts)
    }

    #[test]
    fn test_single_operation() {
        let store = StateStore::default();
        store.apply_operation(&op("board-1", "card_title", "Test Card", "user-1", 1000));

        let state = store.get_entity_state("board-1");
        let reg = &state["card_title"];
        assert_eq!(reg.value, Value::from("Test Card"));
        assert_eq!(reg.version, 1);
        assert_eq!(reg.last_updated_by, "user-1");
    }

    #[test]
    fn test_sequential_updates() {
        let store = StateStore::default();
        store.apply_operation(&op("board-1", "card_title", "First", "user-1", 1000));
        store.apply_operation(&op("board-1", "card_title", "Second", "user-2", 2000));

        let reg = store.get_register("board-1", "card_title").unwrap();
        assert_eq!(reg.value, Value::from("Second"));
        assert_eq!(reg.last_updated_by, "user-2");
        assert_eq!(reg.version, 2);
    }

    #[test]
    fn test_out_of_order_arrival() {
        let store = StateStore::default();
        store.apply_operation(&op("board-1", "card_title", "Second", "user-2", 2000));
        let late = store.apply_operation(&op("board-1", "card_title", "First", "user-1", 1000));

        assert_eq!(late.outcome, MergeOutcome::Discarded);
        let reg = store.get_register("board-1", "card_title").unwrap();
        assert_eq!(reg.value, Value::from("Second"));
        assert_eq!(reg.version, 1);
    }

    #[test]
    fn test_entities_isolated() {
        let store = StateStore::default();
        store.apply_operation(&op("board-1", "title", "One", "user-1", 1));
        store.apply_operation(&op("board-2", "description", "Two", "user-2", 1));

        let one = store.get_entity_state("board-1");
        let two = store.get_entity_state("board-2");
        assert_eq!(one.keys().collect::<Vec<_>>(), vec!["title"]);
        assert_eq!(two.keys().collect::<Vec<_>>(), vec!["description"]);
        assert!(!store.has_field("board-2", "title"));
    }

    #[test]
    fn test_unknown_entity_is_empty() {
        let store = StateStore::default();
        assert!(store.get_entity_state("nonexistent").is_empty());
        assert!(store.get_register("nonexistent", "x").is_none());
        assert!(!store.has_entity("nonexistent"));
    }

    #[test]
    fn test_composite_field_names() {
        let store = StateStore::default();
        store.apply_operation(&op("board-1", "card_42_title", "Fix bug", "u", 1));
        store.apply_operation(&op("board-1", "card_42_status", "doing", "u", 1));
        assert!(store.has_field("board-1", "card_42_title"));
        assert!(store.has_field("board-1", "card_42_status"));
        assert_eq!(store.get_entity_state("board-1").len(), 2);
    }

    #[test]
    fn test_concurrent_same_field_version_counts_accepts() {
        let store = Arc::new(StateStore::default());
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut accepted = 0u64;
                    for i in 0..500u64 {
                        // Distinct timestamps across threads.
                        let ts = i * 8 + t + 1;
                        let m = store.apply_operation(&op("board-1", "hot", "v", "u", ts));
                        if m.outcome.is_accepted() {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();

        let total_accepted: u64 = threads.into_iter().map(|h| h.join().unwrap()).sum();
        let reg = store.get_register("board-1", "hot").unwrap();
        assert_eq!(reg.version, total_accepted);
        assert_eq!(reg.last_updated_at, 499 * 8 + 8);
    }

    #[test]
    fn test_concurrent_distinct_fields() {
        let store = Arc::new(StateStore::default());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let field = format!("field_{t}");
                    for ts in 1..=200u64 {
                        store.apply_operation(&op("board-1", &field, "v", "u", ts));
                    }
                })
            })
            .collect();
        for h in threads {
            h.join().unwrap();
        }

        let state = store.get_entity_state("board-1");
        assert_eq!(state.len(), 8);
        assert!(state.values().all(|reg| reg.version == 200));
    }

    #[test]
    fn test_idle_eviction_skips_pinned() {
        let store = StateStore::new(StoreConfig {
            idle_ttl: Some(Duration::from_secs(10)),
            max_entities: None,
        });
        store.apply_operation(&op("board-1", "f", "v", "u", 1));
        store.apply_operation(&op("board-2", "f", "v", "u", 1));
        store.pin("board-2");

        assert!(store.evict_idle_at(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(60);
        let evicted = store.evict_idle_at(later);
        assert_eq!(evicted, vec!["board-1".to_string()]);
        assert!(store.get_entity_state("board-1").is_empty());
        assert!(store.has_entity("board-2"));

        store.unpin("board-2");
        assert!(!store.is_pinned("board-2"));
        assert_eq!(store.evict_idle_at(later), vec!["board-2".to_string()]);
    }

    #[test]
    fn test_eviction_disabled_by_default() {
        let store = StateStore::default();
        store.apply_operation(&op("board-1", "f", "v", "u", 1));
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(store.evict_idle_at(later).is_empty());
        assert_eq!(store.entity_count(), 1);
    }

    #[test]
    fn test_capacity_evicts_least_recently_touched() {
        let store = StateStore::new(StoreConfig {
            idle_ttl: None,
            max_entities: Some(2),
        });
        store.apply_operation(&op("board-1", "f", "v", "u", 1));
        std::thread::sleep(Duration::from_millis(5));
        store.apply_operation(&op("board-2", "f", "v", "u", 1));
        std::thread::sleep(Duration::from_millis(5));
        // Touch board-1 so board-2 becomes the oldest.
        store.get_entity_state("board-1");
        std::thread::sleep(Duration::from_millis(5));
        store.apply_operation(&op("board-3", "f", "v", "u", 1));

        assert_eq!(store.entity_count(), 2);
        assert!(store.has_entity("board-1"));
        assert!(!store.has_entity("board-2"));
        assert!(store.has_entity("board-3"));
    }

    #[test]
    fn test_capacity_never_evicts_pinned() {
        let store = StateStore::new(StoreConfig {
            idle_ttl: None,
            max_entities: Some(1),
        });
        store.pin("board-1");
        store.apply_operation(&op("board-1", "f", "v", "u", 1));
        store.apply_operation(&op("board-2", "f", "v", "u", 1));
        assert!(store.has_entity("board-1"));
        assert!(store.has_entity("board-2"));
    }

    #[test]
    fn test_clear() {
        let store = StateStore::default();
        store.apply_operation(&op("board-1", "f", "v", "u", 1));
        store.pin("board-1");
        store.clear();
        assert_eq!(store.entity_count(), 0);
        assert!(!store.is_pinned("board-1"));
    }
}
