//! Per-cycle instance cache.
//!
//! A [`UnitOfWorkCache`] belongs to exactly one processing cycle. Entries map a
//! [`CacheKey`] to an instance plus an invalidation callback; the callback runs
//! exactly once, when the entry is disposed individually or when the whole
//! cache is disposed at cycle end (whichever comes first).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::UnitOfWorkError;

/// Shared, type-erased cached instance.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// Callback run once when an entry is invalidated.
pub type InvalidateFn = Box<dyn FnOnce(CachedValue) + Send>;

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Identity of a cache entry: a type plus an optional context key, so the
/// same type can be cached more than once per cycle under different contexts.
#[derive(Clone)]
pub struct CacheKey {
    type_id: TypeId,
    type_name: &'static str,
    context: Option<String>,
}

impl CacheKey {
    /// Key for values of type `T` without a context.
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            context: None,
        }
    }

    /// Key from raw parts.
    #[must_use]
    pub fn from_parts(type_id: TypeId, type_name: &'static str) -> Self {
        Self {
            type_id,
            type_name,
            context: None,
        }
    }

    /// Same key narrowed to `context`.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Name of the keyed type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.context == other.context
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.context.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{}[{context}]", self.type_name),
            None => f.write_str(self.type_name),
        }
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

// ---------------------------------------------------------------------------
// Entry slot
// ---------------------------------------------------------------------------

struct EntrySlot {
    seq: u64,
    key: CacheKey,
    /// `None` once invalidated.
    state: Mutex<Option<(CachedValue, Option<InvalidateFn>)>>,
}

impl EntrySlot {
    fn value(&self) -> Option<CachedValue> {
        self.state.lock().as_ref().map(|(value, _)| Arc::clone(value))
    }

    /// Takes the value and callback out under the lock, runs the callback
    /// outside it. Subsequent calls find `None` and do nothing.
    fn invalidate(&self) {
        let taken = self.state.lock().take();
        if let Some((value, Some(on_invalidate))) = taken {
            on_invalidate(value);
        }
    }
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// Handle to one cached instance.
#[derive(Clone)]
pub struct CacheEntry {
    slot: Arc<EntrySlot>,
    cache: Weak<CacheInner>,
}

impl CacheEntry {
    /// The cached value, or `None` once the entry or its cache was disposed.
    #[must_use]
    pub fn try_get_value(&self) -> Option<CachedValue> {
        self.slot.value()
    }

    /// The cached value as a `T`, or `None` if disposed or of another type.
    #[must_use]
    pub fn try_get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.try_get_value().and_then(|value| value.downcast::<T>().ok())
    }

    /// Key this entry was stored under.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.slot.key
    }

    /// Whether the entry still holds its value.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.slot.state.lock().is_some()
    }

    /// Remove the entry from its cache and run its invalidation callback.
    /// Disposing an already-disposed entry does nothing.
    pub fn dispose(&self) {
        if let Some(cache) = self.cache.upgrade() {
            let mut state = cache.state.lock();
            let owned = state
                .entries
                .get(&self.slot.key)
                .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot));
            if owned {
                state.entries.remove(&self.slot.key);
            }
        }
        self.slot.invalidate();
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.slot.key)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UnitOfWorkCache
// ---------------------------------------------------------------------------

struct CacheState {
    disposed: bool,
    next_seq: u64,
    entries: HashMap<CacheKey, Arc<EntrySlot>>,
}

struct CacheInner {
    state: Mutex<CacheState>,
}

/// Cache of per-unit-of-work instances owned by one processing cycle.
pub struct UnitOfWorkCache {
    inner: Arc<CacheInner>,
}

impl UnitOfWorkCache {
    /// Creates an empty, open cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    disposed: false,
                    next_seq: 0,
                    entries: HashMap::new(),
                }),
            }),
        }
    }

    /// Store `value` keyed by its type.
    ///
    /// # Errors
    ///
    /// See [`add_keyed`](Self::add_keyed).
    pub fn add<T: Any + Send + Sync>(
        &self,
        value: Arc<T>,
        on_invalidate: Option<InvalidateFn>,
    ) -> Result<CacheEntry, UnitOfWorkError> {
        self.add_keyed(CacheKey::of::<T>(), value, on_invalidate)
    }

    /// Store `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns `UnitOfWorkError::CycleEnded` if the cache was disposed and
    /// `UnitOfWorkError::DuplicateKey` if a live entry already uses `key`.
    pub fn add_keyed(
        &self,
        key: CacheKey,
        value: CachedValue,
        on_invalidate: Option<InvalidateFn>,
    ) -> Result<CacheEntry, UnitOfWorkError> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(UnitOfWorkError::CycleEnded);
        }
        if state.entries.contains_key(&key) {
            return Err(UnitOfWorkError::DuplicateKey {
                key: key.to_string(),
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let slot = Arc::new(EntrySlot {
            seq,
            key: key.clone(),
            state: Mutex::new(Some((value, on_invalidate))),
        });
        state.entries.insert(key, Arc::clone(&slot));

        Ok(CacheEntry {
            slot,
            cache: Arc::downgrade(&self.inner),
        })
    }

    /// Handle to the live entry stored under `key`.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let state = self.inner.state.lock();
        state.entries.get(key).map(|slot| CacheEntry {
            slot: Arc::clone(slot),
            cache: Arc::downgrade(&self.inner),
        })
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Whether the cache holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Close the cache and invalidate every live entry in insertion order.
    /// Later `add` calls fail; outstanding handles report no value.
    pub fn dispose(&self) {
        let mut slots: Vec<Arc<EntrySlot>> = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            state.entries.drain().map(|(_, slot)| slot).collect()
        };
        slots.sort_by_key(|slot| slot.seq);
        for slot in slots {
            slot.invalidate();
        }
    }
}

impl Default for UnitOfWorkCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UnitOfWorkCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("UnitOfWorkCache")
            .field("entries", &state.entries.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
