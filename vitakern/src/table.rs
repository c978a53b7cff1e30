use std::sync::Arc;

use parking_lot::Mutex;

use crate::{KResult, KernelError, ObjClass, SLOT_BITS, Uid};

/// Default slot count, the full space addressable by the uid slot field.
pub const DEFAULT_CAPACITY: usize = 1 << SLOT_BITS;

/// Implemented by everything that can live in an [`ObjectTable`].
pub trait KernelObject: Send + Sync + 'static {
    const CLASS: ObjClass;
    fn name(&self) -> &str;
}

struct Slots<T> {
    slots: Vec<Option<Arc<T>>>,
    hint: usize,
}

/// Fixed-capacity uid-indexed object arena for one object class.
///
/// Slot claiming probes forward from a hint that advances past each claimed
/// slot and falls back to a freed slot's index on removal, so freed slots are
/// reused before the arena grows toward exhaustion. Objects are shared via
/// `Arc`: a handle obtained before removal stays valid after it.
pub struct ObjectTable<T: KernelObject> {
    inner: Mutex<Slots<T>>,
}

impl<T: KernelObject> ObjectTable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity <= DEFAULT_CAPACITY);
        Self {
            inner: Mutex::new(Slots {
                slots: (0..capacity).map(|_| None).collect(),
                hint: 0,
            }),
        }
    }

    /// Installs `obj` in a free slot and returns its uid, or `OutOfUids`
    /// when every slot is claimed.
    pub fn create(&self, obj: T) -> KResult<Uid> {
        let obj = Arc::new(obj);
        let mut inner = self.inner.lock();
        let cap = inner.slots.len();
        let idx = (0..cap)
            .map(|i| (inner.hint + i) % cap)
            .find(|&idx| inner.slots[idx].is_none())
            .ok_or(KernelError::OutOfUids)?;
        inner.slots[idx] = Some(obj);
        inner.hint = idx + 1;
        Ok(Uid::assemble(T::CLASS, idx as u32))
    }

    /// Resolves a uid to a shared handle. Tag validation happens before the
    /// slot index is used.
    #[must_use]
    pub fn get(&self, uid: Uid) -> Option<Arc<T>> {
        if !uid.check(T::CLASS) {
            return None;
        }
        let inner = self.inner.lock();
        inner.slots.get(uid.slot() as usize)?.clone()
    }

    /// Frees the slot and returns the evicted handle so the caller can run
    /// teardown after the table lock is released.
    pub fn withdraw(&self, uid: Uid) -> Option<Arc<T>> {
        if !uid.check(T::CLASS) {
            return None;
        }
        let slot = uid.slot() as usize;
        let mut inner = self.inner.lock();
        let evicted = inner.slots.get_mut(slot)?.take();
        if evicted.is_some() {
            inner.hint = inner.hint.min(slot);
        }
        evicted
    }

    pub fn remove(&self, uid: Uid) -> bool {
        self.withdraw(uid).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.iter_mut().for_each(|s| *s = None);
        inner.hint = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl<T: KernelObject> Default for ObjectTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
