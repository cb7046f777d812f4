use std::hash::Hash;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

/// A lock-free copy-on-write hash map: readers atomically load the current snapshot, writers
///  clone-and-swap it. Reads never block, and writers never block readers - the right
///  trade-off for maps that are read per frame but modified only when a group is created or
///  retired.
pub struct AtomicMap<K, V> {
    map: AtomicPtr<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        let map = Arc::new(FxHashMap::<K, V>::default());
        let raw = Box::into_raw(Box::new(map));

        AtomicMap {
            map: AtomicPtr::new(raw),
        }
    }

    /// a consistent snapshot of the map's current state
    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        unsafe { (*self.map.load(Ordering::Acquire)).clone() }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.load().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        loop {
            let old = self.map.load(Ordering::Acquire);

            let mut map: FxHashMap<K, V> = unsafe { (**old).clone() };
            f(&mut map);
            let new = Box::into_raw(Box::new(Arc::new(map)));

            match self.map.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => {
                    unsafe { drop(Box::from_raw(prev)); }
                    return;
                }
                Err(_) => {
                    unsafe { drop(Box::from_raw(new)); }
                }
            }
        }
    }
}

impl<K, V> Drop for AtomicMap<K, V> {
    fn drop(&mut self) {
        unsafe {
            let raw = self.map.load(Ordering::Acquire);
            drop(Box::from_raw(raw));
        }
    }
}
