//! Attribute cache
//!
//! A process-wide map from (collection, handle) to the most recently
//! observed attribute record, used to short-circuit read-only metadata
//! calls. The eviction policy is deliberately simple: the cache is a fixed
//! capacity map and inserts into a full cache drop an arbitrary resident
//! entry. Correctness never depends on residency; every write path goes
//! through to disk first.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::dspace::DsAttributes;
use crate::handle::Handle;
use crate::CollId;

pub struct AttrCache {
    inner: Mutex<Inner>,
}

struct Inner {
    map: HashMap<(CollId, Handle), DsAttributes>,
    capacity: usize,
}

impl AttrCache {
    pub fn new(capacity: usize) -> Self {
        AttrCache {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn get(&self, coll_id: CollId, handle: Handle) -> Option<DsAttributes> {
        let inner = self.inner.lock().unwrap();
        inner.map.get(&(coll_id, handle)).cloned()
    }

    /// Insert or refresh an entry, dropping a resident entry if the cache is
    /// at capacity.
    pub fn insert(&self, coll_id: CollId, handle: Handle, attrs: DsAttributes) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.len() >= inner.capacity && !inner.map.contains_key(&(coll_id, handle)) {
            if let Some(victim) = inner.map.keys().next().copied() {
                inner.map.remove(&victim);
            }
        }
        inner.map.insert((coll_id, handle), attrs);
    }

    pub fn remove(&self, coll_id: CollId, handle: Handle) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(&(coll_id, handle));
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity.max(1);
        while inner.map.len() > inner.capacity {
            if let Some(victim) = inner.map.keys().next().copied() {
                inner.map.remove(&victim);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dspace::{DsAttributes, TypeAttrs};

    fn attrs(size: u64) -> DsAttributes {
        DsAttributes::new(0, 0, 0o644, TypeAttrs::Datafile { bstream_size: size })
    }

    #[test]
    fn test_insert_get_remove() {
        let cache = AttrCache::new(16);
        assert!(cache.get(1, Handle(7)).is_none());

        cache.insert(1, Handle(7), attrs(100));
        let got = cache.get(1, Handle(7)).unwrap();
        assert_eq!(got.type_attrs, TypeAttrs::Datafile { bstream_size: 100 });

        // a different collection misses
        assert!(cache.get(2, Handle(7)).is_none());

        cache.remove(1, Handle(7));
        assert!(cache.get(1, Handle(7)).is_none());
    }

    #[test]
    fn test_capacity_bound() {
        let cache = AttrCache::new(4);
        for i in 0..32 {
            cache.insert(1, Handle(i), attrs(i as u64));
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_refresh_does_not_evict() {
        let cache = AttrCache::new(2);
        cache.insert(1, Handle(1), attrs(1));
        cache.insert(1, Handle(2), attrs(2));
        cache.insert(1, Handle(1), attrs(10));
        assert_eq!(cache.len(), 2);
        let got = cache.get(1, Handle(1)).unwrap();
        assert_eq!(got.type_attrs, TypeAttrs::Datafile { bstream_size: 10 });
    }
}
