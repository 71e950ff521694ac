use linked_hash_set::LinkedHashSet;
use std::{borrow::Borrow, hash::Hash, num::NonZeroUsize};

/// A bounded set that forgets its oldest entries first.
///
/// Used to remember block hashes that were recently imported or rejected, so repeated
/// announcements of them can be dropped without touching the chain store.
#[derive(Debug, Clone)]
pub struct LruCache<T: Hash + Eq> {
    limit: NonZeroUsize,
    inner: LinkedHashSet<T>,
}

impl<T: Hash + Eq> LruCache<T> {
    /// Creates a cache holding at most `limit` entries.
    pub fn new(limit: NonZeroUsize) -> Self {
        Self { inner: LinkedHashSet::new(), limit }
    }

    /// Inserts the entry, evicting the oldest one if the cache is full.
    ///
    /// Returns true if the entry was not present. Re-inserting a present entry refreshes it.
    pub fn insert(&mut self, entry: T) -> bool {
        let is_new = self.inner.insert(entry);
        if self.inner.len() > self.limit.get() {
            self.inner.pop_front();
        }
        is_new
    }

    /// Returns `true` if the set contains a value.
    pub fn contains<Q: ?Sized>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.inner.contains(value)
    }

    /// Removes the entry, returning whether it was present.
    pub fn remove<Q: ?Sized>(&mut self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.inner.remove(value)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fbc_primitives::B256;

    #[test]
    fn evicts_oldest_hash() {
        let mut cache = LruCache::new(NonZeroUsize::new(2).unwrap());
        let (a, b, c) = (B256::with_last_byte(1), B256::with_last_byte(2), B256::with_last_byte(3));
        assert!(cache.insert(a));
        assert!(cache.insert(b));
        assert!(!cache.insert(a));
        assert_eq!(cache.len(), 2);

        // `a` was refreshed, so `b` is the oldest
        cache.insert(c);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn remove_entry() {
        let mut cache = LruCache::new(NonZeroUsize::new(4).unwrap());
        cache.insert("known");
        assert!(cache.remove("known"));
        assert!(!cache.remove("known"));
        assert!(cache.is_empty());
    }
}
