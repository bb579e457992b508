use crate::provider::Completion;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// A cached completion and the provider that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCompletion {
    pub provider_id: String,
    pub completion: Completion,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CachedCompletion>,
    order: VecDeque<String>,
}

/// Bounded FIFO of successful completions keyed by request fingerprint.
pub struct ResponseCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ResponseCache {
    /// A cache holding at most `capacity` entries. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Store or refresh the answer for `fingerprint`, evicting the oldest entry when full.
    pub fn insert(&self, fingerprint: String, entry: CachedCompletion) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.entries.insert(fingerprint.clone(), entry).is_some() {
            return;
        }
        inner.order.push_back(fingerprint);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    /// The cached answer for `fingerprint`, if any.
    pub fn get(&self, fingerprint: &str) -> Option<CachedCompletion> {
        self.inner.lock().entries.get(fingerprint).cloned()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn entry(text: &str) -> CachedCompletion {
        CachedCompletion {
            provider_id: "a".into(),
            completion: Completion::text(text),
        }
    }

    #[test]
    fn test_evicts_oldest_first() {
        let cache = ResponseCache::new(2);
        cache.insert("k1".into(), entry("1"));
        cache.insert("k2".into(), entry("2"));
        cache.insert("k3".into(), entry("3"));
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.get("k3").unwrap().completion.text, "3");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_refresh_keeps_position_and_updates_value() {
        let cache = ResponseCache::new(2);
        cache.insert("k1".into(), entry("old"));
        cache.insert("k2".into(), entry("2"));
        cache.insert("k1".into(), entry("new"));
        assert_eq!(cache.get("k1").unwrap().completion.text, "new");
        cache.insert("k3".into(), entry("3"));
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = ResponseCache::new(0);
        cache.insert("k".into(), entry("x"));
        assert!(cache.is_empty());
    }
}
