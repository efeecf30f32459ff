use std::num::NonZeroUsize;

use lru::LruCache;

use super::projection::PathProjection;

/// Bounded LRU cache sizes, surfaced through configuration.
#[derive(Clone, Copy, Debug)]
pub struct CacheSizes {
    /// Emitted-pattern cache entries.
    pub patterns: usize,
    /// Utility-bound cache entries.
    pub bounds: usize,
    /// Projection cache entries.
    pub projections: usize,
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self {
            patterns: 4096,
            bounds: 4096,
            projections: 256,
        }
    }
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size.max(1)).expect("cache capacity is at least one")
}

/// The engine's three per-run caches. Keys are canonical (sorted) item
/// vectors; all three are hard-capped and evict least-recently-used.
pub struct EngineCaches {
    /// `(sorted items) -> residual upper bound`, for early termination.
    bounds: LruCache<Vec<i64>, f64>,
    /// `(sorted items) -> ()`, suppressing duplicate emission on diamond
    /// traversals.
    emitted: LruCache<Vec<i64>, ()>,
    /// Most recent projections by suffix.
    projections: LruCache<Vec<i64>, PathProjection>,
}

impl EngineCaches {
    pub fn new(sizes: CacheSizes) -> Self {
        Self {
            bounds: LruCache::new(capacity(sizes.bounds)),
            emitted: LruCache::new(capacity(sizes.patterns)),
            projections: LruCache::new(capacity(sizes.projections)),
        }
    }

    pub fn cached_bound(&mut self, key: &[i64]) -> Option<f64> {
        self.bounds.get(key).copied()
    }

    pub fn record_bound(&mut self, key: Vec<i64>, bound: f64) {
        self.bounds.put(key, bound);
    }

    /// Marks `key` as emitted; returns `false` when it had already been
    /// emitted, in which case the caller must not emit again.
    pub fn mark_emitted(&mut self, key: Vec<i64>) -> bool {
        self.emitted.put(key, ()).is_none()
    }

    pub fn cached_projection(&mut self, key: &[i64]) -> Option<PathProjection> {
        self.projections.get(key).cloned()
    }

    pub fn record_projection(&mut self, key: Vec<i64>, projection: PathProjection) {
        self.projections.put(key, projection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_cache_flags_duplicates() {
        let mut caches = EngineCaches::new(CacheSizes::default());

        assert!(caches.mark_emitted(vec![1, 2]));
        assert!(!caches.mark_emitted(vec![1, 2]));
        assert!(caches.mark_emitted(vec![1, 3]));
    }

    #[test]
    fn bound_cache_evicts_at_capacity() {
        let sizes = CacheSizes {
            bounds: 2,
            ..CacheSizes::default()
        };
        let mut caches = EngineCaches::new(sizes);

        caches.record_bound(vec![1], 10.0);
        caches.record_bound(vec![2], 20.0);
        caches.record_bound(vec![3], 30.0);

        assert_eq!(caches.cached_bound(&[1]), None);
        assert_eq!(caches.cached_bound(&[2]), Some(20.0));
        assert_eq!(caches.cached_bound(&[3]), Some(30.0));
    }

    #[test]
    fn zero_configured_size_still_yields_a_working_cache() {
        let sizes = CacheSizes {
            patterns: 0,
            bounds: 0,
            projections: 0,
        };
        let mut caches = EngineCaches::new(sizes);

        caches.record_bound(vec![9], 1.5);
        assert_eq!(caches.cached_bound(&[9]), Some(1.5));
    }
}
