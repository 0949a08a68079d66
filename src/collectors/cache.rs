use super::error::RowConversionError;
use super::metric::MetricObservation;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

/// Result of the last execution of a query group.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub metrics: Vec<MetricObservation>,
    pub errors: Vec<RowConversionError>,
    pub timestamp: Instant,
}

impl CacheEntry {
    #[must_use]
    pub fn new(metrics: Vec<MetricObservation>, errors: Vec<RowConversionError>) -> Self {
        Self {
            metrics,
            errors,
            timestamp: Instant::now(),
        }
    }

    /// Whether the entry is younger than `ttl` at `now`.
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) < ttl
    }
}

/// Last results per query group. Stores timestamps only; freshness is
/// decided by the caller.
#[derive(Debug, Default)]
pub struct MetricCache {
    enabled: bool,
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

impl MetricCache {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up the last result of `name`. Always a miss when disabled.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CacheEntry>> {
        if !self.enabled {
            return None;
        }
        self.lock().get(name).cloned()
    }

    /// Store (or overwrite) the result of `name`. No-op when disabled.
    pub fn put(&self, name: &str, entry: CacheEntry) {
        if !self.enabled {
            return;
        }
        self.lock().insert(name.to_string(), Arc::new(entry));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("MetricCache mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::metric::MetricKind;

    fn entry(value: f64) -> CacheEntry {
        CacheEntry::new(
            vec![MetricObservation {
                name: "pg_up".to_string(),
                help: String::new(),
                labels: vec![("server".to_string(), "localhost:5432".to_string())],
                value,
                kind: MetricKind::Gauge,
            }],
            Vec::new(),
        )
    }

    #[test]
    fn test_get_put() {
        let cache = MetricCache::new(true);
        assert!(cache.get("pg_up").is_none());

        cache.put("pg_up", entry(1.0));
        let hit = cache.get("pg_up");
        assert!(hit.is_some_and(|e| e.metrics.len() == 1));
        assert_eq!(cache.len(), 1);

        cache.put("pg_up", entry(0.0));
        assert_eq!(cache.len(), 1);
        assert!(
            cache
                .get("pg_up")
                .is_some_and(|e| e.metrics.iter().all(|m| m.value.abs() < f64::EPSILON))
        );

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_always_misses() {
        let cache = MetricCache::new(false);
        cache.put("pg_up", entry(1.0));
        assert!(cache.get("pg_up").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_is_fresh() {
        let e = entry(1.0);
        let now = e.timestamp;
        assert!(e.is_fresh(Duration::from_secs(10), now));
        assert!(e.is_fresh(Duration::from_secs(10), now + Duration::from_secs(9)));
        assert!(!e.is_fresh(Duration::from_secs(10), now + Duration::from_secs(10)));
        assert!(!e.is_fresh(Duration::ZERO, now));
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(MetricCache::new(true));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let name = format!("group_{}", i % 4);
                    cache.put(&name, entry(f64::from(i)));
                    cache.get(&name).is_some()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap_or(false));
        }
        assert_eq!(cache.len(), 4);
    }
}
