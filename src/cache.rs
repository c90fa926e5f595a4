use std::collections::HashMap;
use std::sync::RwLock;

/// In-process memoization keyed by (name, version tag).
///
/// Entries are addressed by the version of the master they were derived from,
/// not by a TTL: when an admin uploads a new master the version changes and
/// the stale entries simply stop being looked up. Mutations that change a
/// version's own content (saving a result file, purging the results
/// namespace) invalidate explicitly.
pub struct VersionCache<T: Clone> {
    entries: RwLock<HashMap<(String, String), T>>,
}

impl<T: Clone> VersionCache<T> {
    pub fn new() -> Self {
        VersionCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str, version: &str) -> Option<T> {
        let entries = self.entries.read().unwrap();
        entries.get(&(name.to_string(), version.to_string())).cloned()
    }

    pub fn put(&self, name: &str, version: &str, value: T) {
        let mut entries = self.entries.write().unwrap();
        entries.insert((name.to_string(), version.to_string()), value);
    }

    /// Drop one entry.
    pub fn invalidate(&self, name: &str, version: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(&(name.to_string(), version.to_string()));
    }

    /// Drop everything; used after a master upload.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap();
        entries.clear();
    }
}

impl<T: Clone> Default for VersionCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_scoped_by_version() {
        let cache: VersionCache<Vec<String>> = VersionCache::new();
        cache.put("master", "2026-01", vec!["a".to_string()]);

        assert_eq!(cache.get("master", "2026-01"), Some(vec!["a".to_string()]));
        assert_eq!(cache.get("master", "2026-02"), None);
        assert_eq!(cache.get("listing", "2026-01"), None);
    }

    #[test]
    fn invalidate_and_clear_drop_entries() {
        let cache: VersionCache<u32> = VersionCache::new();
        cache.put("listing", "2026-01", 1);
        cache.put("listing", "2026-02", 2);

        cache.invalidate("listing", "2026-01");
        assert_eq!(cache.get("listing", "2026-01"), None);
        assert_eq!(cache.get("listing", "2026-02"), Some(2));

        cache.clear();
        assert_eq!(cache.get("listing", "2026-02"), None);
    }
}
