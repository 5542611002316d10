//! Process-wide key→value feature map, with per-package overrides and an ignore list that
//! hides selected features from `BuildInfo` emission (and therefore from the buildinfo hash).

use indexmap::IndexMap;
use std::{
    collections::HashSet,
    sync::Mutex,
};

#[derive(Debug, Default)]
struct Inner {
    values: IndexMap<String, String>,
    ignored: HashSet<String>,
}

/// Thread-safe; all mutation and lookup goes through an internal lock, matching the
/// shared-resource policy for `FeatureMap`, the namespace set, and the DLObject set.
#[derive(Debug, Default)]
pub struct FeatureMap {
    inner: Mutex<Inner>,
}

impl FeatureMap {
    pub fn new() -> Self {
        FeatureMap::default()
    }

    /// Insert `key=value` if absent; replace only when `override_` is true.
    pub fn set(&self, key: &str, value: &str, override_: bool) {
        let mut inner = self.inner.lock().unwrap();
        if override_ || !inner.values.contains_key(key) {
            inner.values.insert(key.to_string(), value.to_string());
        }
    }

    /// Parse `"key=value"` and always override any existing value.
    pub fn set_kv(&self, kv: &str) -> Result<(), String> {
        match kv.find('=') {
            Some(idx) => {
                let (k, v) = kv.split_at(idx);
                self.set(k, &v[1..], true);
                Ok(())
            }
            None => Err(format!("invalid feature assignment: {}", kv)),
        }
    }

    /// Per-package lookup tries `"<pkg>:<key>"` before the bare `"<key>"`.
    pub fn get(&self, pkg: &str, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let scoped = format!("{}:{}", pkg, key);
        inner
            .values
            .get(&scoped)
            .or_else(|| inner.values.get(key))
            .cloned()
    }

    /// Mark a feature as suppressed from `BuildInfo` emission.
    pub fn ignore(&self, key: &str) {
        self.inner.lock().unwrap().ignored.insert(key.to_string());
    }

    pub fn is_ignored(&self, key: &str) -> bool {
        self.inner.lock().unwrap().ignored.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_does_not_override_by_default() {
        let fm = FeatureMap::new();
        fm.set("x", "1", false);
        fm.set("x", "2", false);
        assert_eq!(fm.get("pkg", "x"), Some("1".to_string()));
    }

    #[test]
    fn set_overrides_when_requested() {
        let fm = FeatureMap::new();
        fm.set("x", "1", false);
        fm.set("x", "2", true);
        assert_eq!(fm.get("pkg", "x"), Some("2".to_string()));
    }

    #[test]
    fn per_package_lookup_prefers_scoped_key() {
        let fm = FeatureMap::new();
        fm.set("x", "global", false);
        fm.set("pkg:x", "scoped", false);
        assert_eq!(fm.get("pkg", "x"), Some("scoped".to_string()));
        assert_eq!(fm.get("other", "x"), Some("global".to_string()));
    }

    #[test]
    fn ignore_marks_key() {
        let fm = FeatureMap::new();
        fm.ignore("x");
        assert!(fm.is_ignored("x"));
        assert!(!fm.is_ignored("y"));
    }
}
