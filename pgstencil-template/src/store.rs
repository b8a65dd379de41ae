//! Template loading and caching.
//!
//! Templates are resolved by name against a directory, read once as UTF-8
//! and kept for the life of the store. Both blocking and async loads share
//! the same cache.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pgstencil_template::store::TemplateStore;
//!
//! let store = TemplateStore::new("sql", ".sql");
//!
//! let first = store.load("select_merchant").unwrap();
//! let second = store.load("select_merchant.sql").unwrap();
//! // Both names resolve to the same file and share one allocation.
//! assert!(std::sync::Arc::ptr_eq(&first, &second));
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};

/// A cache of template bodies keyed by resolved path.
#[derive(Debug)]
pub struct TemplateStore {
    dir: PathBuf,
    extension: String,
    cache: RwLock<HashMap<PathBuf, Arc<str>>>,
    stats: RwLock<CacheStats>,
}

/// Statistics for the template cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of templates currently cached.
    pub cached_count: usize,
}

impl CacheStats {
    /// Get the cache hit rate.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl TemplateStore {
    /// Create a store reading from `dir`.
    ///
    /// A non-empty `extension` is appended to names that do not already end
    /// with it; a missing leading `.` is added.
    pub fn new(dir: impl Into<PathBuf>, extension: impl AsRef<str>) -> Self {
        let extension = extension.as_ref();
        let extension = if extension.is_empty() || extension.starts_with('.') {
            extension.to_string()
        } else {
            format!(".{extension}")
        };

        Self {
            dir: dir.into(),
            extension,
            cache: RwLock::new(HashMap::new()),
            stats: RwLock::default(),
        }
    }

    /// The template directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The configured extension, including its leading `.`, or `""`.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Resolve a template name to its file path.
    pub fn resolve(&self, name: &str) -> PathBuf {
        if self.extension.is_empty() || name.ends_with(&self.extension) {
            self.dir.join(name)
        } else {
            self.dir.join(format!("{name}{}", self.extension))
        }
    }

    /// Load a template, reading it from disk on first use.
    pub fn load(&self, name: &str) -> TemplateResult<Arc<str>> {
        let path = self.resolve(name);
        if let Some(body) = self.cached(&path) {
            return Ok(body);
        }

        let body = std::fs::read_to_string(&path).map_err(|e| read_error(&path, e))?;
        Ok(self.insert(path, body))
    }

    /// Load a template without blocking the async runtime.
    pub async fn load_async(&self, name: &str) -> TemplateResult<Arc<str>> {
        let path = self.resolve(name);
        if let Some(body) = self.cached(&path) {
            return Ok(body);
        }

        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| read_error(&path, e))?;
        Ok(self.insert(path, body))
    }

    fn cached(&self, path: &Path) -> Option<Arc<str>> {
        let body = self.cache.read().get(path).cloned()?;
        self.stats.write().hits += 1;
        debug!(path = %path.display(), "template cache hit");
        Some(body)
    }

    fn insert(&self, path: PathBuf, body: String) -> Arc<str> {
        debug!(path = %path.display(), bytes = body.len(), "template cache miss");
        self.stats.write().misses += 1;

        // A concurrent load may have won the race; keep its value.
        let mut cache = self.cache.write();
        Arc::clone(cache.entry(path).or_insert_with(|| Arc::from(body)))
    }

    /// Check if a template is cached.
    pub fn contains(&self, name: &str) -> bool {
        self.cache.read().contains_key(&self.resolve(name))
    }

    /// Clear the cache.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.cached_count = self.cache.read().len();
        stats
    }

    /// Get the number of cached templates.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

fn read_error(path: &Path, source: io::Error) -> TemplateError {
    if source.kind() == io::ErrorKind::NotFound {
        TemplateError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        TemplateError::Read {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn store_with(files: &[(&str, &str)], extension: &str) -> (tempfile::TempDir, TemplateStore) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            fs::write(dir.path().join(name), body).unwrap();
        }
        let store = TemplateStore::new(dir.path(), extension);
        (dir, store)
    }

    #[test]
    fn test_resolve_appends_extension() {
        let store = TemplateStore::new("sql", "sql");
        assert_eq!(store.extension(), ".sql");
        assert_eq!(store.resolve("users"), PathBuf::from("sql/users.sql"));
        assert_eq!(store.resolve("users.sql"), PathBuf::from("sql/users.sql"));

        let store = TemplateStore::new("sql", "");
        assert_eq!(store.resolve("users.sql"), PathBuf::from("sql/users.sql"));
    }

    #[test]
    fn test_load_is_cached() {
        let (dir, store) = store_with(&[("a.sql", "SELECT 1")], ".sql");

        let first = store.load("a").unwrap();
        assert_eq!(&*first, "SELECT 1");

        // Changing the file must not be observed after the first read.
        fs::write(dir.path().join("a.sql"), "SELECT 2").unwrap();
        let second = store.load("a.sql").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.cached_count, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_missing_template() {
        let (_dir, store) = store_with(&[], "");

        let err = store.load("nope.sql").unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.contains("nope.sql"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_read_error() {
        let (dir, store) = store_with(&[], "");
        fs::write(dir.path().join("bin.sql"), [0xff, 0xfe, 0x00]).unwrap();

        let err = store.load("bin.sql").unwrap_err();
        assert!(err.is_read_error());
        assert!(!store.contains("bin.sql"));
    }

    #[test]
    fn test_clear() {
        let (_dir, store) = store_with(&[("a.sql", "SELECT 1")], "");
        store.load("a.sql").unwrap();
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.stats().cached_count, 0);
    }

    #[tokio::test]
    async fn test_load_async_shares_cache() {
        let (_dir, store) = store_with(&[("a.sql", "SELECT 1")], ".sql");

        let first = store.load_async("a").await.unwrap();
        let second = store.load("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.stats().misses, 1);
    }
}
