//! Plug-in seams: row comparators and the process-wide registry binding
//! entity names to row layouts and indexer names to comparators.
//!
//! The engine never interprets row payloads itself. Applications register a
//! layout (the fixed row size) per entity and an [`Indexer`] per index, and
//! drive searches with [`Matcher`]s; the catalog's own comparator is built
//! in and always registered.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::{CatalogIndexer, CATALOG_INDEX_NAME};
use crate::error::{CatalogError, ConfigError, Result};

/// Total order over the rows of one index. `a` and `b` are row payloads of
/// the indexed entity.
pub trait Indexer: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// A probe against one row payload. For index walks the result is the row's
/// key relative to the probe (`Greater` prunes to the left subtree, `Less`
/// to the right); for post filtering only `Equal` counts as a match.
pub trait Matcher {
    fn matches(&self, row: &[u8]) -> Ordering;
}

/// A matcher that drives a specific index of the target entity.
pub trait IndexMatcher: Matcher {
    /// The index id (as bound in the catalog) this matcher walks.
    fn index_id(&self) -> &str;
}

/// Payload comparator used to order cursor results.
pub trait Sorter {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Row layouts and indexers known to this process. Built by the application
/// before the fileset is created or attached; the engine resolves names
/// found in the config and the catalog against it.
pub struct Registry {
    layouts: HashMap<String, usize>,
    indexers: HashMap<String, Arc<dyn Indexer>>,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Registry {
            layouts: HashMap::new(),
            indexers: HashMap::new(),
        };
        registry.register_indexer(CATALOG_INDEX_NAME, Arc::new(CatalogIndexer));
        registry
    }

    /// Registers the fixed row size of entity `name`.
    pub fn register_layout(&mut self, name: impl Into<String>, unit_size: usize) {
        self.layouts.insert(name.into(), unit_size);
    }

    pub fn register_indexer(&mut self, name: impl Into<String>, indexer: Arc<dyn Indexer>) {
        self.indexers.insert(name.into(), indexer);
    }

    pub(crate) fn layout(&self, name: &str) -> Result<usize> {
        self.layouts
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownLayout(name.into()).into())
    }

    pub(crate) fn indexer(&self, name: &str) -> Result<&Arc<dyn Indexer>> {
        self.indexers
            .get(name)
            .ok_or_else(|| CatalogError::UnknownIndexer(name.into()).into())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_indexer_is_always_registered() {
        let registry = Registry::new();
        assert!(registry.indexer(CATALOG_INDEX_NAME).is_ok());
        assert!(registry.indexer("nobody").is_err());
    }

    #[test]
    fn layouts_resolve_by_name() {
        let mut registry = Registry::new();
        registry.register_layout("PERSON", 16);
        assert_eq!(registry.layout("PERSON").unwrap(), 16);
        assert!(registry.layout("GHOST").is_err());
    }
}
