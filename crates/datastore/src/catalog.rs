//! The index catalog: well-known region names, the catalog row layout, and
//! the built-in comparator that keeps the catalog-of-catalogs treap ordered
//! by (entity name, index id).
//!
//! The catalog is itself an entity whose rows bind (entity, index-id) to
//! (index table, indexer, published root). Its own index is the fixed-name
//! catalog-of-catalogs treap; the published root of that treap lives in the
//! transaction region header and is swapped atomically on commit.

use std::cmp::Ordering;

use bytemuck::{Pod, Zeroable};
use shmdb_primitives::{FixedName, RowId};

use crate::registry::{IndexMatcher, Indexer, Matcher};

/// The transaction region.
pub const TXN_REGION_NAME: &str = "$";
/// The entity holding one name row per attached region.
pub const ENTITY_MASTER_NAME: &str = "EntityMaster";
/// The catalog entity.
pub const CATALOG_NAME: &str = "IndexMgr";
/// The catalog-of-catalogs treap, which doubles as the name of the built-in
/// catalog indexer.
pub const CATALOG_INDEX_NAME: &str = "IndexMgrIndex";

/// One catalog binding. Unique by (entity_name, index_id).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CatalogRow {
    pub entity_name: FixedName,
    pub index_id: FixedName,
    pub index_name: FixedName,
    pub indexer_name: FixedName,
    /// Root row of this index's treap; `-1` while the index is empty.
    pub root: RowId,
}

impl CatalogRow {
    /// Builds a row from string names. Returns `None` when a name does not
    /// fit a [`FixedName`] cell.
    pub fn new(entity_name: &str, index_id: &str, index_name: &str, indexer_name: &str, root: RowId) -> Option<Self> {
        Some(CatalogRow {
            entity_name: FixedName::new(entity_name)?,
            index_id: FixedName::new(index_id)?,
            index_name: FixedName::new(index_name)?,
            indexer_name: FixedName::new(indexer_name)?,
            root,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// One row of the entity master.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct NameRow {
    pub name: FixedName,
}

impl NameRow {
    pub fn new(name: &str) -> Option<Self> {
        Some(NameRow {
            name: FixedName::new(name)?,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// In-process binding of one index id to its index table and indexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexBinding {
    pub index_name: String,
    pub indexer_name: String,
}

/// Orders catalog rows by (entity_name, index_id).
pub struct CatalogIndexer;

impl Indexer for CatalogIndexer {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a = CatalogRow::from_bytes(a);
        let b = CatalogRow::from_bytes(b);
        a.entity_name
            .cmp(&b.entity_name)
            .then(a.index_id.cmp(&b.index_id))
    }
}

/// Probe for the catalog row of one (entity, index-id) pair.
pub(crate) struct CatalogMatcher {
    entity_name: FixedName,
    index_id: FixedName,
}

impl CatalogMatcher {
    pub fn new(entity_name: &str, index_id: &str) -> Option<Self> {
        Some(CatalogMatcher {
            entity_name: FixedName::new(entity_name)?,
            index_id: FixedName::new(index_id)?,
        })
    }
}

impl Matcher for CatalogMatcher {
    fn matches(&self, row: &[u8]) -> Ordering {
        let row = CatalogRow::from_bytes(row);
        row.entity_name
            .cmp(&self.entity_name)
            .then(row.index_id.cmp(&self.index_id))
    }
}

impl IndexMatcher for CatalogMatcher {
    fn index_id(&self) -> &str {
        CATALOG_INDEX_NAME
    }
}
