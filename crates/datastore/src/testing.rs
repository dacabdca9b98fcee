//! Shared fixtures for the engine-level tests: a small `PERSON` table with
//! a primary-key treap index, plus the plug-ins driving it.

use std::cmp::Ordering;
use std::io::Write as _;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tempfile::TempDir;

use crate::registry::{IndexMatcher, Indexer, Matcher, Registry, Sorter};
use crate::Database;

pub(crate) const PERSON: &str = "PERSON";
pub(crate) const PERSON_PK: &str = "PERSON_PK";
pub(crate) const PERSON_INDEXER: &str = "PersonIdIndexer";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct PersonRow {
    pub id: u32,
    pub name: [u8; 12],
}

impl PersonRow {
    pub fn new(id: u32, name: &str) -> Self {
        let mut buf = [0u8; 12];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        PersonRow { id, name: buf }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(12);
        std::str::from_utf8(&self.name[..end]).unwrap()
    }
}

pub(crate) struct PersonIdIndexer;

impl Indexer for PersonIdIndexer {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        PersonRow::from_bytes(a).id.cmp(&PersonRow::from_bytes(b).id)
    }
}

pub(crate) struct PersonIdMatcher(pub u32);

impl Matcher for PersonIdMatcher {
    fn matches(&self, row: &[u8]) -> Ordering {
        PersonRow::from_bytes(row).id.cmp(&self.0)
    }
}

impl IndexMatcher for PersonIdMatcher {
    fn index_id(&self) -> &str {
        PERSON_PK
    }
}

pub(crate) struct PersonNameSorter;

impl Sorter for PersonNameSorter {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        PersonRow::from_bytes(a)
            .name
            .cmp(&PersonRow::from_bytes(b).name)
    }
}

pub(crate) fn person_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_layout(PERSON, std::mem::size_of::<PersonRow>());
    registry.register_indexer(PERSON_INDEXER, Arc::new(PersonIdIndexer));
    registry
}

pub(crate) fn person_config(timeout_ms: u64, person_max_line: u64) -> String {
    format!(
        "01=<TrMgr><MaxLine>64</MaxLine><TimeOut>{timeout_ms}</TimeOut></TrMgr>\n\
         02=<EntityMaster><MaxLine>32</MaxLine></EntityMaster>\n\
         03=<IndexMgr><MaxLine>128</MaxLine></IndexMgr>\n\
         04=<IndexMgrIndex><MaxLine>512</MaxLine></IndexMgrIndex>\n\
         05=<Entity><EntityName>PERSON</EntityName><MaxLine>{person_max_line}</MaxLine></Entity>\n\
         06=<Index><IndexName>PERSON_PK_IDX</IndexName><MaxLine>512</MaxLine></Index>\n\
         07=<IndexEntry><EntityName>PERSON</EntityName><IndexName>PERSON_PK_IDX</IndexName>\
         <IndexID>PERSON_PK</IndexID><Indexer>PersonIdIndexer</Indexer></IndexEntry>\n"
    )
}

/// Creates a fresh PERSON fileset in a temp dir.
pub(crate) fn person_db(timeout_ms: u64, person_max_line: u64) -> (TempDir, Database) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("regions.conf");
    let mut file = std::fs::File::create(&config_path).unwrap();
    file.write_all(person_config(timeout_ms, person_max_line).as_bytes())
        .unwrap();
    let db = Database::create(&config_path, &dir.path().join("data"), person_registry()).unwrap();
    (dir, db)
}
