//! Fileset initialization: building every region from a config, or
//! attaching to an existing fileset by enumerating its entity master.
//!
//! The [`Database`] is the process-wide registry: the name-to-region map,
//! the entity-to-index-id bindings and the well-known handles live here and
//! are passed into components explicitly. It is built once at create or
//! attach and torn down on drop.
//!
//! Creation registers every entity and index name in `EntityMaster`, and
//! every index binding in the catalog, through the store's own statement
//! API. The fileset describes itself with its own rows, which is what
//! makes attach-by-enumeration possible.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};

use log::info;

use crate::catalog::{
    CatalogRow, IndexBinding, NameRow, CATALOG_INDEX_NAME, CATALOG_NAME, ENTITY_MASTER_NAME, TXN_REGION_NAME,
};
use crate::config::{read_config, ConfigRecord};
use crate::connection::Connection;
use crate::error::{ConfigError, Result, TableError};
use crate::gc::GcReport;
use crate::region::Region;
use crate::registry::Registry;
use crate::treap_index::NODE_SIZE;
use crate::txn::{TransactionTable, TxRecord};

pub struct Database {
    data_dir: PathBuf,
    regions: HashMap<String, Region>,
    /// entity name -> index id -> binding. `BTreeMap` keeps the per-entity
    /// index order stable across processes.
    index_map: HashMap<String, BTreeMap<String, IndexBinding>>,
    registry: Registry,
}

impl Database {
    /// Builds a fresh fileset under `data_dir` from the region config at
    /// `config_path`. Existing region files are re-initialized.
    pub fn create(config_path: &Path, data_dir: &Path, registry: Registry) -> Result<Database> {
        let records = read_config(config_path)?;
        fs::create_dir_all(data_dir).map_err(|source| ConfigError::Io {
            path: data_dir.into(),
            source,
        })?;
        let mut db = Database::empty(data_dir, registry);

        for record in records {
            match record {
                ConfigRecord::TrMgr { max_line, timeout_ms } => {
                    let region = Region::create(
                        data_dir,
                        TXN_REGION_NAME,
                        max_line,
                        mem::size_of::<TxRecord>() as u64,
                        timeout_ms,
                    )?;
                    region.attach_log();
                    db.regions.insert(TXN_REGION_NAME.into(), region);
                }
                ConfigRecord::EntityMaster { max_line, timeout_ms } => {
                    let region = Region::create(
                        data_dir,
                        ENTITY_MASTER_NAME,
                        max_line,
                        mem::size_of::<NameRow>() as u64,
                        timeout_ms,
                    )?;
                    region.attach_log();
                    db.regions.insert(ENTITY_MASTER_NAME.into(), region);
                }
                ConfigRecord::IndexMgr { max_line, timeout_ms } => {
                    let region = Region::create(
                        data_dir,
                        CATALOG_NAME,
                        max_line,
                        mem::size_of::<CatalogRow>() as u64,
                        timeout_ms,
                    )?;
                    region.attach_log();
                    db.regions.insert(CATALOG_NAME.into(), region);
                    db.register_master_row(CATALOG_NAME)?;
                }
                ConfigRecord::IndexMgrIndex { max_line, timeout_ms } => {
                    let region =
                        Region::create(data_dir, CATALOG_INDEX_NAME, max_line, NODE_SIZE as u64, timeout_ms)?;
                    region.attach_log();
                    db.regions.insert(CATALOG_INDEX_NAME.into(), region);
                    db.register_master_row(CATALOG_INDEX_NAME)?;
                }
                ConfigRecord::Index {
                    index_name,
                    max_line,
                    timeout_ms,
                } => {
                    let region = Region::create(data_dir, &index_name, max_line, NODE_SIZE as u64, timeout_ms)?;
                    region.attach_log();
                    db.regions.insert(index_name.clone(), region);
                    db.register_master_row(&index_name)?;
                }
                ConfigRecord::Entity {
                    entity_name,
                    max_line,
                    timeout_ms,
                } => {
                    let unit_size = db.registry.layout(&entity_name)?;
                    let region = Region::create(data_dir, &entity_name, max_line, unit_size as u64, timeout_ms)?;
                    region.attach_log();
                    db.regions.insert(entity_name.clone(), region);
                    db.register_master_row(&entity_name)?;
                }
                ConfigRecord::IndexEntry {
                    entity_name,
                    index_name,
                    index_id,
                    indexer_name,
                } => {
                    db.region(TXN_REGION_NAME)?;
                    db.region(CATALOG_NAME)?;
                    db.region(CATALOG_INDEX_NAME)?;
                    let row = CatalogRow::new(
                        &entity_name,
                        &index_id,
                        &index_name,
                        &indexer_name,
                        shmdb_primitives::RowId::INVALID,
                    )
                    .ok_or(ConfigError::NameLength {
                        tag: "IndexEntry".into(),
                        value: entity_name.clone(),
                    })?;
                    let mut conn = db.connect();
                    conn.execute_insert(CATALOG_NAME, row.as_bytes())?;
                    conn.commit()?;
                    drop(conn);
                    db.add_index(&entity_name, &index_id, index_name.clone(), indexer_name.clone())?;
                    info!("index mapping {entity_name}/{index_id} -> {index_name} via {indexer_name}");
                }
            }
        }
        Ok(db)
    }

    /// Attaches to the fileset under `data_dir`: opens the transaction
    /// region and the entity master, then every region the master lists,
    /// then rebuilds the index bindings from the catalog.
    pub fn attach(data_dir: &Path, registry: Registry) -> Result<Database> {
        let mut db = Database::empty(data_dir, registry);
        for name in [TXN_REGION_NAME, ENTITY_MASTER_NAME] {
            let region = Region::open(data_dir, name)?;
            region.attach_log();
            db.regions.insert(name.into(), region);
        }

        let names = {
            let mut conn = db.connect();
            let mut cursor = conn.open_cursor(ENTITY_MASTER_NAME, false, None, None, None)?;
            let mut names = Vec::new();
            while let Some(payload) = cursor.fetch()? {
                let row = NameRow::from_bytes(&payload);
                let name = row.name.as_str().to_string();
                if name != TXN_REGION_NAME && name != ENTITY_MASTER_NAME {
                    names.push(name);
                }
            }
            conn.commit()?;
            names
        };
        for name in names {
            let region = Region::open(data_dir, &name)?;
            region.attach_log();
            db.regions.insert(name, region);
        }

        let bindings = {
            let mut conn = db.connect();
            let mut cursor = conn.open_cursor(CATALOG_NAME, false, None, None, None)?;
            let mut bindings = Vec::new();
            while let Some(payload) = cursor.fetch()? {
                bindings.push(CatalogRow::from_bytes(&payload));
            }
            conn.commit()?;
            bindings
        };
        for row in bindings {
            db.add_index(
                row.entity_name.as_str(),
                row.index_id.as_str(),
                row.index_name.as_str().into(),
                row.indexer_name.as_str().into(),
            )?;
        }
        Ok(db)
    }

    fn empty(data_dir: &Path, registry: Registry) -> Database {
        let mut db = Database {
            data_dir: data_dir.into(),
            regions: HashMap::new(),
            index_map: HashMap::new(),
            registry,
        };
        // The catalog's own binding has fixed names; seeding it here is
        // what lets catalog rows maintain the catalog-of-catalogs treap.
        db.index_map.entry(CATALOG_NAME.into()).or_default().insert(
            CATALOG_INDEX_NAME.into(),
            IndexBinding {
                index_name: CATALOG_INDEX_NAME.into(),
                indexer_name: CATALOG_INDEX_NAME.into(),
            },
        );
        db
    }

    fn register_master_row(&self, name: &str) -> Result<()> {
        // A config that lists entities before `TrMgr`/`EntityMaster` would
        // otherwise fail deep inside the first statement.
        self.region(TXN_REGION_NAME)?;
        self.region(ENTITY_MASTER_NAME)?;
        let row = NameRow::new(name).ok_or(ConfigError::NameLength {
            tag: "EntityName".into(),
            value: name.into(),
        })?;
        let mut conn = self.connect();
        conn.execute_insert(ENTITY_MASTER_NAME, row.as_bytes())?;
        conn.commit()
    }

    fn add_index(&mut self, entity_name: &str, index_id: &str, index_name: String, indexer_name: String) -> Result<()> {
        let per_entity = self.index_map.entry(entity_name.into()).or_default();
        if per_entity.contains_key(index_id) {
            return Err(ConfigError::DuplicateIndex {
                entity: entity_name.into(),
                index_id: index_id.into(),
            }
            .into());
        }
        per_entity.insert(
            index_id.into(),
            IndexBinding {
                index_name,
                indexer_name,
            },
        );
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Opens a connection. Connections are cheap; each carries its own
    /// transaction.
    pub fn connect(&self) -> Connection<'_> {
        Connection::new(self)
    }

    /// Runs one garbage collection pass over the whole fileset.
    pub fn collect_garbage(&self) -> Result<GcReport> {
        crate::gc::run(self)
    }

    pub(crate) fn region(&self, name: &str) -> Result<&Region> {
        self.regions
            .get(name)
            .ok_or_else(|| TableError::NotFound(name.into()).into())
    }

    pub(crate) fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub(crate) fn txn_region(&self) -> &Region {
        self.regions
            .get(TXN_REGION_NAME)
            .expect("the transaction region is attached before any statement runs")
    }

    pub(crate) fn txn_table(&self) -> TransactionTable<'_> {
        TransactionTable::new(self.txn_region())
    }

    pub(crate) fn catalog_index_region(&self) -> Option<&Region> {
        self.regions.get(CATALOG_INDEX_NAME)
    }

    pub(crate) fn index_bindings(&self, entity_name: &str) -> Option<&BTreeMap<String, IndexBinding>> {
        self.index_map.get(entity_name)
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        info!("detaching {} regions under {}", self.regions.len(), self.data_dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatastoreError;
    use crate::testing::{person_db, person_registry, PersonIdMatcher, PersonRow, PERSON};
    use pretty_assertions::assert_eq;

    #[test]
    fn create_builds_every_region_and_binding() {
        let (dir, db) = person_db(1000, 8);
        for name in [TXN_REGION_NAME, ENTITY_MASTER_NAME, CATALOG_NAME, CATALOG_INDEX_NAME, PERSON, "PERSON_PK_IDX"] {
            assert!(db.region(name).is_ok(), "region {name} missing");
            assert!(
                dir.path().join("data").join(format!("SHM::{name}.table")).exists(),
                "file for {name} missing"
            );
        }
        let bindings = db.index_bindings(PERSON).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings["PERSON_PK"].index_name, "PERSON_PK_IDX");
        assert_eq!(bindings["PERSON_PK"].indexer_name, "PersonIdIndexer");
    }

    #[test]
    fn attach_rebuilds_the_registry_from_the_fileset() -> Result<()> {
        let (dir, db) = person_db(1000, 8);
        let data_dir = dir.path().join("data");
        let mut conn = db.connect();
        conn.execute_insert(PERSON, PersonRow::new(21, "kept").as_bytes())?;
        conn.commit()?;
        drop(conn);
        drop(db);

        let db = Database::attach(&data_dir, person_registry())?;
        assert!(db.region(PERSON).is_ok());
        assert_eq!(db.index_bindings(PERSON).unwrap().len(), 1);

        // Data and index survive the detach/attach cycle.
        let mut conn = db.connect();
        let mut cursor = conn.open_cursor(PERSON, false, Some(&PersonIdMatcher(21)), None, None)?;
        let row = PersonRow::from_bytes(&cursor.fetch()?.unwrap());
        assert_eq!(row, PersonRow::new(21, "kept"));
        conn.commit()?;
        Ok(())
    }

    #[test]
    fn attach_to_nothing_fails_cleanly() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            Database::attach(dir.path(), person_registry()),
            Err(DatastoreError::Region(crate::error::RegionError::Open { .. }))
        ));
    }

    #[test]
    fn create_requires_a_registered_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("regions.conf");
        std::fs::write(
            &config_path,
            "01=<TrMgr><MaxLine>16</MaxLine></TrMgr>\n\
             02=<EntityMaster><MaxLine>16</MaxLine></EntityMaster>\n\
             03=<Entity><EntityName>GHOST_TABLE</EntityName><MaxLine>4</MaxLine></Entity>\n",
        )
        .unwrap();
        assert!(matches!(
            Database::create(&config_path, &dir.path().join("data"), Registry::new()),
            Err(DatastoreError::Config(ConfigError::UnknownLayout(_)))
        ));
    }

    #[test]
    fn statements_against_unknown_tables_fail() -> Result<()> {
        let (_dir, db) = person_db(1000, 8);
        let mut conn = db.connect();
        assert!(matches!(
            conn.execute_insert("NOWHERE", &[0u8; 4]),
            Err(DatastoreError::Table(TableError::NotFound(_)))
        ));
        conn.rollback()?;
        Ok(())
    }
}
