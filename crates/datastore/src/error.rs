use std::io;
use std::path::PathBuf;

use enum_as_inner::EnumAsInner;
use shmdb_primitives::{RowId, Tid};
use thiserror::Error;

#[derive(Error, Debug, EnumAsInner)]
pub enum DatastoreError {
    #[error("ConfigError: {0}")]
    Config(#[from] ConfigError),
    #[error("RegionError: {0}")]
    Region(#[from] RegionError),
    #[error("TxnError: {0}")]
    Txn(#[from] TxnError),
    #[error("TableError: {0}")]
    Table(#[from] TableError),
    #[error("IndexError: {0}")]
    Index(#[from] IndexError),
    #[error("CatalogError: {0}")]
    Catalog(#[from] CatalogError),
    /// A statement could not obtain a row or root lock before its deadline.
    /// No partial side effect of the statement is published.
    #[error("statement on `{0}` timed out")]
    Timeout(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("config file `{0}` contains no records")]
    Empty(PathBuf),
    #[error("record `{key}` has no recognized parent tag")]
    MissingParentTag { key: String },
    #[error("missing `</{tag}>` in record `{record}`")]
    UnterminatedTag { tag: String, record: String },
    #[error("tag `{tag}` does not hold a positive number: `{value}`")]
    BadNumber { tag: String, value: String },
    #[error("name in tag `{tag}` must be 5 to 63 characters: `{value}`")]
    NameLength { tag: String, value: String },
    #[error("no row layout registered for entity `{0}`")]
    UnknownLayout(String),
    #[error("entity `{entity}` already binds index id `{index_id}`")]
    DuplicateIndex { entity: String, index_id: String },
}

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("failed to open region file `{path}`: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to size region file `{path}`: {source}")]
    Grow { path: PathBuf, source: io::Error },
    #[error("failed to map region file `{path}`: {source}")]
    Map { path: PathBuf, source: io::Error },
    #[error("failed to query the system page size: {0}")]
    PageSize(nix::errno::Errno),
    #[error("advisory lock on region `{region}` failed: {source}")]
    Lock { region: String, source: io::Error },
    #[error("region `{region}`: cannot escalate a held Read lock to Write")]
    Escalation { region: String },
    #[error("region file `{path}` does not contain region `{name}`")]
    HeaderMismatch { path: PathBuf, name: String },
    #[error("region file `{path}` is shorter than its header claims")]
    Truncated { path: PathBuf },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TxnError {
    #[error("the transaction table is full")]
    TableFull,
    #[error("no transaction has been started")]
    NotStarted,
    #[error("a transaction is already in progress")]
    AlreadyStarted,
    #[error("transaction {tid} is outside the live window [{collecting}, {next})")]
    OutOfRange { tid: Tid, collecting: Tid, next: Tid },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    #[error("table `{0}` not found")]
    NotFound(String),
    #[error("table `{0}` is full")]
    MemoryFull(String),
    #[error("row {row} of `{table}` is outside the used range (used_end {used_end}, max_line {max_line})")]
    OutOfRange {
        table: String,
        row: RowId,
        used_end: RowId,
        max_line: u64,
    },
    #[error("payload of {got} bytes does not match unit size {expect} of `{table}`")]
    SizeMismatch { table: String, got: usize, expect: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error("duplicate key in index `{0}`")]
    DuplicateKey(String),
    #[error("node {row} of index `{index}` is not readable by transaction {tid}")]
    NodeUnreadable { index: String, row: RowId, tid: Tid },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog holds {matches} rows for `{entity}`/`{index_id}`, expected exactly one")]
    Corrupt {
        entity: String,
        index_id: String,
        matches: usize,
    },
    #[error("no index id `{index_id}` is bound to entity `{entity}`")]
    UnknownIndex { entity: String, index_id: String },
    #[error("no indexer registered under `{0}`")]
    UnknownIndexer(String),
}

pub type Result<T> = core::result::Result<T, DatastoreError>;

/// The numeric result codes of the statement API surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExecuteCode {
    One = 1,
    Ok = 0,
    Err = -1,
    DuplicateKey = -2,
    MemoryFull = -3,
    NullFetch = -4,
    Timeout = -5,
}

impl DatastoreError {
    /// Collapses an error to its statement-surface code.
    pub fn execute_code(&self) -> ExecuteCode {
        match self {
            DatastoreError::Index(IndexError::DuplicateKey(_)) => ExecuteCode::DuplicateKey,
            DatastoreError::Table(TableError::MemoryFull(_)) => ExecuteCode::MemoryFull,
            DatastoreError::Txn(TxnError::TableFull) => ExecuteCode::MemoryFull,
            DatastoreError::Timeout(_) => ExecuteCode::Timeout,
            _ => ExecuteCode::Err,
        }
    }
}
