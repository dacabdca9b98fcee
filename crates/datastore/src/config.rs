//! The region configuration file: line-based `key=value` records whose
//! values are XML-like tag sets describing one region (or one index
//! binding) each.
//!
//! Format rules, kept bug-for-bug compatible with the fileset this store
//! shares its on-disk format with:
//! - a line whose `#` appears before its `=` is a comment and is skipped;
//! - a line with `=` starts a new record keyed by the text left of `=`;
//! - a line without `=` continues the current record's value (leading
//!   control characters and spaces stripped);
//! - records are processed in ascending key order, so keys double as the
//!   build order of the fileset (`01=`, `02=`, ...).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;
use strum::Display;

use crate::error::{ConfigError, Result};

/// Default per-statement timeout when a config never sets `TimeOut`.
pub(crate) const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const NAME_MIN: usize = 5;
const NAME_MAX: usize = 63;

/// The recognized parent tags, in the order they are probed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub(crate) enum ParentTag {
    TrMgr,
    EntityMaster,
    IndexMgr,
    IndexMgrIndex,
    Index,
    Entity,
    IndexEntry,
}

const PARENT_TAGS: [ParentTag; 7] = [
    ParentTag::TrMgr,
    ParentTag::EntityMaster,
    ParentTag::IndexMgr,
    ParentTag::IndexMgrIndex,
    ParentTag::Index,
    ParentTag::Entity,
    ParentTag::IndexEntry,
];

/// One parsed record, in build order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConfigRecord {
    TrMgr {
        max_line: u64,
        timeout_ms: u64,
    },
    EntityMaster {
        max_line: u64,
        timeout_ms: u64,
    },
    IndexMgr {
        max_line: u64,
        timeout_ms: u64,
    },
    IndexMgrIndex {
        max_line: u64,
        timeout_ms: u64,
    },
    Index {
        index_name: String,
        max_line: u64,
        timeout_ms: u64,
    },
    Entity {
        entity_name: String,
        max_line: u64,
        timeout_ms: u64,
    },
    IndexEntry {
        entity_name: String,
        index_name: String,
        index_id: String,
        indexer_name: String,
    },
}

/// Reads and parses a config file into its records, in key order.
pub(crate) fn read_config(path: &Path) -> Result<Vec<ConfigRecord>> {
    let raw = read_records(path)?;
    let mut timeout_ms = DEFAULT_TIMEOUT_MS;
    let mut records = Vec::with_capacity(raw.len());
    for (key, value) in &raw {
        debug!("config record {key}: {value}");
        records.push(parse_record(key, value, &mut timeout_ms)?);
    }
    Ok(records)
}

/// Reads the `key=value` layer: a map from record key to the concatenated
/// record text. `BTreeMap` gives the mandated key-order iteration.
fn read_records(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.into(),
        source,
    })?;

    let mut records = BTreeMap::new();
    let mut key = String::new();
    let mut value = String::new();
    for line in text.lines() {
        let comment_at = line.find('#').unwrap_or(line.len());
        let equals_at = line.find('=').unwrap_or(line.len());
        if equals_at > comment_at {
            continue;
        }
        let rest = if equals_at < line.len() {
            if !key.is_empty() {
                records.insert(std::mem::take(&mut key), std::mem::take(&mut value));
            }
            value.clear();
            key = line[..equals_at].to_string();
            &line[equals_at + 1..]
        } else {
            line
        };
        let rest = rest.trim_start_matches(|c: char| c <= ' ');
        value.push_str(rest);
    }
    if !key.is_empty() {
        records.insert(key, value);
    }

    if records.is_empty() {
        return Err(ConfigError::Empty(path.into()).into());
    }
    Ok(records)
}

fn parse_record(key: &str, record: &str, default_timeout: &mut u64) -> Result<ConfigRecord> {
    let mut found = None;
    for &tag in &PARENT_TAGS {
        if let Some(body) = tag_value(record, &tag.to_string())? {
            if !body.is_empty() {
                found = Some((tag, body));
                break;
            }
        }
    }
    let (tag, body) = found.ok_or(ConfigError::MissingParentTag { key: key.into() })?;

    let record = match tag {
        ParentTag::TrMgr => ConfigRecord::TrMgr {
            max_line: decimal(body, "MaxLine")?,
            timeout_ms: timeout(body, default_timeout)?,
        },
        ParentTag::EntityMaster => ConfigRecord::EntityMaster {
            max_line: decimal(body, "MaxLine")?,
            timeout_ms: timeout(body, default_timeout)?,
        },
        ParentTag::IndexMgr => ConfigRecord::IndexMgr {
            max_line: decimal(body, "MaxLine")?,
            timeout_ms: timeout(body, default_timeout)?,
        },
        ParentTag::IndexMgrIndex => ConfigRecord::IndexMgrIndex {
            max_line: decimal(body, "MaxLine")?,
            timeout_ms: timeout(body, default_timeout)?,
        },
        ParentTag::Index => ConfigRecord::Index {
            index_name: table_name(body, "IndexName")?,
            max_line: decimal(body, "MaxLine")?,
            timeout_ms: timeout(body, default_timeout)?,
        },
        ParentTag::Entity => ConfigRecord::Entity {
            entity_name: table_name(body, "EntityName")?,
            max_line: decimal(body, "MaxLine")?,
            timeout_ms: timeout(body, default_timeout)?,
        },
        ParentTag::IndexEntry => ConfigRecord::IndexEntry {
            entity_name: table_name(body, "EntityName")?,
            index_name: table_name(body, "IndexName")?,
            index_id: table_name(body, "IndexID")?,
            indexer_name: table_name(body, "Indexer")?,
        },
    };
    Ok(record)
}

/// Extracts the text between `<tag>` and `</tag>`. `None` when the start
/// tag is absent; an error when the end tag is.
fn tag_value<'a>(record: &'a str, tag: &str) -> Result<Option<&'a str>> {
    let start_tag = format!("<{tag}>");
    let end_tag = format!("</{tag}>");
    let Some(start) = record.find(&start_tag) else {
        return Ok(None);
    };
    let body_at = start + start_tag.len();
    let Some(end) = record[body_at..].find(&end_tag) else {
        return Err(ConfigError::UnterminatedTag {
            tag: tag.into(),
            record: record.into(),
        }
        .into());
    };
    Ok(Some(&record[body_at..body_at + end]))
}

/// A `<tag>` holding a decimal of at least 1.
fn decimal(record: &str, tag: &str) -> Result<u64> {
    let value = tag_value(record, tag)?.unwrap_or("");
    match value.trim().parse::<u64>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ConfigError::BadNumber {
            tag: tag.into(),
            value: value.into(),
        }
        .into()),
    }
}

/// A `<tag>` holding an entity/index/indexer name of 5..=63 characters.
fn table_name(record: &str, tag: &str) -> Result<String> {
    let value = tag_value(record, tag)?.unwrap_or("").trim();
    if value.len() < NAME_MIN || value.len() > NAME_MAX {
        return Err(ConfigError::NameLength {
            tag: tag.into(),
            value: value.into(),
        }
        .into());
    }
    Ok(value.to_string())
}

/// The optional `<TimeOut>` in milliseconds. Zero means wait forever. The
/// last value seen becomes the default for records that omit the tag.
fn timeout(record: &str, default: &mut u64) -> Result<u64> {
    match tag_value(record, "TimeOut")? {
        Some(value) if !value.is_empty() => {
            let parsed = value.trim().parse::<u64>().map_err(|_| ConfigError::BadNumber {
                tag: "TimeOut".into(),
                value: value.into(),
            })?;
            *default = parsed;
            Ok(parsed)
        }
        _ => Ok(*default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatastoreError;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn parse(text: &str) -> Result<Vec<ConfigRecord>> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        read_config(file.path())
    }

    #[test]
    fn parses_a_full_fileset_in_key_order() -> Result<()> {
        let records = parse(
            "# region layout\n\
             02=<EntityMaster><MaxLine>32</MaxLine></EntityMaster>\n\
             01=<TrMgr><MaxLine>64</MaxLine><TimeOut>1000</TimeOut></TrMgr>\n\
             03=<Entity><EntityName>PERSON</EntityName>\n\
             <MaxLine>8</MaxLine></Entity>\n",
        )?;
        assert_eq!(
            records,
            vec![
                ConfigRecord::TrMgr {
                    max_line: 64,
                    timeout_ms: 1000
                },
                ConfigRecord::EntityMaster {
                    max_line: 32,
                    timeout_ms: 10_000
                },
                ConfigRecord::Entity {
                    entity_name: "PERSON".into(),
                    max_line: 8,
                    timeout_ms: 1000
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn timeout_default_carries_forward_in_key_order() -> Result<()> {
        let records = parse(
            "01=<TrMgr><MaxLine>4</MaxLine><TimeOut>250</TimeOut></TrMgr>\n\
             02=<IndexMgr><MaxLine>4</MaxLine></IndexMgr>\n\
             03=<IndexMgrIndex><MaxLine>4</MaxLine><TimeOut>0</TimeOut></IndexMgrIndex>\n\
             04=<Index><IndexName>SOME_INDEX</IndexName><MaxLine>4</MaxLine></Index>\n",
        )?;
        let timeouts: Vec<u64> = records
            .iter()
            .map(|r| match r {
                ConfigRecord::TrMgr { timeout_ms, .. }
                | ConfigRecord::IndexMgr { timeout_ms, .. }
                | ConfigRecord::IndexMgrIndex { timeout_ms, .. }
                | ConfigRecord::Index { timeout_ms, .. } => *timeout_ms,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(timeouts, vec![250, 250, 0, 0]);
        Ok(())
    }

    #[test]
    fn index_entry_carries_all_four_names() -> Result<()> {
        let records = parse(
            "01=<IndexEntry><EntityName>PERSON</EntityName><IndexName>PERSON_PK_IDX</IndexName>\
             <IndexID>PERSON_PK</IndexID><Indexer>PersonIdIndexer</Indexer></IndexEntry>\n",
        )?;
        assert_eq!(
            records,
            vec![ConfigRecord::IndexEntry {
                entity_name: "PERSON".into(),
                index_name: "PERSON_PK_IDX".into(),
                index_id: "PERSON_PK".into(),
                indexer_name: "PersonIdIndexer".into(),
            }]
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed_records() {
        assert!(matches!(
            parse("01=<Nothing><MaxLine>1</MaxLine></Nothing>\n"),
            Err(DatastoreError::Config(ConfigError::MissingParentTag { .. }))
        ));
        assert!(matches!(
            parse("01=<TrMgr><MaxLine>64</MaxLine>\n"),
            Err(DatastoreError::Config(ConfigError::UnterminatedTag { .. }))
        ));
        assert!(matches!(
            parse("01=<TrMgr><MaxLine>zero</MaxLine></TrMgr>\n"),
            Err(DatastoreError::Config(ConfigError::BadNumber { .. }))
        ));
        assert!(matches!(
            parse("01=<TrMgr><MaxLine>0</MaxLine></TrMgr>\n"),
            Err(DatastoreError::Config(ConfigError::BadNumber { .. }))
        ));
        assert!(matches!(
            parse("01=<Entity><EntityName>ab</EntityName><MaxLine>4</MaxLine></Entity>\n"),
            Err(DatastoreError::Config(ConfigError::NameLength { .. }))
        ));
        assert!(matches!(
            parse("# only comments\n"),
            Err(DatastoreError::Config(ConfigError::Empty(_)))
        ));
    }

    #[test]
    fn comments_and_continuations() -> Result<()> {
        let records = parse(
            "# leading comment\n\
             01=<TrMgr>\n\
             <MaxLine>16</MaxLine>\n\
             # a '=' after '#' keeps this line a comment: =\n\
             </TrMgr>\n",
        )?;
        assert_eq!(
            records,
            vec![ConfigRecord::TrMgr {
                max_line: 16,
                timeout_ms: 10_000
            }]
        );
        Ok(())
    }
}
