//! A region is one backing file, memory-mapped read/write shared, holding a
//! fixed header followed by the entry array and the row payloads of a single
//! table. Cross-process exclusion is an advisory lock on the backing file.
//!
//! The advisory lock is reentrant within a process: the first guard takes
//! the OS lock, later guards only bump a counter. Re-entering with the same
//! mode, or taking Read while Write is held, is an increment; asking for
//! Write while only Read is held is refused, so sections that may write
//! must take Write up front. Guards release in LIFO order by drop.

use std::fs::{File, OpenOptions};
use std::mem;
use std::path::{Path, PathBuf};

use bytemuck::{AnyBitPattern, NoUninit, Pod, Zeroable};
use fs2::FileExt as _;
use log::{info, trace};
use memmap2::MmapMut;
use nix::unistd::{sysconf, SysconfVar};
use parking_lot::Mutex;
use shmdb_primitives::{FixedName, RowId, Tid};

use crate::entity::Entry;
use crate::error::{RegionError, Result};

/// Region files are named `SHM::<region>.table`.
pub const FILE_PREFIX: &str = "SHM::";
pub const FILE_EXT: &str = ".table";

pub(crate) const HEADER_SIZE: usize = mem::size_of::<RegionHeader>();
pub(crate) const ENTRY_SIZE: usize = mem::size_of::<Entry>();

/// The fixed on-disk header at offset 0 of every region file.
///
/// The transaction tail (`tid_next` .. `index_root_master`) is only
/// meaningful in the transaction region `$`; it is zero-initialized
/// everywhere else.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct RegionHeader {
    pub name: FixedName,
    pub unit_size: u64,
    pub max_line: u64,
    pub memory_size: u64,
    pub timeout_ms: u64,
    pub free_begin: i64,
    pub used_end: i64,
    pub tid_next: u64,
    pub tid_collecting: u64,
    pub tcc_next: u64,
    pub index_root_master: i64,
}

/// Total region size for a table of `max_line` slots of `unit_size` bytes.
pub(crate) fn region_size(max_line: u64, unit_size: u64) -> u64 {
    HEADER_SIZE as u64 + (ENTRY_SIZE as u64 + unit_size) * max_line
}

pub(crate) fn region_file_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{FILE_PREFIX}{name}{FILE_EXT}"))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LockMode {
    Read,
    Write,
}

struct RegionInner {
    map: MmapMut,
    lock_mode: Option<LockMode>,
    lock_count: u32,
}

pub(crate) struct Region {
    name: String,
    path: PathBuf,
    file: File,
    max_line: u64,
    unit_size: u64,
    memory_size: u64,
    timeout_ms: u64,
    inner: Mutex<RegionInner>,
}

/// Region lock held by the current process. Dropping the final guard
/// releases the OS lock.
#[must_use = "the region lock is released when the guard drops"]
pub(crate) struct RegionGuard<'a> {
    region: &'a Region,
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.release();
    }
}

impl Region {
    /// Creates (or re-initializes) the region file for `name` and maps it.
    ///
    /// The file is grown to the page-rounded region size; the header is
    /// written and every entry is marked free.
    pub fn create(data_dir: &Path, name: &str, max_line: u64, unit_size: u64, timeout_ms: u64) -> Result<Region> {
        let memory_size = region_size(max_line, unit_size);
        let region = Self::map_file(data_dir, name, memory_size, timeout_ms, max_line, unit_size, true)?;

        let header = RegionHeader {
            name: FixedName::new(name).unwrap_or(FixedName::EMPTY),
            unit_size,
            max_line,
            memory_size,
            timeout_ms,
            free_begin: 0,
            used_end: 0,
            tid_next: Tid::MIN.0,
            tid_collecting: Tid::MIN.0,
            tcc_next: 0,
            index_root_master: RowId::INVALID.0,
        };
        region.write_pod(0, &header);
        for line in 0..max_line {
            region.write_pod(HEADER_SIZE + line as usize * ENTRY_SIZE, &Entry::FREE);
        }
        Ok(region)
    }

    /// Maps an existing region file, taking its geometry from the header.
    pub fn open(data_dir: &Path, name: &str) -> Result<Region> {
        let mut region = Self::map_file(data_dir, name, 0, 0, 0, 0, false)?;
        let header: RegionHeader = region.read_pod(0);
        if header.name.as_str() != name {
            return Err(RegionError::HeaderMismatch {
                path: region.path,
                name: name.into(),
            }
            .into());
        }
        let mapped = region.inner.lock().map.len() as u64;
        if mapped < header.memory_size {
            return Err(RegionError::Truncated { path: region.path }.into());
        }
        region.max_line = header.max_line;
        region.unit_size = header.unit_size;
        region.memory_size = header.memory_size;
        region.timeout_ms = header.timeout_ms;
        Ok(region)
    }

    fn map_file(
        data_dir: &Path,
        name: &str,
        memory_size: u64,
        timeout_ms: u64,
        max_line: u64,
        unit_size: u64,
        create: bool,
    ) -> Result<Region> {
        let path = region_file_path(data_dir, name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .map_err(|source| RegionError::Open {
                path: path.clone(),
                source,
            })?;

        let file_len = file
            .metadata()
            .map_err(|source| RegionError::Open {
                path: path.clone(),
                source,
            })?
            .len();
        if memory_size > 0 {
            let page = page_size()?;
            let target = memory_size.next_multiple_of(page);
            if file_len < target {
                file.set_len(target).map_err(|source| RegionError::Grow {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| RegionError::Map {
            path: path.clone(),
            source,
        })?;

        Ok(Region {
            name: name.into(),
            path,
            file,
            max_line,
            unit_size,
            memory_size,
            timeout_ms,
            inner: Mutex::new(RegionInner {
                map,
                lock_mode: None,
                lock_count: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_line(&self) -> u64 {
        self.max_line
    }

    pub fn unit_size(&self) -> u64 {
        self.unit_size
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn attach_log(&self) {
        info!(
            "attached region {} (max_line {}, unit_size {}, memory_size {}, timeout {} ms)",
            self.name, self.max_line, self.unit_size, self.memory_size, self.timeout_ms
        );
    }

    /// Takes the region lock in `mode`, blocking until the OS grants it.
    pub fn lock(&self, mode: LockMode) -> Result<RegionGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.lock_count > 0 {
            if inner.lock_mode == Some(LockMode::Read) && mode == LockMode::Write {
                return Err(RegionError::Escalation {
                    region: self.name.clone(),
                }
                .into());
            }
            inner.lock_count += 1;
        } else {
            match mode {
                LockMode::Read => self.file.lock_shared(),
                LockMode::Write => self.file.lock_exclusive(),
            }
            .map_err(|source| RegionError::Lock {
                region: self.name.clone(),
                source,
            })?;
            inner.lock_mode = Some(mode);
            inner.lock_count = 1;
        }
        trace!("lock {} {:?} count {}", self.name, inner.lock_mode, inner.lock_count);
        Ok(RegionGuard { region: self })
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.lock_count > 0, "unbalanced region lock release");
        inner.lock_count = inner.lock_count.saturating_sub(1);
        if inner.lock_count == 0 {
            inner.lock_mode = None;
            if let Err(e) = self.file.unlock() {
                // Nothing sensible to do mid-drop; the lock dies with the fd.
                log::error!("failed to unlock region {}: {e}", self.name);
            }
        }
        trace!("unlock {} count {}", self.name, inner.lock_count);
    }

    pub(crate) fn read_pod<T: AnyBitPattern>(&self, offset: usize) -> T {
        let inner = self.inner.lock();
        bytemuck::pod_read_unaligned(&inner.map[offset..offset + mem::size_of::<T>()])
    }

    pub(crate) fn write_pod<T: NoUninit>(&self, offset: usize, value: &T) {
        let mut inner = self.inner.lock();
        inner.map[offset..offset + mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(value));
    }

    pub(crate) fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        inner.map[offset..offset + len].to_vec()
    }

    pub(crate) fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        inner.map[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn header(&self) -> RegionHeader {
        self.read_pod(0)
    }

    /// Read-modify-writes the header under the in-process mutex.
    pub(crate) fn update_header(&self, f: impl FnOnce(&mut RegionHeader)) {
        let mut inner = self.inner.lock();
        let mut header: RegionHeader = bytemuck::pod_read_unaligned(&inner.map[..HEADER_SIZE]);
        f(&mut header);
        inner.map[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    }

    pub(crate) fn entry_offset(&self, line: usize) -> usize {
        HEADER_SIZE + line * ENTRY_SIZE
    }

    pub(crate) fn payload_offset(&self, line: usize) -> usize {
        HEADER_SIZE + self.max_line as usize * ENTRY_SIZE + line * self.unit_size as usize
    }
}

fn page_size() -> Result<u64> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => Ok(sz as u64),
        Ok(_) => Ok(4096),
        Err(errno) => Err(RegionError::PageSize(errno).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatastoreError;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn create_writes_header_and_rounds_to_page() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let region = Region::create(dir.path(), "HEADER_TEST", 8, 16, 250)?;
        let header = region.header();
        assert_eq!(header.name.as_str(), "HEADER_TEST");
        assert_eq!(header.max_line, 8);
        assert_eq!(header.unit_size, 16);
        assert_eq!(header.memory_size, region_size(8, 16));
        assert_eq!(header.index_root_master, RowId::INVALID.0);

        let meta = std::fs::metadata(region_file_path(dir.path(), "HEADER_TEST")).unwrap();
        assert_eq!(meta.len() % page_size()?, 0);
        assert!(meta.len() >= header.memory_size);
        Ok(())
    }

    #[test]
    fn open_round_trips_geometry() -> Result<()> {
        let dir = TempDir::new().unwrap();
        {
            let region = Region::create(dir.path(), "REOPEN_TEST", 4, 32, 100)?;
            region.write_pod(region.payload_offset(0), &0xdead_beef_u64);
        }
        let region = Region::open(dir.path(), "REOPEN_TEST")?;
        assert_eq!(region.max_line(), 4);
        assert_eq!(region.unit_size(), 32);
        assert_eq!(region.timeout_ms(), 100);
        assert_eq!(region.read_pod::<u64>(region.payload_offset(0)), 0xdead_beef_u64);
        Ok(())
    }

    #[test]
    fn open_rejects_missing_or_foreign_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Region::open(dir.path(), "NOT_THERE"),
            Err(DatastoreError::Region(RegionError::Open { .. }))
        ));

        Region::create(dir.path(), "FIRST_NAME", 2, 8, 0).unwrap();
        std::fs::rename(
            region_file_path(dir.path(), "FIRST_NAME"),
            region_file_path(dir.path(), "OTHER_NAME"),
        )
        .unwrap();
        assert!(matches!(
            Region::open(dir.path(), "OTHER_NAME"),
            Err(DatastoreError::Region(RegionError::HeaderMismatch { .. }))
        ));
    }

    #[test]
    fn lock_is_reentrant_and_refuses_escalation() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let region = Region::create(dir.path(), "LOCK_TEST", 2, 8, 0)?;

        let w1 = region.lock(LockMode::Write)?;
        let r_nested = region.lock(LockMode::Read)?; // de-escalation is an increment
        drop(r_nested);
        drop(w1);

        let r1 = region.lock(LockMode::Read)?;
        let r2 = region.lock(LockMode::Read)?;
        assert!(matches!(
            region.lock(LockMode::Write),
            Err(DatastoreError::Region(RegionError::Escalation { .. }))
        ));
        drop(r2);
        drop(r1);

        // Fully released; Write is available again.
        let w2 = region.lock(LockMode::Write)?;
        drop(w2);
        Ok(())
    }
}
