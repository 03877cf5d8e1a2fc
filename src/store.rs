// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! On-disk index files and the keyed file registry.
//!
//! One file per (julian day, source node). Layout, all regions in 512-byte
//! blocks:
//!
//! ```text
//! | control (1) | index region (512) | check region (512) | data region ... |
//! ```
//!
//! The index region holds per-channel linked lists of index blocks as shipped
//! by the producer: each block names a channel, points at the next block in
//! its chain (-1 while open), and maps up to 30 extents of 64 data blocks
//! with a 64-bit occupancy bitmap each. The check region has the same shape
//! and is written only by the local materializer: a bit per data block
//! actually landed. Reconciliation reports bits set in the index region but
//! clear in the check region as gaps. The check region is a completeness
//! oracle, never primary data.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::block::{RepairRequest, PAYLOAD_LEN};
use crate::error::{ReplicationError, Result};
use crate::metrics;

/// Data blocks covered by one extent; also the allocation stride visible in
/// mid-record block-number jumps.
pub const EXTENT_BLOCKS: usize = 64;
/// Extents mapped by one index block.
pub const EXTENTS_PER_INDEX: usize = 30;
/// Index (and check) region size in blocks.
pub const MAX_INDEX_BLOCKS: u32 = 512;

const BLOCK: u64 = PAYLOAD_LEN as u64;
const INDEX_REGION_OFF: u64 = BLOCK;
const CHECK_REGION_OFF: u64 = INDEX_REGION_OFF + BLOCK * MAX_INDEX_BLOCKS as u64;
const DATA_REGION_OFF: u64 = CHECK_REGION_OFF + BLOCK * MAX_INDEX_BLOCKS as u64;

const CONTROL_MAGIC: u32 = 0x5749_4458; // "WIDX"

/// Julian day number of "now" (days since the epoch, offset to the
/// astronomical day count used in file keys).
pub fn today_julian() -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (secs / 86_400) as i32 + 2_440_588
}

/// Whether a block day is inside the retention window around `today`.
/// One day of forward slack covers producers already on the next UTC day.
pub fn in_retention(julian_day: i32, today: i32, retention_days: i32) -> bool {
    julian_day > today - retention_days && julian_day <= today + 1
}

/// File identity: one file per day per source node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub julian_day: i32,
    pub node: [u8; 4],
}

impl FileKey {
    pub fn file_name(&self) -> String {
        format!("{}_{}.idx", self.julian_day, self.node_lossy())
    }

    pub fn node_lossy(&self) -> String {
        String::from_utf8_lossy(&self.node).trim_end().to_string()
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.julian_day, self.node_lossy())
    }
}

/// One extent mapping: 64 data blocks starting at `start_block`. An extent
/// with an empty bitmap carries no information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start_block: i32,
    pub bitmap: u64,
}

impl Extent {
    pub const EMPTY: Extent = Extent {
        start_block: 0,
        bitmap: 0,
    };

    pub fn in_use(&self) -> bool {
        self.bitmap != 0
    }
}

/// Decoded 512-byte index (or check) block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlockRecord {
    pub channel: [u8; 12],
    /// Pointer to the next index block of this channel's chain; negative
    /// while this block is the open tail.
    pub next_index: i32,
    pub extents: [Extent; EXTENTS_PER_INDEX],
}

impl IndexBlockRecord {
    pub fn new(channel: [u8; 12]) -> IndexBlockRecord {
        IndexBlockRecord {
            channel,
            next_index: -1,
            extents: [Extent::EMPTY; EXTENTS_PER_INDEX],
        }
    }

    pub fn is_open(&self) -> bool {
        self.next_index < 0
    }

    /// Slot of the highest extent in use, if any.
    pub fn last_used_extent(&self) -> Option<usize> {
        self.extents.iter().rposition(Extent::in_use)
    }

    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut raw = [0u8; PAYLOAD_LEN];
        let mut buf = &mut raw[..];
        buf.put_slice(&self.channel);
        buf.put_i32(self.next_index);
        for ext in &self.extents {
            buf.put_i32(ext.start_block);
            buf.put_u64(ext.bitmap);
        }
        raw
    }

    /// `None` for an all-zero (never written) slot.
    pub fn decode(raw: &[u8; PAYLOAD_LEN]) -> Option<IndexBlockRecord> {
        if raw.iter().all(|b| *b == 0) {
            return None;
        }
        let mut buf = &raw[..];
        let mut channel = [0u8; 12];
        buf.copy_to_slice(&mut channel);
        let next_index = buf.get_i32();
        let mut extents = [Extent::EMPTY; EXTENTS_PER_INDEX];
        for ext in extents.iter_mut() {
            ext.start_block = buf.get_i32();
            ext.bitmap = buf.get_u64();
        }
        Some(IndexBlockRecord {
            channel,
            next_index,
            extents,
        })
    }
}

/// A missing contiguous block range, derived and transient: issued as a
/// repair request and discarded once the blocks land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRecord {
    pub node: [u8; 4],
    pub julian_day: i32,
    pub start_block: i32,
    pub end_block: i32,
    pub index_pointer: i32,
    pub extent_index: i32,
}

impl GapRecord {
    pub fn to_repair_request(&self) -> RepairRequest {
        RepairRequest {
            julian_day: self.julian_day,
            node: self.node,
            start_block: self.start_block,
            end_block: self.end_block,
            index_pointer: self.index_pointer,
            extent_index: self.extent_index,
        }
    }
}

/// Outcome of a data-region write, for remark accounting. The write always
/// proceeds: last writer wins, conflicts are counted, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Fresh,
    Identical,
    Conflict,
}

/// Result of comparing one index-region block against its check block.
#[derive(Debug, Clone)]
pub struct BlockScan {
    /// Fully matching: channel agrees and every intended bit is present.
    pub satisfied: bool,
    pub gaps: Vec<GapRecord>,
}

struct ControlBlock {
    julian_day: i32,
    node: [u8; 4],
    allocated_index_blocks: u32,
}

impl ControlBlock {
    fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut raw = [0u8; PAYLOAD_LEN];
        let mut buf = &mut raw[..];
        buf.put_u32(CONTROL_MAGIC);
        buf.put_i32(self.julian_day);
        buf.put_slice(&self.node);
        buf.put_u32(self.allocated_index_blocks);
        raw
    }

    fn decode(raw: &[u8; PAYLOAD_LEN], file: &str) -> Result<ControlBlock> {
        let mut buf = &raw[..];
        if buf.get_u32() != CONTROL_MAGIC {
            return Err(ReplicationError::corruption(file, "control block magic mismatch"));
        }
        let julian_day = buf.get_i32();
        let mut node = [0u8; 4];
        buf.copy_to_slice(&mut node);
        let allocated_index_blocks = buf.get_u32();
        if allocated_index_blocks > MAX_INDEX_BLOCKS {
            return Err(ReplicationError::corruption(
                file,
                format!("allocated index blocks {allocated_index_blocks} above region size"),
            ));
        }
        Ok(ControlBlock {
            julian_day,
            node,
            allocated_index_blocks,
        })
    }
}

/// One open index file. Exactly one instance per key exists at a time; the
/// registry resolves create races so both parties share this handle.
pub struct IndexFile {
    key: FileKey,
    path: PathBuf,
    file: Mutex<File>,
    /// Millis since the handle opened; drives staleness closing.
    opened: Instant,
    last_used_ms: AtomicU64,
    read_only: bool,
}

impl IndexFile {
    /// Open or create the file for `key` under `dir`. Returns the handle and
    /// whether the file was newly created (and therefore needs a bootstrap).
    pub fn open_or_create(dir: &Path, key: FileKey) -> Result<(IndexFile, bool)> {
        let path = dir.join(key.file_name());
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| ReplicationError::io("index file open", e))?;
        if existed {
            let mut raw = [0u8; PAYLOAD_LEN];
            read_exact_at(&mut file, 0, &mut raw)?;
            let control = ControlBlock::decode(&raw, &key.to_string())?;
            if control.julian_day != key.julian_day || control.node != key.node {
                return Err(ReplicationError::corruption(
                    key.to_string(),
                    "control block names a different day or node",
                ));
            }
        } else {
            let control = ControlBlock {
                julian_day: key.julian_day,
                node: key.node,
                allocated_index_blocks: 0,
            };
            write_all_at(&mut file, 0, &control.encode())?;
            file.set_len(DATA_REGION_OFF)
                .map_err(|e| ReplicationError::io("index file preallocate", e))?;
            info!(file = %key, "created index file");
        }
        Ok((
            IndexFile {
                key,
                path,
                file: Mutex::new(file),
                opened: Instant::now(),
                last_used_ms: AtomicU64::new(0),
                read_only: false,
            },
            !existed,
        ))
    }

    /// Read-only handle for serving repair requests on a file the registry
    /// has not opened. `None` when the file does not exist.
    pub fn open_read_only(dir: &Path, key: FileKey) -> Result<Option<IndexFile>> {
        let path = dir.join(key.file_name());
        let mut file = match OpenOptions::new().read(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReplicationError::io("index file open", e)),
        };
        let mut raw = [0u8; PAYLOAD_LEN];
        read_exact_at(&mut file, 0, &mut raw)?;
        ControlBlock::decode(&raw, &key.to_string())?;
        Ok(Some(IndexFile {
            key,
            path,
            file: Mutex::new(file),
            opened: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            read_only: true,
        }))
    }

    pub fn key(&self) -> FileKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn touch(&self) {
        self.last_used_ms
            .store(self.opened.elapsed().as_millis() as u64, Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_used_ms.load(Ordering::Acquire);
        self.opened
            .elapsed()
            .saturating_sub(Duration::from_millis(last))
    }

    fn guard_writable(&self) -> Result<()> {
        if self.read_only {
            Err(ReplicationError::store(
                self.key.to_string(),
                "write through a read-only handle",
            ))
        } else {
            Ok(())
        }
    }

    /// Current allocated index-block count, re-read from disk so the
    /// reconciler sees blocks allocated since its last pass.
    pub fn allocated_index_blocks(&self) -> Result<u32> {
        let mut raw = [0u8; PAYLOAD_LEN];
        self.read_at(0, &mut raw)?;
        Ok(ControlBlock::decode(&raw, &self.key.to_string())?.allocated_index_blocks)
    }

    /// Land an index block shipped by the producer at its pointer.
    pub fn write_index_block(&self, pointer: u32, record: &IndexBlockRecord) -> Result<()> {
        self.guard_writable()?;
        self.check_pointer(pointer)?;
        self.write_at(INDEX_REGION_OFF + BLOCK * u64::from(pointer), &record.encode())?;
        // grow the allocated count so reconciliation picks the block up
        let mut raw = [0u8; PAYLOAD_LEN];
        self.read_at(0, &mut raw)?;
        let mut control = ControlBlock::decode(&raw, &self.key.to_string())?;
        if pointer + 1 > control.allocated_index_blocks {
            control.allocated_index_blocks = pointer + 1;
            self.write_at(0, &control.encode())?;
        }
        self.touch();
        Ok(())
    }

    pub fn read_index_block(&self, pointer: u32) -> Result<Option<IndexBlockRecord>> {
        self.check_pointer(pointer)?;
        let mut raw = [0u8; PAYLOAD_LEN];
        self.read_at(INDEX_REGION_OFF + BLOCK * u64::from(pointer), &mut raw)?;
        Ok(IndexBlockRecord::decode(&raw))
    }

    pub fn read_check_block(&self, pointer: u32) -> Result<Option<IndexBlockRecord>> {
        self.check_pointer(pointer)?;
        let mut raw = [0u8; PAYLOAD_LEN];
        self.read_at(CHECK_REGION_OFF + BLOCK * u64::from(pointer), &mut raw)?;
        Ok(IndexBlockRecord::decode(&raw))
    }

    /// Write one data block. Conflicting content is overwritten (last writer
    /// wins) and reported as [`WriteOutcome::Conflict`] for remark counting.
    pub fn write_data_block(
        &self,
        block_number: u32,
        payload: &[u8; PAYLOAD_LEN],
    ) -> Result<WriteOutcome> {
        self.guard_writable()?;
        let off = DATA_REGION_OFF + BLOCK * u64::from(block_number);
        let mut existing = [0u8; PAYLOAD_LEN];
        let had_content = self.read_at_or_zero(off, &mut existing)?;
        let outcome = if !had_content || existing.iter().all(|b| *b == 0) {
            WriteOutcome::Fresh
        } else if existing == *payload {
            WriteOutcome::Identical
        } else {
            WriteOutcome::Conflict
        };
        if outcome != WriteOutcome::Identical {
            self.write_at(off, payload)?;
        }
        self.touch();
        Ok(outcome)
    }

    pub fn read_data_block(&self, block_number: u32) -> Result<Option<[u8; PAYLOAD_LEN]>> {
        let off = DATA_REGION_OFF + BLOCK * u64::from(block_number);
        let mut raw = [0u8; PAYLOAD_LEN];
        if self.read_at_or_zero(off, &mut raw)? {
            Ok(Some(raw))
        } else {
            Ok(None)
        }
    }

    /// Record in the check region that `block_number` of `channel` landed,
    /// under the extent the producer addressed.
    pub fn mark_check(
        &self,
        pointer: u32,
        extent_index: u32,
        block_number: u32,
        channel: &[u8; 12],
    ) -> Result<()> {
        self.guard_writable()?;
        self.check_pointer(pointer)?;
        if extent_index as usize >= EXTENTS_PER_INDEX {
            return Err(ReplicationError::store(
                self.key.to_string(),
                format!("extent {extent_index} out of range"),
            ));
        }
        let off = CHECK_REGION_OFF + BLOCK * u64::from(pointer);
        let mut raw = [0u8; PAYLOAD_LEN];
        self.read_at(off, &mut raw)?;
        let mut record =
            IndexBlockRecord::decode(&raw).unwrap_or_else(|| IndexBlockRecord::new(*channel));
        record.channel = *channel;
        let extent_start = block_number - block_number % EXTENT_BLOCKS as u32;
        let ext = &mut record.extents[extent_index as usize];
        if ext.in_use() && ext.start_block != extent_start as i32 {
            warn!(
                file = %self.key, pointer, extent_index,
                old_start = ext.start_block, new_start = extent_start,
                "check extent re-anchored to a different start"
            );
            ext.bitmap = 0;
        }
        ext.start_block = extent_start as i32;
        ext.bitmap |= 1u64 << (block_number - extent_start);
        self.write_at(off, &record.encode())?;
        self.touch();
        Ok(())
    }

    /// Compare index block `pointer` against its check block. The open
    /// chain tail's last extent churns while a channel is being written, so
    /// it is only compared when `include_last_extent` is set.
    pub fn scan_block(&self, pointer: u32, include_last_extent: bool) -> Result<BlockScan> {
        let intended = match self.read_index_block(pointer)? {
            Some(record) => record,
            None => {
                return Ok(BlockScan {
                    satisfied: true,
                    gaps: Vec::new(),
                })
            }
        };
        let actual = self.read_check_block(pointer)?;
        let channel_matches = actual
            .as_ref()
            .map(|a| a.channel == intended.channel)
            .unwrap_or(false);

        let skip_extent = if intended.is_open() && !include_last_extent {
            intended.last_used_extent()
        } else {
            None
        };

        let mut gaps = Vec::new();
        for (slot, want) in intended.extents.iter().enumerate() {
            if !want.in_use() || skip_extent == Some(slot) {
                continue;
            }
            let have = if channel_matches {
                // a check extent anchored elsewhere proves nothing
                actual
                    .as_ref()
                    .map(|a| a.extents[slot])
                    .filter(|e| e.in_use() && e.start_block == want.start_block)
                    .map(|e| e.bitmap)
                    .unwrap_or(0)
            } else {
                0
            };
            let missing = want.bitmap & !have;
            self.coalesce_missing(missing, want.start_block, pointer, slot, &mut gaps);
        }
        let complete = gaps.is_empty() && skip_extent.is_none();
        Ok(BlockScan {
            satisfied: complete && channel_matches,
            gaps,
        })
    }

    fn coalesce_missing(
        &self,
        missing: u64,
        extent_start: i32,
        pointer: u32,
        slot: usize,
        out: &mut Vec<GapRecord>,
    ) {
        let mut bit = 0u32;
        while bit < EXTENT_BLOCKS as u32 {
            if missing & (1u64 << bit) == 0 {
                bit += 1;
                continue;
            }
            let run_start = bit;
            while bit < EXTENT_BLOCKS as u32 && missing & (1u64 << bit) != 0 {
                bit += 1;
            }
            out.push(GapRecord {
                node: self.key.node,
                julian_day: self.key.julian_day,
                start_block: extent_start + run_start as i32,
                end_block: extent_start + bit as i32 - 1,
                index_pointer: pointer as i32,
                extent_index: slot as i32,
            });
        }
    }

    /// Two open chain tails for one channel mean a lost "index full"
    /// transition; the index must be rebuilt from upstream.
    pub fn find_duplicate_open_channel(&self) -> Result<Option<[u8; 12]>> {
        let allocated = self.allocated_index_blocks()?;
        let mut open: Vec<[u8; 12]> = Vec::new();
        for pointer in 0..allocated {
            if let Some(record) = self.read_index_block(pointer)? {
                if record.is_open() {
                    if open.contains(&record.channel) {
                        return Ok(Some(record.channel));
                    }
                    open.push(record.channel);
                }
            }
        }
        Ok(None)
    }

    /// Drop the index region ahead of re-applying a full upstream index.
    /// Data and check regions survive: landed blocks stay landed.
    pub fn reset_index_region(&self) -> Result<()> {
        self.guard_writable()?;
        let zero = [0u8; PAYLOAD_LEN];
        let allocated = self.allocated_index_blocks()?;
        for pointer in 0..allocated {
            self.write_at(INDEX_REGION_OFF + BLOCK * u64::from(pointer), &zero)?;
        }
        let control = ControlBlock {
            julian_day: self.key.julian_day,
            node: self.key.node,
            allocated_index_blocks: 0,
        };
        self.write_at(0, &control.encode())?;
        debug!(file = %self.key, "index region reset for re-bootstrap");
        Ok(())
    }

    fn check_pointer(&self, pointer: u32) -> Result<()> {
        if pointer >= MAX_INDEX_BLOCKS {
            return Err(ReplicationError::store(
                self.key.to_string(),
                format!("index pointer {pointer} out of range"),
            ));
        }
        Ok(())
    }

    // The primitives below run on the caller's runtime thread. The critical
    // section is one seek plus one 512-byte transfer on a local file; keep
    // it that way, anything longer belongs on spawn_blocking.
    fn read_at(&self, off: u64, buf: &mut [u8; PAYLOAD_LEN]) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        read_exact_at(&mut file, off, buf)
    }

    /// Like `read_at` but short/absent regions read as zeros; returns whether
    /// any real bytes were present.
    fn read_at_or_zero(&self, off: u64, buf: &mut [u8; PAYLOAD_LEN]) -> Result<bool> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let len = file
            .metadata()
            .map_err(|e| ReplicationError::io("index file stat", e))?
            .len();
        if off + BLOCK > len {
            buf.fill(0);
            return Ok(false);
        }
        read_exact_at(&mut file, off, buf)?;
        Ok(true)
    }

    fn write_at(&self, off: u64, buf: &[u8; PAYLOAD_LEN]) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        write_all_at(&mut file, off, buf)
    }
}

fn read_exact_at(file: &mut File, off: u64, buf: &mut [u8; PAYLOAD_LEN]) -> Result<()> {
    file.seek(SeekFrom::Start(off))
        .map_err(|e| ReplicationError::io("index file seek", e))?;
    file.read_exact(buf)
        .map_err(|e| ReplicationError::io("index file read", e))
}

fn write_all_at(file: &mut File, off: u64, buf: &[u8; PAYLOAD_LEN]) -> Result<()> {
    file.seek(SeekFrom::Start(off))
        .map_err(|e| ReplicationError::io("index file seek", e))?;
    file.write_all(buf)
        .map_err(|e| ReplicationError::io("index file write", e))
}

/// Registry of open index files, one writer handle per key. A create race
/// resolves inside the map entry: the loser finds the winner's handle.
pub struct FileStore {
    data_dir: PathBuf,
    files: DashMap<FileKey, std::sync::Arc<IndexFile>>,
}

impl FileStore {
    pub fn new(data_dir: PathBuf) -> Result<FileStore> {
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| ReplicationError::io("data dir create", e))?;
        Ok(FileStore {
            data_dir,
            files: DashMap::new(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Resolve (or create) the writer handle for `key`. `created` is true
    /// when the file is brand new and must be bootstrapped before live
    /// application.
    pub fn resolve(&self, key: FileKey) -> Result<(std::sync::Arc<IndexFile>, bool)> {
        let resolved = match self.files.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false, false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (file, created) = IndexFile::open_or_create(&self.data_dir, key)?;
                let file = std::sync::Arc::new(file);
                entry.insert(file.clone());
                (file, created, true)
            }
        };
        let (file, created, inserted) = resolved;
        if inserted {
            metrics::set_open_files(self.files.len());
        }
        Ok((file, created))
    }

    pub fn get(&self, key: FileKey) -> Option<std::sync::Arc<IndexFile>> {
        self.files.get(&key).map(|entry| entry.clone())
    }

    /// Handle for serving a repair request: the live writer when one is
    /// open, otherwise a transient read-only handle, `None` when the file
    /// does not exist at all.
    pub fn for_repair(&self, key: FileKey) -> Result<Option<std::sync::Arc<IndexFile>>> {
        if let Some(file) = self.get(key) {
            return Ok(Some(file));
        }
        Ok(IndexFile::open_read_only(&self.data_dir, key)?.map(std::sync::Arc::new))
    }

    pub fn open_keys(&self) -> Vec<FileKey> {
        self.files.iter().map(|entry| *entry.key()).collect()
    }

    pub fn close(&self, key: FileKey, reason: &'static str) {
        if self.files.remove(&key).is_some() {
            info!(file = %key, reason, "closed index file");
            metrics::record_file_closed(reason);
            metrics::set_open_files(self.files.len());
        }
    }

    /// Close files idle past `stale_after` and purge files outside the
    /// retention window from disk. Returns the keys closed.
    pub fn maintenance(
        &self,
        stale_after: Duration,
        today: i32,
        retention_days: i32,
    ) -> Vec<FileKey> {
        let mut closed = Vec::new();
        for key in self.open_keys() {
            let Some(file) = self.get(key) else { continue };
            if !in_retention(key.julian_day, today, retention_days) {
                let path = file.path().to_path_buf();
                drop(file);
                self.close(key, "retention");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(file = %key, error = %e, "failed to purge expired index file");
                }
                closed.push(key);
            } else if file.idle_for() > stale_after {
                drop(file);
                self.close(key, "stale");
                closed.push(key);
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> FileKey {
        FileKey {
            julian_day: 2_460_916,
            node: *b"TN01",
        }
    }

    fn payload(fill: u8) -> [u8; PAYLOAD_LEN] {
        [fill; PAYLOAD_LEN]
    }

    #[test]
    fn create_then_reopen_validates_control() {
        let dir = TempDir::new().unwrap();
        let (_, created) = IndexFile::open_or_create(dir.path(), key()).unwrap();
        assert!(created);
        let (file, created) = IndexFile::open_or_create(dir.path(), key()).unwrap();
        assert!(!created);
        assert_eq!(file.allocated_index_blocks().unwrap(), 0);

        // a different key must not accept this file's control block
        let mut other = key();
        other.node = *b"XX99";
        assert!(IndexFile::open_read_only(dir.path(), other).unwrap().is_none());
    }

    #[test]
    fn remark_policy_counts_only_differing_rewrites() {
        let dir = TempDir::new().unwrap();
        let (file, _) = IndexFile::open_or_create(dir.path(), key()).unwrap();
        assert_eq!(
            file.write_data_block(100, &payload(0xAA)).unwrap(),
            WriteOutcome::Fresh
        );
        assert_eq!(
            file.write_data_block(100, &payload(0xAA)).unwrap(),
            WriteOutcome::Identical
        );
        assert_eq!(
            file.write_data_block(100, &payload(0xBB)).unwrap(),
            WriteOutcome::Conflict
        );
        // last writer wins
        assert_eq!(file.read_data_block(100).unwrap().unwrap(), payload(0xBB));
    }

    #[test]
    fn index_blocks_roundtrip_and_grow_allocation() {
        let dir = TempDir::new().unwrap();
        let (file, _) = IndexFile::open_or_create(dir.path(), key()).unwrap();
        let mut record = IndexBlockRecord::new(*b"IUANMO BHZ00");
        record.extents[0] = Extent {
            start_block: 64,
            bitmap: 0b1111,
        };
        file.write_index_block(3, &record).unwrap();
        assert_eq!(file.allocated_index_blocks().unwrap(), 4);
        assert_eq!(file.read_index_block(3).unwrap().unwrap(), record);
        assert!(file.read_index_block(2).unwrap().is_none());
        assert!(file.write_index_block(MAX_INDEX_BLOCKS, &record).is_err());
    }

    #[test]
    fn gaps_converge_after_repair_blocks_land() {
        let dir = TempDir::new().unwrap();
        let (file, _) = IndexFile::open_or_create(dir.path(), key()).unwrap();

        // producer intends blocks 64..=69 under extent slot 0
        let mut intended = IndexBlockRecord::new(*b"IUANMO BHZ00");
        intended.extents[0] = Extent {
            start_block: 64,
            bitmap: 0b111111,
        };
        intended.next_index = 7; // closed chain link, fully comparable
        file.write_index_block(0, &intended).unwrap();

        // only 64, 65 and 69 actually landed
        for bn in [64u32, 65, 69] {
            file.write_data_block(bn, &payload(1)).unwrap();
            file.mark_check(0, 0, bn, b"IUANMO BHZ00").unwrap();
        }
        let scan = file.scan_block(0, true).unwrap();
        assert!(!scan.satisfied);
        assert_eq!(scan.gaps.len(), 1);
        assert_eq!(scan.gaps[0].start_block, 66);
        assert_eq!(scan.gaps[0].end_block, 68);

        // repair path delivers the missing range
        for bn in 66u32..=68 {
            file.write_data_block(bn, &payload(1)).unwrap();
            file.mark_check(0, 0, bn, b"IUANMO BHZ00").unwrap();
        }
        let scan = file.scan_block(0, true).unwrap();
        assert!(scan.satisfied);
        assert!(scan.gaps.is_empty());
    }

    #[test]
    fn open_tail_last_extent_is_skipped_unless_asked() {
        let dir = TempDir::new().unwrap();
        let (file, _) = IndexFile::open_or_create(dir.path(), key()).unwrap();
        let mut intended = IndexBlockRecord::new(*b"IUANMO BHZ00");
        intended.extents[0] = Extent {
            start_block: 0,
            bitmap: u64::MAX,
        };
        intended.extents[1] = Extent {
            start_block: 64,
            bitmap: 0b11,
        };
        // open tail: extent 1 is live
        file.write_index_block(0, &intended).unwrap();
        for bn in 0..64u32 {
            file.write_data_block(bn, &payload(2)).unwrap();
            file.mark_check(0, 0, bn, b"IUANMO BHZ00").unwrap();
        }
        let relaxed = file.scan_block(0, false).unwrap();
        assert!(relaxed.gaps.is_empty());
        assert!(!relaxed.satisfied); // live extent unchecked, not yet provable

        let strict = file.scan_block(0, true).unwrap();
        assert_eq!(strict.gaps.len(), 1);
        assert_eq!(strict.gaps[0].start_block, 64);
        assert_eq!(strict.gaps[0].end_block, 65);
    }

    #[test]
    fn duplicate_open_tail_is_reported() {
        let dir = TempDir::new().unwrap();
        let (file, _) = IndexFile::open_or_create(dir.path(), key()).unwrap();
        let mut a = IndexBlockRecord::new(*b"IUANMO BHZ00");
        a.extents[0] = Extent {
            start_block: 0,
            bitmap: 1,
        };
        file.write_index_block(0, &a).unwrap();
        assert!(file.find_duplicate_open_channel().unwrap().is_none());
        file.write_index_block(1, &a).unwrap();
        assert_eq!(
            file.find_duplicate_open_channel().unwrap(),
            Some(*b"IUANMO BHZ00")
        );
        file.reset_index_region().unwrap();
        assert_eq!(file.allocated_index_blocks().unwrap(), 0);
        assert!(file.find_duplicate_open_channel().unwrap().is_none());
    }

    #[test]
    fn registry_shares_one_handle_per_key() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        let (a, created_a) = store.resolve(key()).unwrap();
        let (b, created_b) = store.resolve(key()).unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(store.open_keys(), vec![key()]);
    }

    #[test]
    fn repair_lookup_degrades_gracefully() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.for_repair(key()).unwrap().is_none());

        let (file, _) = store.resolve(key()).unwrap();
        file.write_data_block(5, &payload(9)).unwrap();
        store.close(key(), "test");
        // transient read-only handle off disk
        let ro = store.for_repair(key()).unwrap().unwrap();
        assert_eq!(ro.read_data_block(5).unwrap().unwrap(), payload(9));
        assert!(ro.write_data_block(5, &payload(1)).is_err());
    }

    #[test]
    fn maintenance_closes_stale_and_purges_expired() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        let today = 2_460_916;
        let expired = FileKey {
            julian_day: today - 100,
            node: *b"TN01",
        };
        let live = FileKey {
            julian_day: today,
            node: *b"TN01",
        };
        store.resolve(expired).unwrap();
        let (live_file, _) = store.resolve(live).unwrap();
        live_file.write_data_block(0, &payload(1)).unwrap();

        let closed = store.maintenance(Duration::from_secs(3600), today, 30);
        assert_eq!(closed, vec![expired]);
        assert!(!dir.path().join(expired.file_name()).exists());
        assert!(store.get(live).is_some());

        // everything is stale with a zero threshold
        let closed = store.maintenance(Duration::ZERO, today, 30);
        assert_eq!(closed, vec![live]);
    }
}
