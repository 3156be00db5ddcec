// Copyright (c) 2023 VELLUM LABS <dev@vellumlabs.io>
//! Append-only block-indexed log store.
//!
//! One [`HistoryLog`] instance owns a pair of files: a log file of
//! variable-length per-block records and an index file of fixed 8-byte
//! offsets. Record layout:
//!
//! ```text
//! block_num: u32 LE | version: u32 LE | payload_len: u64 LE | payload | block_num: u32 LE
//! ```
//!
//! The payload always begins with a 64-byte envelope (`block_id` then
//! `previous_id`) followed by the category-specific body; the envelope is
//! what makes `get_block_id` and the parent check on `store` possible
//! without decoding the body. The trailing height supports reverse scanning
//! and truncation. The index file is a dense array of `u64 LE` offsets
//! covering `[begin_block, end_block)`.
//!
//! Heights are contiguous and offsets monotonic; a fork overwrites the log
//! tail before the new entry is appended. Any I/O error is fatal to the
//! instance. Corruption discovered while opening truncates back to the last
//! consistent entry.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::{info, warn};
use vellum_models::{BlockId, TransactionId, ID_SIZE_BYTES};

use crate::error::StateHistoryError;
use crate::trace_converter;

const LOG_SUFFIX: &str = ".log";
const INDEX_SUFFIX: &str = ".index";

/// Bytes of `block_num + version + payload_len` leading every record.
const ENTRY_HEADER_BYTES: u64 = 16;
/// Bytes of the trailing height closing every record.
const ENTRY_TRAILER_BYTES: u64 = 4;
/// Bytes of the `block_id | previous_id` envelope leading every payload.
pub const PAYLOAD_ENVELOPE_BYTES: usize = 2 * ID_SIZE_BYTES;

#[derive(Clone, Copy, Debug)]
struct EntryHeader {
    block_num: u32,
    version: u32,
    payload_len: u64,
}

impl EntryHeader {
    fn record_len(&self) -> u64 {
        ENTRY_HEADER_BYTES + self.payload_len + ENTRY_TRAILER_BYTES
    }
}

/// A raw log entry as stored on disk: format version plus payload bytes
/// (envelope included).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    /// entry format version
    pub version: u32,
    /// payload bytes, starting with the 64-byte id envelope
    pub payload: Vec<u8>,
}

/// Append-only log of per-block entries with random-access retrieval.
pub struct HistoryLog {
    name: String,
    log_file: File,
    index_file: File,
    begin_block: u32,
    end_block: u32,
    log_size: u64,
}

impl HistoryLog {
    /// Opens or creates the `<name>.log` / `<name>.index` pair under `dir`,
    /// reconstructing the block range from what is on disk. An index that
    /// disagrees with the log is rebuilt by scanning the log forward; a
    /// corrupt log tail is truncated back to the last consistent entry.
    pub fn open(dir: &Path, name: &str) -> Result<Self, StateHistoryError> {
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(format!("{}{}", name, LOG_SUFFIX)))?;
        let index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(format!("{}{}", name, INDEX_SUFFIX)))?;
        let mut log = HistoryLog {
            name: name.to_string(),
            log_file,
            index_file,
            begin_block: 0,
            end_block: 0,
            log_size: 0,
        };
        log.recover()?;
        if !log.is_empty() {
            info!(
                "{}: opened with blocks [{}, {})",
                log.name, log.begin_block, log.end_block
            );
        }
        Ok(log)
    }

    /// First stored height (inclusive).
    pub fn begin_block(&self) -> u32 {
        self.begin_block
    }

    /// One past the last stored height (exclusive).
    pub fn end_block(&self) -> u32 {
        self.end_block
    }

    /// True if no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.begin_block == self.end_block
    }

    /// True if an entry for `block_num` is stored.
    pub fn contains(&self, block_num: u32) -> bool {
        !self.is_empty() && block_num >= self.begin_block && block_num < self.end_block
    }

    /// Returns the stored block id at `block_num`.
    pub fn get_block_id(&self, block_num: u32) -> Result<BlockId, StateHistoryError> {
        let offset = self.entry_offset(block_num)?;
        let header = self.read_header(offset, block_num)?;
        if header.payload_len < PAYLOAD_ENVELOPE_BYTES as u64 {
            return Err(StateHistoryError::Corrupted(format!(
                "{}: entry {} payload too short for id envelope",
                self.name, block_num
            )));
        }
        let mut id = [0u8; ID_SIZE_BYTES];
        self.log_file
            .read_exact_at(&mut id, offset + ENTRY_HEADER_BYTES)?;
        Ok(BlockId(id))
    }

    /// Returns the raw payload bytes and format version stored at `block_num`.
    pub fn get_log_entry(&self, block_num: u32) -> Result<LogEntry, StateHistoryError> {
        let offset = self.entry_offset(block_num)?;
        let header = self.read_header(offset, block_num)?;
        let mut payload = vec![0u8; header.payload_len as usize];
        self.log_file
            .read_exact_at(&mut payload, offset + ENTRY_HEADER_BYTES)?;
        let mut trailer = [0u8; 4];
        self.log_file.read_exact_at(
            &mut trailer,
            offset + ENTRY_HEADER_BYTES + header.payload_len,
        )?;
        if u32::from_le_bytes(trailer) != block_num {
            return Err(StateHistoryError::Corrupted(format!(
                "{}: trailing height of entry {} does not match",
                self.name, block_num
            )));
        }
        Ok(LogEntry {
            version: header.version,
            payload,
        })
    }

    /// Appends the entry for `block_num`. Heights must stay contiguous:
    /// a height below `end_block` truncates the tail first (fork), a height
    /// above it is rejected as a gap, and an append whose `previous_id`
    /// disagrees with the stored entry below it is rejected outright.
    pub fn store(
        &mut self,
        block_num: u32,
        block_id: &BlockId,
        previous_id: &BlockId,
        version: u32,
        body: &[u8],
    ) -> Result<(), StateHistoryError> {
        if self.is_empty() {
            self.begin_block = block_num;
            self.end_block = block_num;
        } else if block_num < self.end_block {
            warn!(
                "{}: overwriting blocks [{}, {}) after fork",
                self.name, block_num, self.end_block
            );
            self.truncate(block_num)?;
            if self.is_empty() {
                self.begin_block = block_num;
                self.end_block = block_num;
            }
        } else if block_num > self.end_block {
            return Err(StateHistoryError::Gap {
                expected: self.end_block,
                got: block_num,
            });
        } else if block_num > self.begin_block {
            let stored_previous = self.get_block_id(block_num - 1)?;
            if stored_previous != *previous_id {
                return Err(StateHistoryError::ForkMismatch(block_num));
            }
        }

        let payload_len = (PAYLOAD_ENVELOPE_BYTES + body.len()) as u64;
        let mut record =
            Vec::with_capacity((ENTRY_HEADER_BYTES + payload_len + ENTRY_TRAILER_BYTES) as usize);
        record.extend_from_slice(&block_num.to_le_bytes());
        record.extend_from_slice(&version.to_le_bytes());
        record.extend_from_slice(&payload_len.to_le_bytes());
        record.extend_from_slice(block_id.to_bytes());
        record.extend_from_slice(previous_id.to_bytes());
        record.extend_from_slice(body);
        record.extend_from_slice(&block_num.to_le_bytes());

        self.log_file.write_all_at(&record, self.log_size)?;
        let slot = u64::from(block_num - self.begin_block) * 8;
        self.index_file
            .write_all_at(&self.log_size.to_le_bytes(), slot)?;
        self.log_size += record.len() as u64;
        self.end_block = block_num + 1;
        Ok(())
    }

    /// Prunes the signatures and context-free data of `ids` inside the entry
    /// stored at `block_num`, rewriting exactly the modified byte range on
    /// disk. Ids found in the entry are drained from `ids`; the rest are left
    /// for the caller. Only version-1 entries support pruning.
    pub fn prune_transactions(
        &mut self,
        block_num: u32,
        ids: &mut Vec<TransactionId>,
    ) -> Result<(), StateHistoryError> {
        let offset = self.entry_offset(block_num)?;
        let header = self.read_header(offset, block_num)?;
        let mut entry = self.get_log_entry(block_num)?;
        let body = &mut entry.payload[PAYLOAD_ENVELOPE_BYTES..];
        if let Some((start, end)) =
            trace_converter::prune_traces(body, header.version, ids)?
        {
            let disk_start =
                offset + ENTRY_HEADER_BYTES + PAYLOAD_ENVELOPE_BYTES as u64 + start;
            self.log_file
                .write_all_at(&body[start as usize..end as usize], disk_start)?;
        }
        Ok(())
    }

    fn entry_offset(&self, block_num: u32) -> Result<u64, StateHistoryError> {
        if !self.contains(block_num) {
            return Err(StateHistoryError::OutOfRange(block_num));
        }
        let mut offset = [0u8; 8];
        self.index_file
            .read_exact_at(&mut offset, u64::from(block_num - self.begin_block) * 8)?;
        Ok(u64::from_le_bytes(offset))
    }

    fn read_header(&self, offset: u64, block_num: u32) -> Result<EntryHeader, StateHistoryError> {
        let header = self.read_header_raw(offset)?;
        if header.block_num != block_num {
            return Err(StateHistoryError::Corrupted(format!(
                "{}: index for block {} points at a record labeled {}",
                self.name, block_num, header.block_num
            )));
        }
        Ok(header)
    }

    fn read_header_raw(&self, offset: u64) -> Result<EntryHeader, StateHistoryError> {
        let mut bytes = [0u8; ENTRY_HEADER_BYTES as usize];
        self.log_file.read_exact_at(&mut bytes, offset)?;
        Ok(EntryHeader {
            block_num: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            version: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            payload_len: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        })
    }

    /// Discards all entries with height >= `block_num`, logically and
    /// physically. Truncating at or below `begin_block` empties the log.
    fn truncate(&mut self, block_num: u32) -> Result<(), StateHistoryError> {
        if block_num <= self.begin_block {
            self.log_file.set_len(0)?;
            self.index_file.set_len(0)?;
            self.begin_block = 0;
            self.end_block = 0;
            self.log_size = 0;
        } else {
            let offset = self.entry_offset(block_num)?;
            self.log_file.set_len(offset)?;
            self.index_file
                .set_len(u64::from(block_num - self.begin_block) * 8)?;
            self.end_block = block_num;
            self.log_size = offset;
        }
        Ok(())
    }

    /// Rebuilds `begin_block`/`end_block`/`log_size` from the files. The
    /// index is trusted when its length and last offset are consistent with
    /// the log; otherwise it is rebuilt by a forward scan, truncating the
    /// log at the first inconsistent record.
    fn recover(&mut self) -> Result<(), StateHistoryError> {
        let log_len = self.log_file.metadata()?.len();
        if log_len == 0 {
            self.index_file.set_len(0)?;
            self.begin_block = 0;
            self.end_block = 0;
            self.log_size = 0;
            return Ok(());
        }
        if log_len < ENTRY_HEADER_BYTES + ENTRY_TRAILER_BYTES {
            warn!("{}: log holds no complete entry, clearing", self.name);
            self.log_file.set_len(0)?;
            self.index_file.set_len(0)?;
            return Ok(());
        }
        let first = self.read_header_raw(0)?;
        self.begin_block = first.block_num;

        if let Some((end_block, log_size)) = self.try_trust_index(log_len)? {
            self.end_block = end_block;
            self.log_size = log_size;
            return Ok(());
        }
        self.rebuild_index(log_len)
    }

    /// Accepts the existing index when its shape matches the log exactly:
    /// whole number of slots, last slot pointing at a record whose leading
    /// and trailing heights agree and which ends exactly at the log's end.
    fn try_trust_index(&self, log_len: u64) -> Result<Option<(u32, u64)>, StateHistoryError> {
        let index_len = self.index_file.metadata()?.len();
        if index_len == 0 || index_len % 8 != 0 {
            return Ok(None);
        }
        let entries = index_len / 8;
        let mut offset = [0u8; 8];
        self.index_file.read_exact_at(&mut offset, index_len - 8)?;
        let offset = u64::from_le_bytes(offset);
        if offset + ENTRY_HEADER_BYTES + ENTRY_TRAILER_BYTES > log_len {
            return Ok(None);
        }
        let last = self.read_header_raw(offset)?;
        let expected_last = match entries
            .checked_sub(1)
            .and_then(|n| u32::try_from(n).ok())
            .and_then(|n| self.begin_block.checked_add(n))
        {
            Some(h) => h,
            None => return Ok(None),
        };
        if last.block_num != expected_last || offset + last.record_len() != log_len {
            return Ok(None);
        }
        let mut trailer = [0u8; 4];
        self.log_file
            .read_exact_at(&mut trailer, offset + ENTRY_HEADER_BYTES + last.payload_len)?;
        if u32::from_le_bytes(trailer) != last.block_num {
            return Ok(None);
        }
        Ok(Some((expected_last + 1, log_len)))
    }

    /// Walks the log from the start, collecting entry offsets and dropping
    /// everything from the first inconsistent record on.
    fn rebuild_index(&mut self, log_len: u64) -> Result<(), StateHistoryError> {
        info!("{}: rebuilding index", self.name);
        let mut offsets: Vec<u64> = Vec::new();
        let mut pos = 0u64;
        while pos + ENTRY_HEADER_BYTES + ENTRY_TRAILER_BYTES <= log_len {
            let header = self.read_header_raw(pos)?;
            let expected = self.begin_block.wrapping_add(offsets.len() as u32);
            if header.block_num != expected
                || header.payload_len < PAYLOAD_ENVELOPE_BYTES as u64
                || pos + header.record_len() > log_len
            {
                break;
            }
            let mut trailer = [0u8; 4];
            self.log_file
                .read_exact_at(&mut trailer, pos + ENTRY_HEADER_BYTES + header.payload_len)?;
            if u32::from_le_bytes(trailer) != header.block_num {
                break;
            }
            offsets.push(pos);
            pos += header.record_len();
        }
        if pos < log_len {
            warn!(
                "{}: dropping {} corrupt trailing bytes",
                self.name,
                log_len - pos
            );
            self.log_file.set_len(pos)?;
        }
        if offsets.is_empty() {
            self.index_file.set_len(0)?;
            self.begin_block = 0;
            self.end_block = 0;
            self.log_size = 0;
            return Ok(());
        }
        let mut index_bytes = Vec::with_capacity(offsets.len() * 8);
        for offset in &offsets {
            index_bytes.extend_from_slice(&offset.to_le_bytes());
        }
        self.index_file.set_len(0)?;
        self.index_file.write_all_at(&index_bytes, 0)?;
        self.end_block = self.begin_block + offsets.len() as u32;
        self.log_size = pos;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_id(n: u32) -> BlockId {
        let mut bytes = [0u8; ID_SIZE_BYTES];
        bytes[..4].copy_from_slice(&n.to_le_bytes());
        BlockId(bytes)
    }

    fn body_for(n: u32) -> Vec<u8> {
        vec![n as u8; 10 + (n as usize % 7)]
    }

    fn store_chain(log: &mut HistoryLog, range: std::ops::RangeInclusive<u32>) {
        for n in range {
            log.store(n, &test_id(n), &test_id(n - 1), 1, &body_for(n))
                .unwrap();
        }
    }

    #[test]
    fn test_store_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        assert!(log.is_empty());
        store_chain(&mut log, 1..=5);
        assert_eq!(log.begin_block(), 1);
        assert_eq!(log.end_block(), 6);
        for n in 1..=5 {
            assert_eq!(log.get_block_id(n).unwrap(), test_id(n));
            let entry = log.get_log_entry(n).unwrap();
            assert_eq!(entry.version, 1);
            assert_eq!(&entry.payload[..ID_SIZE_BYTES], test_id(n).to_bytes());
            assert_eq!(&entry.payload[PAYLOAD_ENVELOPE_BYTES..], &body_for(n)[..]);
        }
    }

    #[test]
    fn test_reopen_preserves_range_and_bytes() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
            store_chain(&mut log, 3..=20);
        }
        let log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        assert_eq!(log.begin_block(), 3);
        assert_eq!(log.end_block(), 21);
        let entry = log.get_log_entry(17).unwrap();
        assert_eq!(&entry.payload[PAYLOAD_ENVELOPE_BYTES..], &body_for(17)[..]);
    }

    #[test]
    fn test_gap_rejected() {
        let dir = TempDir::new().unwrap();
        let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        // first store into an empty log may start anywhere
        log.store(5, &test_id(5), &test_id(4), 1, b"five").unwrap();
        let err = log
            .store(7, &test_id(7), &test_id(6), 1, b"seven")
            .unwrap_err();
        assert!(matches!(
            err,
            StateHistoryError::Gap {
                expected: 6,
                got: 7
            }
        ));
        assert_eq!(log.end_block(), 6);
    }

    #[test]
    fn test_fork_truncates_tail() {
        let dir = TempDir::new().unwrap();
        let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        store_chain(&mut log, 1..=10);
        // a fork replaces block 8: entries 8..=10 are discarded first
        let forked = BlockId([0xfe; ID_SIZE_BYTES]);
        log.store(8, &forked, &test_id(7), 1, b"forked").unwrap();
        assert_eq!(log.end_block(), 9);
        assert_eq!(log.get_block_id(8).unwrap(), forked);
        assert!(log.get_log_entry(9).is_err());
        // appending on top of the fork works
        log.store(9, &test_id(9), &forked, 1, b"next").unwrap();
        assert_eq!(log.end_block(), 10);
    }

    #[test]
    fn test_fork_below_begin_restarts_log() {
        let dir = TempDir::new().unwrap();
        let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        store_chain(&mut log, 10..=15);
        log.store(9, &test_id(9), &test_id(8), 1, b"rewind").unwrap();
        assert_eq!(log.begin_block(), 9);
        assert_eq!(log.end_block(), 10);
    }

    #[test]
    fn test_parent_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        store_chain(&mut log, 1..=3);
        let err = log
            .store(4, &test_id(4), &BlockId([0xaa; ID_SIZE_BYTES]), 1, b"bad")
            .unwrap_err();
        assert!(matches!(err, StateHistoryError::ForkMismatch(4)));
    }

    #[test]
    fn test_out_of_range_query() {
        let dir = TempDir::new().unwrap();
        let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        store_chain(&mut log, 2..=4);
        assert!(matches!(
            log.get_log_entry(1),
            Err(StateHistoryError::OutOfRange(1))
        ));
        assert!(matches!(
            log.get_block_id(5),
            Err(StateHistoryError::OutOfRange(5))
        ));
    }

    #[test]
    fn test_reopen_with_truncated_index_rebuilds() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
            store_chain(&mut log, 1..=100);
        }
        let index_path = dir.path().join("trace_history.index");
        let index = OpenOptions::new().write(true).open(&index_path).unwrap();
        index.set_len(50 * 8).unwrap();
        drop(index);
        let log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        assert_eq!(log.begin_block(), 1);
        assert_eq!(log.end_block(), 101);
        assert_eq!(
            &log.get_log_entry(100).unwrap().payload[PAYLOAD_ENVELOPE_BYTES..],
            &body_for(100)[..]
        );
    }

    #[test]
    fn test_reopen_with_corrupt_tail_truncates() {
        let dir = TempDir::new().unwrap();
        let full_len = {
            let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
            store_chain(&mut log, 1..=10);
            log.log_size
        };
        let log_path = dir.path().join("trace_history.log");
        let file = OpenOptions::new().write(true).open(&log_path).unwrap();
        // chop the last record in half
        file.set_len(full_len - 8).unwrap();
        drop(file);
        let log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        assert_eq!(log.begin_block(), 1);
        assert_eq!(log.end_block(), 10);
        assert!(log.get_log_entry(9).is_ok());
    }

    #[test]
    fn test_store_after_reopen_continues() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
            store_chain(&mut log, 1..=4);
        }
        let mut log = HistoryLog::open(dir.path(), "trace_history").unwrap();
        store_chain(&mut log, 5..=6);
        assert_eq!(log.end_block(), 7);
        assert_eq!(log.get_block_id(6).unwrap(), test_id(6));
    }
}
