//! Append-only, zxid-indexed, crash-safe transaction log.
//!
//! The log is a directory of segment files, each named by the zxid of its
//! first record. A record is laid out big-endian as
//! `{ length: u32 | epoch: u32 | xid: u64 | txn_type: u32 | body | crc32: u32 }`
//! where `length` covers the zxid, type, and body fields and the checksum
//! covers the same bytes. Appends go to the newest ("active") segment and a
//! new segment is rolled once the active one grows past a split size.
//!
//! On open all segments are scanned and their record offsets mirrored in
//! memory. A torn or checksum-failing record at the tail of the newest
//! segment is discarded (interrupted append); anywhere else it is fatal.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::utils::ZabError;
use crate::zxid::{Transaction, Zxid};

/// Roll the active segment once it grows past this many bytes.
const SEGMENT_SPLIT_BYTES: u64 = 32 * 1024 * 1024;

/// Fixed per-record overhead: length header + crc trailer.
const RECORD_OVERHEAD: usize = 8;

/// Fixed payload bytes ahead of the body: epoch + xid + txn_type.
const PAYLOAD_HEADER: usize = 16;

// Table-driven CRC-32C (Castagnoli), reflected polynomial.
const fn make_crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x82F6_3B78
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = make_crc32c_table();

fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}

/// Encodes one record into bytes.
fn encode_record(txn: &Transaction) -> Vec<u8> {
    let payload_len = PAYLOAD_HEADER + txn.body.len();
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + payload_len);
    buf.extend_from_slice(&(payload_len as u32).to_be_bytes());
    buf.extend_from_slice(&txn.zxid.epoch.to_be_bytes());
    buf.extend_from_slice(&txn.zxid.xid.to_be_bytes());
    buf.extend_from_slice(&txn.txn_type.to_be_bytes());
    buf.extend_from_slice(&txn.body);
    let crc = crc32c(&buf[4..]);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf
}

/// Parses the record starting at `offset`. Returns the transaction and the
/// offset one past its trailer, or `None` if the bytes do not hold a whole
/// valid record (torn tail or corruption; caller decides which).
fn parse_record(bytes: &[u8], offset: usize) -> Option<(Transaction, usize)> {
    if offset + 4 > bytes.len() {
        return None;
    }
    let payload_len =
        u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
            as usize;
    if payload_len < PAYLOAD_HEADER {
        return None;
    }
    let payload_s = offset + 4;
    let payload_e = payload_s + payload_len;
    let record_e = payload_e + 4;
    if record_e > bytes.len() {
        return None;
    }
    let stored_crc =
        u32::from_be_bytes(bytes[payload_e..record_e].try_into().unwrap());
    if crc32c(&bytes[payload_s..payload_e]) != stored_crc {
        return None;
    }
    let epoch =
        u32::from_be_bytes(bytes[payload_s..payload_s + 4].try_into().unwrap());
    let xid = u64::from_be_bytes(
        bytes[payload_s + 4..payload_s + 12].try_into().unwrap(),
    );
    let txn_type = u32::from_be_bytes(
        bytes[payload_s + 12..payload_s + 16].try_into().unwrap(),
    );
    let body = bytes[payload_s + 16..payload_e].to_vec();
    Some((
        Transaction::new(Zxid::new(epoch, xid), txn_type, body),
        record_e,
    ))
}

/// One segment file and its in-memory record index.
#[derive(Debug)]
struct Segment {
    path: PathBuf,

    /// Record start offsets, in zxid order.
    entries: Vec<(Zxid, u64)>,

    /// Byte length of the valid portion of the file.
    len: u64,
}

fn segment_file_name(first: Zxid) -> String {
    format!("log-{:08x}-{:016x}", first.epoch, first.xid)
}

/// The segment transaction log.
#[derive(Debug)]
pub struct SegmentLog {
    /// Directory holding the segment files.
    dir: PathBuf,

    /// Segments in zxid order; the last one is the active segment.
    segments: Vec<Segment>,

    /// Append handle to the active segment.
    active: Option<File>,

    /// Roll threshold for the active segment.
    split_bytes: u64,
}

impl SegmentLog {
    /// Opens (or initializes) the log under the given directory, scanning
    /// and indexing all segment files.
    pub async fn open(dir: &Path) -> Result<SegmentLog, ZabError> {
        if !fs::try_exists(dir).await? {
            fs::create_dir_all(dir).await?;
        }

        let mut names = Vec::new();
        let mut dirents = fs::read_dir(dir).await?;
        while let Some(dirent) = dirents.next_entry().await? {
            let name = dirent.file_name().to_string_lossy().into_owned();
            if name.starts_with("log-") {
                names.push(name);
            }
        }
        // zero-padded hex names sort in zxid order
        names.sort();

        let mut log = SegmentLog {
            dir: dir.to_path_buf(),
            segments: Vec::new(),
            active: None,
            split_bytes: SEGMENT_SPLIT_BYTES,
        };
        let count = names.len();
        for (i, name) in names.into_iter().enumerate() {
            let path = dir.join(&name);
            let newest = i + 1 == count;
            log.scan_segment(path, newest).await?;
        }

        Ok(log)
    }

    /// Scans one segment file, building its index. A broken tail record is
    /// chopped off if this is the newest segment, and fatal otherwise.
    async fn scan_segment(
        &mut self,
        path: PathBuf,
        newest: bool,
    ) -> Result<(), ZabError> {
        let bytes = fs::read(&path).await?;
        let mut entries = Vec::new();
        let mut offset = 0usize;
        let mut last_zxid = self.latest_zxid();

        while offset < bytes.len() {
            match parse_record(&bytes, offset) {
                Some((txn, next)) => {
                    if txn.zxid <= last_zxid {
                        return Err(ZabError::Corruption(format!(
                            "out-of-order zxid {} in segment '{}'",
                            txn.zxid,
                            path.display()
                        )));
                    }
                    last_zxid = txn.zxid;
                    entries.push((txn.zxid, offset as u64));
                    offset = next;
                }
                None if newest => {
                    pf_warn!(
                        "log";
                        "dropping torn tail of '{}' at offset {}",
                        path.display(),
                        offset
                    );
                    break;
                }
                None => {
                    return Err(ZabError::Corruption(format!(
                        "bad record in segment '{}' at offset {}",
                        path.display(),
                        offset
                    )));
                }
            }
        }

        if entries.is_empty() {
            // nothing valid in this file; only tolerable at the tail
            if newest {
                fs::remove_file(&path).await?;
                return Ok(());
            }
            return Err(ZabError::Corruption(format!(
                "empty segment '{}'",
                path.display()
            )));
        }

        if offset < bytes.len() {
            // truncate the torn tail away
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(offset as u64).await?;
            file.sync_all().await?;
        }

        self.segments.push(Segment {
            path,
            entries,
            len: offset as u64,
        });
        Ok(())
    }

    /// Zxid of the last entry, or `Zxid::NULL` if the log is empty.
    pub fn latest_zxid(&self) -> Zxid {
        self.segments
            .last()
            .and_then(|seg| seg.entries.last())
            .map(|(zxid, _)| *zxid)
            .unwrap_or(Zxid::NULL)
    }

    /// Zxid of the first retained entry, if any.
    pub fn first_zxid(&self) -> Option<Zxid> {
        self.segments
            .first()
            .and_then(|seg| seg.entries.first())
            .map(|(zxid, _)| *zxid)
    }

    /// True if an entry with exactly this zxid is in the log.
    pub fn contains(&self, zxid: Zxid) -> bool {
        self.segments.iter().any(|seg| {
            seg.entries
                .binary_search_by_key(&zxid, |(z, _)| *z)
                .is_ok()
        })
    }

    /// Greatest entry zxid that is ≤ the given zxid, if any.
    pub fn highest_zxid_le(&self, zxid: Zxid) -> Option<Zxid> {
        for seg in self.segments.iter().rev() {
            let idx = seg.entries.partition_point(|(z, _)| *z <= zxid);
            if idx > 0 {
                return Some(seg.entries[idx - 1].0);
            }
        }
        None
    }

    /// Number of retained entries.
    pub fn num_entries(&self) -> usize {
        self.segments.iter().map(|seg| seg.entries.len()).sum()
    }

    /// Appends a transaction. Its zxid must exceed `latest_zxid()`. The
    /// write may sit in OS buffers until the next `sync()`.
    pub async fn append(&mut self, txn: &Transaction) -> Result<(), ZabError> {
        let latest = self.latest_zxid();
        if txn.zxid <= latest {
            return logged_err!("log"; "append zxid {} not beyond latest {}",
                                      txn.zxid, latest);
        }

        // roll a fresh segment if none is active or the active one is large
        let roll = match self.segments.last() {
            None => true,
            Some(seg) => seg.len >= self.split_bytes,
        };
        if roll {
            // the outgoing segment must be durable before its handle is
            // dropped; `sync()` only ever reaches the active segment
            self.sync().await?;
            let path = self.dir.join(segment_file_name(txn.zxid));
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?;
            self.segments.push(Segment {
                path,
                entries: Vec::new(),
                len: 0,
            });
            self.active = Some(file);
        } else if self.active.is_none() {
            let seg = self.segments.last().unwrap();
            let mut file =
                OpenOptions::new().write(true).open(&seg.path).await?;
            file.seek(SeekFrom::Start(seg.len)).await?;
            self.active = Some(file);
        }

        let record = encode_record(txn);
        let file = self.active.as_mut().unwrap();
        file.write_all(&record).await?;

        let seg = self.segments.last_mut().unwrap();
        seg.entries.push((txn.zxid, seg.len));
        seg.len += record.len() as u64;
        Ok(())
    }

    /// Flushes all prior appends to stable storage before returning.
    pub async fn sync(&mut self) -> Result<(), ZabError> {
        if let Some(file) = self.active.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Removes all entries with zxid greater than the given one. The given
    /// zxid must be in the log or be `Zxid::NULL`.
    pub async fn truncate(&mut self, zxid: Zxid) -> Result<(), ZabError> {
        if zxid.is_null() {
            self.wipe().await?;
            return Ok(());
        }
        if !self.contains(zxid) {
            return logged_err!("log"; "truncate target {} not found in log",
                                      zxid);
        }

        // drop whole segments strictly after the target
        while let Some(seg) = self.segments.last() {
            if seg.entries.first().map(|(z, _)| *z > zxid).unwrap_or(true) {
                let seg = self.segments.pop().unwrap();
                self.active = None;
                fs::remove_file(&seg.path).await?;
            } else {
                break;
            }
        }

        // chop the containing segment after the target entry
        let seg = self.segments.last_mut().unwrap();
        let keep = seg.entries.partition_point(|(z, _)| *z <= zxid);
        debug_assert!(keep > 0);
        if keep < seg.entries.len() {
            let cut = seg.entries[keep].1;
            seg.entries.truncate(keep);
            seg.len = cut;
            self.active = None;
            let file = OpenOptions::new().write(true).open(&seg.path).await?;
            file.set_len(cut).await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Drops leading whole segments whose entries are all ≤ the given zxid.
    /// The newest segment is always retained so `latest_zxid()` stays
    /// meaningful across snapshot-driven compaction.
    pub async fn trim_front(&mut self, upto: Zxid) -> Result<(), ZabError> {
        while self.segments.len() > 1 {
            let covered = self.segments[0]
                .entries
                .last()
                .map(|(z, _)| *z <= upto)
                .unwrap_or(false);
            if !covered {
                break;
            }
            let seg = self.segments.remove(0);
            fs::remove_file(&seg.path).await?;
            pf_debug!("log"; "trimmed segment '{}'", seg.path.display());
        }
        Ok(())
    }

    /// Removes every entry and segment file, leaving an empty log. Used both
    /// by `truncate(Zxid::NULL)` and when installing a snapshot.
    pub async fn wipe(&mut self) -> Result<(), ZabError> {
        self.active = None;
        for seg in self.segments.drain(..) {
            fs::remove_file(&seg.path).await?;
        }
        Ok(())
    }

    /// Returns a restartable iterator over entries with zxid ≥ `from`, in
    /// order. The iterator reads segment files lazily; entries appended
    /// after its creation are not guaranteed to be observed.
    pub fn iterate(&self, from: Zxid) -> LogIter {
        let mut segs = VecDeque::new();
        for seg in &self.segments {
            if seg.entries.is_empty() {
                continue;
            }
            let idx = seg.entries.partition_point(|(z, _)| *z < from);
            if idx < seg.entries.len() {
                segs.push_back((
                    seg.path.clone(),
                    seg.entries[idx].1,
                    seg.len,
                ));
            }
        }
        LogIter { segs, buf: None }
    }
}

/// Lazy, in-order iterator over log entries. Obtain a fresh one from
/// `SegmentLog::iterate` to restart.
#[derive(Debug)]
pub struct LogIter {
    /// Remaining segments as (path, start offset, valid length).
    segs: VecDeque<(PathBuf, u64, u64)>,

    /// Bytes + cursor + end bound of the segment currently being walked.
    buf: Option<(Vec<u8>, usize, usize)>,
}

impl LogIter {
    /// Yields the next transaction, or `None` at the end of the log.
    pub async fn next(&mut self) -> Result<Option<Transaction>, ZabError> {
        loop {
            if let Some((bytes, cursor, end)) = self.buf.as_mut() {
                if *cursor < *end {
                    match parse_record(bytes, *cursor) {
                        Some((txn, next)) => {
                            *cursor = next;
                            return Ok(Some(txn));
                        }
                        None => {
                            return Err(ZabError::Corruption(format!(
                                "bad record at offset {} during iteration",
                                *cursor
                            )));
                        }
                    }
                }
                self.buf = None;
            }

            match self.segs.pop_front() {
                Some((path, start, len)) => {
                    let bytes = fs::read(&path).await?;
                    let end = std::cmp::min(len as usize, bytes.len());
                    self.buf = Some((bytes, start as usize, end));
                }
                None => return Ok(None),
            }
        }
    }
}
