// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction-aware write-ahead log
//!
//! Commits append a `TXBEGIN / TXOP* / TXCOMMIT` record group to an in-memory
//! buffer under the writer lock; a background flusher drains the buffer to
//! the current segment and fsyncs on a fixed cadence, when the buffer grows
//! past a threshold, or synchronously via [`Wal::sync`]. A commit is durable
//! only once its TXCOMMIT record has been fsynced.
//!
//! Record framing: `magic u32 | record type u8 | body length u32 |
//! crc32c(body) u32 | body`, all little-endian. TXOP payloads carry
//! length-prefixed UTF-8 identity fields, which keeps replay idempotent.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Magic number identifying ZipTag WAL frames.
const WAL_MAGIC: u32 = 0x5A54_4C47;
/// Frame header: magic + record type + body length + checksum.
const FRAME_HEADER_LEN: usize = 13;
/// Soft maximum per WAL segment before rotation.
const MAX_SEGMENT_BYTES: u64 = 16 * 1024 * 1024;
/// Buffer size that triggers an early flush.
const FLUSH_BUFFER_BYTES: usize = 256 * 1024;
/// Defensive ceiling on a single record body.
const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// WAL record types.
const RT_TXBEGIN: u8 = 1;
const RT_TXOP: u8 = 2;
const RT_TXCOMMIT: u8 = 3;

/// TXOP kinds.
const OP_ADD_TAG: u8 = 1;
const OP_REM_TAG: u8 = 2;
const OP_LINK: u8 = 3;
const OP_UNLINK: u8 = 4;
const OP_DECLARE_TTYPE: u8 = 5;
const OP_DROP_TTYPE: u8 = 6;

/// A logged transaction operation, addressed by identity so that replay
/// needs no uniqueness tracking beyond the TXCOMMIT set.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    AddTag { ttype: String, val: String },
    RemTag { ttype: String, val: String },
    Link { a: (String, String), b: (String, String) },
    Unlink { a: (String, String), b: (String, String) },
    DeclareTtype { ttype: String },
    DropTtype { ttype: String },
}

/// A single WAL record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    TxBegin {
        txid: u64,
        parent_rev: u64,
        ts_ms: u64,
    },
    TxOp {
        txid: u64,
        index: u32,
        op: TxOp,
    },
    TxCommit {
        txid: u64,
        new_rev: u64,
    },
}

/// WAL-specific errors
#[derive(Error, Debug)]
pub enum WalError {
    #[error("wal io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt wal record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

impl WalError {
    fn io(path: impl Into<Option<PathBuf>>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn get_str(body: &[u8], pos: &mut usize, offset: u64) -> Result<String, WalError> {
    let len = get_u32(body, pos, offset)? as usize;
    if *pos + len > body.len() {
        return Err(WalError::Corrupt {
            offset,
            reason: "truncated string field".into(),
        });
    }
    let s = std::str::from_utf8(&body[*pos..*pos + len])
        .map_err(|_| WalError::Corrupt {
            offset,
            reason: "invalid utf-8 in string field".into(),
        })?
        .to_string();
    *pos += len;
    Ok(s)
}

fn get_u64(body: &[u8], pos: &mut usize, offset: u64) -> Result<u64, WalError> {
    if *pos + 8 > body.len() {
        return Err(WalError::Corrupt {
            offset,
            reason: "truncated u64 field".into(),
        });
    }
    let v = u64::from_le_bytes(body[*pos..*pos + 8].try_into().expect("length checked"));
    *pos += 8;
    Ok(v)
}

fn get_u32(body: &[u8], pos: &mut usize, offset: u64) -> Result<u32, WalError> {
    if *pos + 4 > body.len() {
        return Err(WalError::Corrupt {
            offset,
            reason: "truncated u32 field".into(),
        });
    }
    let v = u32::from_le_bytes(body[*pos..*pos + 4].try_into().expect("length checked"));
    *pos += 4;
    Ok(v)
}

impl TxOp {
    fn kind(&self) -> u8 {
        match self {
            TxOp::AddTag { .. } => OP_ADD_TAG,
            TxOp::RemTag { .. } => OP_REM_TAG,
            TxOp::Link { .. } => OP_LINK,
            TxOp::Unlink { .. } => OP_UNLINK,
            TxOp::DeclareTtype { .. } => OP_DECLARE_TTYPE,
            TxOp::DropTtype { .. } => OP_DROP_TTYPE,
        }
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            TxOp::AddTag { ttype, val } | TxOp::RemTag { ttype, val } => {
                put_str(buf, ttype);
                put_str(buf, val);
            }
            TxOp::Link { a, b } | TxOp::Unlink { a, b } => {
                put_str(buf, &a.0);
                put_str(buf, &a.1);
                put_str(buf, &b.0);
                put_str(buf, &b.1);
            }
            TxOp::DeclareTtype { ttype } | TxOp::DropTtype { ttype } => {
                put_str(buf, ttype);
            }
        }
    }

    fn decode_payload(kind: u8, body: &[u8], pos: &mut usize, offset: u64) -> Result<Self, WalError> {
        match kind {
            OP_ADD_TAG | OP_REM_TAG => {
                let ttype = get_str(body, pos, offset)?;
                let val = get_str(body, pos, offset)?;
                Ok(if kind == OP_ADD_TAG {
                    TxOp::AddTag { ttype, val }
                } else {
                    TxOp::RemTag { ttype, val }
                })
            }
            OP_LINK | OP_UNLINK => {
                let a = (get_str(body, pos, offset)?, get_str(body, pos, offset)?);
                let b = (get_str(body, pos, offset)?, get_str(body, pos, offset)?);
                Ok(if kind == OP_LINK {
                    TxOp::Link { a, b }
                } else {
                    TxOp::Unlink { a, b }
                })
            }
            OP_DECLARE_TTYPE | OP_DROP_TTYPE => {
                let ttype = get_str(body, pos, offset)?;
                Ok(if kind == OP_DECLARE_TTYPE {
                    TxOp::DeclareTtype { ttype }
                } else {
                    TxOp::DropTtype { ttype }
                })
            }
            other => Err(WalError::Corrupt {
                offset,
                reason: format!("unknown op kind {}", other),
            }),
        }
    }
}

impl WalRecord {
    fn record_type(&self) -> u8 {
        match self {
            WalRecord::TxBegin { .. } => RT_TXBEGIN,
            WalRecord::TxOp { .. } => RT_TXOP,
            WalRecord::TxCommit { .. } => RT_TXCOMMIT,
        }
    }

    /// Encode as a framed record.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        match self {
            WalRecord::TxBegin {
                txid,
                parent_rev,
                ts_ms,
            } => {
                body.extend_from_slice(&txid.to_le_bytes());
                body.extend_from_slice(&parent_rev.to_le_bytes());
                body.extend_from_slice(&ts_ms.to_le_bytes());
            }
            WalRecord::TxOp { txid, index, op } => {
                body.extend_from_slice(&txid.to_le_bytes());
                body.extend_from_slice(&index.to_le_bytes());
                body.push(op.kind());
                op.encode_payload(&mut body);
            }
            WalRecord::TxCommit { txid, new_rev } => {
                body.extend_from_slice(&txid.to_le_bytes());
                body.extend_from_slice(&new_rev.to_le_bytes());
            }
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&WAL_MAGIC.to_le_bytes());
        frame.push(self.record_type());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    fn decode_body(rtype: u8, body: &[u8], offset: u64) -> Result<Self, WalError> {
        let mut pos = 0usize;
        let record = match rtype {
            RT_TXBEGIN => WalRecord::TxBegin {
                txid: get_u64(body, &mut pos, offset)?,
                parent_rev: get_u64(body, &mut pos, offset)?,
                ts_ms: get_u64(body, &mut pos, offset)?,
            },
            RT_TXOP => {
                let txid = get_u64(body, &mut pos, offset)?;
                let index = get_u32(body, &mut pos, offset)?;
                if pos >= body.len() {
                    return Err(WalError::Corrupt {
                        offset,
                        reason: "missing op kind".into(),
                    });
                }
                let kind = body[pos];
                pos += 1;
                let op = TxOp::decode_payload(kind, body, &mut pos, offset)?;
                WalRecord::TxOp { txid, index, op }
            }
            RT_TXCOMMIT => WalRecord::TxCommit {
                txid: get_u64(body, &mut pos, offset)?,
                new_rev: get_u64(body, &mut pos, offset)?,
            },
            other => {
                return Err(WalError::Corrupt {
                    offset,
                    reason: format!("unknown record type {}", other),
                })
            }
        };
        Ok(record)
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal-{:06}.log", seq))
}

/// List WAL segments in `dir`, ascending by sequence number.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(WalError::io(Some(dir.to_path_buf()), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| WalError::io(Some(dir.to_path_buf()), e))?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(seq) = name
                .strip_prefix("wal-")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                out.push((seq, entry.path()));
            }
        }
    }
    out.sort_unstable_by_key(|(seq, _)| *seq);
    Ok(out)
}

/// Remove WAL segments with a sequence number strictly below `keep_from`.
pub fn remove_segments_before(dir: &Path, keep_from: u64) -> Result<usize, WalError> {
    let mut removed = 0;
    for (seq, path) in list_segments(dir)? {
        if seq < keep_from {
            std::fs::remove_file(&path).map_err(|e| WalError::io(Some(path.clone()), e))?;
            debug!("truncated wal segment {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

/// Result of scanning the log: decoded records plus the location of a torn
/// trailing record, if the final segment ended mid-write.
#[derive(Debug)]
pub struct ScanOutcome {
    pub records: Vec<WalRecord>,
    /// `(segment path, byte offset of the torn record)`; recovery truncates
    /// the segment here so later appends start from a clean tail.
    pub torn_tail: Option<(PathBuf, u64)>,
}

/// Scan all segments starting at `from_seq` and decode records in order.
///
/// A truncated record at the tail of the last segment is treated as
/// end-of-log and reported for repair. A truncated record followed by more
/// segments, or a checksum mismatch on a fully-present record, is fatal
/// corruption.
pub fn scan_records(dir: &Path, from_seq: u64) -> Result<ScanOutcome, WalError> {
    let mut records = Vec::new();
    let segments: Vec<(u64, PathBuf)> = list_segments(dir)?
        .into_iter()
        .filter(|(seq, _)| *seq >= from_seq)
        .collect();
    let last_index = segments.len().saturating_sub(1);

    for (index, (_, path)) in segments.iter().enumerate() {
        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| WalError::io(Some(path.clone()), e))?;

        let mut offset = 0usize;
        while offset < bytes.len() {
            let torn = |reason: &str| -> Result<ScanOutcome, WalError> {
                if index == last_index {
                    warn!(
                        "wal {}: {} at offset {}, treating as end of log",
                        path.display(),
                        reason,
                        offset
                    );
                    Ok(ScanOutcome {
                        records: Vec::new(),
                        torn_tail: Some((path.clone(), offset as u64)),
                    })
                } else {
                    Err(WalError::Corrupt {
                        offset: offset as u64,
                        reason: format!("{} before the final segment", reason),
                    })
                }
            };

            if offset + FRAME_HEADER_LEN > bytes.len() {
                let mut outcome = torn("truncated frame header")?;
                outcome.records = records;
                return Ok(outcome);
            }
            let header = &bytes[offset..offset + FRAME_HEADER_LEN];
            let magic = u32::from_le_bytes(header[0..4].try_into().expect("length checked"));
            if magic != WAL_MAGIC {
                return Err(WalError::Corrupt {
                    offset: offset as u64,
                    reason: format!("bad magic {:#010x}", magic),
                });
            }
            let rtype = header[4];
            let body_len =
                u32::from_le_bytes(header[5..9].try_into().expect("length checked")) as usize;
            if body_len > MAX_RECORD_BYTES {
                return Err(WalError::Corrupt {
                    offset: offset as u64,
                    reason: format!("record body {} exceeds cap", body_len),
                });
            }
            let expected_crc =
                u32::from_le_bytes(header[9..13].try_into().expect("length checked"));
            let body_start = offset + FRAME_HEADER_LEN;
            if body_start + body_len > bytes.len() {
                let mut outcome = torn("truncated record body")?;
                outcome.records = records;
                return Ok(outcome);
            }
            let body = &bytes[body_start..body_start + body_len];
            let actual_crc = crc32c::crc32c(body);
            if actual_crc != expected_crc {
                return Err(WalError::Corrupt {
                    offset: offset as u64,
                    reason: format!(
                        "crc mismatch: expected {:#010x}, got {:#010x}",
                        expected_crc, actual_crc
                    ),
                });
            }
            records.push(WalRecord::decode_body(rtype, body, offset as u64)?);
            offset = body_start + body_len;
        }
    }
    Ok(ScanOutcome {
        records,
        torn_tail: None,
    })
}

struct WalInner {
    buffer: Vec<u8>,
    writer: Option<BufWriter<File>>,
    seg_seq: u64,
    seg_bytes: u64,
}

/// Append-only segmented WAL with a buffered write path.
pub struct Wal {
    dir: PathBuf,
    inner: Mutex<WalInner>,
    flush_cond: Condvar,
    shutdown: AtomicBool,
    flush_interval_ms: u64,
    /// Total bytes appended since open; the snapshotter uses this to decide
    /// when a checkpoint is worthwhile.
    bytes_appended: AtomicU64,
}

impl Wal {
    /// Open the WAL for appending, starting a fresh segment after the
    /// highest existing one.
    pub fn open(dir: &Path, flush_interval_ms: u64) -> Result<Self, WalError> {
        create_dir_all(dir).map_err(|e| WalError::io(Some(dir.to_path_buf()), e))?;
        let next_seq = list_segments(dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);
        let wal = Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(WalInner {
                buffer: Vec::new(),
                writer: None,
                seg_seq: next_seq,
                seg_bytes: 0,
            }),
            flush_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            flush_interval_ms,
            bytes_appended: AtomicU64::new(0),
        };
        wal.inner.lock().writer = Some(wal.open_segment(next_seq)?);
        debug!("wal open: segment {} in {}", next_seq, dir.display());
        Ok(wal)
    }

    fn open_segment(&self, seq: u64) -> Result<BufWriter<File>, WalError> {
        let path = segment_path(&self.dir, seq);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| WalError::io(Some(path), e))?;
        Ok(BufWriter::new(file))
    }

    pub fn current_seq(&self) -> u64 {
        self.inner.lock().seg_seq
    }

    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended.load(Ordering::Relaxed)
    }

    /// Append a record group to the flush buffer. Called under the commit
    /// writer lock so groups are never interleaved.
    pub fn append_group(&self, records: &[WalRecord]) -> Result<(), WalError> {
        let mut encoded = Vec::with_capacity(records.len() * 64);
        for record in records {
            encoded.extend_from_slice(&record.encode());
        }
        let mut inner = self.inner.lock();
        inner.buffer.extend_from_slice(&encoded);
        self.bytes_appended
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        if inner.buffer.len() >= FLUSH_BUFFER_BYTES {
            self.flush_cond.notify_one();
        }
        Ok(())
    }

    /// Drain the buffer to the current segment and fsync.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        if !inner.buffer.is_empty() {
            if inner.seg_bytes > 0
                && inner.seg_bytes + inner.buffer.len() as u64 > MAX_SEGMENT_BYTES
            {
                self.rotate_locked(inner)?;
            }
            let buffer = std::mem::take(&mut inner.buffer);
            let writer = inner
                .writer
                .as_mut()
                .expect("wal writer present after open");
            writer
                .write_all(&buffer)
                .map_err(|e| WalError::io(None, e))?;
            inner.seg_bytes += buffer.len() as u64;
        }
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush().map_err(|e| WalError::io(None, e))?;
            writer
                .get_mut()
                .sync_data()
                .map_err(|e| WalError::io(None, e))?;
        }
        Ok(())
    }

    fn rotate_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        if let Some(mut old) = inner.writer.take() {
            old.flush().map_err(|e| WalError::io(None, e))?;
            old.get_mut()
                .sync_data()
                .map_err(|e| WalError::io(None, e))?;
        }
        inner.seg_seq += 1;
        inner.seg_bytes = 0;
        inner.writer = Some(self.open_segment(inner.seg_seq)?);
        debug!("wal rotated to segment {}", inner.seg_seq);
        Ok(())
    }

    /// Flush everything buffered and start a fresh segment. Returns the new
    /// segment sequence; used by checkpointing so older segments become
    /// removable once a snapshot covering them is durable.
    pub fn rotate(&self) -> Result<u64, WalError> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        self.rotate_locked(&mut inner)?;
        Ok(inner.seg_seq)
    }

    /// Background flusher loop; runs until [`Wal::shutdown`] is called.
    pub fn run_flusher(&self) {
        let interval = Duration::from_millis(self.flush_interval_ms.max(1));
        loop {
            let mut inner = self.inner.lock();
            if self.shutdown.load(Ordering::Acquire) && inner.buffer.is_empty() {
                break;
            }
            self.flush_cond.wait_for(&mut inner, interval);
            if let Err(e) = self.flush_locked(&mut inner) {
                warn!("wal flush failed: {}", e);
            }
        }
        debug!("wal flusher stopped");
    }

    /// Signal the flusher to drain and exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.flush_cond.notify_all();
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("segment", &self.current_seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let records = vec![
            WalRecord::TxBegin {
                txid: 1,
                parent_rev: 0,
                ts_ms: 1_700_000_000_000,
            },
            WalRecord::TxOp {
                txid: 1,
                index: 0,
                op: TxOp::AddTag {
                    ttype: "person".into(),
                    val: "ada".into(),
                },
            },
            WalRecord::TxOp {
                txid: 1,
                index: 1,
                op: TxOp::Link {
                    a: ("person".into(), "ada".into()),
                    b: ("rel".into(), "speaks".into()),
                },
            },
            WalRecord::TxCommit { txid: 1, new_rev: 1 },
        ];
        for record in &records {
            let frame = record.encode();
            let body_len =
                u32::from_le_bytes(frame[5..9].try_into().unwrap()) as usize;
            let decoded =
                WalRecord::decode_body(frame[4], &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len], 0)
                    .unwrap();
            assert_eq!(&decoded, record);
        }
    }

    #[test]
    fn test_crc_detects_flip() {
        let record = WalRecord::TxCommit { txid: 9, new_rev: 4 };
        let mut frame = record.encode();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let body_len = u32::from_le_bytes(frame[5..9].try_into().unwrap()) as usize;
        let body = &frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len];
        let expected = u32::from_le_bytes(frame[9..13].try_into().unwrap());
        assert_ne!(crc32c::crc32c(body), expected);
    }

    #[test]
    fn test_scan_stops_at_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path(), 200).unwrap();
        wal.append_group(&[
            WalRecord::TxBegin {
                txid: 1,
                parent_rev: 0,
                ts_ms: 0,
            },
            WalRecord::TxCommit { txid: 1, new_rev: 1 },
        ])
        .unwrap();
        wal.sync().unwrap();

        // Append a torn record by hand.
        let path = segment_path(dir.path(), wal.current_seq());
        let mut bytes = std::fs::read(&path).unwrap();
        let torn = WalRecord::TxCommit { txid: 2, new_rev: 2 }.encode();
        bytes.extend_from_slice(&torn[..torn.len() - 4]);
        std::fs::write(&path, bytes).unwrap();

        let outcome = scan_records(dir.path(), 1).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert!(matches!(outcome.records[1], WalRecord::TxCommit { txid: 1, .. }));
        assert!(outcome.torn_tail.is_some());
    }

    #[test]
    fn test_scan_rejects_mid_log_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path(), 200).unwrap();
        wal.append_group(&[WalRecord::TxCommit { txid: 1, new_rev: 1 }])
            .unwrap();
        wal.append_group(&[WalRecord::TxCommit { txid: 2, new_rev: 2 }])
            .unwrap();
        wal.sync().unwrap();

        let path = segment_path(dir.path(), wal.current_seq());
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte inside the first record's body.
        bytes[FRAME_HEADER_LEN] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = scan_records(dir.path(), 1).unwrap_err();
        assert!(matches!(err, WalError::Corrupt { offset: 0, .. }));
    }
}
