//! Crash-recovery event journal.
//!
//! Append-only, length-prefixed binary frames:
//!
//! ```text
//! [4 bytes: frame_len][8 bytes: seq][8 bytes: timestamp_ns][1 byte: kind]
//! [N bytes: bincode payload][4 bytes: CRC32]
//! ```
//!
//! `frame_len` counts everything after itself (21 + N). The CRC covers
//! seq ‖ timestamp ‖ kind ‖ payload. Segments are named
//! `journal-{start_seq:020}.log` and rolled when the configured size is
//! reached; on open the last segment is scanned and any torn tail is
//! truncated so appends continue from the last durable frame. Replay walks
//! the segments in name order and stops at the first frame that fails its
//! checksum.

use crate::events::ExchangeEvent;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const FRAME_HEADER: usize = 4; // the length prefix itself
const FRAME_FIXED: usize = 8 + 8 + 1 + 4; // seq + ts + kind + crc
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("event payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("event encoding failed: {0}")]
    Encode(String),
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp_ns: u64,
    pub kind: u8,
    pub event: ExchangeEvent,
}

#[derive(Debug)]
struct Writer {
    file: File,
    path: PathBuf,
    written: u64,
    next_seq: u64,
}

// 9.0: single-writer journal. the lock serializes appends and seq assignment;
// readers only ever touch closed bytes.
#[derive(Debug)]
pub struct EventJournal {
    dir: PathBuf,
    segment_bytes: u64,
    fsync: bool,
    writer: Mutex<Writer>,
}

impl EventJournal {
    pub fn open(
        dir: impl Into<PathBuf>,
        segment_bytes: u64,
        fsync: bool,
    ) -> Result<Self, JournalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| JournalError::Io {
            path: dir.clone(),
            source,
        })?;

        let segments = list_segments(&dir)?;
        let writer = match segments.last() {
            Some(path) => reopen_segment(path)?,
            None => new_segment(&dir, 1)?,
        };

        Ok(Self {
            dir,
            segment_bytes,
            fsync,
            writer: Mutex::new(writer),
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.writer.lock().next_seq
    }

    /// Append one event, returning its sequence number. The frame is
    /// flushed (and synced when configured) before this returns; a failure
    /// here is fatal for the caller.
    pub fn append(&self, timestamp: Timestamp, event: &ExchangeEvent) -> Result<u64, JournalError> {
        let payload =
            bincode::serialize(event).map_err(|e| JournalError::Encode(e.to_string()))?;
        if payload.len() > MAX_PAYLOAD {
            return Err(JournalError::PayloadTooLarge(payload.len()));
        }

        let mut writer = self.writer.lock();
        let seq = writer.next_seq;
        let frame = encode_frame(seq, timestamp.as_nanos(), event.kind(), &payload);

        if writer.written + frame.len() as u64 > self.segment_bytes && writer.written > 0 {
            *writer = new_segment(&self.dir, seq)?;
        }

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| JournalError::Io {
                path: path.clone(),
                source,
            }
        };
        writer
            .file
            .write_all(&frame)
            .map_err(io_err(&writer.path))?;
        writer.file.flush().map_err(io_err(&writer.path))?;
        if self.fsync {
            writer.file.sync_data().map_err(io_err(&writer.path))?;
        }
        writer.written += frame.len() as u64;
        writer.next_seq = seq + 1;
        Ok(seq)
    }

    /// Read every durable frame across all segments, in sequence order.
    /// Stops at the first torn or corrupt frame.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>, JournalError> {
        read_dir_entries(&self.dir)
    }
}

/// Standalone replay reader, usable before an [`EventJournal`] writer is
/// opened on the directory.
pub fn read_dir_entries(dir: &Path) -> Result<Vec<JournalEntry>, JournalError> {
    let mut entries = Vec::new();
    for path in list_segments(dir)? {
        let mut bytes = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|source| JournalError::Io {
                path: path.clone(),
                source,
            })?;

        let (decoded, clean) = decode_frames(&bytes);
        let stop = !clean;
        entries.extend(decoded);
        if stop {
            tracing::warn!(segment = %path.display(), "journal segment has a torn tail; replay stops here");
            break;
        }
    }
    Ok(entries)
}

fn encode_frame(seq: u64, ts_ns: u64, kind: u8, payload: &[u8]) -> Vec<u8> {
    let body_len = FRAME_FIXED + payload.len();
    let mut frame = Vec::with_capacity(FRAME_HEADER + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.extend_from_slice(&seq.to_le_bytes());
    frame.extend_from_slice(&ts_ns.to_le_bytes());
    frame.push(kind);
    frame.extend_from_slice(payload);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[FRAME_HEADER..]);
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    frame
}

/// Decode frames from a byte buffer. Returns the entries plus whether the
/// buffer ended cleanly (no torn or corrupt tail).
fn decode_frames(bytes: &[u8]) -> (Vec<JournalEntry>, bool) {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + FRAME_HEADER <= bytes.len() {
        let body_len =
            u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        if body_len < FRAME_FIXED || body_len > FRAME_FIXED + MAX_PAYLOAD {
            return (entries, false);
        }
        let body_start = pos + FRAME_HEADER;
        let body_end = body_start + body_len;
        if body_end > bytes.len() {
            return (entries, false); // torn tail
        }

        let body = &bytes[body_start..body_end];
        let (checked, crc_bytes) = body.split_at(body_len - 4);
        let expected = u32::from_le_bytes(crc_bytes.try_into().expect("4 bytes"));
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(checked);
        if hasher.finalize() != expected {
            return (entries, false);
        }

        let seq = u64::from_le_bytes(checked[0..8].try_into().expect("8 bytes"));
        let ts = u64::from_le_bytes(checked[8..16].try_into().expect("8 bytes"));
        let kind = checked[16];
        let event: ExchangeEvent = match bincode::deserialize(&checked[17..]) {
            Ok(event) => event,
            Err(_) => return (entries, false),
        };
        entries.push(JournalEntry {
            seq,
            timestamp_ns: ts,
            kind,
            event,
        });
        pos = body_end;
    }

    (entries, pos == bytes.len())
}

fn segment_path(dir: &Path, start_seq: u64) -> PathBuf {
    dir.join(format!("journal-{start_seq:020}.log"))
}

fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, JournalError> {
    let mut segments: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| JournalError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("journal-") && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect();
    segments.sort();
    Ok(segments)
}

fn new_segment(dir: &Path, start_seq: u64) -> Result<Writer, JournalError> {
    let path = segment_path(dir, start_seq);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| JournalError::Io {
            path: path.clone(),
            source,
        })?;
    Ok(Writer {
        file,
        path,
        written: 0,
        next_seq: start_seq,
    })
}

/// Open the most recent segment for appending: scan its frames, truncate any
/// torn tail, continue the sequence after the last durable frame.
fn reopen_segment(path: &Path) -> Result<Writer, JournalError> {
    let io_err = |source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut bytes = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(io_err)?;
    let (entries, clean) = decode_frames(&bytes);

    let valid_len = if clean {
        bytes.len() as u64
    } else {
        let mut len = 0u64;
        let mut pos = 0usize;
        for _ in &entries {
            let body_len =
                u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
            len += (FRAME_HEADER + body_len) as u64;
            pos += FRAME_HEADER + body_len;
        }
        len
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(io_err)?;
    if !clean {
        tracing::warn!(segment = %path.display(), "truncating torn journal tail");
        file.set_len(valid_len).map_err(io_err)?;
    }
    file.seek(SeekFrom::End(0)).map_err(io_err)?;

    let start_seq = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("journal-"))
        .and_then(|n| n.strip_suffix(".log"))
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(1);
    let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(start_seq);

    Ok(Writer {
        file,
        path: path.to_path_buf(),
        written: valid_len,
        next_seq,
    })
}
