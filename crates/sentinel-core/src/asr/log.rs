//! Append-only segment log for audit records.
//!
//! Records are stored as JSON lines in numbered segment files
//! (`segment-000000.log`, `segment-000001.log`, ...). The active segment
//! holds an advisory exclusive lock so two processes cannot interleave
//! writes. Every append is synced before returning; durability of a
//! record never waits on batching or anchoring.
//!
//! Mutex poisoning indicates a panic in another thread, which is unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::AgentStateRecord;

/// Size threshold at which the active segment rotates.
const SEGMENT_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Filename of the compacted index.
const INDEX_FILE: &str = "index.json";

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error on a segment or index file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record failed to parse.
    #[error("corrupt record in {segment}: {source}")]
    Corrupt {
        /// The segment containing the bad line.
        segment: String,
        /// Parse failure.
        source: serde_json::Error,
    },

    /// Record serialization failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A record with this id already exists.
    #[error("duplicate record id: {asr_id}")]
    DuplicateId {
        /// The colliding id.
        asr_id: String,
    },

    /// Another writer holds the active segment.
    #[error("active segment is locked by another writer: {path}")]
    Locked {
        /// The locked segment path.
        path: String,
    },
}

/// Compacted index over the closed segments.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LogIndex {
    /// Per-segment record counts, in segment order.
    segments: Vec<SegmentEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentEntry {
    file: String,
    records: u64,
}

struct ActiveSegment {
    index: u64,
    file: File,
    bytes: u64,
    records: u64,
}

/// Single-writer append-only record log.
pub struct SegmentLog {
    dir: PathBuf,
    active: Mutex<ActiveSegment>,
    seen: Mutex<HashSet<String>>,
}

impl SegmentLog {
    /// Opens the log in `dir`, creating it if needed, and takes the
    /// writer lock on the active segment.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Locked`] if another writer holds the active
    /// segment, or an I/O error.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut seen = HashSet::new();
        let mut highest = 0u64;
        for (index, path) in segment_files(&dir)? {
            highest = highest.max(index);
            for record in read_segment(&path)? {
                seen.insert(record.asr_id);
            }
        }

        let path = segment_path(&dir, highest);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| LogError::Locked {
            path: path.display().to_string(),
        })?;
        let bytes = file.metadata()?.len();

        Ok(Self {
            dir,
            active: Mutex::new(ActiveSegment {
                index: highest,
                file,
                bytes,
                records: 0,
            }),
            seen: Mutex::new(seen),
        })
    }

    /// Appends a record durably: the line is written and synced before
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::DuplicateId`] if the id is already present,
    /// or an I/O error.
    pub fn append(&self, record: &AgentStateRecord) -> Result<(), LogError> {
        {
            let mut seen = self.seen.lock().expect("log id set lock");
            if !seen.insert(record.asr_id.clone()) {
                return Err(LogError::DuplicateId {
                    asr_id: record.asr_id.clone(),
                });
            }
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut active = self.active.lock().expect("log writer lock");
        active.file.write_all(&line)?;
        active.file.sync_data()?;
        active.bytes += line.len() as u64;
        active.records += 1;

        if active.bytes >= SEGMENT_MAX_BYTES {
            self.rotate(&mut active)?;
        }
        Ok(())
    }

    /// Reads every record across all segments, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be read or parsed.
    pub fn read_all(&self) -> Result<Vec<AgentStateRecord>, LogError> {
        // Hold the writer lock so a rotation cannot race the scan.
        let _active = self.active.lock().expect("log writer lock");
        let mut records = Vec::new();
        for (_, path) in segment_files(&self.dir)? {
            records.extend(read_segment(&path)?);
        }
        Ok(records)
    }

    /// Number of records appended since open plus those found at open.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.seen.lock().expect("log id set lock").len()
    }

    fn rotate(&self, active: &mut ActiveSegment) -> Result<(), LogError> {
        let closed_index = active.index;
        let closed_records = active.records;

        let next_index = active.index + 1;
        let path = segment_path(&self.dir, next_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| LogError::Locked {
            path: path.display().to_string(),
        })?;

        // The previous segment unlocks when its handle drops.
        active.file = file;
        active.index = next_index;
        active.bytes = 0;
        active.records = 0;

        self.compact_index(closed_index, closed_records)?;
        tracing::debug!(segment = next_index, "rotated audit segment");
        Ok(())
    }

    /// Rewrites the compacted index to cover all closed segments.
    fn compact_index(&self, closed_index: u64, closed_records: u64) -> Result<(), LogError> {
        let index_path = self.dir.join(INDEX_FILE);
        let mut index: LogIndex = if index_path.exists() {
            serde_json::from_str(&fs::read_to_string(&index_path)?)?
        } else {
            LogIndex::default()
        };

        index.segments.push(SegmentEntry {
            file: format!("segment-{closed_index:06}.log"),
            records: closed_records,
        });
        fs::write(&index_path, serde_json::to_string_pretty(&index)?)?;
        Ok(())
    }
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("segment-{index:06}.log"))
}

fn segment_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, LogError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some(index) = name
            .strip_prefix("segment-")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|digits| digits.parse::<u64>().ok())
        {
            out.push((index, path));
        }
    }
    out.sort_by_key(|(index, _)| *index);
    Ok(out)
}

fn read_segment(path: &Path) -> Result<Vec<AgentStateRecord>, LogError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record =
            serde_json::from_str(&line).map_err(|source| LogError::Corrupt {
                segment: path.display().to_string(),
                source,
            })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::super::metadata::Metadata;
    use super::super::record::{ActionKind, PqcStatusKind, ThreatLevel};
    use super::*;
    use crate::identity::AgentId;

    fn record(id: &str) -> AgentStateRecord {
        AgentStateRecord::build(
            format!("asr_{id:0>32}"),
            "2026-08-02T10:15:30.123Z".into(),
            AgentId::parse("0x00a329c0648769a73afac7f9381e08fb43dbea72").unwrap(),
            ActionKind::Authenticate,
            ThreatLevel::Info,
            PqcStatusKind::Safe,
            Metadata::new(),
        )
    }

    #[test]
    fn append_and_read_back() {
        let temp = TempDir::new().unwrap();
        let log = SegmentLog::open(temp.path()).unwrap();

        log.append(&record("1")).unwrap();
        log.append(&record("2")).unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(AgentStateRecord::verify_signature));
    }

    #[test]
    fn duplicate_id_rejected() {
        let temp = TempDir::new().unwrap();
        let log = SegmentLog::open(temp.path()).unwrap();

        log.append(&record("1")).unwrap();
        let err = log.append(&record("1")).unwrap_err();
        assert!(matches!(err, LogError::DuplicateId { .. }));
    }

    #[test]
    fn reopen_preserves_records_and_dedup() {
        let temp = TempDir::new().unwrap();
        {
            let log = SegmentLog::open(temp.path()).unwrap();
            log.append(&record("1")).unwrap();
        }

        let log = SegmentLog::open(temp.path()).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 1);
        assert!(matches!(
            log.append(&record("1")),
            Err(LogError::DuplicateId { .. })
        ));
        log.append(&record("2")).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 2);
    }

    #[test]
    fn records_persist_in_append_order() {
        let temp = TempDir::new().unwrap();
        let log = SegmentLog::open(temp.path()).unwrap();
        for i in 0..10 {
            log.append(&record(&i.to_string())).unwrap();
        }
        let records = log.read_all().unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.asr_id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "zero-padded ids append in sorted order");
    }
}
