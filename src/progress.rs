//! Completion persistence and cycle sourcing.
//!
//! Each fully-completed tracker segment is appended to the completion log as
//! one JSON object per line, giving an audit trail and a resume point. The
//! [`CycleSource`] is the shared, strictly-increasing supply of cycle numbers
//! workers draw from; the resuming variant is seeded from a previous run's
//! log and skips segments already recorded complete.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

/// One fully-completed segment: its first cycle, its width, and the raw leaf
/// bitmap packed into 64-bit words (leaf 0 at word 0 bit 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub base: u64,
    pub width: u32,
    pub bitmap: Vec<u64>,
}

impl SegmentRecord {
    /// The cycle range this record covers.
    pub fn range(&self) -> Range<u64> {
        self.base..self.base + u64::from(self.width)
    }
}

/// Append-only writer for segment completion records.
pub struct CompletionLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CompletionLog {
    /// Opens the log for appending, creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Appends one record as a JSON line and flushes it to the OS.
    pub fn append(&self, record: &SegmentRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&line)?;
        writer.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record from a log written by a previous run. A missing
    /// file yields an empty list, so first runs need no special casing.
    pub fn read(path: impl AsRef<Path>) -> std::io::Result<Vec<SegmentRecord>> {
        let file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: SegmentRecord = serde_json::from_str(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            records.push(record);
        }
        Ok(records)
    }
}

enum Source {
    /// Fresh run: a single fetch-and-add is the only contention point.
    Counter { next: AtomicU64, end: u64 },
    /// Resumed run: remaining ranges after removing completed segments.
    Ranges(Mutex<VecDeque<Range<u64>>>),
}

/// Shared, strictly-increasing source of cycle numbers, drawn in strides.
/// Every cycle in `[start, end)` is handed out exactly once.
pub struct CycleSource {
    source: Source,
}

impl CycleSource {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            source: Source::Counter {
                next: AtomicU64::new(start),
                end,
            },
        }
    }

    /// A source over `[start, end)` that skips the ranges covered by the
    /// given completion records from an earlier run.
    pub fn resuming(start: u64, end: u64, completed: &[SegmentRecord]) -> Self {
        let mut skips: Vec<Range<u64>> = completed.iter().map(SegmentRecord::range).collect();
        skips.sort_by_key(|r| r.start);
        let mut remaining = VecDeque::new();
        let mut cursor = start;
        for skip in skips {
            if skip.start > cursor {
                remaining.push_back(cursor..skip.start.min(end));
            }
            cursor = cursor.max(skip.end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            remaining.push_back(cursor..end);
        }
        let skipped = (end - start) - remaining.iter().map(|r| r.end - r.start).sum::<u64>();
        info!(start, end, skipped, "cycle source resumed from completion log");
        Self {
            source: Source::Ranges(Mutex::new(remaining)),
        }
    }

    /// Draws the next stride of up to `stride` consecutive cycles. Returns
    /// `None` once the source is exhausted.
    pub fn next_stride(&self, stride: u64) -> Option<Range<u64>> {
        let stride = stride.max(1);
        match &self.source {
            Source::Counter { next, end } => {
                let first = next.fetch_add(stride, Ordering::Relaxed);
                if first >= *end {
                    None
                } else {
                    Some(first..(first + stride).min(*end))
                }
            }
            Source::Ranges(ranges) => {
                let mut ranges = ranges.lock().unwrap();
                let front = ranges.front_mut()?;
                let first = front.start;
                let last = (first + stride).min(front.end);
                front.start = last;
                if front.is_empty() {
                    ranges.pop_front();
                }
                Some(first..last)
            }
        }
    }

    /// Cycles not yet drawn. Approximate once draws begin; exact before.
    pub fn remaining(&self) -> u64 {
        match &self.source {
            Source::Counter { next, end } => end.saturating_sub(next.load(Ordering::Relaxed)),
            Source::Ranges(ranges) => ranges
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.end - r.start)
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn log_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("completions.jsonl");
        let log = CompletionLog::open(&path).unwrap();
        let records = vec![
            SegmentRecord {
                base: 0,
                width: 32,
                bitmap: vec![u64::from(u32::MAX)],
            },
            SegmentRecord {
                base: 32,
                width: 32,
                bitmap: vec![u64::from(u32::MAX)],
            },
        ];
        for record in &records {
            log.append(record).unwrap();
        }
        drop(log);
        assert_eq!(CompletionLog::read(&path).unwrap(), records);
    }

    #[test]
    fn reading_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.jsonl");
        assert!(CompletionLog::read(path).unwrap().is_empty());
    }

    #[test]
    fn appending_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("completions.jsonl");
        let first = SegmentRecord {
            base: 0,
            width: 32,
            bitmap: vec![1],
        };
        let second = SegmentRecord {
            base: 32,
            width: 32,
            bitmap: vec![2],
        };
        CompletionLog::open(&path).unwrap().append(&first).unwrap();
        CompletionLog::open(&path).unwrap().append(&second).unwrap();
        assert_eq!(CompletionLog::read(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn counter_source_hands_out_each_cycle_once() {
        let source = Arc::new(CycleSource::new(0, 1000));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let source = Arc::clone(&source);
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    while let Some(stride) = source.next_stride(7) {
                        let mut seen = seen.lock().unwrap();
                        for cycle in stride {
                            assert!(seen.insert(cycle), "cycle {cycle} drawn twice");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 1000);
    }

    #[test]
    fn strides_clamp_at_end() {
        let source = CycleSource::new(0, 10);
        assert_eq!(source.next_stride(8), Some(0..8));
        assert_eq!(source.next_stride(8), Some(8..10));
        assert_eq!(source.next_stride(8), None);
    }

    #[test]
    fn resuming_skips_completed_segments() {
        let completed = vec![
            SegmentRecord {
                base: 0,
                width: 32,
                bitmap: vec![u64::from(u32::MAX)],
            },
            SegmentRecord {
                base: 64,
                width: 32,
                bitmap: vec![u64::from(u32::MAX)],
            },
        ];
        let source = CycleSource::resuming(0, 128, &completed);
        assert_eq!(source.remaining(), 64);
        let mut drawn = Vec::new();
        while let Some(stride) = source.next_stride(100) {
            drawn.extend(stride);
        }
        let expected: Vec<u64> = (32..64).chain(96..128).collect();
        assert_eq!(drawn, expected);
    }

    #[test]
    fn resuming_with_no_records_covers_whole_range() {
        let source = CycleSource::resuming(5, 25, &[]);
        assert_eq!(source.remaining(), 20);
        assert_eq!(source.next_stride(100), Some(5..25));
    }
}
