//! Out-of-order cycle completion tracking.
//!
//! Asynchronous execution completes cycles in arbitrary order, so a plain
//! "highest contiguous cycle" counter would stall behind a single slow
//! straggler. Instead each fixed-width segment of the cycle range is tracked
//! as a bit-packed segment tree: leaves record individual completions and
//! every internal bit is set iff all of its descendants are, which keeps
//! "whole segment done" a single top-bit test while marks cost at most one
//! walk up the tree. Updates are lock-free compare-and-swap loops so any
//! completion thread may mark without coordination.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, error};

use crate::errors::TrackerError;
use crate::progress::{CompletionLog, SegmentRecord};

/// Leaves in a single-word segment image.
pub const SEGMENT_WIDTH: usize = 32;
/// Leaves in the two-level wide tracker.
pub const WIDE_WIDTH: usize = 1024;

/// Outcome of one mark operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkOutcome {
    /// False when the index was already marked (idempotent re-mark).
    pub newly_marked: bool,
    /// True for exactly the mark that filled the whole segment.
    pub completed_segment: bool,
}

/// A 32-leaf completion bitmap packed into one word as an implicit binary
/// heap: the root lives at bit 1, node `i` has children `2i` and `2i+1`, and
/// the leaves occupy bits 32..64. Bit 0 is unused.
pub struct SegmentImage {
    image: AtomicU64,
}

const TOP_BIT: u64 = 1 << 1;

impl SegmentImage {
    pub fn new() -> Self {
        Self {
            image: AtomicU64::new(0),
        }
    }

    /// Marks leaf `index` complete and propagates internal bits upward while
    /// the sibling at each level is already set. Lock-free; concurrent marks
    /// retry on CAS conflict against a fresh snapshot.
    pub fn mark(&self, index: usize) -> Result<MarkOutcome, TrackerError> {
        if index >= SEGMENT_WIDTH {
            return Err(TrackerError::IndexOutOfRange {
                index,
                width: SEGMENT_WIDTH,
            });
        }
        let leaf = (SEGMENT_WIDTH + index) as u32;
        loop {
            let current = self.image.load(Ordering::Acquire);
            if current & (1 << leaf) != 0 {
                return Ok(MarkOutcome {
                    newly_marked: false,
                    completed_segment: false,
                });
            }
            let mut next = current | (1 << leaf);
            let mut node = leaf;
            while node > 1 {
                let sibling = node ^ 1;
                if next & (1 << sibling) == 0 {
                    break;
                }
                node >>= 1;
                next |= 1 << node;
            }
            if self
                .image
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(MarkOutcome {
                    newly_marked: true,
                    completed_segment: next & TOP_BIT != 0 && current & TOP_BIT == 0,
                });
            }
        }
    }

    /// Whether every leaf is marked: a single test of the root bit.
    pub fn is_complete(&self) -> bool {
        self.image.load(Ordering::Acquire) & TOP_BIT != 0
    }

    pub fn is_marked(&self, index: usize) -> bool {
        index < SEGMENT_WIDTH
            && self.image.load(Ordering::Acquire) & (1 << (SEGMENT_WIDTH + index)) != 0
    }

    /// Leaf bits as the low 32 bits of a word, leaf 0 at bit 0.
    pub fn leaf_mask(&self) -> u64 {
        self.image.load(Ordering::Acquire) >> SEGMENT_WIDTH
    }

    pub fn lowest(&self) -> Option<usize> {
        let mask = self.leaf_mask();
        (mask != 0).then(|| mask.trailing_zeros() as usize)
    }

    pub fn highest(&self) -> Option<usize> {
        let mask = self.leaf_mask();
        (mask != 0).then(|| 63 - mask.leading_zeros() as usize)
    }

    pub fn total(&self) -> usize {
        self.leaf_mask().count_ones() as usize
    }

    /// Number of leading leaves (from index 0) that are all marked.
    pub fn contiguous_prefix(&self) -> usize {
        ((!self.leaf_mask()).trailing_zeros() as usize).min(SEGMENT_WIDTH)
    }
}

impl Default for SegmentImage {
    fn default() -> Self {
        Self::new()
    }
}

/// A 1024-leaf tracker built from 32 [`SegmentImage`] children plus one
/// summary image whose leaf `j` is set when child `j` fills. Full completion
/// therefore stays a single top-bit test on the summary.
pub struct WideTracker {
    children: [SegmentImage; SEGMENT_WIDTH],
    summary: SegmentImage,
}

impl WideTracker {
    pub fn new() -> Self {
        Self {
            children: std::array::from_fn(|_| SegmentImage::new()),
            summary: SegmentImage::new(),
        }
    }

    pub fn mark(&self, index: usize) -> Result<MarkOutcome, TrackerError> {
        if index >= WIDE_WIDTH {
            return Err(TrackerError::IndexOutOfRange {
                index,
                width: WIDE_WIDTH,
            });
        }
        let child = index / SEGMENT_WIDTH;
        let outcome = self.children[child].mark(index % SEGMENT_WIDTH)?;
        let mut completed_segment = false;
        if outcome.completed_segment {
            completed_segment = self.summary.mark(child)?.completed_segment;
        }
        Ok(MarkOutcome {
            newly_marked: outcome.newly_marked,
            completed_segment,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.summary.is_complete()
    }

    pub fn is_marked(&self, index: usize) -> bool {
        index < WIDE_WIDTH
            && self.children[index / SEGMENT_WIDTH].is_marked(index % SEGMENT_WIDTH)
    }

    pub fn lowest(&self) -> Option<usize> {
        self.children
            .iter()
            .enumerate()
            .find_map(|(i, child)| child.lowest().map(|low| i * SEGMENT_WIDTH + low))
    }

    pub fn highest(&self) -> Option<usize> {
        self.children
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, child)| child.highest().map(|high| i * SEGMENT_WIDTH + high))
    }

    pub fn total(&self) -> usize {
        self.children.iter().map(SegmentImage::total).sum()
    }

    pub fn contiguous_prefix(&self) -> usize {
        let mut prefix = 0;
        for child in &self.children {
            let part = child.contiguous_prefix();
            prefix += part;
            if part < SEGMENT_WIDTH {
                break;
            }
        }
        prefix
    }
}

impl Default for WideTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Segment width selection for the activity-level tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerWidth {
    Narrow,
    Wide,
}

impl TrackerWidth {
    pub fn width(self) -> usize {
        match self {
            Self::Narrow => SEGMENT_WIDTH,
            Self::Wide => WIDE_WIDTH,
        }
    }
}

impl Default for TrackerWidth {
    fn default() -> Self {
        Self::Narrow
    }
}

enum SegmentBits {
    Narrow(SegmentImage),
    Wide(WideTracker),
}

struct Segment {
    bits: SegmentBits,
}

impl Segment {
    fn new(width: TrackerWidth) -> Self {
        let bits = match width {
            TrackerWidth::Narrow => SegmentBits::Narrow(SegmentImage::new()),
            TrackerWidth::Wide => SegmentBits::Wide(WideTracker::new()),
        };
        Self { bits }
    }

    fn mark(&self, index: usize) -> Result<MarkOutcome, TrackerError> {
        match &self.bits {
            SegmentBits::Narrow(image) => image.mark(index),
            SegmentBits::Wide(wide) => wide.mark(index),
        }
    }

    fn is_marked(&self, index: usize) -> bool {
        match &self.bits {
            SegmentBits::Narrow(image) => image.is_marked(index),
            SegmentBits::Wide(wide) => wide.is_marked(index),
        }
    }

    fn contiguous_prefix(&self) -> usize {
        match &self.bits {
            SegmentBits::Narrow(image) => image.contiguous_prefix(),
            SegmentBits::Wide(wide) => wide.contiguous_prefix(),
        }
    }

    /// Leaf bits packed into 64-bit words, leaf 0 at word 0 bit 0.
    fn leaf_words(&self) -> Vec<u64> {
        match &self.bits {
            SegmentBits::Narrow(image) => vec![image.leaf_mask()],
            SegmentBits::Wide(wide) => wide
                .children
                .chunks(2)
                .map(|pair| pair[0].leaf_mask() | (pair[1].leaf_mask() << 32))
                .collect(),
        }
    }
}

struct TrackerState {
    live: BTreeMap<u64, Arc<Segment>>,
    retired: BTreeSet<u64>,
    /// Count of contiguous retired segments starting from segment 0.
    retired_contig: u64,
}

/// Tracks completion of cycles across `[start, end)`, materializing one
/// bit-packed segment at a time and retiring each to the completion log as
/// it fills.
pub struct CompletionTracker {
    start: u64,
    end: u64,
    width: TrackerWidth,
    state: Mutex<TrackerState>,
    total: AtomicU64,
    /// Highest marked cycle plus one; zero means nothing marked yet.
    highest: AtomicU64,
    log: Option<CompletionLog>,
}

impl CompletionTracker {
    pub fn new(start: u64, end: u64, width: TrackerWidth, log: Option<CompletionLog>) -> Self {
        Self {
            start,
            end,
            width,
            state: Mutex::new(TrackerState {
                live: BTreeMap::new(),
                retired: BTreeSet::new(),
                retired_contig: 0,
            }),
            total: AtomicU64::new(0),
            highest: AtomicU64::new(0),
            log,
        }
    }

    /// Records completion of one cycle. Idempotent for re-marks; marking a
    /// cycle outside `[start, end)` is a fatal input error.
    pub fn mark_complete(&self, cycle: u64) -> Result<(), TrackerError> {
        if cycle < self.start || cycle >= self.end {
            return Err(TrackerError::CycleOutOfRange {
                cycle,
                start: self.start,
                end: self.end,
            });
        }
        let width = self.width.width() as u64;
        let seg_index = (cycle - self.start) / width;
        let offset = ((cycle - self.start) % width) as usize;

        let segment = {
            let mut state = self.state.lock().unwrap();
            if state.retired.contains(&seg_index) || seg_index < state.retired_contig {
                return Ok(());
            }
            match state.live.get(&seg_index) {
                Some(segment) => Arc::clone(segment),
                None => {
                    let segment = Arc::new(self.materialize(seg_index));
                    state.live.insert(seg_index, Arc::clone(&segment));
                    segment
                }
            }
        };

        let outcome = segment.mark(offset)?;
        if outcome.newly_marked {
            self.total.fetch_add(1, Ordering::Relaxed);
            self.highest.fetch_max(cycle + 1, Ordering::Relaxed);
        }
        if outcome.completed_segment {
            self.retire(seg_index, &segment);
        }
        Ok(())
    }

    fn materialize(&self, seg_index: u64) -> Segment {
        let segment = Segment::new(self.width);
        let width = self.width.width() as u64;
        let base = self.start + seg_index * width;
        // The tail segment may extend past the end of the cycle range;
        // pre-mark the padding so top-bit completion still fires.
        for pad in self.end.saturating_sub(base)..width {
            segment
                .mark(pad as usize)
                .expect("padding index within segment width");
        }
        segment
    }

    fn retire(&self, seg_index: u64, segment: &Segment) {
        let width = self.width.width() as u64;
        let base = self.start + seg_index * width;
        let mut state = self.state.lock().unwrap();
        state.live.remove(&seg_index);
        state.retired.insert(seg_index);
        loop {
            let contig = state.retired_contig;
            if !state.retired.remove(&contig) {
                break;
            }
            state.retired_contig += 1;
        }
        debug!(segment = seg_index, base, "segment complete");
        if let Some(log) = &self.log {
            let record = SegmentRecord {
                base,
                width: self.width.width() as u32,
                bitmap: segment.leaf_words(),
            };
            if let Err(err) = log.append(&record) {
                // Progress persistence is advisory; the run itself goes on.
                error!(segment = seg_index, error = %err, "failed to append completion record");
            }
        }
    }

    pub fn is_complete(&self, cycle: u64) -> bool {
        if cycle < self.start || cycle >= self.end {
            return false;
        }
        let width = self.width.width() as u64;
        let seg_index = (cycle - self.start) / width;
        let offset = ((cycle - self.start) % width) as usize;
        let state = self.state.lock().unwrap();
        if seg_index < state.retired_contig || state.retired.contains(&seg_index) {
            return true;
        }
        state
            .live
            .get(&seg_index)
            .is_some_and(|segment| segment.is_marked(offset))
    }

    /// Total cycles marked complete so far (padding excluded).
    pub fn total_complete(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Highest cycle marked complete, if any.
    pub fn highest_complete(&self) -> Option<u64> {
        match self.highest.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n - 1),
        }
    }

    /// First cycle not yet known complete; every cycle below it is done.
    /// Equals `end` once the whole range has completed.
    pub fn low_water_mark(&self) -> u64 {
        let width = self.width.width() as u64;
        let state = self.state.lock().unwrap();
        let base = self.start + state.retired_contig * width;
        let prefix = state
            .live
            .get(&state.retired_contig)
            .map_or(0, |segment| segment.contiguous_prefix() as u64);
        (base + prefix).min(self.end)
    }

    /// Whether every cycle in the tracked range has completed.
    pub fn all_complete(&self) -> bool {
        self.low_water_mark() == self.end
    }

    pub fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }
}
