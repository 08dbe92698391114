//! Heap segments and the index over them.

use crate::error::{HeapError, Result};

/// A contiguous region of heap memory.
///
/// Invariants upheld by [`SegmentIndex`]: segments are sorted by `start`
/// and non-overlapping; `first_object >= start`; `committed_end <= end`.
/// Large-object segments use 8-byte alignment regardless of pointer width;
/// all others use pointer-width alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub committed_end: u64,
    pub first_object: u64,
    pub is_large_object_segment: bool,
}

impl Segment {
    #[inline]
    pub fn length(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Ordered, non-overlapping list of segments with an address→segment
/// lookup that exploits the spatial locality of a heap walk via an MRU
/// hint.
pub struct SegmentIndex {
    segments: Vec<Segment>,
    /// Atomic rather than `Cell` so a `SegmentIndex` can be shared across
    /// the parallel path finder's worker threads; a lost update just costs
    /// one extra wraparound scan, never correctness.
    mru: std::sync::atomic::AtomicUsize,
}

impl SegmentIndex {
    /// Builds an index from an unsorted segment list, validating the
    /// ordering/containment invariants above. Construction-time invariant
    /// violations are fatal — they surface as an error rather than
    /// producing a half-usable index.
    pub fn new(mut segments: Vec<Segment>) -> Result<Self> {
        segments.sort_by_key(|s| s.start);

        for s in &segments {
            if s.first_object < s.start {
                return Err(HeapError::invariant(format!(
                    "segment [{:#x}, {:#x}) has first_object {:#x} before start",
                    s.start, s.end, s.first_object
                )));
            }
            if s.committed_end > s.end {
                return Err(HeapError::invariant(format!(
                    "segment [{:#x}, {:#x}) has committed_end {:#x} past end",
                    s.start, s.end, s.committed_end
                )));
            }
        }
        for pair in segments.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.end > b.start {
                return Err(HeapError::invariant(format!(
                    "segment [{:#x}, {:#x}) overlaps following segment starting at {:#x}",
                    a.start, a.end, b.start
                )));
            }
        }

        Ok(SegmentIndex {
            segments,
            mru: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Address→segment lookup: fast-reject against the overall bounds, then
    /// scan from the last-hit index, wrapping once. The MRU hint is updated
    /// on a hit.
    pub fn segment_of(&self, addr: u64) -> Option<Segment> {
        let first = self.segments.first()?;
        let last = self.segments.last()?;
        if addr < first.first_object || addr >= last.end {
            return None;
        }

        let len = self.segments.len();
        let start = self.mru.load(std::sync::atomic::Ordering::Relaxed).min(len - 1);
        for offset in 0..len {
            let idx = (start + offset) % len;
            let seg = &self.segments[idx];
            if addr >= seg.start && addr < seg.start + seg.length() {
                self.mru.store(idx, std::sync::atomic::Ordering::Relaxed);
                return Some(*seg);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: u64, end: u64) -> Segment {
        Segment {
            start,
            end,
            committed_end: end,
            first_object: start,
            is_large_object_segment: false,
        }
    }

    #[test]
    fn rejects_overlapping_segments() {
        let err = SegmentIndex::new(vec![seg(0x1000, 0x2000), seg(0x1800, 0x3000)]).unwrap_err();
        assert!(matches!(err, HeapError::InvariantViolation(_)));
    }

    #[test]
    fn rejects_first_object_before_start() {
        let mut s = seg(0x1000, 0x2000);
        s.first_object = 0xfff;
        let err = SegmentIndex::new(vec![s]).unwrap_err();
        assert!(matches!(err, HeapError::InvariantViolation(_)));
    }

    #[test]
    fn looks_up_addresses_across_segments_and_updates_mru() {
        let idx = SegmentIndex::new(vec![seg(0x1000, 0x2000), seg(0x3000, 0x4000)]).unwrap();
        assert_eq!(idx.segment_of(0x1500).unwrap().start, 0x1000);
        assert_eq!(idx.segment_of(0x3500).unwrap().start, 0x3000);
        assert!(idx.segment_of(0x2500).is_none());
        assert!(idx.segment_of(0xff).is_none());
        assert!(idx.segment_of(0x4000).is_none());
    }
}
