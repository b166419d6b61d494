use crate::{*, error::*, log::*};
use std::{collections::HashSet, ops::Range};

// Byte ranges of target memory fetched during the current cycle.
//
// Every cycle (i.e. every time the target stops and all watches get re-evaluated) starts by throwing away all cached bytes
// and re-fetching the ranges that were *requested* during the previous cycle. Watches tend to read the same scattered small
// fields every time (list nodes, counters, struct members), so the previous footprint is a good guess for the next one.
// If the guess is wrong, the read just misses and goes to the transport. It's never wrong data: prefetched bytes are fresh.

pub struct ByteSegment {
    pub start: usize,
    pub data: Vec<u8>,
}

impl ByteSegment {
    pub fn end(&self) -> usize { self.start + self.data.len() }
    pub fn range(&self) -> Range<usize> { self.start..self.end() }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestedRange {
    pub start: usize,
    pub size: usize,
}

pub struct ByteRangeCache {
    // Sorted by start. No two segments overlap or touch; write() merges them.
    segments: Vec<ByteSegment>,

    // Footprint of the current cycle, in order of first request. Consumed by the next begin_update_cycle().
    requested: Vec<RequestedRange>,
    requested_set: HashSet<RequestedRange>,
}

impl ByteRangeCache {
    pub fn new() -> Self { Self {segments: Vec::new(), requested: Vec::new(), requested_set: HashSet::new()} }

    pub fn segments(&self) -> &[ByteSegment] { &self.segments }
    pub fn requested_ranges(&self) -> &[RequestedRange] { &self.requested }
    pub fn cached_bytes(&self) -> usize { self.segments.iter().map(|s| s.data.len()).sum() }

    pub fn record_request_range(&mut self, start: usize, size: usize) {
        if size == 0 || start.checked_add(size).is_none() {
            return;
        }
        let r = RequestedRange {start, size};
        if self.requested_set.insert(r) {
            self.requested.push(r);
        }
    }

    // Only returns something if one segment covers the whole range. Doesn't stitch adjacent segments (there are none, see write()).
    pub fn read(&self, start: usize, size: usize) -> Option<&[u8]> {
        let end = start.checked_add(size)?;
        if size == 0 {
            return Some(&[]);
        }
        let idx = self.segments.partition_point(|s| s.start <= start);
        if idx == 0 {
            return None;
        }
        let s = &self.segments[idx - 1];
        if end > s.end() {
            return None;
        }
        Some(&s.data[start - s.start..end - s.start])
    }

    // Sorted disjoint subranges of [start, start+size) not covered by any segment.
    pub fn get_missing_ranges(&self, start: usize, size: usize) -> Vec<Range<usize>> {
        let end = start.saturating_add(size);
        let mut res: Vec<Range<usize>> = Vec::new();
        let mut cursor = start;
        // Segments are disjoint, so ends are sorted too.
        let mut idx = self.segments.partition_point(|s| s.end() <= start);
        while cursor < end && idx < self.segments.len() {
            let s = &self.segments[idx];
            if s.start >= end {
                break;
            }
            if s.start > cursor {
                res.push(cursor..s.start);
            }
            cursor = cursor.max(s.end());
            idx += 1;
        }
        if cursor < end {
            res.push(cursor..end);
        }
        res
    }

    // Segments overlapping or touching the new data are folded into one. New bytes win in the overlap.
    pub fn write(&mut self, start: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = match start.checked_add(data.len()) {
            Some(e) => e,
            None => {
                eprintln!("warning: cache write out of address space: 0x{:x} + 0x{:x}", start, data.len());
                return;
            }
        };
        // Affected segments are contiguous in sorted order: [lo, hi).
        let lo = self.segments.partition_point(|s| s.end() < start);
        let hi = self.segments.partition_point(|s| s.start <= end);
        if lo >= hi {
            self.segments.insert(lo, ByteSegment {start, data: data.to_vec()});
            return;
        }

        let new_start = start.min(self.segments[lo].start);
        let new_end = end.max(self.segments[hi - 1].end());
        let mut buf = vec![0u8; new_end - new_start];
        for s in &self.segments[lo..hi] {
            buf[s.start - new_start..s.end() - new_start].copy_from_slice(&s.data);
        }
        buf[start - new_start..end - new_start].copy_from_slice(data);
        self.segments.splice(lo..hi, std::iter::once(ByteSegment {start: new_start, data: buf}));
    }

    // Forget cached bytes in [start, start+size), splitting segments that straddle the boundaries.
    pub fn invalidate(&mut self, start: usize, size: usize) {
        if size == 0 {
            return;
        }
        let end = start.saturating_add(size);
        let lo = self.segments.partition_point(|s| s.end() <= start);
        let hi = self.segments.partition_point(|s| s.start < end);
        if lo >= hi {
            return;
        }
        let removed: Vec<ByteSegment> = self.segments.drain(lo..hi).collect();
        let mut keep: Vec<ByteSegment> = Vec::new();
        for s in removed {
            if s.start < start {
                keep.push(ByteSegment {start: s.start, data: s.data[..start - s.start].to_vec()});
            }
            if s.end() > end {
                keep.push(ByteSegment {start: end, data: s.data[end - s.start..].to_vec()});
            }
        }
        self.segments.splice(lo..lo, keep);
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.requested.clear();
        self.requested_set.clear();
    }

    // Start of a new cycle: drop all cached bytes, then re-fetch what the previous cycle asked for.
    // Requests are merged only if they're contiguous or overlapping; we don't want to fetch bytes nobody asked for.
    // A failed fetch just leaves a hole; the next read of that range will miss and retry through the transport.
    // Returns the number of ranges fetched successfully.
    pub fn begin_update_cycle(&mut self, fetch: &mut dyn FnMut(usize, usize) -> Result<Vec<u8>>, mut stats: Option<&mut ReadStats>) -> usize {
        self.segments.clear();
        let requested: Vec<Range<usize>> = self.requested.iter().map(|r| r.start..r.start + r.size).collect();
        let merged = coalesce_ranges(requested, 0, usize::MAX);

        let _prof = ProfileScope::with_threshold(0.1, format!("prefetch of {} ranges", merged.len()));
        let mut fetched = 0usize;
        for r in merged {
            match fetch(r.start, r.len()) {
                Ok(data) if data.len() == r.len() => {
                    self.write(r.start, &data);
                    fetched += 1;
                    if let Some(s) = stats.as_deref_mut() {
                        s.prefetched_ranges += 1;
                        s.prefetched_bytes += data.len();
                    }
                }
                Ok(data) => {
                    eprintln!("warning: prefetch of 0x{:x}:{} returned {} bytes", r.start, r.len(), data.len());
                    if let Some(s) = stats.as_deref_mut() { s.prefetch_failures += 1; }
                }
                Err(_) => if let Some(s) = stats.as_deref_mut() { s.prefetch_failures += 1; }
            }
        }

        self.requested.clear();
        self.requested_set.clear();
        fetched
    }
}

// Sorts the ranges and greedily merges neighbors that are at most `max_gap` bytes apart, as long as the merged range stays within `max_bytes`.
// A single range longer than `max_bytes` is kept as is. Empty ranges are dropped.
pub fn coalesce_ranges(mut ranges: Vec<Range<usize>>, max_gap: usize, max_bytes: usize) -> Vec<Range<usize>> {
    ranges.sort_unstable_by_key(|r| (r.start, r.end));
    let mut res: Vec<Range<usize>> = Vec::new();
    for r in ranges {
        if r.is_empty() {
            continue;
        }
        if let Some(last) = res.last_mut() {
            let new_end = last.end.max(r.end);
            if r.start <= last.end.saturating_add(max_gap) && new_end - last.start <= max_bytes {
                last.end = new_end;
                continue;
            }
        }
        res.push(r);
    }
    res
}

#[cfg(test)]
mod tests {
    use crate::range_cache::*;
    use rand::{Rng, random};

    fn bytes(start: u8, n: usize) -> Vec<u8> { (0..n).map(|i| start.wrapping_add(i as u8)).collect() }

    #[test]
    fn write_then_read() {
        let mut c = ByteRangeCache::new();
        let d = bytes(7, 9);
        c.write(0x1000, &d);
        assert_eq!(c.read(0x1000, 9), Some(&d[..]));
        assert_eq!(c.read(0x1002, 3), Some(&d[2..5]));
        assert_eq!(c.read(0x1000, 10), None);
        assert_eq!(c.read(0xfff, 2), None);
    }

    #[test]
    fn merge_overlapping_and_touching() {
        let mut c = ByteRangeCache::new();
        c.write(10, &[1; 10]); // [10, 20)
        c.write(30, &[3; 5]); // [30, 35)
        c.write(15, &[2; 10]); // [15, 25), overlaps the first
        assert_eq!(c.segments().len(), 2);
        let mut expected = vec![1u8; 5];
        expected.extend_from_slice(&[2; 10]);
        assert_eq!(c.read(10, 15), Some(&expected[..]));

        // Touches both neighbors.
        c.write(25, &[9; 5]);
        assert_eq!(c.segments().len(), 1);
        assert_eq!(c.segments()[0].range(), 10..35);
        assert_eq!(c.read(25, 10), Some(&[9, 9, 9, 9, 9, 3, 3, 3, 3, 3][..]));

        // Not touching: stays separate.
        c.write(36, &[4]);
        assert_eq!(c.segments().len(), 2);
        assert_eq!(c.read(34, 3), None);
    }

    #[test]
    fn missing_ranges() {
        let mut c = ByteRangeCache::new();
        assert_eq!(c.get_missing_ranges(100, 50), vec![100..150]);
        c.write(110, &[0; 10]);
        c.write(130, &[0; 5]);
        c.write(200, &[0; 5]);
        assert_eq!(c.get_missing_ranges(100, 50), vec![100..110, 120..130, 135..150]);
        assert!(c.get_missing_ranges(112, 5).is_empty());
        assert_eq!(c.get_missing_ranges(115, 10), vec![120..125]);
        assert!(c.get_missing_ranges(100, 0).is_empty());
    }

    #[test]
    fn request_log() {
        let mut c = ByteRangeCache::new();
        c.record_request_range(0x10, 4);
        c.record_request_range(0x10, 4);
        c.record_request_range(0x10, 0);
        c.record_request_range(0x10, 8);
        assert_eq!(c.requested_ranges(), &[RequestedRange {start: 0x10, size: 4}, RequestedRange {start: 0x10, size: 8}]);
    }

    #[test]
    fn prefetch_coalesces_contiguous_ranges() {
        let mut c = ByteRangeCache::new();
        c.record_request_range(0x1000, 9);
        c.record_request_range(0x1009, 16);
        c.record_request_range(0x2000, 4); // not contiguous with anything
        c.write(0x5000, &[1, 2, 3]);

        let mut calls: Vec<(usize, usize)> = Vec::new();
        let mut stats = ReadStats::default();
        let n = c.begin_update_cycle(&mut |addr, size| { calls.push((addr, size)); Ok(vec![0xab; size]) }, Some(&mut stats));
        assert_eq!(n, 2);
        assert_eq!(calls, vec![(0x1000, 25), (0x2000, 4)]);
        assert_eq!(stats.prefetched_ranges, 2);
        assert_eq!(stats.prefetched_bytes, 29);
        // Old segments are gone, request log consumed.
        assert_eq!(c.read(0x5000, 1), None);
        assert!(c.requested_ranges().is_empty());
        assert_eq!(c.read(0x1000, 25), Some(&[0xab; 25][..]));

        // Nothing was requested in the last cycle, so nothing is fetched.
        let mut count = 0;
        c.begin_update_cycle(&mut |_, _| { count += 1; Ok(Vec::new()) }, None);
        assert_eq!(count, 0);
        assert!(c.segments().is_empty());
    }

    #[test]
    fn prefetch_failure_leaves_hole() {
        let mut c = ByteRangeCache::new();
        c.record_request_range(0x100, 8);
        c.record_request_range(0x200, 8);
        c.record_request_range(0x300, 8);
        let mut stats = ReadStats::default();
        c.begin_update_cycle(&mut |addr, size| {
            match addr {
                0x200 => err!(Fetch, "no"),
                0x300 => Ok(vec![0; size - 1]),
                _ => Ok(vec![5; size]),
            }
        }, Some(&mut stats));
        assert_eq!(stats.prefetch_failures, 2);
        assert_eq!(c.read(0x100, 8), Some(&[5; 8][..]));
        assert_eq!(c.read(0x200, 8), None);
        assert_eq!(c.read(0x300, 8), None);
        assert_eq!(c.get_missing_ranges(0x100, 0x108), vec![0x108..0x208]);
    }

    #[test]
    fn invalidate_splits() {
        let mut c = ByteRangeCache::new();
        c.write(0, &bytes(0, 20));
        c.invalidate(5, 5);
        assert_eq!(c.segments().len(), 2);
        assert_eq!(c.read(0, 5), Some(&bytes(0, 5)[..]));
        assert_eq!(c.read(10, 10), Some(&bytes(10, 10)[..]));
        assert_eq!(c.get_missing_ranges(0, 20), vec![5..10]);
        c.invalidate(0, 100);
        assert!(c.segments().is_empty());
    }

    #[test]
    fn coalesce() {
        assert_eq!(coalesce_ranges(vec![10..20, 0..10, 30..40], 0, usize::MAX), vec![0..20, 30..40]);
        assert_eq!(coalesce_ranges(vec![10..20, 0..10, 30..40], 10, usize::MAX), vec![0..40]);
        assert_eq!(coalesce_ranges(vec![0..10, 5..8, 10..20], 0, 15), vec![0..10, 10..20]);
        assert_eq!(coalesce_ranges(vec![0..100, 100..101], 0, 50), vec![0..100, 100..101]);
        assert!(coalesce_ranges(vec![5..5], 0, 50).is_empty());
    }

    // Compare against a plain byte map: the most recent write wins, coverage is exactly the union of writes.
    #[test]
    fn random_writes() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut c = ByteRangeCache::new();
            let mut reference: Vec<Option<u8>> = vec![None; 256];
            for _ in 0..rng.gen_range(1..12) {
                let start = rng.gen_range(0..240usize);
                let len = rng.gen_range(1..16usize).min(256 - start);
                let data: Vec<u8> = (0..len).map(|_| random::<u8>()).collect();
                c.write(start, &data);
                for i in 0..len {
                    reference[start + i] = Some(data[i]);
                }
                assert_eq!(c.read(start, len), Some(&data[..]));
            }
            for w in c.segments().windows(2) {
                assert!(w[0].end() < w[1].start);
            }
            let start = rng.gen_range(0..200usize);
            let len = rng.gen_range(0..56usize);
            let missing = c.get_missing_ranges(start, len);
            for w in missing.windows(2) {
                assert!(w[0].end < w[1].start);
            }
            for a in start..start + len {
                let is_missing = missing.iter().any(|r| r.contains(&a));
                assert_eq!(is_missing, reference[a].is_none());
                if let Some(b) = reference[a] {
                    assert_eq!(c.read(a, 1), Some(&[b][..]));
                }
            }
        }
    }
}
