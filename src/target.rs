use crate::{*, error::*, log::*, util::*, range_cache::*, procfs::*, settings::*};
use std::{collections::HashMap, ops::Range};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
}

// One logical read in a batch. Addresses and sizes come straight from expression evaluation, hence signed.
#[derive(Clone, Debug)]
pub struct BatchRequest<K> {
    pub key: K,
    pub address: i64,
    pub size: i64,
}

// Reads from the target through the cycle-scoped cache, and memoizes symbol lookups.
// All reads go through here; the Target itself is only touched on cache miss, on prefetch, and on first lookup of each symbol.
pub struct TargetReader<T: Target> {
    pub target: T,
    pub cache: ByteRangeCache,
    pub stats: ReadStats,

    max_batch_bytes: usize,
    max_batch_gap: usize,

    // Keyed by trimmed name. Only successful lookups are remembered: a symbol may appear later (e.g. library loaded).
    symbol_addresses: HashMap<String, usize>,
    symbol_sizes: HashMap<String, usize>,
    symbol_array_counts: HashMap<String, usize>,

    state: RunState,
    limiter: Limiter,
}

// Rejects what address arithmetic in an expression can produce but memory can't contain.
pub fn normalize_span(address: i64, size: i64) -> Result<(usize, usize)> {
    if address < 0 {
        return err!(Usage, "negative address: {}", address);
    }
    if size <= 0 {
        return err!(Usage, "bad read size: {}", size);
    }
    let (address, size) = (usize::try_from(address)?, usize::try_from(size)?);
    if address.checked_add(size).is_none() {
        return err!(Usage, "range out of bounds: 0x{:x}:{}", address, size);
    }
    Ok((address, size))
}

impl<T: Target> TargetReader<T> {
    pub fn new(target: T, settings: &Settings) -> Self {
        Self {target, cache: ByteRangeCache::new(), stats: ReadStats::default(), max_batch_bytes: settings.max_batch_bytes.max(1), max_batch_gap: settings.max_batch_gap,
              symbol_addresses: HashMap::new(), symbol_sizes: HashMap::new(), symbol_array_counts: HashMap::new(), state: RunState::Stopped, limiter: Limiter::new()}
    }

    pub fn read_memory(&mut self, address: i64, size: i64) -> Result<Vec<u8>> {
        let (address, size) = normalize_span(address, size)?;
        self.read(address, size)
    }

    // The caller always gets one contiguous buffer, even if it was assembled from cached fragments and fresh fetches.
    pub fn read(&mut self, addr: usize, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        if addr.checked_add(size).is_none() {
            return err!(Usage, "range out of bounds: 0x{:x}:{}", addr, size);
        }
        self.cache.record_request_range(addr, size);
        self.read_unrecorded(addr, size)
    }

    // Same as read(), but doesn't add the range to next cycle's prefetch footprint.
    fn read_unrecorded(&mut self, addr: usize, size: usize) -> Result<Vec<u8>> {
        if let Some(b) = self.cache.read(addr, size) {
            self.stats.hits += 1;
            return Ok(b.to_vec());
        }
        self.stats.misses += 1;
        for r in self.cache.get_missing_ranges(addr, size) {
            let data = self.fetch(r.clone())?;
            self.cache.write(r.start, &data);
        }
        match self.cache.read(addr, size) {
            Some(b) => Ok(b.to_vec()),
            None => err!(Internal, "range 0x{:x}:{} not cached after fetch", addr, size),
        }
    }

    fn fetch(&mut self, r: Range<usize>) -> Result<Vec<u8>> {
        self.stats.fetches += 1;
        match self.target.read_memory(r.start, r.len()) {
            Ok(data) if data.len() == r.len() => {
                self.stats.fetched_bytes += data.len();
                Ok(data)
            }
            Ok(data) => {
                self.stats.failed_fetches += 1;
                if self.limiter.check(line!()) { eprintln!("warning: read of 0x{:x}:{} returned {} bytes", r.start, r.len(), data.len()); }
                err!(Fetch, "short read at 0x{:x}: {} of {} bytes", r.start, data.len(), r.len())
            }
            Err(e) => {
                self.stats.failed_fetches += 1;
                Err(e)
            }
        }
    }

    // Merges requests into few covering reads, then slices each request's bytes out of its covering range.
    // Results are in the order of `requests`. A failure affects only the keys whose bytes it would have provided.
    pub fn read_memory_batch<K: Clone>(&mut self, requests: &[BatchRequest<K>]) -> Vec<(K, Result<Vec<u8>>)> {
        self.stats.batch_requests += requests.len();
        let spans: Vec<Result<(usize, usize)>> = requests.iter().map(|r| normalize_span(r.address, r.size)).collect();
        let ranges: Vec<Range<usize>> = spans.iter().filter_map(|s| s.as_ref().ok().map(|&(a, n)| a..a+n)).collect();
        // Footprint is what was asked for, not the gap bytes merging pulled in.
        for r in &ranges {
            self.cache.record_request_range(r.start, r.len());
        }
        let merged = coalesce_ranges(ranges, self.max_batch_gap, self.max_batch_bytes);
        self.stats.batch_ranges += merged.len();

        let mut data: Vec<Result<Vec<u8>>> = Vec::with_capacity(merged.len());
        for r in &merged {
            data.push(self.read_unrecorded(r.start, r.len()));
        }

        let mut res = Vec::with_capacity(requests.len());
        for (req, span) in requests.iter().zip(spans) {
            let bytes = match span {
                Err(e) => Err(e),
                Ok((addr, size)) => Self::slice_covering(&merged, &data, addr, size),
            };
            res.push((req.key.clone(), bytes));
        }
        res
    }

    fn slice_covering(merged: &[Range<usize>], data: &[Result<Vec<u8>>], addr: usize, size: usize) -> Result<Vec<u8>> {
        // Ranges are sorted and disjoint, so the covering one (if any) is the last one starting at or before addr.
        let idx = merged.partition_point(|r| r.start <= addr);
        if idx == 0 || !merged[idx - 1].contains_range(&(addr..addr + size)) {
            return err!(Internal, "no covering range for 0x{:x}:{}", addr, size);
        }
        let r = &merged[idx - 1];
        match &data[idx - 1] {
            Err(e) => Err(e.clone()),
            Ok(buf) => {
                let off = addr - r.start;
                match buf.get(off..off + size) {
                    Some(b) => Ok(b.to_vec()),
                    None => err!(OutOfBounds, "slice 0x{:x}:{} out of bounds of 0x{:x}:{}", addr, size, r.start, buf.len()),
                }
            }
        }
    }

    // Reads until a NUL unit (1 or 2 bytes) or until `limit` units. Returns the bytes without the terminator, and whether it was found.
    // Reads in growing aligned chunks, so that a short string near the end of a mapping doesn't fail, and long strings don't take many round trips.
    pub fn read_null_terminated(&mut self, addr: usize, unit: usize, limit: usize) -> Result<(Vec<u8>, bool)> {
        if unit != 1 && unit != 2 {
            return err!(Usage, "bad string unit size: {}", unit);
        }
        let limit_bytes = limit.saturating_mul(unit);
        let mut res: Vec<u8> = Vec::new();
        let mut pos = addr;
        let mut chunk_size = 1usize << 6;
        let mut scanned = 0usize;
        while res.len() < limit_bytes {
            let n = ((pos & !(chunk_size - 1)) + chunk_size - pos).min(limit_bytes - res.len());
            let chunk = self.read(pos, n)?;
            res.extend_from_slice(&chunk);
            pos += n;
            while scanned + unit <= res.len() {
                if res[scanned..scanned + unit].iter().all(|b| *b == 0) {
                    res.truncate(scanned);
                    return Ok((res, true));
                }
                scanned += unit;
            }
            chunk_size = (chunk_size << 1).min(1 << 12);
        }
        res.truncate(limit_bytes);
        Ok((res, false))
    }

    pub fn symbol_address(&mut self, name: &str) -> Result<usize> {
        memoized(&mut self.symbol_addresses, name, |n| self.target.symbol_address(n))
    }

    pub fn symbol_size(&mut self, name: &str) -> Result<usize> {
        memoized(&mut self.symbol_sizes, name, |n| self.target.symbol_size(n))
    }

    pub fn symbol_array_count(&mut self, name: &str) -> Result<usize> {
        memoized(&mut self.symbol_array_counts, name, |n| self.target.symbol_array_count(n))
    }

    // Not memoized, registers change every stop.
    pub fn read_register(&mut self, name: &str) -> Result<u64> {
        let name = name.trim();
        if name.is_empty() {
            return err!(Usage, "empty register name");
        }
        self.target.read_register(name)
    }

    pub fn symbol_at(&mut self, addr: usize) -> Result<SymbolInfo> { self.target.symbol_at(addr) }

    // For when the host knows the symbol layout changed (e.g. overlay switched, library reloaded).
    pub fn forget_symbols(&mut self) {
        self.symbol_addresses.clear();
        self.symbol_sizes.clear();
        self.symbol_array_counts.clear();
    }

    pub fn on_continue(&mut self) { self.state = RunState::Running; }
    pub fn on_stop(&mut self) { self.state = RunState::Stopped; }
    pub fn state(&self) -> RunState { self.state }
    pub fn is_stopped(&self) -> bool { self.state == RunState::Stopped }

    // Prefetch of the previous cycle's footprint. Returns the number of ranges fetched.
    pub fn begin_update_cycle(&mut self) -> usize {
        let target = &mut self.target;
        self.cache.begin_update_cycle(&mut |addr: usize, size: usize| target.read_memory(addr, size), Some(&mut self.stats))
    }

    pub fn invalidate(&mut self, addr: usize, size: usize) { self.cache.invalidate(addr, size); }
    pub fn invalidate_all(&mut self) { self.cache.clear(); }
}

fn memoized(map: &mut HashMap<String, usize>, name: &str, lookup: impl FnOnce(&str) -> Result<usize>) -> Result<usize> {
    let name = name.trim();
    if name.is_empty() {
        return err!(Usage, "empty symbol name");
    }
    if let Some(&v) = map.get(name) {
        return Ok(v);
    }
    let v = lookup(name)?;
    map.insert(name.to_string(), v);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use crate::{target::*, procfs::*, settings::*, range_cache::*};

    fn reader_with(regions: &[(usize, Vec<u8>)]) -> TargetReader<SnapshotTarget> {
        let mut t = SnapshotTarget::new();
        for (addr, bytes) in regions {
            t.map(*addr, bytes);
        }
        TargetReader::new(t, &Settings::default())
    }

    fn seq(n: usize) -> Vec<u8> { (0..n).map(|i| i as u8).collect() }

    #[test]
    fn miss_then_hit() {
        let mut r = reader_with(&[(0x1000, seq(64))]);
        assert_eq!(r.read_memory(0x1004, 4).unwrap(), vec![4, 5, 6, 7]);
        assert_eq!(r.read_memory(0x1005, 2).unwrap(), vec![5, 6]);
        assert_eq!(r.target.reads, vec![(0x1004, 4)]);
        assert_eq!((r.stats.hits, r.stats.misses, r.stats.fetches), (1, 1, 1));
    }

    #[test]
    fn stitches_fragments() {
        let mut r = reader_with(&[(0x1000, seq(64))]);
        r.read_memory(0x1010, 4).unwrap();
        r.read_memory(0x1018, 4).unwrap();
        r.target.reads.clear();
        assert_eq!(r.read_memory(0x100e, 16).unwrap(), (14..30).collect::<Vec<u8>>());
        assert_eq!(r.target.reads, vec![(0x100e, 2), (0x1014, 4), (0x101c, 2)]);
        assert_eq!(r.cache.segments().len(), 1);
    }

    #[test]
    fn bad_spans() {
        let mut r = reader_with(&[(0x1000, seq(16))]);
        assert!(r.read_memory(-8, 4).unwrap_err().is_usage());
        assert!(r.read_memory(0x1000, 0).unwrap_err().is_usage());
        assert!(r.read_memory(0x1000, -1).unwrap_err().is_usage());
        assert!(r.read_memory(i64::MAX, 8).is_err());
        assert!(r.read_memory(0x2000, 4).unwrap_err().is_fetch());
        assert!(r.cache.segments().is_empty());
        assert_eq!(r.stats.failed_fetches, 2);
    }

    #[test]
    fn batch_merges_contiguous() {
        let mut r = reader_with(&[(0x1000, seq(64))]);
        let reqs = vec![
            BatchRequest {key: "c", address: 0x1008, size: 4},
            BatchRequest {key: "a", address: 0x1000, size: 4},
            BatchRequest {key: "b", address: 0x1004, size: 4},
            BatchRequest {key: "far", address: 0x1020, size: 2},
        ];
        let res = r.read_memory_batch(&reqs);
        assert_eq!(r.target.reads, vec![(0x1000, 12), (0x1020, 2)]);
        let got: Vec<(&str, Vec<u8>)> = res.into_iter().map(|(k, v)| (k, v.unwrap())).collect();
        assert_eq!(got, vec![("c", vec![8, 9, 10, 11]), ("a", vec![0, 1, 2, 3]), ("b", vec![4, 5, 6, 7]), ("far", vec![32, 33])]);
        assert_eq!((r.stats.batch_requests, r.stats.batch_ranges), (4, 2));
    }

    #[test]
    fn batch_failures_are_per_key() {
        let mut r = reader_with(&[(0x1000, seq(16))]);
        let reqs = vec![
            BatchRequest {key: 1, address: 0x1000, size: 8},
            BatchRequest {key: 2, address: 0x5000, size: 8},
            BatchRequest {key: 3, address: -4, size: 8},
            BatchRequest {key: 4, address: 0x1008, size: 0},
        ];
        let res = r.read_memory_batch(&reqs);
        assert_eq!(res[0].1.as_ref().unwrap(), &seq(8));
        assert!(res[1].1.as_ref().unwrap_err().is_fetch());
        assert!(res[2].1.as_ref().unwrap_err().is_usage());
        assert!(res[3].1.is_err());
    }

    #[test]
    fn batch_limits() {
        let mut settings = Settings::default();
        settings.max_batch_bytes = 8;
        settings.max_batch_gap = 2;
        let mut t = SnapshotTarget::new();
        t.map(0x1000, &seq(64));
        let mut r = TargetReader::new(t, &settings);
        let reqs: Vec<BatchRequest<usize>> = [0x1000, 0x1004, 0x1008, 0x100c, 0x1020].iter().enumerate().map(|(i, &a)| BatchRequest {key: i, address: a, size: 2}).collect();
        let res = r.read_memory_batch(&reqs);
        // Gaps of 2 bytes are bridged, but 0x1000..0x100a would be over the byte budget.
        assert_eq!(r.target.reads, vec![(0x1000, 6), (0x1008, 6), (0x1020, 2)]);
        assert!(res.iter().all(|(_, v)| v.is_ok()));
        assert_eq!(res[3].1.as_ref().unwrap(), &vec![12, 13]);
        assert_eq!(res[1].1.as_ref().unwrap(), &vec![4, 5]);
    }

    #[test]
    fn batch_footprint_excludes_gap_bytes() {
        let mut settings = Settings::default();
        settings.max_batch_gap = 2;
        let mut t = SnapshotTarget::new();
        t.map(0x1000, &seq(16));
        let mut r = TargetReader::new(t, &settings);
        let reqs = [BatchRequest {key: 'a', address: 0x1000, size: 2}, BatchRequest {key: 'b', address: 0x1004, size: 2}, BatchRequest {key: 'c', address: -1, size: 2}];
        let res = r.read_memory_batch(&reqs);
        assert_eq!(r.target.reads, vec![(0x1000, 6)]);
        assert!(res[2].1.is_err());
        assert_eq!(r.cache.requested_ranges(), &[RequestedRange {start: 0x1000, size: 2}, RequestedRange {start: 0x1004, size: 2}]);

        // Gap bytes going away mustn't break next cycle's prefetch.
        r.target.unmap(0x1002, 2);
        r.target.reads.clear();
        assert_eq!(r.begin_update_cycle(), 2);
        assert_eq!(r.target.reads, vec![(0x1000, 2), (0x1004, 2)]);
        assert_eq!(r.stats.prefetch_failures, 0);
        assert_eq!(r.read_memory(0x1004, 2).unwrap(), vec![4, 5]);
        assert_eq!(r.target.reads.len(), 2);
    }

    #[test]
    fn prefetch_uses_previous_footprint() {
        let mut r = reader_with(&[(0x1000, seq(64))]);
        r.read_memory(0x1000, 9).unwrap();
        r.read_memory(0x1009, 9).unwrap();
        r.read_memory(0x1030, 4).unwrap();
        r.target.reads.clear();

        r.target.map(0x1000, &[0xaa; 4]);
        assert_eq!(r.begin_update_cycle(), 2);
        assert_eq!(r.target.reads, vec![(0x1000, 18), (0x1030, 4)]);
        assert_eq!(r.read_memory(0x1000, 2).unwrap(), vec![0xaa, 0xaa]);
        assert_eq!(r.read_memory(0x1010, 2).unwrap(), vec![16, 17]);
        assert_eq!(r.target.reads.len(), 2);
        assert_eq!(r.stats.prefetched_ranges, 2);
    }

    #[test]
    fn symbols_are_memoized_by_trimmed_name() {
        let mut t = SnapshotTarget::new();
        t.symbols.add("head", 0x2000, 8, None, None);
        t.symbols.add("nodes", 0x3000, 90, Some(10), None);
        let mut r = TargetReader::new(t, &Settings::default());
        assert_eq!(r.symbol_address(" head ").unwrap(), 0x2000);
        r.target.symbols = SymbolTable::new();
        assert_eq!(r.symbol_address("head").unwrap(), 0x2000);
        assert!(r.symbol_size("head").unwrap_err().is_no_symbol());
        assert!(r.symbol_address("").unwrap_err().is_usage());
        r.forget_symbols();
        assert!(r.symbol_address("head").is_err());

        r.target.symbols.add("nodes", 0x3000, 90, Some(10), None);
        assert_eq!(r.symbol_array_count("nodes").unwrap(), 10);
        assert_eq!(r.symbol_at(0x3005).unwrap().offset, 5);
    }

    #[test]
    fn run_state() {
        let mut r = reader_with(&[]);
        assert!(r.is_stopped());
        r.on_continue();
        assert_eq!(r.state(), RunState::Running);
        r.on_stop();
        assert!(r.is_stopped());
    }

    #[test]
    fn null_terminated() {
        let mut mem = b"hello\0world".to_vec();
        mem.resize(200, b'x');
        let mut wide: Vec<u8> = "hi!".encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
        wide.extend_from_slice(&[0, 0]);
        wide.resize(100, 0x55);
        let mut r = reader_with(&[(0x1003, mem), (0x2001, wide)]);
        assert_eq!(r.read_null_terminated(0x1003, 1, 100).unwrap(), (b"hello".to_vec(), true));
        assert_eq!(r.read_null_terminated(0x1009, 1, 3).unwrap(), (b"wor".to_vec(), false));
        assert!(r.read_null_terminated(0x100f, 1, 1000).is_err());
        assert_eq!(r.read_null_terminated(0x2001, 2, 100).unwrap(), (vec![b'h', 0, b'i', 0, b'!', 0], true));
        assert!(r.read_null_terminated(0x2001, 3, 100).unwrap_err().is_usage());
    }
}
