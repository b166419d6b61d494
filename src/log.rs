use crate::{util::*};
use std::{collections::VecDeque, time::Instant, fmt};

// Short human-readable explanations of why some read/write/format produced nothing.
// Operations on the session degrade to "absent" instead of failing the whole evaluation pass, and leave a line here.
// Things that are only interesting to the developer (e.g. transport returned a wrong number of bytes) go to stderr instead.
pub struct Log {
    pub lines: VecDeque<String>,
}

const MAX_LINES: usize = 100;

impl Log {
    pub fn new() -> Log {
        Log {lines: VecDeque::new()}
    }

    pub fn add_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > MAX_LINES {
            self.lines.pop_front();
        }
    }

    pub fn last(&self) -> Option<&str> { self.lines.back().map(|s| s.as_str()) }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
#[macro_export]
macro_rules! log {
    ($log:expr, $($arg:tt)*) => (
        ($log).add_line(format!($($arg)*))
    );
}

// A very minimal profiling thing. Prints to stderr in destructor.
pub struct ProfileScope {
    name: String,
    start: Instant,
    threshold_secs: f64,
    active: bool,
}

impl ProfileScope {
    pub fn new(name: String) -> Self {
        ProfileScope {start: Instant::now(), name, threshold_secs: 0.0, active: true}
    }

    pub fn with_threshold(secs: f64, name: String) -> Self {
        ProfileScope {start: Instant::now(), name, threshold_secs: secs, active: true}
    }

    pub fn cancel(&mut self) { self.active = false; }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let secs = self.start.elapsed().as_secs_f64();
        if self.threshold_secs <= 0.0 || secs >= self.threshold_secs {
            eprintln!("info: {} took {:.3}s", self.name, secs);
        }
    }
}

// Counters for the read path. Reset by the owner whenever it wants a fresh window (e.g. per cycle).
#[derive(Clone, Default, Debug)]
pub struct ReadStats {
    pub hits: usize,
    pub misses: usize,
    pub fetches: usize,
    pub fetched_bytes: usize,
    pub failed_fetches: usize,

    pub prefetched_ranges: usize,
    pub prefetched_bytes: usize,
    pub prefetch_failures: usize,

    // readMemoryBatch: how many logical requests came in, and into how many physical ranges they were merged.
    pub batch_requests: usize,
    pub batch_ranges: usize,
}

impl ReadStats {
    pub fn reset(&mut self) { *self = Self::default(); }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

impl fmt::Display for ReadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hits: {} misses: {} ({:.0}%), fetches: {} ({}, {} failed), prefetch: {} ranges ({}, {} failed), batch: {} -> {}",
               PrettyCount(self.hits), PrettyCount(self.misses), self.hit_rate() * 100.0,
               PrettyCount(self.fetches), PrettySize(self.fetched_bytes), self.failed_fetches,
               self.prefetched_ranges, PrettySize(self.prefetched_bytes), self.prefetch_failures,
               self.batch_requests, self.batch_ranges)
    }
}
