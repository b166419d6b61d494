use std::{fmt, fmt::Write, ops::Range};

// A thing for limiting the number of warnings printed from each line of source code.
// Usage: if limiter.check(line!()) { eprintln!("warning: ...") }
pub struct Limiter {
    count_by_line: Vec<u16>,
}

impl Limiter {
    pub fn new() -> Self { Self {count_by_line: Vec::new()} }

    // Allow one per line.
    pub fn check(&mut self, line: u32) -> bool {
        self.check_n(line, 1)
    }

    // Allow n per line.
    pub fn check_n(&mut self, line: u32, n: u16) -> bool {
        let idx = line as usize;
        if idx >= self.count_by_line.len() {
            self.count_by_line.resize(idx + 1, 0);
        }
        if self.count_by_line[idx] < n {
            self.count_by_line[idx] += 1;
            true
        } else {
            false
        }
    }
}

// Prints numbers with a few digits of precision and optional K/M/G suffix, e.g. "42", "12.4K", "123M".
pub struct PrettyCount(pub usize);
impl fmt::Display for PrettyCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = self.0;
        if x < 1000 {                          write!(f, "{}", x) }
        else if x < 1000_000 {                 write!(f, "{:.3} K", x as f64 / 1e3) }
        else if x < 1000_000_000 {             write!(f, "{:.3} M", x as f64 / 1e6) }
        else {                                 write!(f, "{:.3} G", x as f64 / 1e9) }
    }
}

// Prints byte sizes with a few digits of precision and B/KiB/MiB/GiB suffix, e.g. "42 B", "12.4 KiB".
pub struct PrettySize(pub usize);
impl fmt::Display for PrettySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = self.0;
        if x < 1<<10 {             write!(f, "{} B", x) }
        else if x < (1usize<<20) { write!(f, "{:.3} KiB", x as f64 / (1usize<<10) as f64) }
        else if x < (1usize<<30) { write!(f, "{:.3} MiB", x as f64 / (1usize<<20) as f64) }
        else {                     write!(f, "{:.3} GiB", x as f64 / (1usize<<30) as f64) }
    }
}

// Address ranges are passed around as Range<usize> everywhere; these are the few things std doesn't have.
pub trait RangeExt {
    fn overlaps_or_touches(&self, other: &Range<usize>) -> bool;
    fn contains_range(&self, other: &Range<usize>) -> bool;
}
impl RangeExt for Range<usize> {
    fn overlaps_or_touches(&self, other: &Range<usize>) -> bool { self.start <= other.end && other.start <= self.end }
    fn contains_range(&self, other: &Range<usize>) -> bool { self.start <= other.start && other.end <= self.end }
}

// "de ad be ef"
pub fn hex_bytes(bytes: &[u8], separator: &str, upper: bool) -> String {
    let mut res = String::with_capacity(bytes.len() * (2 + separator.len()));
    for (i, b) in bytes.iter().enumerate() {
        if i != 0 {
            res.push_str(separator);
        }
        if upper {
            write!(res, "{:02X}", b).unwrap();
        } else {
            write!(res, "{:02x}", b).unwrap();
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use crate::util::*;

    #[test]
    fn ranges() {
        assert!((0..4).overlaps_or_touches(&(4..8)));
        assert!(!(0..4).overlaps_or_touches(&(5..8)));
        assert!((0..8).contains_range(&(2..8)));
        assert!(!(2..8).contains_range(&(1..3)));
    }

    #[test]
    fn limiter() {
        let mut l = Limiter::new();
        assert!(l.check_n(10, 2));
        assert!(l.check_n(10, 2));
        assert!(!l.check_n(10, 2));
        assert!(l.check(3));
    }

    #[test]
    fn hex() {
        assert_eq!(hex_bytes(&[0xde, 0xad, 0x0b], " ", false), "de ad 0b");
        assert_eq!(hex_bytes(&[0x1e, 0x30], "-", true), "1E-30");
        assert_eq!(hex_bytes(&[], ":", true), "");
    }
}
