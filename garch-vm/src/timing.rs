//! Host-side instruction timing.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

/// Maximum number of samples written to the data file.
pub const MAX_EXPORTED_SAMPLES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingReport {
    pub max: u64,
    pub median: u64,
    pub min: u64,
    pub mean: u64,
    pub samples: usize,
}

/// Per-instruction host durations in nanoseconds.
#[derive(Debug, Default)]
pub struct TimingStats {
    samples: Vec<u64>,
}

impl TimingStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&mut self, elapsed: Duration) {
        self.samples.push(elapsed.as_nanos().min(u64::MAX as u128) as u64);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn report(&self) -> Option<TimingReport> {
        if self.samples.is_empty() {
            return None;
        }
        let sorted = self.sorted_desc();
        let sum: u128 = sorted.iter().map(|&s| s as u128).sum();
        Some(TimingReport {
            max: sorted[0],
            median: sorted[sorted.len() / 2],
            min: sorted[sorted.len() - 1],
            mean: (sum / sorted.len() as u128) as u64,
            samples: sorted.len(),
        })
    }

    fn sorted_desc(&self) -> Vec<u64> {
        let mut sorted = self.samples.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted
    }

    /// Samples sorted slowest first, thinned to at most
    /// `MAX_EXPORTED_SAMPLES` by taking every n-th value.
    pub fn decimated(&self) -> Vec<u64> {
        let sorted = self.sorted_desc();
        if sorted.len() <= MAX_EXPORTED_SAMPLES {
            return sorted;
        }
        let stride = sorted.len().div_ceil(MAX_EXPORTED_SAMPLES);
        sorted.into_iter().step_by(stride).collect()
    }

    /// Write the decimated samples, one per line.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for sample in self.decimated() {
            writeln!(out, "{}", sample)?;
        }
        out.flush()
    }
}

/// `1234567` -> `1,234,567`
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(samples: &[u64]) -> TimingStats {
        let mut s = TimingStats::new();
        for &ns in samples {
            s.record(Duration::from_nanos(ns));
        }
        s
    }

    #[test]
    fn report_of_empty_is_none() {
        assert!(TimingStats::new().report().is_none());
    }

    #[test]
    fn report_values() {
        let report = stats(&[30, 10, 20, 40]).report().unwrap();
        assert_eq!(report.max, 40);
        assert_eq!(report.min, 10);
        // Descending [40, 30, 20, 10], middle index 2.
        assert_eq!(report.median, 20);
        assert_eq!(report.mean, 25);
        assert_eq!(report.samples, 4);
    }

    #[test]
    fn decimation_caps_sample_count() {
        let samples: Vec<u64> = (0..5001).collect();
        let out = stats(&samples).decimated();
        assert!(out.len() <= MAX_EXPORTED_SAMPLES);
        assert_eq!(out[0], 5000);
        assert!(out.windows(2).all(|w| w[0] >= w[1]));

        let small = stats(&[1, 3, 2]).decimated();
        assert_eq!(small, vec![3, 2, 1]);
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }
}
