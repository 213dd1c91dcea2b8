//! Statistics for engine-driven runs
//!
//! [`ReadStats`] accumulates per-completion counters and latencies while a
//! run is in progress; [`ReadReport`] is the serialisable summary printed by
//! the CLI as text or JSON.

pub mod histogram;

use crate::engine::{Backend, PollMode};
use histogram::LatencyHistogram;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Running counters of a read run
#[derive(Debug, Default)]
pub struct ReadStats {
    pub ops: u64,
    pub bytes: u64,
    /// Completions with a negative result
    pub errors: u64,
    /// Completions that transferred fewer bytes than requested
    pub short_reads: u64,
    /// Blocks whose content did not match the fixture
    pub verify_failures: u64,
    pub latency: LatencyHistogram,
    /// Wall time from first submission to last harvest
    pub elapsed: Duration,
}

impl ReadStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one harvested completion
    pub fn record(&mut self, result: i64, requested: usize, latency: Duration) {
        self.ops += 1;
        self.latency.record(latency);
        if result < 0 {
            self.errors += 1;
            return;
        }
        self.bytes += result as u64;
        if (result as usize) < requested {
            self.short_reads += 1;
        }
    }
}

/// Latency percentiles in microseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min_us: f64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
}

impl LatencySummary {
    fn from_histogram(hist: &LatencyHistogram) -> Self {
        let us = |d: Option<Duration>| d.map_or(0.0, |d| d.as_secs_f64() * 1e6);
        Self {
            min_us: us(hist.min()),
            mean_us: us(hist.mean()),
            p50_us: us(hist.percentile(50.0)),
            p99_us: us(hist.percentile(99.0)),
            max_us: us(hist.max()),
        }
    }
}

/// Summary of a completed read run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadReport {
    pub backend: Backend,
    pub poll_mode: PollMode,
    pub capacity: usize,
    pub block_size: usize,
    pub ops: u64,
    pub bytes: u64,
    pub errors: u64,
    pub short_reads: u64,
    pub verify_failures: u64,
    pub elapsed_secs: f64,
    pub throughput_mib_s: f64,
    pub latency: LatencySummary,
}

impl ReadReport {
    pub fn new(
        stats: &ReadStats,
        backend: Backend,
        poll_mode: PollMode,
        capacity: usize,
        block_size: usize,
    ) -> Self {
        let secs = stats.elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            stats.bytes as f64 / (1024.0 * 1024.0) / secs
        } else {
            0.0
        };
        Self {
            backend,
            poll_mode,
            capacity,
            block_size,
            ops: stats.ops,
            bytes: stats.bytes,
            errors: stats.errors,
            short_reads: stats.short_reads,
            verify_failures: stats.verify_failures,
            elapsed_secs: secs,
            throughput_mib_s: throughput,
            latency: LatencySummary::from_histogram(&stats.latency),
        }
    }

    /// Whether every request succeeded with full, verified content
    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.verify_failures == 0
    }
}

impl fmt::Display for ReadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Engine: {} ({}), capacity {}", self.backend, self.poll_mode, self.capacity)?;
        writeln!(f, "Block size: {} bytes", self.block_size)?;
        writeln!(f, "Operations: {} ({} errors, {} short)", self.ops, self.errors, self.short_reads)?;
        writeln!(f, "Bytes read: {}", self.bytes)?;
        writeln!(f, "Verify failures: {}", self.verify_failures)?;
        writeln!(f, "Elapsed: {:.3}s ({:.2} MiB/s)", self.elapsed_secs, self.throughput_mib_s)?;
        write!(
            f,
            "Latency (us): min {:.1}  mean {:.1}  p50 {:.1}  p99 {:.1}  max {:.1}",
            self.latency.min_us,
            self.latency.mean_us,
            self.latency.p50_us,
            self.latency.p99_us,
            self.latency.max_us
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_classifies_results() {
        let mut stats = ReadStats::new();
        stats.record(4096, 4096, Duration::from_micros(10));
        stats.record(100, 4096, Duration::from_micros(20));
        stats.record(-(libc::EIO as i64), 4096, Duration::from_micros(30));

        assert_eq!(stats.ops, 3);
        assert_eq!(stats.bytes, 4196);
        assert_eq!(stats.short_reads, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.latency.len(), 3);
    }

    #[test]
    fn test_report_json() {
        let mut stats = ReadStats::new();
        stats.record(1024, 1024, Duration::from_micros(50));
        stats.elapsed = Duration::from_millis(10);
        let report = ReadReport::new(
            &stats,
            Backend::Kernel,
            PollMode::Pollable,
            8,
            1024,
        );
        assert!(report.is_clean());

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["backend"], "kernel");
        assert_eq!(json["poll_mode"], "pollable");
        assert_eq!(json["bytes"], 1024);
        assert!(json["latency"]["p50_us"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_report_text() {
        let stats = ReadStats::new();
        let report = ReadReport::new(
            &stats,
            Backend::Sync,
            PollMode::NotPollable,
            1,
            4096,
        );
        let text = report.to_string();
        assert!(text.starts_with("Engine: sync (not_pollable), capacity 1"));
        assert_eq!(report.throughput_mib_s, 0.0);
    }
}
