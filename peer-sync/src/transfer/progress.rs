//! Per-attempt transfer accounting and human-readable formatting.

use std::time::{Duration, Instant};

/// Counts uploads during one attempt and renders log lines.
#[derive(Debug)]
pub struct TransferMeter {
    started: Instant,
    total_files: usize,
    files: usize,
    bytes: u64,
}

impl TransferMeter {
    pub fn new(total_files: usize) -> Self {
        Self {
            started: Instant::now(),
            total_files,
            files: 0,
            bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }

    pub fn files(&self) -> usize {
        self.files
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average throughput since the meter started, in bytes per second.
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 / secs) as u64
        } else {
            0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} files, {} at {}",
            self.files,
            self.total_files,
            format_bytes(self.bytes),
            format_speed(self.average_speed())
        )
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    match seconds {
        0..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m {}s", seconds / 60, seconds % 60),
        _ => format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_counts() {
        let mut meter = TransferMeter::new(3);
        meter.record(100);
        meter.record(24);
        assert_eq!(meter.files(), 2);
        assert_eq!(meter.bytes(), 124);
        assert!(meter.summary().starts_with("2/3 files, 124.00 B"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_format_speed_and_duration() {
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
