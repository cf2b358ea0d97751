//! Per-transfer byte accounting, speed smoothing and human-readable status.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const SPEED_SAMPLES: usize = 8;

const SIZE_UNITS: [&str; 6] = ["Byte", "KByte", "MByte", "GByte", "TByte", "PByte"];

/// Ring of the last [`SPEED_SAMPLES`] per-tick byte deltas.
#[derive(Debug, Clone, Default)]
pub struct SpeedRing {
    samples: [u64; SPEED_SAMPLES],
    next: usize,
    filled: bool,
}

impl SpeedRing {
    pub fn push(&mut self, delta: u64) {
        self.samples[self.next] = delta;
        self.next += 1;
        if self.next == SPEED_SAMPLES {
            self.next = 0;
            self.filled = true;
        }
    }

    pub fn is_filled(&self) -> bool {
        self.filled
    }

    /// Recency-weighted average over the slots in index order:
    /// `avg = s[0]`, then `avg = (avg + s[i]) / 2`.
    pub fn average(&self) -> Option<u64> {
        if !self.filled {
            return None;
        }
        let (first, rest) = self.samples.split_first()?;
        Some(rest.iter().fold(*first, |avg, s| (avg + s) / 2))
    }
}

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    path: PathBuf,
    pub expected_size: u64,
    pub received_size: u64,
    pub size_now: u64,
    pub size_last: u64,
    speed: SpeedRing,
    pub average_speed: u64,
}

impl DownloadProgress {
    pub fn new(path: PathBuf, expected_size: u64) -> Self {
        Self {
            path,
            expected_size,
            received_size: 0,
            size_now: 0,
            size_last: 0,
            speed: SpeedRing::default(),
            average_speed: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.received_size += len as u64;
    }

    /// Restart accounting at a resume offset.
    pub fn resume_at(&mut self, offset: u64) {
        self.received_size = offset;
        self.size_now = offset;
        self.size_last = offset;
    }

    /// One reporting tick. Returns the speed used for throttling.
    pub fn sample(&mut self) -> u64 {
        self.size_last = self.size_now;
        self.size_now = self.received_size;
        let delta = self.size_now.saturating_sub(self.size_last);
        if self.received_size > 0 {
            self.speed.push(delta);
        }
        self.average_speed = self.speed.average().unwrap_or(delta);
        self.average_speed
    }

    pub fn percent(&self) -> f64 {
        if self.expected_size == 0 {
            return 0.0;
        }
        self.received_size as f64 * 100.0 / self.expected_size as f64
    }

    /// Seconds left at the current average speed, if that is knowable.
    pub fn eta_secs(&self) -> Option<u64> {
        if self.average_speed == 0 || self.expected_size == 0 {
            return None;
        }
        let remaining = self.expected_size.saturating_sub(self.received_size);
        Some(remaining / self.average_speed)
    }

    pub fn status_line(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let total = if self.expected_size == 0 {
            "?".to_string()
        } else {
            format_size(self.expected_size)
        };
        format!(
            "{} {:6.2}% {} / {} at {}/s, eta {}",
            name,
            self.percent(),
            format_size(self.received_size),
            total,
            format_size(self.average_speed),
            format_eta(self.eta_secs()),
        )
    }
}

/// `1536` -> `1.500KByte`.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.3}{}", value, SIZE_UNITS[unit])
}

pub fn format_eta(secs: Option<u64>) -> String {
    let Some(secs) = secs else {
        return "---".to_string();
    };
    if secs < 60 {
        return format!("{}s", secs);
    }
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3_600;
    let mins = secs % 3_600 / 60;
    let mut out = String::new();
    if days > 0 {
        let _ = write!(out, "{}d", days);
    }
    if days > 0 || hours > 0 {
        let _ = write!(out, "{}h", hours);
    }
    let _ = write!(out, "{}m{}s", mins, secs % 60);
    out
}

/// Parse a throughput limit like `1.5MByte`. Unparseable, zero or negative
/// input means unlimited and yields `None`.
pub fn parse_speed(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let exp = SIZE_UNITS
        .iter()
        .position(|u| u.eq_ignore_ascii_case(unit.trim()))?;
    let bytes = number * 1024f64.powi(exp as i32);
    if bytes < 1.0 {
        return None;
    }
    Some(bytes as u64)
}
